//! Validated configuration values passed explicitly into component constructors

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::error::CommonError;

/// Configuration value that knows how to check itself
///
/// Every component in the workspace receives its settings as one of these
/// values instead of reading process-wide state.
pub trait ValidatedConfig:
    Send + Sync + Clone + Debug + Serialize + for<'de> Deserialize<'de>
{
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate the configuration, returning an error if invalid
    fn validate(&self) -> Result<(), Self::Error>;

    /// Get a description of what this configuration controls
    fn description() -> &'static str;

    /// Consume the value, returning it only if it validates
    fn validated(self) -> Result<Self, Self::Error> {
        self.validate()?;
        Ok(self)
    }
}

/// Helper trait for configurations that can be created with sensible defaults
pub trait DefaultConfig: ValidatedConfig + Default {
    /// Create a validated default configuration
    fn validated_default() -> Result<Self, Self::Error> {
        Self::default().validated()
    }
}

impl<T> DefaultConfig for T where T: ValidatedConfig + Default {}

/// Check that `value` lies in `min..=max`, naming the field in the error
pub fn ensure_range<T>(field: &str, value: T, min: T, max: T) -> Result<(), CommonError>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(CommonError::configuration(format!(
            "{} must be between {} and {}, got {}",
            field, min, max, value
        )));
    }
    Ok(())
}
