//! Application data directory holding downloaded GGUF files

use crate::error::ModelError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable overriding the model directory
pub const HOME_ENV: &str = "AVLLM_HOME";

/// Directory name under the user's home when [`HOME_ENV`] is unset
pub const DEFAULT_DIR_NAME: &str = ".av_llm";

/// Suffix of files still being downloaded
pub const PARTIAL_SUFFIX: &str = ".part";

/// One `.gguf` file found in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedModel {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Flat directory of model files keyed by file name
#[derive(Debug, Clone)]
pub struct ModelCache {
    root: PathBuf,
}

impl ModelCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache rooted at `$AVLLM_HOME`, falling back to `~/.av_llm`
    pub fn from_env() -> Result<Self, ModelError> {
        if let Some(root) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(PathBuf::from(root)));
        }
        let home = dirs::home_dir()
            .ok_or_else(|| ModelError::cache("cannot determine the home directory"))?;
        Ok(Self::new(home.join(DEFAULT_DIR_NAME)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory if it does not exist yet
    pub async fn ensure_dir(&self) -> Result<(), ModelError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            ModelError::cache(format!("cannot create {}: {}", self.root.display(), e))
        })
    }

    /// Path a file called `name` has inside the cache
    pub fn path_for(&self, name: &str) -> Result<PathBuf, ModelError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// All `.gguf` files in the cache, sorted by name
    pub async fn list(&self) -> Result<Vec<CachedModel>, ModelError> {
        let mut models = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("model directory {} does not exist yet", self.root.display());
                return Ok(models);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("gguf") {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            models.push(CachedModel {
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
                size_bytes: metadata.len(),
            });
        }

        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    /// Delete `name` from the cache
    pub async fn remove(&self, name: &str) -> Result<PathBuf, ModelError> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("removed {}", path.display());
                Ok(path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ModelError::not_found(
                format!("{} is not in {}", name, self.root.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

/// Cache entries are plain file names, never paths
fn validate_name(name: &str) -> Result<(), ModelError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(ModelError::InvalidConfig(format!(
            "'{}' is not a valid model file name",
            name
        )));
    }
    Ok(())
}

/// Format a byte count the way `model ls` prints it: `512B`, `1.5KB (1536)`
pub fn human_readable_size(size: u64) -> String {
    const SUFFIXES: [char; 7] = ['B', 'K', 'M', 'G', 'T', 'P', 'E'];

    let mut mantissa = size as f64;
    let mut i = 0;
    while mantissa >= 1024.0 && i < SUFFIXES.len() - 1 {
        mantissa /= 1024.0;
        i += 1;
    }
    let rounded = (mantissa * 10.0).ceil() / 10.0;
    let number = if rounded.fract() == 0.0 {
        format!("{}", rounded as u64)
    } else {
        format!("{:.1}", rounded)
    };

    if i == 0 {
        format!("{}{}", number, SUFFIXES[i])
    } else {
        format!("{}{}B ({})", number, SUFFIXES[i], size)
    }
}
