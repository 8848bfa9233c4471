use llama_common::config::ensure_range;
use llama_common::{CommonError, ValidatedConfig};
use serde::{Deserialize, Serialize};

/// Configuration for the embedding context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Scale vectors to unit L2 norm
    pub normalize: bool,
    /// Context (and batch) size; longer inputs are truncated to this many tokens
    pub n_ctx: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            normalize: true,
            n_ctx: 2048,
        }
    }
}

impl ValidatedConfig for EmbeddingConfig {
    type Error = CommonError;

    fn validate(&self) -> Result<(), Self::Error> {
        ensure_range("embedding n_ctx", self.n_ctx, 8, 131_072)
    }

    fn description() -> &'static str {
        "Embedding model context settings"
    }
}

/// One embedding vector with bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    /// Tokens actually fed to the model after truncation
    pub token_count: usize,
    pub processing_time_ms: u64,
}

impl Embedding {
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.vector)
    }

    pub fn normalize(&mut self) {
        normalize_l2(&mut self.vector);
    }
}

pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `values` to unit length; the zero vector is left alone
pub fn normalize_l2(values: &mut [f32]) {
    let magnitude = l2_norm(values);
    if magnitude > 0.0 {
        for value in values.iter_mut() {
            *value /= magnitude;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalization() {
        let mut embedding = Embedding {
            vector: vec![3.0, 4.0],
            token_count: 2,
            processing_time_ms: 1,
        };
        embedding.normalize();
        assert!((embedding.norm() - 1.0).abs() < 1e-6);
        assert!((embedding.vector[0] - 0.6).abs() < 1e-6);
        assert!((embedding.vector[1] - 0.8).abs() < 1e-6);
        assert_eq!(embedding.dimension(), 2);
    }

    #[test]
    fn test_zero_vector_untouched() {
        let mut values = vec![0.0, 0.0, 0.0];
        normalize_l2(&mut values);
        assert_eq!(values, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_config_validation() {
        assert!(EmbeddingConfig::default().validate().is_ok());
        let config = EmbeddingConfig {
            n_ctx: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    proptest! {
        #[test]
        fn normalized_vectors_have_unit_norm(values in prop::collection::vec(-100.0f32..100.0, 1..64)) {
            prop_assume!(l2_norm(&values) > 1e-3);
            let mut values = values;
            normalize_l2(&mut values);
            prop_assert!((l2_norm(&values) - 1.0).abs() < 1e-4);
        }
    }
}
