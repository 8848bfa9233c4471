use llama_common::config::ensure_range;
use llama_common::{CommonError, ValidatedConfig};
use llama_cpp_2::model::LlamaModel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A loaded model with associated metadata
#[derive(Debug)]
pub struct LoadedModel {
    pub model: LlamaModel,
    pub path: PathBuf,
    pub metadata: ModelMetadata,
}

/// Metadata about a loaded model
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    /// Where the reference pointed
    pub source: ModelSource,
    pub filename: String,
    pub size_bytes: u64,
    pub load_time: Duration,
    /// True when no download was needed
    pub cache_hit: bool,
    /// Context length the model was trained with
    pub context_size: usize,
}

/// What a model reference on the command line turned out to be
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ModelSource {
    /// A `.gguf` path that exists on disk
    LocalFile(PathBuf),
    /// A file name inside the application data directory
    Cached { name: String },
    /// A remote file, optionally reached through a built-in alias
    Remote { url: String, alias: Option<String> },
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::LocalFile(path) => write!(f, "{}", path.display()),
            ModelSource::Cached { name } => write!(f, "cache:{}", name),
            ModelSource::Remote {
                alias: Some(alias), ..
            } => write!(f, "alias:{}", alias),
            ModelSource::Remote { url, .. } => write!(f, "{}", url),
        }
    }
}

/// A model reference resolved to a file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub path: PathBuf,
    pub source: ModelSource,
    pub cache_hit: bool,
}

impl ResolvedModel {
    /// File name used as the model id in listings and API responses
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Parameters handed to llama.cpp when a model file is loaded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Layers to offload to the GPU
    pub n_gpu_layers: u32,
    /// Lock model memory so it cannot be swapped out
    pub use_mlock: bool,
    /// Forward llama.cpp's own log output to tracing
    pub debug: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            use_mlock: false,
            debug: false,
        }
    }
}

impl ValidatedConfig for ModelConfig {
    type Error = CommonError;

    fn validate(&self) -> Result<(), Self::Error> {
        ensure_range("n_gpu_layers", self.n_gpu_layers, 0, 100_000)
    }

    fn description() -> &'static str {
        "llama.cpp model loading parameters"
    }
}
