//! # Llama Loader
//!
//! Turns a model reference given on the command line (a `.gguf` path, a
//! cached file name, a built-in alias or an `http(s)` URL) into a local
//! GGUF file, downloading it into the application data directory on a
//! cache miss, and loads that file through llama.cpp.

pub mod cache;
pub mod download;
pub mod error;
pub mod loader;
pub mod registry;
pub mod resolver;
pub mod types;

// Re-export main types for convenience
pub use cache::{human_readable_size, CachedModel, ModelCache};
pub use download::{DownloadOptions, Downloader};
pub use error::ModelError;
pub use loader::{global_backend, ModelLoader};
pub use registry::{filename_from_url, is_remote_url, lookup_alias, ModelAlias, BUILTIN_ALIASES};
pub use resolver::ModelResolver;
pub use types::{LoadedModel, ModelConfig, ModelMetadata, ModelSource, ResolvedModel};
