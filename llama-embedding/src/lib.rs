//! # llama-embedding
//!
//! Text embeddings from GGUF models through llama-cpp-2, pooled on the last
//! token and optionally L2-normalised. The server only sees the
//! [`TextEmbedder`] trait.
//!
//! ```rust,no_run
//! use llama_embedding::{EmbeddingConfig, EmbeddingModel, SharedEmbeddingModel, TextEmbedder};
//! use llama_loader::{ModelCache, ModelConfig, ModelLoader, ModelResolver, Downloader, DownloadOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let resolver = ModelResolver::new(
//!         ModelCache::from_env()?,
//!         Downloader::new(DownloadOptions::default())?,
//!     );
//!     let resolved = resolver.resolve("embedding-model.gguf").await?;
//!     let loader = ModelLoader::new(ModelConfig::default())?;
//!     let model = EmbeddingModel::load(&loader, &resolved, EmbeddingConfig::default()).await?;
//!
//!     let embedder = SharedEmbeddingModel::new(model);
//!     let embedding = embedder.embed("hello").await?;
//!     println!("dimension {}, norm {}", embedding.dimension(), embedding.norm());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod model;
pub mod types;

pub use error::{EmbeddingError, EmbeddingResult as Result};
pub use model::{EmbeddingModel, SharedEmbeddingModel, TextEmbedder};
pub use types::{l2_norm, normalize_l2, Embedding, EmbeddingConfig};
