//! # Llama Chat
//!
//! Conversation state and token generation on top of llama.cpp.
//!
//! The core is [`SessionState`], which accumulates a transcript, renders it
//! through a [`ChatTemplate`] and sends only the newly rendered suffix to the
//! model on each turn. Around it sit the shared generation loop, fill-in-middle
//! prompt layout, a [`SessionStore`] for named sessions, and a bounded
//! [`RequestQueue`] that runs inference jobs on a fixed number of workers.
//!
//! Everything that talks to llama.cpp goes through [`InferenceEngine`] and
//! [`InferenceContext`]. [`LlamaEngine`] is the real implementation; with the
//! `test-utils` feature a deterministic `ScriptedEngine` is available too.
//!
//! ```rust,no_run
//! use llama_chat::{LlamaEngine, MessageRole, SamplingParams, SessionId, SessionState, ContextConfig};
//! use llama_loader::{ModelCache, ModelConfig, ModelLoader, ModelResolver, Downloader, DownloadOptions};
//! use std::ops::ControlFlow;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let resolver = ModelResolver::new(
//!         ModelCache::from_env()?,
//!         Downloader::new(DownloadOptions::default())?,
//!     );
//!     let resolved = resolver.resolve("qween3-1.7b").await?;
//!     let loader = ModelLoader::new(ModelConfig::default())?;
//!     let engine = LlamaEngine::new(loader.load(&resolved).await?, loader.backend());
//!
//!     let mut session = SessionState::new(SessionId::new(), ContextConfig::default());
//!     session.append(MessageRole::System, "You are terse.")?;
//!     let outcome = session.turn(
//!         &engine,
//!         MessageRole::User,
//!         "Name a prime.",
//!         &SamplingParams::default(),
//!         64,
//!         &mut |piece| {
//!             print!("{}", piece);
//!             ControlFlow::Continue(())
//!         },
//!     )?;
//!     println!("\n[{}]", outcome.finish_reason.as_openai());
//!     Ok(())
//! }
//! ```

pub mod accumulator;
pub mod engine;
pub mod error;
pub mod fim;
pub mod generation;
pub mod queue;
pub mod session;
pub mod template;
pub mod types;

pub use accumulator::{RenderedDelta, SessionPhase, SessionState};
#[cfg(any(test, feature = "test-utils"))]
pub use engine::ScriptedEngine;
pub use engine::{
    ContextConfig, FimTokens, InferenceContext, InferenceEngine, LlamaEngine, Token,
};
pub use error::{ChatError, QueueError, SessionError};
pub use fim::{infill, ExtraChunk, FimRequest};
pub use generation::{run_generation, TokenCallback, Utf8Accumulator};
pub use queue::{JobHandle, QueueConfig, QueueStats, RequestQueue};
pub use session::{SessionConfig, SessionStore, SharedSession};
pub use template::{ChatTemplate, ChatmlTemplate};
pub use types::{
    ChatMessage, FinishReason, GenerationOutcome, GenerationRequest, MessageRole,
    SamplingParams, SessionId,
};
