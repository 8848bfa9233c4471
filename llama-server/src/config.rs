use llama_chat::{ContextConfig, QueueConfig, SessionConfig};
use llama_common::config::ensure_range;
use llama_common::{CommonError, ValidatedConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Everything the HTTP server needs besides the models themselves
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Reported as `model_path` by `/props`
    pub model_path: String,
    /// Default `max_tokens` when a request leaves it out
    pub n_predict: usize,
    pub repeat_penalty: f32,
    pub context: ContextConfig,
    pub sessions: SessionConfig,
    pub queue: QueueConfig,
    /// How long shutdown waits for queued requests to finish
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            model_path: String::new(),
            n_predict: 1024,
            repeat_penalty: 1.0,
            context: ContextConfig::default(),
            sessions: SessionConfig::default(),
            queue: QueueConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Number of requests generated in parallel
    pub fn n_parallel(&self) -> usize {
        self.queue.worker_threads
    }

    /// Set the worker count, clamped to what the queue accepts
    pub fn with_parallel(mut self, n_parallel: usize) -> Self {
        self.queue.worker_threads = n_parallel.clamp(1, 16);
        self
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, CommonError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| {
                CommonError::configuration(format!(
                    "invalid listen address {}:{}: {}",
                    self.host, self.port, e
                ))
            })
    }
}

impl ValidatedConfig for ServerConfig {
    type Error = CommonError;

    fn validate(&self) -> Result<(), Self::Error> {
        self.socket_addr()?;
        ensure_range("n_predict", self.n_predict, 1, 1 << 20)?;
        ensure_range("repeat_penalty", self.repeat_penalty, 0.0, 10.0)?;
        self.context.validate()?;
        self.sessions.validate()?;
        self.queue.validate()?;
        Ok(())
    }

    fn description() -> &'static str {
        "HTTP server settings"
    }
}
