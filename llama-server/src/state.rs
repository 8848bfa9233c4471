use crate::config::ServerConfig;
use crate::error::ApiResult;
use crate::openai::unix_now;
use llama_chat::{
    ChatError, InferenceContext, InferenceEngine, JobHandle, RequestQueue, SessionId, SessionStore,
};
use llama_embedding::TextEmbedder;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

/// Raw-token context shared by `/v1/responses` calls until a client restarts it
pub type ResponsesContext = Arc<Mutex<Option<Box<dyn InferenceContext>>>>;

/// Shared state behind every route
pub struct AppState {
    pub engine: Arc<dyn InferenceEngine>,
    pub embedder: Option<Arc<dyn TextEmbedder>>,
    pub sessions: Arc<SessionStore>,
    pub queue: RequestQueue,
    pub responses: ResponsesContext,
    pub config: ServerConfig,
    started_at: Instant,
    created: i64,
    /// Cancels the session reaper when the state goes away
    _reaper: DropGuard,
}

impl AppState {
    /// Build the state and start the session reaper; needs a tokio runtime
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        embedder: Option<Arc<dyn TextEmbedder>>,
        config: ServerConfig,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(
            config.sessions.clone(),
            config.context.clone(),
        ));
        let background = CancellationToken::new();
        sessions.spawn_reaper(background.clone());

        info!(
            "Serving {} with {} workers, context {}",
            engine.name(),
            config.n_parallel(),
            config.context.n_ctx
        );
        Self {
            engine,
            embedder,
            sessions,
            queue: RequestQueue::new(config.queue.clone()),
            responses: Arc::new(Mutex::new(None)),
            config,
            started_at: Instant::now(),
            created: unix_now(),
            _reaper: background.drop_guard(),
        }
    }

    pub fn model_name(&self) -> &str {
        self.engine.name()
    }

    /// Unix time the server started, reported as the model's `created`
    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Run `job` on the worker pool and wait for its result
    ///
    /// If the calling handler is dropped (client gone) the job's token is
    /// cancelled.
    pub async fn run<T, F>(&self, session: Option<SessionId>, job: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> Result<T, ChatError> + Send + 'static,
    {
        let handle: JobHandle<Result<T, ChatError>> = self.queue.submit(session, job).await?;
        let guard = handle.cancellation_token().drop_guard();
        let result = handle.wait().await;
        let _ = guard.disarm();
        Ok(result??)
    }

    /// Stop background tasks and drain the queue
    pub async fn shutdown(self: Arc<Self>) {
        match Arc::try_unwrap(self) {
            Ok(state) => {
                let timeout = state.config.shutdown_timeout;
                let AppState { queue, .. } = state;
                let stats = queue.shutdown_with_timeout(timeout).await;
                info!(
                    "Served {} requests ({} failed, {} cancelled)",
                    stats.total_requests, stats.failed_requests, stats.cancelled_requests
                );
            }
            Err(_) => warn!("Server state still in use at shutdown, dropping queue without draining"),
        }
    }
}

