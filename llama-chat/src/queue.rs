//! Bounded pool of inference workers.
//!
//! Requests are queued on a bounded channel and picked up by a fixed number of
//! workers; each job runs on a blocking thread because decoding is CPU/GPU
//! bound. A full queue rejects new work immediately instead of piling up.

use crate::error::QueueError;
use crate::types::SessionId;
use llama_common::async_utils;
use llama_common::config::ensure_range;
use llama_common::{CommonError, ValidatedConfig};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    /// Number of requests processed in parallel
    pub worker_threads: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 64,
            worker_threads: 1,
        }
    }
}

impl ValidatedConfig for QueueConfig {
    type Error = CommonError;

    fn validate(&self) -> Result<(), Self::Error> {
        ensure_range("max_queue_size", self.max_queue_size, 1, 10_000)?;
        ensure_range("worker_threads", self.worker_threads, 1, 16)?;
        Ok(())
    }

    fn description() -> &'static str {
        "Request queue settings"
    }
}

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub total_requests: AtomicU64,
    pub completed_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub cancelled_requests: AtomicU64,
    pub current_queue_size: AtomicUsize,
    pub total_processing_time_ms: AtomicU64,
    pub peak_queue_size: AtomicUsize,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request_submitted(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let current_size = self.current_queue_size.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_queue_size.fetch_max(current_size, Ordering::Relaxed);
    }

    pub fn record_request_completed(&self, processing_time: Duration) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
        self.current_queue_size.fetch_sub(1, Ordering::Relaxed);
        self.total_processing_time_ms
            .fetch_add(processing_time.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_request_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.current_queue_size.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_request_cancelled(&self) {
        self.cancelled_requests.fetch_add(1, Ordering::Relaxed);
        self.current_queue_size.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> QueueStats {
        let completed = self.completed_requests.load(Ordering::Relaxed);
        let total_time = self.total_processing_time_ms.load(Ordering::Relaxed);
        QueueStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            completed_requests: completed,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cancelled_requests: self.cancelled_requests.load(Ordering::Relaxed),
            current_queue_size: self.current_queue_size.load(Ordering::Relaxed),
            average_processing_time_ms: if completed > 0 {
                total_time / completed
            } else {
                0
            },
            peak_queue_size: self.peak_queue_size.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub cancelled_requests: u64,
    /// Requests waiting or running
    pub current_queue_size: usize,
    pub average_processing_time_ms: u64,
    pub peak_queue_size: usize,
}

type Job = Box<dyn FnOnce(&CancellationToken) + Send + 'static>;

struct QueuedJob {
    id: Ulid,
    session: Option<SessionId>,
    submitted_at: Instant,
    cancellation: CancellationToken,
    job: Job,
}

/// Result of a submitted job
pub struct JobHandle<T> {
    id: Ulid,
    receiver: oneshot::Receiver<T>,
    cancellation: CancellationToken,
}

impl<T> JobHandle<T> {
    pub fn id(&self) -> Ulid {
        self.id
    }

    /// Token the job observes; cancelling it stops queued or running work
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Wait for the job to finish
    pub async fn wait(self) -> Result<T, QueueError> {
        match self.receiver.await {
            Ok(value) => Ok(value),
            Err(_) if self.cancellation.is_cancelled() => Err(QueueError::Cancelled),
            Err(_) => Err(QueueError::WorkerError(
                "worker dropped the request".to_string(),
            )),
        }
    }
}

pub struct RequestQueue {
    sender: Option<mpsc::Sender<QueuedJob>>,
    worker_handles: Vec<JoinHandle<()>>,
    metrics: Arc<QueueMetrics>,
}

impl RequestQueue {
    /// Start `config.worker_threads` workers; must be called inside a tokio runtime
    pub fn new(config: QueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.max_queue_size.max(1));
        let receiver = Arc::new(TokioMutex::new(receiver));
        let metrics = Arc::new(QueueMetrics::new());

        let worker_handles = (0..config.worker_threads.max(1))
            .map(|worker_id| {
                let receiver = receiver.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    Self::worker_loop(worker_id, receiver, metrics).await;
                })
            })
            .collect();

        info!(
            "RequestQueue initialized with {} workers, max queue size: {}",
            config.worker_threads, config.max_queue_size
        );

        Self {
            sender: Some(sender),
            worker_handles,
            metrics,
        }
    }

    /// Queue `job`, failing fast with [`QueueError::Full`] when no slot is free
    ///
    /// `job` runs on a blocking thread and should poll the token it is given.
    pub async fn submit<T, F>(
        &self,
        session: Option<SessionId>,
        job: F,
    ) -> Result<JobHandle<T>, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or_else(|| {
            warn!("Queue is shutting down, rejecting request");
            QueueError::ShuttingDown
        })?;

        let (result_sender, receiver) = oneshot::channel();
        let cancellation = CancellationToken::new();
        let id = Ulid::new();
        let queued = QueuedJob {
            id,
            session,
            submitted_at: Instant::now(),
            cancellation: cancellation.clone(),
            job: Box::new(move |token| {
                let _ = result_sender.send(job(token));
            }),
        };

        self.metrics.record_request_submitted();
        if let Err(e) = sender.try_send(queued) {
            self.metrics.record_request_failed();
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("Queue is full, rejecting request");
                    QueueError::Full
                }
                mpsc::error::TrySendError::Closed(_) => QueueError::ShuttingDown,
            });
        }

        match session {
            Some(session) => debug!("Submitted request {} for session {}", id, session),
            None => debug!("Submitted request {} to queue", id),
        }

        Ok(JobHandle {
            id,
            receiver,
            cancellation,
        })
    }

    pub fn get_stats(&self) -> QueueStats {
        self.metrics.get_stats()
    }

    async fn worker_loop(
        worker_id: usize,
        receiver: Arc<TokioMutex<mpsc::Receiver<QueuedJob>>>,
        metrics: Arc<QueueMetrics>,
    ) {
        info!("Worker {} started", worker_id);

        loop {
            let queued = {
                let mut receiver = receiver.lock().await;
                match receiver.recv().await {
                    Some(job) => job,
                    None => {
                        info!("Worker {} shutting down - channel closed", worker_id);
                        break;
                    }
                }
            };

            let queue_time = queued.submitted_at.elapsed();
            let QueuedJob {
                id,
                session,
                cancellation,
                job,
                ..
            } = queued;

            if cancellation.is_cancelled() {
                warn!(
                    "Worker {} dropping cancelled request {} (queued for {:?})",
                    worker_id, id, queue_time
                );
                metrics.record_request_cancelled();
                continue;
            }

            debug!(
                "Worker {} processing request {} of session {:?} (queue time: {:?})",
                worker_id, id, session, queue_time
            );
            let start = Instant::now();
            let token = cancellation.clone();
            match tokio::task::spawn_blocking(move || job(&token)).await {
                Ok(()) if cancellation.is_cancelled() => metrics.record_request_cancelled(),
                Ok(()) => metrics.record_request_completed(start.elapsed()),
                Err(join_error) => {
                    error!("Worker {} request {} panicked: {}", worker_id, id, join_error);
                    metrics.record_request_failed();
                }
            }
        }
    }

    /// Stop accepting work and wait for the workers to drain the queue
    pub async fn shutdown(mut self) {
        info!("RequestQueue shutting down gracefully");
        let stats = self.get_stats();
        info!(
            "Shutdown initiated with {} requests in queue, {} total processed",
            stats.current_queue_size, stats.total_requests
        );

        // Closing the channel ends each worker loop once the queue is empty.
        self.sender.take();

        let total_workers = self.worker_handles.len();
        let mut successful_shutdowns = 0;
        for (i, handle) in self.worker_handles.drain(..).enumerate() {
            match handle.await {
                Ok(()) => successful_shutdowns += 1,
                Err(join_error) => error!("Worker {} failed during shutdown: {}", i, join_error),
            }
        }
        info!(
            "RequestQueue shutdown complete: {}/{} workers stopped cleanly",
            successful_shutdowns, total_workers
        );
    }

    /// [`RequestQueue::shutdown`] bounded by `timeout`; returns the stats at shutdown start
    pub async fn shutdown_with_timeout(self, timeout: Duration) -> QueueStats {
        let stats_before = self.get_stats();
        info!("Starting RequestQueue shutdown with {:?} timeout", timeout);

        let result = async_utils::with_timeout_action(
            async {
                self.shutdown().await;
                Ok::<_, QueueError>(())
            },
            timeout,
            async_utils::TimeoutAction::LogWarning,
            &format!(
                "RequestQueue shutdown (had {} requests in queue)",
                stats_before.current_queue_size
            ),
        )
        .await;

        if matches!(result, Ok(Some(()))) {
            info!("RequestQueue shutdown completed within timeout");
        }
        stats_before
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        if self.sender.take().is_some() {
            debug!(
                "RequestQueue dropped with {} worker handles, channel closed",
                self.worker_handles.len()
            );
        }
    }
}
