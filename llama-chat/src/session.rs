//! Named sessions shared between HTTP requests.

use crate::accumulator::SessionState;
use crate::engine::ContextConfig;
use crate::error::SessionError;
use crate::types::SessionId;
use llama_common::{CommonError, ValidatedConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Limits on how many sessions are kept and for how long
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub max_sessions: usize,
    /// Sessions unused for this long are dropped by the reaper
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl ValidatedConfig for SessionConfig {
    type Error = CommonError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.max_sessions == 0 {
            return Err(CommonError::configuration("max_sessions must be at least 1"));
        }
        if self.idle_timeout < Duration::from_millis(1) {
            return Err(CommonError::configuration(
                "idle_timeout must be at least 1ms",
            ));
        }
        Ok(())
    }

    fn description() -> &'static str {
        "Session store limits"
    }
}

pub type SharedSession = Arc<Mutex<SessionState>>;

struct Entry {
    state: SharedSession,
    last_used: Instant,
}

impl Entry {
    // A session whose lock is held is in the middle of a request.
    fn is_busy(&self) -> bool {
        self.state.try_lock().is_err()
    }
}

/// Sessions keyed by id, each behind its own mutex
///
/// The per-session mutex serializes requests on one session while different
/// sessions run in parallel.
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Entry>>,
    config: SessionConfig,
    context_config: ContextConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig, context_config: ContextConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            context_config,
        }
    }

    /// A session that is not stored, for one-off requests
    pub fn ephemeral(&self) -> SessionState {
        SessionState::new(SessionId::new(), self.context_config.clone())
    }

    /// Fetch `id`, creating it if needed
    ///
    /// When the store is full the least recently used idle session is evicted;
    /// if every session is busy the call fails with
    /// [`SessionError::LimitExceeded`].
    pub async fn get_or_create(&self, id: SessionId) -> Result<SharedSession, SessionError> {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();

        if let Some(entry) = sessions.get_mut(&id) {
            entry.last_used = now;
            return Ok(entry.state.clone());
        }

        if sessions.len() >= self.config.max_sessions {
            let victim = sessions
                .iter()
                .filter(|(_, entry)| !entry.is_busy())
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| *id);
            match victim {
                Some(victim) => {
                    debug!("Evicting least recently used session {}", victim);
                    sessions.remove(&victim);
                }
                None => {
                    return Err(SessionError::LimitExceeded {
                        max: self.config.max_sessions,
                    })
                }
            }
        }

        let state = Arc::new(Mutex::new(SessionState::new(id, self.context_config.clone())));
        sessions.insert(
            id,
            Entry {
                state: state.clone(),
                last_used: now,
            },
        );
        debug!("Created session {} ({} total)", id, sessions.len());
        Ok(state)
    }

    pub async fn get(&self, id: &SessionId) -> Result<SharedSession, SessionError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        entry.last_used = Instant::now();
        Ok(entry.state.clone())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop idle sessions unused for longer than the idle timeout
    pub async fn evict_idle(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let timeout = self.config.idle_timeout;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.is_busy() || entry.last_used.elapsed() < timeout);
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(
                "Evicted {} idle sessions, {} remaining",
                evicted,
                sessions.len()
            );
        }
        evicted
    }

    /// Run [`SessionStore::evict_idle`] periodically until `shutdown` fires
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let period = (store.config.idle_timeout / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Session reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        store.evict_idle().await;
                    }
                }
            }
        })
    }
}
