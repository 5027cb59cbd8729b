//! Per-session flow state and the store that owns it
//!
//! The flow engine never reaches for ambient state: every operation takes
//! the `SessionState` it works on, and the gate loads/saves that state through
//! a `SessionStore` handed to it at construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::BoxFuture;
use crate::credential::Credential;
use crate::identity::IdentityClaims;

/// Mutable flags one browser session carries through the flow.
///
/// `state_token` is only `Some` while a flow is in flight. It is cleared by
/// the callback whether validation succeeds or fails.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub oauth_done: bool,
    pub state_token: Option<String>,
    /// PKCE verifier paired with `state_token`, consumed at exchange
    pub pkce_verifier: Option<Secret<String>>,
    pub redirect_after_auth: Option<String>,
    pub user_id: Option<String>,
    pub id_token: Option<IdentityClaims>,
    pub credential: Option<Credential>,
}

/// Where a session stands in the authorization flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowPhase {
    NotStarted,
    InFlight,
    Done,
}

impl SessionState {
    pub fn phase(&self) -> FlowPhase {
        if self.oauth_done {
            FlowPhase::Done
        } else if self.state_token.is_some() {
            FlowPhase::InFlight
        } else {
            FlowPhase::NotStarted
        }
    }
}

/// Session persistence keyed by an opaque session id (the gate uses a
/// UUID carried in a cookie).
///
/// Uses `Pin<Box<dyn Future>>` return types so the gate can hold
/// `Arc<dyn SessionStore>`. Unknown ids load as a fresh default state.
pub trait SessionStore: Send + Sync {
    fn load<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, SessionState>;

    fn save<'a>(&'a self, session_id: &'a str, state: SessionState) -> BoxFuture<'a, ()>;

    fn remove<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, ()>;
}

/// Idle time after which an in-memory session is forgotten
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(8 * 3600);

struct StoredSession {
    state: SessionState,
    last_seen: Instant,
}

/// Process-local session store.
///
/// Concurrent requests for the same session are last-writer-wins; the mutex
/// only guarantees the map itself is never torn. Sessions untouched for
/// longer than the idle timeout load as fresh and are dropped by
/// `sweep_idle`.
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, StoredSession>>,
    idle_timeout: Duration,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::with_idle_timeout(DEFAULT_SESSION_IDLE_TIMEOUT)
    }
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every session idle for longer than the timeout. Returns how
    /// many were removed.
    pub async fn sweep_idle(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, stored| stored.last_seen.elapsed() <= self.idle_timeout);
        before - sessions.len()
    }
}

/// Spawn a background task that sweeps idle sessions every `interval`.
pub fn spawn_session_sweeper(
    store: Arc<InMemorySessionStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; nothing can be idle yet
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = store.sweep_idle().await;
            if removed > 0 {
                let remaining = store.len().await;
                info!(removed, remaining, "swept idle sessions");
            }
        }
    })
}

impl SessionStore for InMemorySessionStore {
    fn load<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, SessionState> {
        Box::pin(async move {
            let mut sessions = self.sessions.lock().await;
            let Some(stored) = sessions.get_mut(session_id) else {
                return SessionState::default();
            };
            if stored.last_seen.elapsed() > self.idle_timeout {
                debug!(session_id, "session idle past timeout, starting fresh");
                sessions.remove(session_id);
                return SessionState::default();
            }
            stored.last_seen = Instant::now();
            stored.state.clone()
        })
    }

    fn save<'a>(&'a self, session_id: &'a str, state: SessionState) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut sessions = self.sessions.lock().await;
            debug!(session_id, phase = ?state.phase(), "saving session");
            sessions.insert(
                session_id.to_owned(),
                StoredSession {
                    state,
                    last_seen: Instant::now(),
                },
            );
        })
    }

    fn remove<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.sessions.lock().await.remove(session_id);
        })
    }
}
