//! Session store.
//!
//! Reconstructs per-agent conversation context for a stateless protocol.
//! Each session holds a bounded ring of recent messages; idle sessions are
//! swept after the configured TTL. Only the dispatcher mutates rings, via
//! the single `observe` entry point per request.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use portcullis_types::analysis::SessionMessage;
use portcullis_types::config::SessionConfig;

/// One tracked session.
struct Session {
    /// Bounded ring of recent messages, head = oldest.
    ring: VecDeque<SessionMessage>,
    /// Monotonic instant of the most recent access.
    last_activity: Instant,
    /// Agent identity, fixed at first non-empty sighting.
    agent_id: String,
}

/// In-memory session store with TTL-based sweeping.
///
/// Sessions are created lazily on first observation. `observe` and
/// `snapshot` both refresh `last_activity`, so a session referenced during
/// analysis cannot be swept mid-use: the sweep compares idle time against
/// its own start instant and keeps anything touched after that.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ring_size: usize,
    ttl: Duration,
}

impl SessionStore {
    /// Build a store from configuration.
    pub fn new(config: &SessionConfig) -> Self {
        Self::with_limits(config.ring_size, Duration::from_secs(config.ttl_secs))
    }

    /// Build a store with explicit limits.
    pub fn with_limits(ring_size: usize, ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ring_size: ring_size.max(1),
            ttl,
        }
    }

    /// Record one inbound message for a session, creating it if needed.
    ///
    /// Inserts at the ring tail, evicting the head when full, and refreshes
    /// the activity timestamp.
    pub async fn observe(&self, session_id: &str, agent_id: &str, message: SessionMessage) {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(session_id.to_string()).or_insert_with(|| {
            debug!(session = %session_id, "created session");
            Session {
                ring: VecDeque::with_capacity(self.ring_size.min(64)),
                last_activity: Instant::now(),
                agent_id: String::new(),
            }
        });

        if session.agent_id.is_empty() && !agent_id.is_empty() {
            session.agent_id = agent_id.to_string();
        }

        session.ring.push_back(message);
        while session.ring.len() > self.ring_size {
            session.ring.pop_front();
        }
        session.last_activity = Instant::now();
    }

    /// Ordered copy of a session's recent messages, oldest first.
    ///
    /// Counts as activity: the session is kept alive while its context is in
    /// use by an analysis.
    pub async fn snapshot(&self, session_id: &str) -> Vec<SessionMessage> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.last_activity = Instant::now();
                session.ring.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Agent identity fixed for a session, if any.
    pub async fn agent_id(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.agent_id.clone())
            .filter(|a| !a.is_empty())
    }

    /// Number of live sessions.
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions idle for longer than the TTL.
    ///
    /// Idle time is measured against the sweep's start instant, so a session
    /// observed after the scan began is never dropped. Returns the ids of
    /// evicted sessions so callers can release associated state.
    pub async fn sweep(&self) -> Vec<String> {
        let scan_start = Instant::now();
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| scan_start.saturating_duration_since(s.last_activity) > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            info!(swept = expired.len(), "swept expired sessions");
        }
        expired
    }
}
