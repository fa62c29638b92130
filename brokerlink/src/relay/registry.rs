//! Bookkeeping of live relay sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::time::Instant;

use super::identity::RouteIdentity;

/// A live session as seen from outside.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub peer: Option<SocketAddr>,
    pub target: String,
    pub routing_key: String,
    #[serde(skip)]
    pub started: Instant,
}

/// Registry of live sessions.
///
/// The only state shared between sessions. Entries are added when a
/// session starts relaying and removed when its [`SessionGuard`] drops,
/// however the session ends.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, SessionInfo>>,
    served: AtomicU64,
    rejected: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session that starts relaying now.
    pub fn register(
        self: &Arc<Self>,
        peer: Option<SocketAddr>,
        identity: &RouteIdentity,
    ) -> SessionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.served.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(
            id,
            SessionInfo {
                id,
                peer,
                target: identity.target.clone(),
                routing_key: identity.routing_key.clone(),
                started: Instant::now(),
            },
        );
        SessionGuard {
            id,
            registry: Arc::clone(self),
        }
    }

    /// Count a session that was turned away.
    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of sessions currently relaying.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no session is relaying.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live sessions, oldest first.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Sessions that reached the relaying state so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Sessions rejected so far.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, SessionInfo>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes its session from the registry on drop.
#[derive(Debug)]
pub struct SessionGuard {
    id: u64,
    registry: Arc<SessionRegistry>,
}

impl SessionGuard {
    /// Registry id of the session.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_removes_session() {
        let registry = Arc::new(SessionRegistry::new());
        let a = registry.register(None, &RouteIdentity::new("devA", "svc1"));
        let b = registry.register(None, &RouteIdentity::new("devB", "svc1"));

        assert_eq!(registry.len(), 2);
        assert_ne!(a.id(), b.id());

        drop(a);
        let live = registry.snapshot();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].target, "devB");

        drop(b);
        assert!(registry.is_empty());
        assert_eq!(registry.served(), 2);
    }
}
