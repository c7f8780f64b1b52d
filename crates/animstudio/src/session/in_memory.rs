use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Session, SessionEntry, SessionId, SessionLease, SessionStore};
use crate::error::{StudioError, StudioResult};

/// Bounds applied by [`InMemorySessionStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Live sessions kept before the least recently active one is evicted.
    pub max_sessions: usize,
    /// Sessions untouched for longer than this are dropped by `evict_expired`.
    pub idle_ttl: Duration,
    /// Per-list cap on history entries; the oldest entries are dropped first.
    pub max_history: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            idle_ttl: Duration::from_secs(60 * 60),
            max_history: 200,
        }
    }
}

// The map holds one reference; any other means a caller is using the slot.
fn in_use(slot: &Arc<Slot>) -> bool {
    Arc::strong_count(slot) > 1
}

struct Slot {
    session: Mutex<Session>,
    // Milliseconds since the store's epoch; read without taking the session lock.
    touched_ms: AtomicU64,
}

/// An in-memory implementation of the `SessionStore` trait.
///
/// The outer map lock is held only to look up, insert or remove slots. Each
/// session has its own mutex, so mutations of one session are serialised
/// while different sessions never contend on anything but the map lookup.
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<SessionId, Arc<Slot>>>,
    policy: SessionPolicy,
    epoch: Instant,
}

impl InMemorySessionStore {
    /// Creates a new `InMemorySessionStore` with the default policy.
    pub fn new() -> Self {
        Self::with_policy(SessionPolicy::default())
    }

    pub fn with_policy(policy: SessionPolicy) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            policy,
            epoch: Instant::now(),
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    fn now_ms(&self) -> u64 {
        Instant::now().duration_since(self.epoch).as_millis() as u64
    }

    fn touch(&self, slot: &Slot) {
        slot.touched_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    async fn existing(&self, session_id: &SessionId) -> Option<Arc<Slot>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    async fn slot(&self, session_id: &SessionId) -> Arc<Slot> {
        let mut sessions = self.sessions.lock().await;
        if let Some(slot) = sessions.get(session_id) {
            return slot.clone();
        }

        if sessions.len() >= self.policy.max_sessions {
            let oldest = sessions
                .iter()
                .filter(|(_, slot)| !in_use(slot))
                .min_by_key(|(_, slot)| slot.touched_ms.load(Ordering::Relaxed))
                .map(|(id, _)| id.clone());
            match oldest {
                Some(oldest) => {
                    debug!(session = %oldest, "evicting least recently active session");
                    sessions.remove(&oldest);
                }
                None => warn!(
                    live = sessions.len(),
                    "all sessions are in use; exceeding session capacity"
                ),
            }
        }

        let slot = Arc::new(Slot {
            session: Mutex::new(Session::new(session_id.clone())),
            touched_ms: AtomicU64::new(self.now_ms()),
        });
        sessions.insert(session_id.clone(), slot.clone());
        debug!(session = %session_id, "created session");
        slot
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &SessionId) -> StudioResult<Session> {
        let slot = self
            .existing(session_id)
            .await
            .ok_or_else(|| StudioError::SessionNotFound(session_id.clone()))?;
        let session = slot.session.lock().await;
        Ok(session.clone())
    }

    async fn get_or_create(&self, session_id: &SessionId) -> StudioResult<Session> {
        let slot = self.slot(session_id).await;
        self.touch(&slot);
        let session = slot.session.lock().await;
        Ok(session.clone())
    }

    async fn lease(&self, session_id: &SessionId) -> StudioResult<SessionLease> {
        let slot = self.slot(session_id).await;
        self.touch(&slot);
        Ok(SessionLease::new(slot))
    }

    async fn append_all(
        &self,
        session_id: &SessionId,
        entries: Vec<SessionEntry>,
    ) -> StudioResult<()> {
        let slot = self.slot(session_id).await;
        let mut session = slot.session.lock().await;
        for entry in entries {
            session.add_entry(entry, self.policy.max_history);
        }
        self.touch(&slot);
        Ok(())
    }

    async fn set_preferences(
        &self,
        session_id: &SessionId,
        preferences: Map<String, Value>,
    ) -> StudioResult<Session> {
        let slot = self.slot(session_id).await;
        let mut session = slot.session.lock().await;
        session.merge_preferences(preferences);
        self.touch(&slot);
        Ok(session.clone())
    }

    async fn clear(&self, session_id: &SessionId) -> StudioResult<bool> {
        let removed = self.sessions.lock().await.remove(session_id).is_some();
        debug!(session = %session_id, removed, "cleared session");
        Ok(removed)
    }

    async fn list(&self) -> StudioResult<Vec<SessionId>> {
        let mut ids: Vec<SessionId> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn evict_expired(&self) -> StudioResult<usize> {
        let now = self.now_ms();
        let ttl = self.policy.idle_ttl.as_millis() as u64;
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, slot| {
            in_use(slot) || now.saturating_sub(slot.touched_ms.load(Ordering::Relaxed)) <= ttl
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle sessions");
        }
        Ok(evicted)
    }
}
