use async_trait::async_trait;
use serde_json::{Map, Value};
use std::any::Any;
use std::sync::Arc;

use super::{Session, SessionEntry, SessionId};
use crate::error::StudioResult;

/// Keeps a session out of eviction for as long as it is held.
pub struct SessionLease {
    _pin: Option<Arc<dyn Any + Send + Sync>>,
}

impl SessionLease {
    pub fn new(pin: Arc<dyn Any + Send + Sync>) -> Self {
        Self { _pin: Some(pin) }
    }

    /// A lease for stores that never evict.
    pub fn detached() -> Self {
        Self { _pin: None }
    }
}

/// Trait for abstracting asynchronous session storage operations.
///
/// Implementations must serialise mutations of a single session so that
/// concurrent appends never drop entries and history order reflects one
/// consistent interleaving. No ordering is required across sessions.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Retrieves a session by its ID without creating it.
    ///
    /// Fails with `StudioError::SessionNotFound` for unknown ids.
    async fn get(&self, session_id: &SessionId) -> StudioResult<Session>;

    /// Retrieves a session, creating an empty one on first reference.
    async fn get_or_create(&self, session_id: &SessionId) -> StudioResult<Session>;

    /// Creates the session if needed and protects it from capacity and idle
    /// eviction until the lease is dropped. `clear` still removes it.
    async fn lease(&self, session_id: &SessionId) -> StudioResult<SessionLease> {
        self.get_or_create(session_id).await?;
        Ok(SessionLease::detached())
    }

    /// Appends one entry, creating the session if needed.
    async fn append(&self, session_id: &SessionId, entry: SessionEntry) -> StudioResult<()> {
        self.append_all(session_id, vec![entry]).await
    }

    /// Appends several entries as one contiguous block.
    async fn append_all(
        &self,
        session_id: &SessionId,
        entries: Vec<SessionEntry>,
    ) -> StudioResult<()>;

    /// Merges preference keys into the session and returns the updated session.
    async fn set_preferences(
        &self,
        session_id: &SessionId,
        preferences: Map<String, Value>,
    ) -> StudioResult<Session>;

    /// Removes a session. Returns whether it existed.
    async fn clear(&self, session_id: &SessionId) -> StudioResult<bool>;

    /// Ids of all live sessions.
    async fn list(&self) -> StudioResult<Vec<SessionId>>;

    /// Drops sessions idle past the configured expiry. Returns how many were removed.
    async fn evict_expired(&self) -> StudioResult<usize>;
}
