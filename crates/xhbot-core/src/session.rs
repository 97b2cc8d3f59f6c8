use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SessionError;
use crate::ids::GroupUserId;

/// Conversation continuation state for one group member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub identity: GroupUserId,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_touched: DateTime<Utc>,
}

impl Session {
    pub fn new(identity: GroupUserId, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            identity,
            payload,
            created_at: now,
            last_touched: now,
        }
    }

    /// Strictly older than `expiry` since the last touch.
    pub fn is_expired(&self, now: DateTime<Utc>, expiry: TimeDelta) -> bool {
        now - self.last_touched > expiry
    }
}

/// Time-expiring session storage keyed by group-user identity.
///
/// At most one session exists per identity. `sweep` is the only path that
/// removes sessions; `get` returns a stale session until it has been swept,
/// so callers that care check [`Session::is_expired`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create or refresh the session, replacing its payload and resetting
    /// `last_touched` to `now`. `created_at` survives refreshes.
    async fn touch_at(
        &self,
        identity: GroupUserId,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError>;

    async fn touch(
        &self,
        identity: GroupUserId,
        payload: serde_json::Value,
    ) -> Result<(), SessionError> {
        self.touch_at(identity, payload, Utc::now()).await
    }

    /// Read-modify-write one session atomically.
    ///
    /// `update` sees the live payload, or `None` when the session is missing
    /// or already expired, and returns the payload to store. Returning `None`
    /// leaves the store untouched. A write resets `last_touched` to `now`; an
    /// expired session is replaced, so `created_at` restarts too.
    ///
    /// Returns the stored session if a write happened.
    async fn update_at(
        &self,
        identity: GroupUserId,
        now: DateTime<Utc>,
        update: &(dyn for<'v> Fn(Option<&'v serde_json::Value>) -> Option<serde_json::Value> + Send + Sync),
    ) -> Result<Option<Session>, SessionError>;

    async fn get(&self, identity: &GroupUserId) -> Result<Option<Session>, SessionError>;

    /// Remove every session with `now - last_touched > expiry` and return
    /// their identities.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<GroupUserId>, SessionError>;

    /// Number of stored sessions, expired-but-unswept included.
    async fn count(&self) -> Result<usize, SessionError>;

    /// Expiry shared by every session in this store.
    fn expiry(&self) -> TimeDelta;
}
