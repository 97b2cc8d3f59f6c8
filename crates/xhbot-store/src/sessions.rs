use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use xhbot_core::{GroupUserId, Session, SessionError, SessionStore};

/// In-process TTL session store.
///
/// Expiry is lazy: nothing is removed until [`SessionStore::sweep`] runs.
pub struct MemorySessionStore {
    sessions: DashMap<GroupUserId, Session>,
    expiry: TimeDelta,
}

impl MemorySessionStore {
    pub fn new(expiry: TimeDelta) -> Self {
        Self {
            sessions: DashMap::new(),
            expiry,
        }
    }

    pub fn from_secs(expiry_secs: u64) -> Self {
        let secs = i64::try_from(expiry_secs).unwrap_or(i64::MAX);
        Self::new(TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn touch_at(
        &self,
        identity: GroupUserId,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        match self.sessions.entry(identity) {
            Entry::Occupied(mut entry) => {
                let expiry = self.expiry;
                let session = entry.get_mut();
                if session.is_expired(now, expiry) {
                    session.created_at = now;
                }
                session.payload = payload;
                session.last_touched = now;
            }
            Entry::Vacant(entry) => {
                entry.insert(Session::new(identity, payload, now));
            }
        }
        Ok(())
    }

    async fn update_at(
        &self,
        identity: GroupUserId,
        now: DateTime<Utc>,
        update: &(dyn for<'v> Fn(Option<&'v serde_json::Value>) -> Option<serde_json::Value> + Send + Sync),
    ) -> Result<Option<Session>, SessionError> {
        // The shard stays locked from read to write.
        match self.sessions.entry(identity) {
            Entry::Occupied(mut entry) => {
                let expired = entry.get().is_expired(now, self.expiry);
                let live = (!expired).then_some(&entry.get().payload);
                let Some(payload) = update(live) else {
                    return Ok(None);
                };
                let session = entry.get_mut();
                if expired {
                    session.created_at = now;
                }
                session.payload = payload;
                session.last_touched = now;
                Ok(Some(session.clone()))
            }
            Entry::Vacant(entry) => {
                let Some(payload) = update(None) else {
                    return Ok(None);
                };
                let session = Session::new(identity, payload, now);
                entry.insert(session.clone());
                Ok(Some(session))
            }
        }
    }

    async fn get(&self, identity: &GroupUserId) -> Result<Option<Session>, SessionError> {
        Ok(self.sessions.get(identity).map(|s| s.value().clone()))
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<GroupUserId>, SessionError> {
        let expiry = self.expiry;
        let mut expired = Vec::new();
        self.sessions.retain(|identity, session| {
            if session.is_expired(now, expiry) {
                expired.push(*identity);
                false
            } else {
                true
            }
        });
        expired.sort();
        Ok(expired)
    }

    async fn count(&self) -> Result<usize, SessionError> {
        Ok(self.sessions.len())
    }

    fn expiry(&self) -> TimeDelta {
        self.expiry
    }
}
