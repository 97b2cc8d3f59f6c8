use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use xhbot_core::{GroupUserId, SessionStore};

use crate::registry::{Connection, ConnectionRegistry, SendError};

/// A payload to push to every connection in a namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastJob {
    pub namespace: String,
    pub payload: String,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("broadcast queue is full")]
    Full,
    #[error("broadcast scheduler is not running")]
    Closed,
}

/// Producer side of the broadcast queue, handed to whoever decides what to
/// broadcast and when.
#[derive(Clone, Debug)]
pub struct BroadcastQueue {
    tx: mpsc::Sender<BroadcastJob>,
}

impl BroadcastQueue {
    pub fn enqueue(
        &self,
        namespace: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), EnqueueError> {
        let job = BroadcastJob {
            namespace: namespace.into(),
            payload: payload.into(),
        };
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

pub fn broadcast_queue(capacity: usize) -> (BroadcastQueue, mpsc::Receiver<BroadcastJob>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BroadcastQueue { tx }, rx)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<GroupUserId>,
    pub notified: usize,
}

/// Pushes broadcasts to live connections and sweeps expired sessions.
///
/// Send failures are logged per connection and never abort a tick. The
/// scheduler never unregisters anything: a stalled connection is the
/// supervisor's to clean up.
pub struct BroadcastScheduler {
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<dyn SessionStore>,
    send_timeout: Duration,
    notify_on_expiry: bool,
}

/// Keeps the scheduler's two background tasks alive.
pub struct SchedulerHandle {
    pub broadcast: tokio::task::JoinHandle<()>,
    pub expiry: tokio::task::JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn abort(&self) {
        self.broadcast.abort();
        self.expiry.abort();
    }
}

impl BroadcastScheduler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<dyn SessionStore>,
        send_timeout: Duration,
        notify_on_expiry: bool,
    ) -> Self {
        Self {
            registry,
            sessions,
            send_timeout,
            notify_on_expiry,
        }
    }

    /// Send `payload` to every connection currently in `namespace`.
    ///
    /// Sends run concurrently, each bounded by the send timeout. An empty
    /// namespace is a no-op.
    pub async fn broadcast(&self, namespace: &str, payload: &str) -> BroadcastReport {
        let targets = self.registry.list_by_namespace(namespace);
        if targets.is_empty() {
            tracing::debug!(namespace = %namespace, "broadcast to empty namespace");
            return BroadcastReport::default();
        }

        let results = join_all(
            targets
                .iter()
                .map(|conn| self.send_one(conn, payload.to_string())),
        )
        .await;

        let delivered = results.iter().filter(|r| r.is_ok()).count();
        let report = BroadcastReport {
            attempted: targets.len(),
            delivered,
            failed: targets.len() - delivered,
        };
        tracing::info!(
            namespace = %namespace,
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            "broadcast sent"
        );
        report
    }

    async fn send_one(&self, conn: &Connection, payload: String) -> Result<(), SendError> {
        let result = conn.send_timeout(payload, self.send_timeout).await;
        if let Err(e) = &result {
            tracing::warn!(
                connection_id = %conn.id(),
                namespace = %conn.namespace(),
                error = %e,
                "broadcast send failed"
            );
        }
        result
    }

    /// Evict expired sessions and, if enabled, tell the connections that
    /// served them. Notification is best-effort.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> SweepReport {
        let expired = match self.sessions.sweep(now).await {
            Ok(expired) => expired,
            Err(e) => {
                tracing::warn!(error = %e, "session sweep failed");
                return SweepReport::default();
            }
        };

        let mut notified = 0;
        for identity in &expired {
            if self.recreated_since(identity, now).await {
                tracing::debug!(
                    group_id = identity.group_id,
                    user_id = identity.user_id,
                    "session restarted after sweep, keeping association"
                );
                continue;
            }
            for conn in self.registry.find_by_identity(identity) {
                conn.forget(identity);
                if !self.notify_on_expiry {
                    continue;
                }
                if self.send_one(&conn, expiry_notice(identity)).await.is_ok() {
                    notified += 1;
                }
            }
        }

        if !expired.is_empty() {
            tracing::info!(expired = expired.len(), notified, "expired sessions swept");
        }
        SweepReport { expired, notified }
    }

    /// A message may have started a fresh session between the sweep and now.
    async fn recreated_since(&self, identity: &GroupUserId, now: DateTime<Utc>) -> bool {
        match self.sessions.get(identity).await {
            Ok(Some(session)) => !session.is_expired(now, self.sessions.expiry()),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "session lookup after sweep failed");
                false
            }
        }
    }

    /// Run every queued job once.
    pub async fn drain(&self, jobs: &mut mpsc::Receiver<BroadcastJob>) -> Result<usize, EnqueueError> {
        let mut ran = 0;
        loop {
            match jobs.try_recv() {
                Ok(job) => {
                    self.broadcast(&job.namespace, &job.payload).await;
                    ran += 1;
                }
                Err(mpsc::error::TryRecvError::Empty) => return Ok(ran),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return if ran > 0 { Ok(ran) } else { Err(EnqueueError::Closed) };
                }
            }
        }
    }

    /// Start the broadcast tick and the expiry tick on independent timers.
    pub fn spawn(
        self: Arc<Self>,
        mut jobs: mpsc::Receiver<BroadcastJob>,
        broadcast_interval: Duration,
        expiry_interval: Duration,
    ) -> SchedulerHandle {
        let broadcaster = Arc::clone(&self);
        let broadcast = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broadcast_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if broadcaster.drain(&mut jobs).await.is_err() {
                    tracing::info!("broadcast queue closed");
                    break;
                }
            }
        });

        let sweeper = self;
        let expiry = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(expiry_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // consume first immediate tick
            loop {
                ticker.tick().await;
                sweeper.sweep_expired(Utc::now()).await;
            }
        });

        SchedulerHandle { broadcast, expiry }
    }
}

fn expiry_notice(identity: &GroupUserId) -> String {
    serde_json::json!({
        "type": "session_expired",
        "group_id": identity.group_id,
        "user_id": identity.user_id,
    })
    .to_string()
}
