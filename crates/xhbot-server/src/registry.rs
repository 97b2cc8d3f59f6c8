use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use xhbot_core::{ConnectionId, GroupUserId};

/// Namespace for connections that did not ask for one.
pub const DEFAULT_NAMESPACE: &str = "default";

const MAX_NAMESPACE_LEN: usize = 64;

/// 1-64 chars of `[A-Za-z0-9_-]`.
pub fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.is_empty()
        && namespace.len() <= MAX_NAMESPACE_LEN
        && namespace
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
}

/// A live bot connection as seen from outside its supervisor.
///
/// Every outbound frame goes through `tx`; the supervisor's writer task is
/// the only thing that touches the socket.
pub struct Connection {
    id: ConnectionId,
    namespace: String,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    connected_at: DateTime<Utc>,
    identities: Mutex<HashSet<GroupUserId>>,
}

impl Connection {
    fn new(id: ConnectionId, namespace: String, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            namespace,
            tx,
            connected: AtomicBool::new(true),
            connected_at: Utc::now(),
            identities: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    /// Queue a frame, waiting for room. Used for in-order replies.
    pub async fn send(&self, message: String) -> Result<(), SendError> {
        self.tx.send(message).await.map_err(|_| SendError::Closed)
    }

    /// Queue a frame, giving up after `timeout` if the queue stays full.
    pub async fn send_timeout(&self, message: String, timeout: Duration) -> Result<(), SendError> {
        self.tx
            .send_timeout(message, timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => SendError::TimedOut(timeout),
                mpsc::error::SendTimeoutError::Closed(_) => SendError::Closed,
            })
    }

    /// Record that this connection carried traffic for `identity`.
    pub fn associate(&self, identity: GroupUserId) {
        self.identities.lock().insert(identity);
    }

    /// Drop an association. Returns whether it existed.
    pub fn forget(&self, identity: &GroupUserId) -> bool {
        self.identities.lock().remove(identity)
    }

    pub fn serves(&self, identity: &GroupUserId) -> bool {
        self.identities.lock().contains(identity)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Registry of all open bot connections, indexed by id and by namespace.
///
/// Injected into the supervisor and the scheduler; there is no global
/// instance.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    namespaces: DashMap<String, HashSet<ConnectionId>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            namespaces: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a new connection under `namespace` and return it together
    /// with the receiving end of its outbound queue.
    pub fn register(&self, namespace: &str) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(Connection::new(id.clone(), namespace.to_string(), tx));
        self.connections.insert(id.clone(), Arc::clone(&conn));
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(id);
        (conn, rx)
    }

    /// Remove a connection. Unknown ids are a no-op; returns whether this call
    /// removed it.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let Some((_, conn)) = self.connections.remove(id) else {
            return false;
        };
        conn.mark_disconnected();

        let now_empty = match self.namespaces.get_mut(conn.namespace()) {
            Some(mut ids) => {
                ids.remove(id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.namespaces
                .remove_if(conn.namespace(), |_, ids| ids.is_empty());
        }
        true
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Point-in-time snapshot of a namespace's connections.
    pub fn list_by_namespace(&self, namespace: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<ConnectionId> = match self.namespaces.get(namespace) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Connections that have carried traffic for `identity`.
    pub fn find_by_identity(&self, identity: &GroupUserId) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().serves(identity))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of open connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Namespaces with at least one open connection.
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
