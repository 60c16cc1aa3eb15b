//! Table entries: a remote [`Node`] and our own [`LocalNode`] identity.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use krpc_encoding::{Endpoint, NodeId};

pub type InfoHash = NodeId;

/// A remote peer known to the routing table.
///
/// `attempts`, `pending` and `last_ping` are accessed from concurrent search
/// rounds and maintenance loops, so they live behind atomics/a mutex rather
/// than requiring the caller to hold the table lock.
pub struct Node {
    pub endpoint: Endpoint,
    pub id: NodeId,
    version: Mutex<Option<Vec<u8>>>,
    attempts: AtomicU32,
    pending: AtomicU32,
    last_ping: Mutex<Option<Instant>>,
    tokens: Mutex<HashMap<InfoHash, Vec<u8>>>,
}

impl Node {
    pub fn new(endpoint: Endpoint, id: NodeId, version: Option<Vec<u8>>) -> Node {
        Node {
            endpoint,
            id,
            version: Mutex::new(version),
            attempts: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            last_ping: Mutex::new(None),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn version(&self) -> Option<Vec<u8>> {
        self.version.lock().unwrap().clone()
    }

    /// Fills in the version only if we don't already have one, mirroring the
    /// "update if previously unknown" rule for re-registration.
    pub fn set_version_if_unknown(&self, version: Option<Vec<u8>>) {
        if version.is_none() {
            return;
        }
        let mut slot = self.version.lock().unwrap();
        if slot.is_none() {
            *slot = version;
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    pub fn bump_attempts(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn incr_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_pending(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn last_ping(&self) -> Option<Instant> {
        *self.last_ping.lock().unwrap()
    }

    pub fn mark_pinged_now(&self) {
        *self.last_ping.lock().unwrap() = Some(Instant::now());
    }

    pub fn is_stale(&self, staleness: std::time::Duration) -> bool {
        match self.last_ping() {
            None => true,
            Some(t) => t.elapsed() > staleness,
        }
    }

    pub fn is_bep42_valid(&self) -> bool {
        krpc_encoding::bep42::valid_id(&self.id, self.endpoint.ip)
    }

    pub fn store_token(&self, info_hash: InfoHash, token: Vec<u8>) {
        self.tokens.lock().unwrap().insert(info_hash, token);
    }

    pub fn token_for(&self, info_hash: &InfoHash) -> Option<Vec<u8>> {
        self.tokens.lock().unwrap().get(info_hash).cloned()
    }

    pub fn has_token_for(&self, info_hash: &InfoHash) -> bool {
        self.tokens.lock().unwrap().contains_key(info_hash)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.endpoint == other.endpoint
    }
}
impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.endpoint.hash(state);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("attempts", &self.attempts())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Our own identity: initially our bind endpoint, then updated to whatever
/// the bootstrap peer reports as our externally visible address.
pub struct LocalNode {
    pub endpoint: Mutex<Endpoint>,
    pub id: Mutex<NodeId>,
    pub values: Mutex<HashMap<InfoHash, Vec<Endpoint>>>,
    pub token_key: [u8; 20],
}

impl LocalNode {
    pub fn new(endpoint: Endpoint, id: NodeId, token_key: [u8; 20]) -> LocalNode {
        LocalNode {
            endpoint: Mutex::new(endpoint),
            id: Mutex::new(id),
            values: Mutex::new(HashMap::new()),
            token_key,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        *self.endpoint.lock().unwrap()
    }

    pub fn set_endpoint(&self, endpoint: Endpoint) {
        *self.endpoint.lock().unwrap() = endpoint;
    }

    pub fn id(&self) -> NodeId {
        *self.id.lock().unwrap()
    }

    pub fn set_id(&self, id: NodeId) {
        *self.id.lock().unwrap() = id;
    }

    pub fn record_announce(&self, info_hash: InfoHash, endpoint: Endpoint) {
        self.values
            .lock()
            .unwrap()
            .entry(info_hash)
            .or_default()
            .push(endpoint);
    }

    pub fn values_for(&self, info_hash: &InfoHash) -> Vec<Endpoint> {
        self.values
            .lock()
            .unwrap()
            .get(info_hash)
            .cloned()
            .unwrap_or_default()
    }
}
