//! The bucketless routing table: a map from node-id to the (usually
//! single-element) list of peers claiming that id, plus a protected-id set
//! and an endpoint blacklist.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use krpc_encoding::{Endpoint, NodeId};
use num_bigint::BigUint;

use crate::errors::RoutingTableError;
use crate::node::Node;

struct Inner {
    nodes: HashMap<NodeId, Vec<Arc<Node>>>,
    protected_ids: HashSet<NodeId>,
    bad_endpoints: HashSet<Endpoint>,
}

/// Routing table statistics, as reported by the periodic status loop.
#[derive(Debug, Clone, Copy)]
pub struct TableStats {
    pub ids: usize,
    pub nodes: usize,
    pub bad_endpoints: usize,
    pub protected_ids: usize,
}

pub struct RoutingTable {
    inner: Mutex<Inner>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> RoutingTable {
        RoutingTable {
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                protected_ids: HashSet::new(),
                bad_endpoints: HashSet::new(),
            }),
        }
    }

    /// Registers an observation of `id` at `endpoint`. Returns `None` if the
    /// endpoint is blacklisted; otherwise returns the (possibly
    /// newly-created) entry.
    pub fn register(
        &self,
        endpoint: Endpoint,
        id: NodeId,
        version: Option<Vec<u8>>,
    ) -> Option<Arc<Node>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.bad_endpoints.contains(&endpoint) {
            tracing::debug!(%endpoint, "rejected registration of blacklisted endpoint");
            return None;
        }
        if let Some(existing) = inner
            .nodes
            .get(&id)
            .and_then(|list| list.iter().find(|n| n.endpoint == endpoint))
        {
            existing.set_version_if_unknown(version);
            return Some(existing.clone());
        }
        tracing::debug!(%endpoint, ?id, "registering new node");
        let node = Arc::new(Node::new(endpoint, id, version));
        inner.nodes.entry(id).or_default().push(node.clone());
        Some(node)
    }

    pub fn mark_good(&self, node: &Arc<Node>) {
        node.reset_attempts();
    }

    /// Marks a failed exchange against `node`. `force` always evicts (used
    /// by the size limiter and on identity mismatch); otherwise eviction
    /// only happens once `attempts` passes the BEP-42-dependent threshold
    /// and the id isn't protected, and the endpoint is blacklisted.
    pub fn remove(&self, node: &Arc<Node>, force: bool) {
        let attempts = node.bump_attempts();
        let mut inner = self.inner.lock().unwrap();
        let Some(list) = inner.nodes.get(&node.id) else {
            return;
        };
        if !list.iter().any(|n| n.endpoint == node.endpoint) {
            return;
        }

        let max_attempts = if node.is_bep42_valid() { 5 } else { 2 };
        let protected = inner.protected_ids.contains(&node.id);
        let too_many_attempts = attempts > max_attempts;

        if force || (too_many_attempts && !protected) {
            if !force {
                inner.bad_endpoints.insert(node.endpoint);
            }
            let list = inner.nodes.get_mut(&node.id).unwrap();
            list.retain(|n| n.endpoint != node.endpoint);
            if list.is_empty() {
                inner.nodes.remove(&node.id);
            }
        }
    }

    /// Ids that admission limits (the size limiter) MUST NOT evict.
    pub fn protect(&self, ids: impl IntoIterator<Item = NodeId>) {
        let mut inner = self.inner.lock().unwrap();
        inner.protected_ids.extend(ids);
    }

    /// Snapshot query: filters every entry by `predicate`, sorts ascending
    /// by `rank`, and returns the first `limit` (or all, if `None`).
    pub fn query<P, R, K>(
        &self,
        limit: Option<usize>,
        predicate: P,
        mut rank: R,
    ) -> Result<Vec<Arc<Node>>, RoutingTableError>
    where
        P: Fn(&Node) -> bool,
        R: FnMut(&Node) -> K,
        K: Ord,
    {
        let inner = self.inner.lock().unwrap();
        if inner.nodes.is_empty() {
            return Err(RoutingTableError::Empty);
        }
        let mut result: Vec<Arc<Node>> = inner
            .nodes
            .values()
            .flatten()
            .filter(|n| predicate(n))
            .cloned()
            .collect();
        result.sort_by_key(|n| rank(n));
        if let Some(limit) = limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    /// Same as `query` but allows an empty table (used by maintenance loops
    /// which should not error on a cold start).
    pub fn query_allow_empty<P, R, K>(&self, limit: Option<usize>, predicate: P, rank: R) -> Vec<Arc<Node>>
    where
        P: Fn(&Node) -> bool,
        R: FnMut(&Node) -> K,
        K: Ord,
    {
        self.query(limit, predicate, rank).unwrap_or_default()
    }

    pub fn stats(&self) -> TableStats {
        let inner = self.inner.lock().unwrap();
        TableStats {
            ids: inner.nodes.len(),
            nodes: inner.nodes.values().map(|v| v.len()).sum(),
            bad_endpoints: inner.bad_endpoints.len(),
            protected_ids: inner.protected_ids.len(),
        }
    }

    /// Removes `count` entries from the blacklist, oldest-insertion-order
    /// not preserved (a `HashSet` gives no ordering, matching the
    /// original's "pop arbitrary elements" redemption policy).
    pub fn redeem_bad_endpoints(&self, count: usize) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..count {
            let Some(ep) = inner.bad_endpoints.iter().next().copied() else {
                break;
            };
            inner.bad_endpoints.remove(&ep);
        }
    }
}

/// Ascending-XOR-distance-from-`target` ranking, the default sort for
/// closest-node queries.
pub fn rank_by_distance(target: NodeId) -> impl FnMut(&Node) -> BigUint {
    move |node: &Node| node.id.distance(&target)
}

/// A node whose id is BEP-42-valid for its own endpoint.
pub fn is_bep42_valid(node: &Node) -> bool {
    node.is_bep42_valid()
}

pub fn always(_node: &Node) -> bool {
    true
}

pub fn not_in(blacklist: &HashSet<Endpoint>) -> impl Fn(&Node) -> bool + '_ {
    move |node: &Node| !blacklist.contains(&node.endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(a: u8, b: u8, c: u8, d: u8, port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::new(a, b, c, d), port)
    }

    #[test]
    fn register_is_idempotent_per_endpoint_and_id() {
        let table = RoutingTable::new();
        let id = NodeId::random();
        let endpoint = ep(1, 2, 3, 4, 6000);
        let first = table.register(endpoint, id, None).unwrap();
        let second = table.register(endpoint, id, None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.stats().nodes, 1);
    }

    #[test]
    fn register_rejects_blacklisted_endpoint() {
        let table = RoutingTable::new();
        let id = NodeId::random();
        let endpoint = ep(1, 2, 3, 4, 6000);
        let node = table.register(endpoint, id, None).unwrap();
        table.remove(&node, false);
        table.remove(&node, false);
        table.remove(&node, false);
        assert!(table.register(endpoint, id, None).is_none());
    }

    #[test]
    fn forced_remove_does_not_blacklist() {
        let table = RoutingTable::new();
        let id = NodeId::random();
        let endpoint = ep(1, 2, 3, 4, 6000);
        let node = table.register(endpoint, id, None).unwrap();
        table.remove(&node, true);
        assert!(table.register(endpoint, id, None).is_some());
    }

    #[test]
    fn protected_id_survives_attempt_threshold() {
        let table = RoutingTable::new();
        let id = NodeId::random();
        let endpoint = ep(1, 2, 3, 4, 6000);
        table.protect([id]);
        let node = table.register(endpoint, id, None).unwrap();
        for _ in 0..10 {
            table.remove(&node, false);
        }
        assert_eq!(table.stats().nodes, 1);
    }

    #[test]
    fn query_on_empty_table_errors() {
        let table = RoutingTable::new();
        let result = table.query(None, always, rank_by_distance(NodeId::random()));
        assert_eq!(result.unwrap_err(), RoutingTableError::Empty);
    }

    #[test]
    fn query_sorts_by_distance_and_respects_limit() {
        let table = RoutingTable::new();
        let target = NodeId::from_bytes([0u8; 20]);
        for i in 1..=5u8 {
            let mut bytes = [0u8; 20];
            bytes[19] = i;
            table.register(ep(10, 0, 0, i, 6000 + i as u16), NodeId::from_bytes(bytes), None);
        }
        let closest = table.query(Some(2), always, rank_by_distance(target)).unwrap();
        assert_eq!(closest.len(), 2);
        assert!(closest[0].id.distance(&target) <= closest[1].id.distance(&target));
    }
}
