//! The server side of the four BEP-0005 queries. Mirrors `tinybt`'s
//! `DHT._handle_query` plus its per-method `_ping`/`_find_node`/
//! `_get_peers`/`_announce_peer` reply methods, generalized into an
//! explicit [`tokio_krpc::QueryHandler`] impl instead of introspecting a
//! Python callback's formal parameters (spec §9 "handler registration by
//! introspection").

use std::net::SocketAddr;
use std::sync::Arc;

use krpc_encoding::messages::{find_node_reply, get_peers_reply, id_only_reply};
use krpc_encoding::{Endpoint, Query};
use routing_table::{is_bep42_valid, rank_by_distance, LocalNode, RoutingTable};
use tokio_krpc::{to_ipv4_endpoint, QueryHandler, ReplySender};

use crate::token::{token_for, verify_token};

/// The number of closest nodes returned in a `find_node`/`get_peers` reply.
const REPLY_NODE_COUNT: usize = 8;

pub struct DhtHandler {
    pub(crate) local: Arc<LocalNode>,
    pub(crate) table: Arc<RoutingTable>,
}

impl DhtHandler {
    fn closest_valid_nodes(&self, target: krpc_encoding::NodeId) -> Vec<(krpc_encoding::NodeId, Endpoint)> {
        self.table
            .query_allow_empty(Some(REPLY_NODE_COUNT), is_bep42_valid, rank_by_distance(target))
            .into_iter()
            .map(|node| (node.id, node.endpoint))
            .collect()
    }

    fn register_sender(&self, source: Endpoint, query: &Query, version: Option<Vec<u8>>) {
        if source.is_privileged() {
            tracing::debug!(%source, "ignoring query from a privileged source port");
            return;
        }
        self.table.register(source, query.sender_id(), version);
    }
}

impl QueryHandler for DhtHandler {
    fn handle_query(
        &self,
        source: SocketAddr,
        version: Option<Vec<u8>>,
        query: Query,
        reply: ReplySender,
    ) {
        let Some(source) = to_ipv4_endpoint(source) else {
            tracing::debug!(%source, "dropping query from a non-IPv4 source");
            return;
        };
        self.register_sender(source, &query, version);

        match query {
            Query::Ping { .. } => {
                reply.send_reply(id_only_reply(self.local.id()));
            }
            Query::FindNode { target, .. } => {
                let nodes = self.closest_valid_nodes(target);
                reply.send_reply(find_node_reply(self.local.id(), &nodes));
            }
            Query::GetPeers { info_hash, .. } => {
                let token = token_for(&self.local.token_key, source.ip);
                let nodes = self.closest_valid_nodes(info_hash);
                let values = self.local.values_for(&info_hash);
                reply.send_reply(get_peers_reply(self.local.id(), &token, &nodes, &values));
            }
            Query::AnnouncePeer {
                id,
                info_hash,
                port,
                token,
                implied_port,
            } => {
                let token_ok = verify_token(&token, &self.local.token_key, source.ip);
                let id_ok = krpc_encoding::bep42::valid_id(&id, source.ip);
                if !token_ok || !id_ok {
                    tracing::debug!(%source, token_ok, id_ok, "rejecting announce_peer");
                    return;
                }
                let effective_port = if implied_port { source.port } else { port };
                self.local
                    .record_announce(info_hash, Endpoint::new(source.ip, effective_port));
                reply.send_reply(id_only_reply(self.local.id()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krpc_encoding::{bep42, NodeId};
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio_krpc::{KRPCPeer, QueryError};

    struct Silent;
    impl QueryHandler for Silent {
        fn handle_query(&self, _source: SocketAddr, _version: Option<Vec<u8>>, _query: Query, _reply: ReplySender) {}
    }

    async fn bind_server() -> (KRPCPeer, Arc<LocalNode>, Arc<RoutingTable>) {
        let local = Arc::new(LocalNode::new(Endpoint::new(Ipv4Addr::LOCALHOST, 0), NodeId::random(), [7u8; 20]));
        let table = Arc::new(RoutingTable::new());
        let handler = Arc::new(DhtHandler {
            local: local.clone(),
            table: table.clone(),
        });
        let peer = KRPCPeer::bind("127.0.0.1:0".parse().unwrap(), b"RS01".to_vec(), handler)
            .await
            .unwrap();
        (peer, local, table)
    }

    async fn bind_client() -> KRPCPeer {
        KRPCPeer::bind("127.0.0.1:0".parse().unwrap(), b"RS01".to_vec(), Arc::new(Silent))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn ping_replies_with_the_local_id() {
        let (server, local, _table) = bind_server().await;
        let client = bind_client().await;

        let reply = client
            .send_query(server.local_addr(), Query::Ping { id: NodeId::random() })
            .wait(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.id(), Some(local.id()));
    }

    #[tokio::test]
    async fn find_node_returns_only_bep42_valid_nodes() {
        let (server, _local, table) = bind_server().await;

        let valid_endpoint = Endpoint::new(Ipv4Addr::new(203, 0, 113, 9), 7000);
        let mut valid_id = NodeId::random();
        let salt = valid_id.as_bytes()[19];
        valid_id.set_prefix(&bep42::prefix_bytes(valid_endpoint.ip, salt, 0));
        table.register(valid_endpoint, valid_id, None);

        let invalid_endpoint = Endpoint::new(Ipv4Addr::new(203, 0, 113, 10), 7001);
        let invalid_id = NodeId::from_bytes([0xAAu8; 20]);
        table.register(invalid_endpoint, invalid_id, None);

        let client = bind_client().await;
        let reply = client
            .send_query(
                server.local_addr(),
                Query::FindNode {
                    id: NodeId::random(),
                    target: NodeId::random(),
                },
            )
            .wait(Duration::from_secs(1))
            .await
            .unwrap();

        let nodes = reply.nodes();
        assert!(nodes.iter().any(|(id, ep)| *id == valid_id && *ep == valid_endpoint));
        assert!(!nodes.iter().any(|(id, _)| *id == invalid_id));
    }

    #[tokio::test]
    async fn get_peers_returns_a_token_and_any_stored_values() {
        let (server, local, _table) = bind_server().await;
        let info_hash = NodeId::random();
        let stored = Endpoint::new(Ipv4Addr::new(10, 0, 0, 5), 6885);
        local.record_announce(info_hash, stored);

        let client = bind_client().await;
        let reply = client
            .send_query(
                server.local_addr(),
                Query::GetPeers {
                    id: NodeId::random(),
                    info_hash,
                },
            )
            .wait(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(reply.token().is_some());
        assert_eq!(reply.values(), vec![stored]);
    }

    #[tokio::test]
    async fn announce_peer_with_a_bad_token_is_silently_dropped() {
        let (server, _local, _table) = bind_server().await;
        let client = bind_client().await;

        let result = client
            .send_query(
                server.local_addr(),
                Query::AnnouncePeer {
                    id: NodeId::random(),
                    info_hash: NodeId::random(),
                    port: 6881,
                    token: b"not-a-real-token".to_vec(),
                    implied_port: false,
                },
            )
            .wait(Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(QueryError::Timeout)));
    }

    #[tokio::test]
    async fn announce_peer_with_a_valid_token_records_the_effective_endpoint() {
        let (server, local, _table) = bind_server().await;
        let client = bind_client().await;
        let info_hash = NodeId::random();

        let get_peers_reply = client
            .send_query(
                server.local_addr(),
                Query::GetPeers {
                    id: NodeId::random(),
                    info_hash,
                },
            )
            .wait(Duration::from_secs(1))
            .await
            .unwrap();
        let token = get_peers_reply.token().unwrap();

        let client_source = client.local_addr();
        let client_ip = match client_source.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => panic!("expected an IPv4 client address"),
        };
        let mut announce_id = NodeId::random();
        let salt = announce_id.as_bytes()[19];
        announce_id.set_prefix(&bep42::prefix_bytes(client_ip, salt, 0));

        client
            .send_query(
                server.local_addr(),
                Query::AnnouncePeer {
                    id: announce_id,
                    info_hash,
                    port: 6999,
                    token,
                    implied_port: true,
                },
            )
            .wait(Duration::from_secs(1))
            .await
            .unwrap();

        let expected = Endpoint::new(client_ip, client_source.port());
        assert_eq!(local.values_for(&info_hash), vec![expected]);
    }
}
