//! The DHT engine: owns a local node identity, bootstraps via a seed
//! endpoint, answers the four BEP-0005 queries (through [`DhtHandler`]),
//! drives the iterative closest-node search, and runs periodic
//! maintenance. Generalizes `tinybt.dht.dht.DHT`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use krpc_encoding::{bep42, Endpoint, NodeId, Query};
use rand::RngCore;
use routing_table::{InfoHash, LocalNode, Node, RoutingTable};
use tokio::sync::Mutex as AsyncMutex;
use tokio_krpc::{to_ipv4_endpoint, to_socket_addr, KRPCPeer, QueryError, QueryReply};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::errors::DhtError;
use crate::handler::DhtHandler;
use crate::search::{evaluate_response, iterative_search, SearchConfig};

/// A running DHT node. Cheaply `Clone`-free: share it behind an `Arc` if
/// multiple tasks need to call into it concurrently (every method takes
/// `&self`).
pub struct Dht {
    local: Arc<LocalNode>,
    table: Arc<RoutingTable>,
    krpc: Arc<KRPCPeer>,
    config: Config,
    cancel: CancellationToken,
    maintenance: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Dht {
    /// Binds `listen`, pings `bootstrap` to learn our externally visible
    /// endpoint, derives a BEP-42-valid local id for it, registers the
    /// bootstrap peer, and starts all maintenance loops. A bootstrap
    /// failure is fatal, per spec §7.
    pub async fn new(listen: SocketAddr, bootstrap: SocketAddr, config: Config) -> Result<Dht, DhtError> {
        let provisional_id = NodeId::random();
        let mut token_key = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut token_key);

        let listen_ip = match listen.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => std::net::Ipv4Addr::UNSPECIFIED,
        };
        let local = Arc::new(LocalNode::new(
            Endpoint::new(listen_ip, listen.port()),
            provisional_id,
            token_key,
        ));
        let table = Arc::new(RoutingTable::new());

        let handler = Arc::new(DhtHandler {
            local: local.clone(),
            table: table.clone(),
        });
        let krpc = Arc::new(
            KRPCPeer::bind(listen, config.client_version.clone(), handler)
                .await
                .map_err(DhtError::Bind)?,
        );
        local.set_endpoint(Endpoint::new(listen_ip, krpc.local_addr().port()));

        let bootstrap_endpoint =
            to_ipv4_endpoint(bootstrap).unwrap_or(Endpoint::new(std::net::Ipv4Addr::UNSPECIFIED, bootstrap.port()));
        let bootstrap_reply = krpc
            .send_query(bootstrap, Query::Ping { id: provisional_id })
            .wait(config.bootstrap_timeout)
            .await
            .map_err(|_| DhtError::BootstrapFailed(bootstrap_endpoint))?;
        let external = bootstrap_reply
            .ip
            .ok_or(DhtError::BootstrapFailed(bootstrap_endpoint))?;
        let bootstrap_id = bootstrap_reply
            .id()
            .ok_or(DhtError::BootstrapFailed(bootstrap_endpoint))?;
        local.set_endpoint(external);

        let salt = local.id().as_bytes()[19];
        let seed = local.id().as_bytes()[0];
        let prefix = bep42::prefix_bytes(external.ip, salt, seed);
        let mut grafted = local.id();
        grafted.set_prefix(&prefix);
        local.set_id(grafted);
        debug_assert!(bep42::valid_id(&local.id(), external.ip));

        table.register(bootstrap_endpoint, bootstrap_id, bootstrap_reply.version());
        table.protect([local.id()]);

        let cancel = CancellationToken::new();
        let mut maintenance = routing_table::spawn_all(table.clone(), &config.maintenance_config(), cancel.clone());
        maintenance.push(tokio::spawn(check_nodes_loop(
            table.clone(),
            krpc.clone(),
            local.id(),
            config.clone(),
            cancel.clone(),
        )));
        maintenance.push(tokio::spawn(discover_loop(
            table.clone(),
            krpc.clone(),
            local.id(),
            config.clone(),
            cancel.clone(),
        )));

        Ok(Dht {
            local,
            table,
            krpc,
            config,
            cancel,
            maintenance: AsyncMutex::new(maintenance),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local.id()
    }

    /// Our externally visible `(ip, port)`, as reported by the bootstrap
    /// peer's BEP-42 `ip` field. Mirrors `DHT.get_external_connection`.
    pub fn external_endpoint(&self) -> Endpoint {
        self.local.endpoint()
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Cancels all maintenance loops, closes the transport, and joins
    /// every spawned task with a generous timeout.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.krpc.close().await;
        let handles = std::mem::take(&mut *self.maintenance.lock().await);
        let join_all = futures_join_all(handles);
        if tokio::time::timeout(Duration::from_secs(60), join_all).await.is_err() {
            tracing::warn!("maintenance tasks did not join within the shutdown grace period");
        }
    }

    /// Liveness probe (spec §4.6 `ping`).
    pub async fn dht_ping(&self, endpoint: Endpoint, timeout: Duration) -> Option<QueryReply> {
        let reply = self
            .krpc
            .send_query(to_socket_addr(endpoint), Query::Ping { id: self.local_id() })
            .wait(timeout)
            .await
            .ok()?;
        if let Some(id) = reply.id() {
            self.table.register(endpoint, id, reply.version());
        }
        Some(reply)
    }

    /// Iterative closest-node search for `target` (spec §4.7). Yields
    /// every endpoint seen whose node-id exactly equals `target` — in
    /// practice the search usually exhausts the frontier first.
    pub fn dht_find_node(&self, target: NodeId) -> UnboundedReceiverStream<Endpoint> {
        let krpc = self.krpc.clone();
        let local_id = self.local_id();
        let timeout = self.config.query_timeout;
        iterative_search(
            self.table.clone(),
            local_id,
            target,
            SearchConfig {
                round_timeout: self.config.query_timeout,
                retries: self.config.search_retries,
            },
            self.cancel.clone(),
            move |endpoint, our_id, target| {
                let krpc = krpc.clone();
                async move {
                    krpc.send_query(to_socket_addr(endpoint), Query::FindNode { id: our_id, target })
                        .wait(timeout)
                        .await
                }
            },
            move |_node, reply| {
                reply
                    .nodes()
                    .into_iter()
                    .filter(|(id, _)| *id == target)
                    .map(|(_, endpoint)| endpoint)
                    .collect()
            },
        )
    }

    /// Iterative peer lookup for `info_hash` (spec §4.7 `get_peers`).
    /// Every answering node's `token` is recorded for a later
    /// `dht_announce_peer`.
    pub fn dht_get_peers(&self, info_hash: InfoHash) -> UnboundedReceiverStream<Endpoint> {
        let krpc = self.krpc.clone();
        let local_id = self.local_id();
        let timeout = self.config.query_timeout;
        iterative_search(
            self.table.clone(),
            local_id,
            info_hash,
            SearchConfig {
                round_timeout: self.config.query_timeout,
                retries: self.config.search_retries,
            },
            self.cancel.clone(),
            move |endpoint, our_id, info_hash| {
                let krpc = krpc.clone();
                async move {
                    krpc.send_query(to_socket_addr(endpoint), Query::GetPeers { id: our_id, info_hash })
                        .wait(timeout)
                        .await
                }
            },
            move |node, reply| {
                if let Some(token) = reply.token() {
                    node.store_token(info_hash, token);
                }
                reply.values()
            },
        )
    }

    /// Announces `info_hash` to every node that handed us a `get_peers`
    /// token for it (spec §4.6 `announce_peer`).
    pub async fn dht_announce_peer(
        &self,
        info_hash: InfoHash,
        implied_port: bool,
    ) -> Vec<(Endpoint, Result<QueryReply, QueryError>)> {
        let has_token = move |n: &Node| n.has_token_for(&info_hash);
        let Ok(nodes) = self.table.query(None, has_token, |_| 0u8) else {
            return Vec::new();
        };

        let port = self.local.endpoint().port;
        let mut futures = Vec::new();
        for node in nodes {
            let Some(token) = node.token_for(&info_hash) else { continue };
            let krpc = self.krpc.clone();
            let id = self.local_id();
            let endpoint = node.endpoint;
            let timeout = self.config.query_timeout;
            futures.push(async move {
                let result = krpc
                    .send_query(
                        to_socket_addr(endpoint),
                        Query::AnnouncePeer {
                            id,
                            info_hash,
                            port,
                            token,
                            implied_port,
                        },
                    )
                    .wait(timeout)
                    .await;
                (endpoint, result)
            });
        }
        futures_join_all(futures).await
    }
}

async fn futures_join_all<F: std::future::Future>(futures: impl IntoIterator<Item = F>) -> Vec<F::Output> {
    let mut handles = Vec::new();
    for fut in futures {
        handles.push(fut);
    }
    let mut results = Vec::with_capacity(handles.len());
    for fut in handles {
        results.push(fut.await);
    }
    results
}

/// Periodically re-pings nodes that haven't been successfully pinged in
/// `check_staleness`, in batches of `check_batch`. A node whose reply
/// carries a different id than it was registered under is force-removed
/// (spec §9 "node identity changes"). Mirrors `DHT._check_nodes`.
async fn check_nodes_loop(
    table: Arc<RoutingTable>,
    krpc: Arc<KRPCPeer>,
    local_id: NodeId,
    config: Config,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(config.check_interval) => {}
        }

        let stale = move |n: &Node| n.is_stale(config.check_staleness);
        let Ok(candidates) = table.query(Some(config.check_batch), stale, |_| 0u8) else {
            continue;
        };
        if candidates.is_empty() {
            continue;
        }
        tracing::debug!(count = candidates.len(), "liveness check: pinging stale nodes");

        for node in candidates {
            node.mark_pinged_now();
            let endpoint = node.endpoint;
            let krpc = krpc.clone();
            let table = table.clone();
            let timeout = config.check_ping_timeout;
            evaluate_response(
                &table,
                &node,
                || async move {
                    krpc.send_query(to_socket_addr(endpoint), Query::Ping { id: local_id })
                        .wait(timeout)
                        .await
                },
                timeout,
            )
            .await;
        }
    }
}

/// Periodically runs a `find_node` against a random target to keep the
/// routing table populated, short-circuiting after a handful of results.
/// Mirrors `DHT._discover_nodes`.
async fn discover_loop(
    table: Arc<RoutingTable>,
    krpc: Arc<KRPCPeer>,
    local_id: NodeId,
    config: Config,
    cancel: CancellationToken,
) {
    const DISCOVERY_RESULT_CAP: usize = 10;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(config.discover_interval) => {}
        }
        tracing::debug!("discovery: searching for a random target");
        let target = NodeId::random();
        let timeout = config.query_timeout;
        let mut stream = iterative_search(
            table.clone(),
            local_id,
            target,
            SearchConfig {
                round_timeout: config.query_timeout,
                retries: config.search_retries,
            },
            cancel.clone(),
            move |endpoint, our_id, target| {
                let krpc = krpc.clone();
                async move {
                    krpc.send_query(to_socket_addr(endpoint), Query::FindNode { id: our_id, target })
                        .wait(timeout)
                        .await
                }
            },
            |_node, _reply| Vec::new(),
        );
        let mut seen = 0;
        while seen < DISCOVERY_RESULT_CAP {
            if stream.next().await.is_none() {
                break;
            }
            seen += 1;
        }
    }
}
