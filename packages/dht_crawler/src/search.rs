//! Iterative closest-node search (spec §4.7), generalizing `tinybt`'s
//! `DHT._iter_krpc_search`: a query function, a result projection, and a
//! target drive a lazy, cancellable sequence of unique [`Endpoint`]
//! results. `find_node` and `get_peers` are both instances of this with
//! different `query`/`project` closures.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use krpc_encoding::{Endpoint, NodeId};
use routing_table::{not_in, rank_by_distance, Node, RoutingTable};
use tokio::sync::mpsc;
use tokio_krpc::{QueryError, QueryReply};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// Candidates considered per round, before the `pending <= 3` admission
/// filter is applied.
const CANDIDATES_PER_ROUND: usize = 20;
/// A node already juggling this many of our in-flight queries is skipped
/// for a round rather than piled on.
const MAX_PENDING_PER_NODE: u32 = 3;

pub struct SearchConfig {
    pub round_timeout: Duration,
    pub retries: u32,
}

/// Resolves (or times out / errors) a query sent to `node`, updates the
/// node's health in `table`, and returns the reply on success. Shared by
/// every response-evaluating call site (spec §4.6 "Response evaluation").
pub async fn evaluate_response<F, Fut>(
    table: &RoutingTable,
    node: &Arc<Node>,
    query: F,
    timeout: Duration,
) -> Option<QueryReply>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<QueryReply, QueryError>>,
{
    match tokio::time::timeout(timeout, query()).await {
        Ok(Ok(reply)) => {
            if let Some(version) = reply.version() {
                node.set_version_if_unknown(Some(version));
            }
            if let Some(id) = reply.id() {
                if id != node.id {
                    tracing::debug!(old = %node.id, new = %id, "node identity changed; force-removing");
                    table.remove(node, true);
                    return None;
                }
            }
            table.mark_good(node);
            Some(reply)
        }
        Ok(Err(err)) => {
            tracing::debug!(endpoint = %node.endpoint, error = %err, "query failed");
            table.remove(node, false);
            None
        }
        Err(_) => {
            tracing::debug!(endpoint = %node.endpoint, "query timed out");
            table.remove(node, false);
            None
        }
    }
}

/// Runs the iterative search in the background and streams unique
/// [`Endpoint`] results as they arrive. Dropping the stream stops
/// consuming from the channel; the background task notices on its next
/// send and exits (mirrors the Completion "drop the receiver" contract).
pub fn iterative_search<Q, QFut, P>(
    table: Arc<RoutingTable>,
    local_id: NodeId,
    target: NodeId,
    config: SearchConfig,
    cancel: CancellationToken,
    query: Q,
    project: P,
) -> UnboundedReceiverStream<Endpoint>
where
    Q: Fn(Endpoint, NodeId, NodeId) -> QFut + Send + Sync + 'static,
    QFut: Future<Output = Result<QueryReply, QueryError>> + Send + 'static,
    P: Fn(&Arc<Node>, &QueryReply) -> Vec<Endpoint> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_search(table, local_id, target, config, cancel, query, project, tx));
    UnboundedReceiverStream::new(rx)
}

async fn run_search<Q, QFut, P>(
    table: Arc<RoutingTable>,
    local_id: NodeId,
    target: NodeId,
    config: SearchConfig,
    cancel: CancellationToken,
    query: Q,
    project: P,
    tx: mpsc::UnboundedSender<Endpoint>,
) where
    Q: Fn(Endpoint, NodeId, NodeId) -> QFut + Send + Sync + 'static,
    QFut: Future<Output = Result<QueryReply, QueryError>> + Send + 'static,
    P: Fn(&Arc<Node>, &QueryReply) -> Vec<Endpoint> + Send + Sync + 'static,
{
    let mut returned: HashSet<Endpoint> = HashSet::new();
    let mut used: HashMap<Endpoint, u32> = HashMap::new();
    let mut discovered: HashMap<Endpoint, Arc<Node>> = HashMap::new();

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let blacklist: HashSet<Endpoint> = used
            .iter()
            .filter(|(_, &count)| count > config.retries)
            .map(|(ep, _)| *ep)
            .collect();
        discovered.retain(|ep, _| !blacklist.contains(ep));

        let mut candidates: HashMap<Endpoint, Arc<Node>> = table
            .query_allow_empty(Some(CANDIDATES_PER_ROUND), not_in(&blacklist), rank_by_distance(target))
            .into_iter()
            .map(|node| (node.endpoint, node))
            .collect();
        for (ep, node) in &discovered {
            candidates.entry(*ep).or_insert_with(|| node.clone());
        }

        if candidates.is_empty() {
            return;
        }

        let mut in_flight = Vec::new();
        for node in candidates.values() {
            if node.pending() > MAX_PENDING_PER_NODE {
                continue;
            }
            node.incr_pending();
            *used.entry(node.endpoint).or_insert(0) += 1;
            let fut = query(node.endpoint, local_id, target);
            in_flight.push((node.clone(), fut));
        }

        let round_deadline = Instant::now() + config.round_timeout;
        for (node, fut) in in_flight {
            if cancel.is_cancelled() {
                return;
            }
            let remaining = round_deadline.saturating_duration_since(Instant::now());
            let reply = evaluate_response(&table, &node, || fut, remaining).await;
            node.decr_pending();

            let Some(reply) = reply else { continue };

            for (id, endpoint) in reply.nodes() {
                if let Some(registered) = table.register(endpoint, id, None) {
                    discovered.insert(endpoint, registered);
                }
            }

            for endpoint in project(&node, &reply) {
                if returned.insert(endpoint) && tx.send(endpoint).is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krpc_encoding::messages::find_node_reply;
    use std::net::Ipv4Addr;
    use tokio_stream::StreamExt;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), port)
    }

    /// A hub node's `find_node` reply names the target exactly once; the
    /// target itself replies with nothing further. The search must yield
    /// the target's endpoint exactly once and then terminate once both
    /// entries exceed the retry budget (spec §8 "search monotonicity" and
    /// "search termination").
    #[tokio::test]
    async fn find_node_style_search_yields_each_result_once_and_terminates() {
        let table = Arc::new(RoutingTable::new());
        let hub_id = NodeId::random();
        let hub_endpoint = ep(41001);
        table.register(hub_endpoint, hub_id, None);

        let target = NodeId::random();
        let target_endpoint = ep(41002);

        let stream = iterative_search(
            table,
            NodeId::random(),
            target,
            SearchConfig {
                round_timeout: Duration::from_millis(200),
                retries: 1,
            },
            CancellationToken::new(),
            move |endpoint, _caller_id, _search_target| async move {
                let reply = if endpoint == hub_endpoint {
                    find_node_reply(hub_id, &[(target, target_endpoint)])
                } else {
                    find_node_reply(target, &[])
                };
                Ok(QueryReply {
                    values: krpc_encoding::ReplyValues(reply),
                    ip: None,
                })
            },
            move |_node, reply: &QueryReply| {
                reply
                    .nodes()
                    .into_iter()
                    .filter(|(id, _)| *id == target)
                    .map(|(_, ep)| ep)
                    .collect()
            },
        );

        let mut stream = stream;
        let mut results = Vec::new();
        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(endpoint) = stream.next().await {
                results.push(endpoint);
            }
        })
        .await;
        assert!(drained.is_ok(), "search did not terminate within its retry budget");
        assert_eq!(results, vec![target_endpoint]);
    }
}
