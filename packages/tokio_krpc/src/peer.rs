//! The KRPC peer: transaction-id-matched request/response layer over
//! [`UdpTransport`], plus a server-side dispatcher that hands incoming
//! queries to a user-supplied [`QueryHandler`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use krpc_encoding::{Endpoint, Envelope, MessageBody, Query, ReplyValues, TransactionId, Value};
use tokio::sync::oneshot;
use tracing::instrument;

use crate::errors::{QueryError, TransportError};
use crate::transport::UdpTransport;

pub fn to_ipv4_endpoint(addr: SocketAddr) -> Option<Endpoint> {
    match addr {
        SocketAddr::V4(v4) => Some(Endpoint::new(*v4.ip(), v4.port())),
        SocketAddr::V6(_) => None,
    }
}

fn endpoint_to_sockaddr(ep: Endpoint) -> SocketAddr {
    SocketAddr::new(std::net::IpAddr::V4(ep.ip), ep.port)
}

/// Invoked once per inbound query, after the sender's `id` (if present) has
/// already been used to register it in the routing table by the caller.
/// `version` is the envelope's `v` field, forwarded so the caller can tag a
/// newly-registered node with it. Handlers run synchronously: all they do
/// is read/update local state and send a reply, never block on I/O.
pub trait QueryHandler: Send + Sync + 'static {
    fn handle_query(&self, source: SocketAddr, version: Option<Vec<u8>>, query: Query, reply: ReplySender);
}

/// A callback the dispatcher hands to the query handler. Replying always
/// stamps in the BEP-42 `ip` field for the querier's endpoint.
#[derive(Clone)]
pub struct ReplySender {
    peer: Weak<PeerInner>,
    source: SocketAddr,
    transaction_id: TransactionId,
}

impl ReplySender {
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn send_reply(&self, values: Value) {
        let Some(peer) = self.peer.upgrade() else { return };
        let envelope = Envelope {
            transaction_id: self.transaction_id,
            version: Some(peer.client_version.clone()),
            body: MessageBody::Reply { values },
            ip: to_ipv4_endpoint(self.source),
        };
        peer.transport.send(self.source, envelope.encode());
    }

    pub fn send_error(&self, code: i64, message: impl Into<String>) {
        let Some(peer) = self.peer.upgrade() else { return };
        let envelope = Envelope {
            transaction_id: self.transaction_id,
            version: Some(peer.client_version.clone()),
            body: MessageBody::Error {
                code,
                message: message.into(),
            },
            ip: to_ipv4_endpoint(self.source),
        };
        peer.transport.send(self.source, envelope.encode());
    }
}

enum CompletionOutcome {
    Reply(ReplyValues, Option<Endpoint>),
    Error { code: i64, message: String },
}

/// A resolved reply: the `r` dict plus the BEP-42 `ip` field the replier
/// stamped in (if any). Derefs to [`ReplyValues`] so existing call sites
/// that only care about the dict keep working unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryReply {
    pub values: ReplyValues,
    pub ip: Option<Endpoint>,
}

impl std::ops::Deref for QueryReply {
    type Target = ReplyValues;
    fn deref(&self) -> &ReplyValues {
        &self.values
    }
}

/// A pending outgoing request. Resolves when a matching reply/error
/// arrives, or raises [`QueryError::Timeout`] if `wait`'s deadline passes
/// first. Dropping it without waiting reclaims the transaction slot.
pub struct Completion {
    peer: Weak<PeerInner>,
    addr: SocketAddr,
    transaction_id: TransactionId,
    rx: oneshot::Receiver<CompletionOutcome>,
    sent_at: Instant,
}

impl Completion {
    pub fn age(&self) -> Duration {
        self.sent_at.elapsed()
    }

    pub async fn wait(mut self, timeout: Duration) -> Result<QueryReply, QueryError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(CompletionOutcome::Reply(values, ip))) => Ok(QueryReply { values, ip }),
            Ok(Ok(CompletionOutcome::Error { code, message })) => {
                Err(QueryError::KRPCError { code, message })
            }
            Ok(Err(_)) => Err(QueryError::Cancelled),
            Err(_) => Err(QueryError::Timeout),
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(peer) = self.peer.upgrade() {
            peer.transactions
                .lock()
                .unwrap()
                .remove(&(self.addr, self.transaction_id));
        }
    }
}

struct PeerInner {
    transport: UdpTransport,
    transactions: Mutex<HashMap<(SocketAddr, TransactionId), oneshot::Sender<CompletionOutcome>>>,
    client_version: Vec<u8>,
    handler: Arc<dyn QueryHandler>,
}

impl PeerInner {
    fn register_transaction(
        &self,
        addr: SocketAddr,
        tx: oneshot::Sender<CompletionOutcome>,
    ) -> TransactionId {
        use std::collections::hash_map::Entry;
        let mut map = self.transactions.lock().unwrap();
        loop {
            let candidate: TransactionId = rand::random();
            if let Entry::Vacant(slot) = map.entry((addr, candidate)) {
                slot.insert(tx);
                return candidate;
            }
        }
    }
}

/// A KRPC peer bound to a single UDP socket.
pub struct KRPCPeer {
    inner: Arc<PeerInner>,
    dispatch_task: tokio::task::JoinHandle<()>,
}

impl KRPCPeer {
    pub async fn bind(
        addr: SocketAddr,
        client_version: Vec<u8>,
        handler: Arc<dyn QueryHandler>,
    ) -> Result<KRPCPeer, TransportError> {
        let transport = UdpTransport::bind(addr).await?;
        let inner = Arc::new(PeerInner {
            transport,
            transactions: Mutex::new(HashMap::new()),
            client_version,
            handler,
        });
        let dispatch_inner = inner.clone();
        let dispatch_task = tokio::spawn(dispatch_loop(dispatch_inner));
        Ok(KRPCPeer { inner, dispatch_task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    /// Sends `query` to `addr` and returns a [`Completion`] the caller can
    /// `wait` on.
    pub fn send_query(&self, addr: SocketAddr, query: Query) -> Completion {
        let (tx, rx) = oneshot::channel();
        let transaction_id = self.inner.register_transaction(addr, tx);
        let envelope = Envelope {
            transaction_id,
            version: Some(self.inner.client_version.clone()),
            body: MessageBody::Query {
                method: query.name().to_string(),
                args: query.to_args(),
            },
            ip: None,
        };
        self.inner.transport.send(addr, envelope.encode());
        Completion {
            peer: Arc::downgrade(&self.inner),
            addr,
            transaction_id,
            rx,
            sent_at: Instant::now(),
        }
    }

    pub async fn shutdown(self) {
        self.inner.transport.close().await;
        let _ = self.dispatch_task.await;
    }

    /// Closes the underlying transport without requiring ownership, for
    /// callers that keep the peer behind an `Arc`. Unblocks the dispatch
    /// loop (its `recv` returns `None`) but does not join it; use
    /// [`KRPCPeer::shutdown`] when exclusive ownership is available.
    pub async fn close(&self) {
        self.inner.transport.close().await;
    }
}

#[instrument(skip(inner))]
async fn dispatch_loop(inner: Arc<PeerInner>) {
    while let Some((bytes, addr)) = inner.transport.recv().await {
        let inner = inner.clone();
        // One dispatcher invocation per inbound datagram.
        tokio::spawn(async move {
            inner.handle_datagram(addr, &bytes);
        });
    }
}

impl PeerInner {
    fn handle_datagram(self: &Arc<Self>, addr: SocketAddr, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(%addr, error = %err, "dropping malformed KRPC datagram");
                return;
            }
        };
        match envelope.body {
            MessageBody::Reply { values } => {
                self.resolve(addr, envelope.transaction_id, CompletionOutcome::Reply(ReplyValues(values)));
            }
            MessageBody::Error { code, message } => {
                self.resolve(addr, envelope.transaction_id, CompletionOutcome::Error { code, message });
            }
            MessageBody::Query { method, args } => {
                let query = match Query::from_name_and_args(&method, &args) {
                    Ok(query) => query,
                    Err(err) => {
                        tracing::debug!(%addr, method, error = %err, "ignoring malformed/unknown query");
                        return;
                    }
                };
                let reply = ReplySender {
                    peer: Arc::downgrade(self),
                    source: addr,
                    transaction_id: envelope.transaction_id,
                };
                let handler = self.handler.clone();
                let version = envelope.version.clone();
                // Handler exceptions must never crash the peer.
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    handler.handle_query(addr, version, query, reply);
                }));
                if outcome.is_err() {
                    tracing::debug!(%addr, "query handler panicked; swallowed");
                }
            }
        }
    }

    fn resolve(&self, addr: SocketAddr, transaction_id: TransactionId, outcome: CompletionOutcome) {
        match self.transactions.lock().unwrap().remove(&(addr, transaction_id)) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                tracing::debug!(%addr, "discarding reply for unknown transaction");
            }
        }
    }
}

pub use endpoint_to_sockaddr as to_socket_addr;

#[cfg(test)]
mod tests {
    use super::*;
    use krpc_encoding::NodeId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoHandler {
        seen: AtomicUsize,
    }

    impl QueryHandler for EchoHandler {
        fn handle_query(&self, _source: SocketAddr, _version: Option<Vec<u8>>, query: Query, reply: ReplySender) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if let Query::Ping { id } = query {
                reply.send_reply(krpc_encoding::messages::id_only_reply(id));
            }
        }
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let handler = Arc::new(EchoHandler { seen: AtomicUsize::new(0) });
        let server = KRPCPeer::bind(
            "127.0.0.1:0".parse().unwrap(),
            b"XK\x00\x01".to_vec(),
            handler.clone(),
        )
        .await
        .unwrap();

        let noop_handler = Arc::new(EchoHandler { seen: AtomicUsize::new(0) });
        let client = KRPCPeer::bind(
            "127.0.0.1:0".parse().unwrap(),
            b"XK\x00\x01".to_vec(),
            noop_handler,
        )
        .await
        .unwrap();

        let our_id = NodeId::random();
        let completion = client.send_query(server.local_addr(), Query::Ping { id: our_id });
        let reply = completion.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.id(), Some(our_id));
        assert_eq!(handler.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unanswered_query_times_out() {
        let handler = Arc::new(EchoHandler { seen: AtomicUsize::new(0) });
        let client = KRPCPeer::bind("127.0.0.1:0".parse().unwrap(), b"XK".to_vec(), handler)
            .await
            .unwrap();
        // Nothing is listening on this address.
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let completion = client.send_query(dead, Query::Ping { id: NodeId::random() });
        let result = completion.wait(Duration::from_millis(50)).await;
        assert_eq!(result.unwrap_err(), QueryError::Timeout);
    }
}
