//! Tokio-based UDP transport and transaction-matched KRPC peer: the layer
//! that turns [`krpc_encoding`] messages into an actual client/server.

mod errors;
mod peer;
mod transport;

pub use errors::{QueryError, TransportError};
pub use peer::{
    to_ipv4_endpoint, to_socket_addr, Completion, KRPCPeer, QueryHandler, QueryReply, ReplySender,
};
pub use transport::UdpTransport;
