use thiserror::Error;
use tokio_krpc::TransportError;

use krpc_encoding::Endpoint;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[from] TransportError),
    #[error("bootstrap ping to {0} timed out or was malformed")]
    BootstrapFailed(Endpoint),
}
