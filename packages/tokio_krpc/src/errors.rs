use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[source] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("query timed out")]
    Timeout,
    #[error("remote returned KRPC error {code}: {message}")]
    KRPCError { code: i64, message: String },
    #[error("completion was abandoned before a reply arrived")]
    Cancelled,
}
