use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingTableError {
    #[error("routing table has no entries")]
    Empty,
}
