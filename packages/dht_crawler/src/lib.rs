//! A Mainline BitTorrent DHT (BEP-0005) engine: bootstrap, the four KRPC
//! queries, an iterative closest-node search, BEP-42 node identity, and the
//! maintenance loops that keep a bucketless routing table bounded.
//!
//! Built on [`krpc_encoding`] (the wire codec), [`tokio_krpc`] (the UDP
//! transport and transaction-matched KRPC peer), and [`routing_table`] (node
//! admission, health, and periodic upkeep). This crate wires those layers
//! into [`Dht`], the engine applications drive.

pub mod config;
pub mod dht;
pub mod errors;
pub mod handler;
pub mod search;
pub mod token;

pub use config::Config;
pub use dht::Dht;
pub use errors::DhtError;
pub use search::SearchConfig;
