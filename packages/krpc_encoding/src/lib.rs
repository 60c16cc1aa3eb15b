//! Wire-level building blocks for the mainline DHT: the bencode codec, fixed
//! width integer/endpoint packing, CRC32C, BEP-42 node identity, and the
//! KRPC message shapes built on top of them. No I/O lives here; this crate
//! is pure encoding/decoding so it can be unit tested without a socket.

pub mod bencode;
pub mod bep42;
pub mod crc32c;
pub mod messages;
pub mod node_id;
pub mod wire;

pub use bencode::{BencodeError, Value};
pub use messages::{Envelope, MessageBody, MessageError, Query, ReplyValues, TransactionId};
pub use node_id::NodeId;
pub use wire::{Endpoint, WireError};
