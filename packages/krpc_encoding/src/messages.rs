//! KRPC message shapes: queries, the generic reply/error envelope, and the
//! helpers that build/parse them against [`crate::bencode::Value`].
//!
//! This deliberately does not lean on a derive-based encoding (the way a
//! later generation of the teacher crate used `serde_bencode`): the wire
//! codec is the point of this crate, and a typed `Query` enum built by hand
//! against `bencode::Value` keeps argument decoding explicit rather than
//! introspecting handler signatures the way the original Python peer did.

use thiserror::Error;

use crate::bencode::{self, BencodeError, Value};
use crate::node_id::NodeId;
use crate::wire::{decode_connection, decode_nodes, encode_connection, encode_nodes, Endpoint};

/// 2-byte opaque transaction id, matched between a query and its reply.
pub type TransactionId = [u8; 2];

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid bencoding: {0}")]
    InvalidEncoding(#[from] BencodeError),
    #[error("message missing required key {0:?}")]
    MissingKey(&'static str),
    #[error("message had the wrong shape for key {0:?}")]
    WrongShape(&'static str),
    #[error("unknown query method {0:?}")]
    UnknownMethod(String),
}

/// The queries defined by BEP-0005.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: NodeId,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: NodeId,
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    },
}

impl Query {
    pub fn name(&self) -> &'static str {
        match self {
            Query::Ping { .. } => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }

    pub fn sender_id(&self) -> NodeId {
        match self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. } => *id,
        }
    }

    pub fn to_args(&self) -> Value {
        let mut args = Value::dict();
        match self {
            Query::Ping { id } => {
                args.insert("id", Value::Bytes(id.as_bytes().to_vec()));
            }
            Query::FindNode { id, target } => {
                args.insert("id", Value::Bytes(id.as_bytes().to_vec()));
                args.insert("target", Value::Bytes(target.as_bytes().to_vec()));
            }
            Query::GetPeers { id, info_hash } => {
                args.insert("id", Value::Bytes(id.as_bytes().to_vec()));
                args.insert("info_hash", Value::Bytes(info_hash.as_bytes().to_vec()));
            }
            Query::AnnouncePeer {
                id,
                info_hash,
                port,
                token,
                implied_port,
            } => {
                args.insert("id", Value::Bytes(id.as_bytes().to_vec()));
                args.insert("info_hash", Value::Bytes(info_hash.as_bytes().to_vec()));
                args.insert("port", Value::Int(*port as i64));
                args.insert("token", Value::Bytes(token.clone()));
                args.insert("implied_port", Value::Int(if *implied_port { 1 } else { 0 }));
            }
        }
        args
    }

    pub fn from_name_and_args(name: &str, args: &Value) -> Result<Query, MessageError> {
        fn get_id(args: &Value, key: &'static str) -> Result<NodeId, MessageError> {
            args.get(key.as_bytes())
                .and_then(Value::as_bytes)
                .and_then(|b| NodeId::try_from_slice(b).ok())
                .ok_or(MessageError::MissingKey(key))
        }

        match name {
            "ping" => Ok(Query::Ping {
                id: get_id(args, "id")?,
            }),
            "find_node" => Ok(Query::FindNode {
                id: get_id(args, "id")?,
                target: get_id(args, "target")?,
            }),
            "get_peers" => Ok(Query::GetPeers {
                id: get_id(args, "id")?,
                info_hash: get_id(args, "info_hash")?,
            }),
            "announce_peer" => {
                let id = get_id(args, "id")?;
                let info_hash = get_id(args, "info_hash")?;
                let token = args
                    .get(b"token")
                    .and_then(Value::as_bytes)
                    .ok_or(MessageError::MissingKey("token"))?
                    .to_vec();
                let implied_port = args
                    .get(b"implied_port")
                    .and_then(Value::as_int)
                    .map(|n| n != 0)
                    .unwrap_or(false);
                let port = args
                    .get(b"port")
                    .and_then(Value::as_int)
                    .map(|n| n as u16)
                    .unwrap_or(0);
                Ok(Query::AnnouncePeer {
                    id,
                    info_hash,
                    port,
                    token,
                    implied_port,
                })
            }
            other => Err(MessageError::UnknownMethod(other.to_string())),
        }
    }
}

/// Builds the reply-values dict for a `ping` or `announce_peer` reply.
pub fn id_only_reply(id: NodeId) -> Value {
    let mut values = Value::dict();
    values.insert("id", Value::Bytes(id.as_bytes().to_vec()));
    values
}

/// Builds the reply-values dict for a `find_node` reply.
pub fn find_node_reply(id: NodeId, nodes: &[(NodeId, Endpoint)]) -> Value {
    let mut values = id_only_reply(id);
    values.insert("nodes", Value::Bytes(encode_nodes(nodes)));
    values
}

/// Builds the reply-values dict for a `get_peers` reply.
pub fn get_peers_reply(
    id: NodeId,
    token: &[u8],
    nodes: &[(NodeId, Endpoint)],
    values: &[Endpoint],
) -> Value {
    let mut reply = id_only_reply(id);
    reply.insert("token", Value::Bytes(token.to_vec()));
    reply.insert("nodes", Value::Bytes(encode_nodes(nodes)));
    if !values.is_empty() {
        let list = values
            .iter()
            .map(|ep| Value::Bytes(encode_connection(ep).to_vec()))
            .collect();
        reply.insert("values", Value::List(list));
    }
    reply
}

/// A decoded `r` dict (or the generic success payload of a resolved
/// completion): typed accessors over an otherwise-untyped bencode dict,
/// since its shape varies by which query produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyValues(pub Value);

impl ReplyValues {
    pub fn id(&self) -> Option<NodeId> {
        self.0
            .get(b"id")
            .and_then(Value::as_bytes)
            .and_then(|b| NodeId::try_from_slice(b).ok())
    }

    pub fn version(&self) -> Option<Vec<u8>> {
        self.0.get(b"v").and_then(Value::as_bytes).map(|b| b.to_vec())
    }

    pub fn token(&self) -> Option<Vec<u8>> {
        self.0.get(b"token").and_then(Value::as_bytes).map(|b| b.to_vec())
    }

    pub fn nodes(&self) -> Vec<(NodeId, Endpoint)> {
        self.0
            .get(b"nodes")
            .and_then(Value::as_bytes)
            .map(decode_nodes)
            .unwrap_or_default()
    }

    pub fn values(&self) -> Vec<Endpoint> {
        self.0
            .get(b"values")
            .and_then(Value::as_list)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_bytes)
                    .filter_map(|b| decode_connection(b).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The body of a KRPC message: a query, a successful reply, or an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Query { method: String, args: Value },
    Reply { values: Value },
    Error { code: i64, message: String },
}

/// A full KRPC datagram: transaction id, body, optional client version tag,
/// and (reply-only) the BEP-42 `ip` field echoing the querier's endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub transaction_id: TransactionId,
    pub version: Option<Vec<u8>>,
    pub body: MessageBody,
    pub ip: Option<Endpoint>,
}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut dict = Value::dict();
        dict.insert("t", Value::Bytes(self.transaction_id.to_vec()));
        match &self.body {
            MessageBody::Query { method, args } => {
                dict.insert("y", Value::from("q"));
                dict.insert("q", Value::Bytes(method.as_bytes().to_vec()));
                dict.insert("a", args.clone());
            }
            MessageBody::Reply { values } => {
                dict.insert("y", Value::from("r"));
                dict.insert("r", values.clone());
            }
            MessageBody::Error { code, message } => {
                dict.insert("y", Value::from("e"));
                dict.insert(
                    "e",
                    Value::List(vec![Value::Int(*code), Value::Bytes(message.as_bytes().to_vec())]),
                );
            }
        }
        if let Some(version) = &self.version {
            dict.insert("v", Value::Bytes(version.clone()));
        }
        if let Some(ip) = &self.ip {
            dict.insert("ip", Value::Bytes(encode_connection(ip).to_vec()));
        }
        bencode::encode(&dict)
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope, MessageError> {
        let value = bencode::decode(bytes)?;
        let transaction_id = value
            .get(b"t")
            .and_then(Value::as_bytes)
            .ok_or(MessageError::MissingKey("t"))
            .and_then(|b| <[u8; 2]>::try_from(b).map_err(|_| MessageError::WrongShape("t")))?;
        let y = value.get(b"y").and_then(Value::as_bytes).ok_or(MessageError::MissingKey("y"))?;
        let body = match y {
            b"q" => {
                let method = value
                    .get(b"q")
                    .and_then(Value::as_bytes)
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .ok_or(MessageError::MissingKey("q"))?;
                let args = value.get(b"a").cloned().ok_or(MessageError::MissingKey("a"))?;
                MessageBody::Query { method, args }
            }
            b"r" => {
                let values = value.get(b"r").cloned().ok_or(MessageError::MissingKey("r"))?;
                MessageBody::Reply { values }
            }
            b"e" => {
                let error_list = value.get(b"e").and_then(Value::as_list).ok_or(MessageError::MissingKey("e"))?;
                if error_list.len() != 2 {
                    return Err(MessageError::WrongShape("e"));
                }
                let code = error_list[0].as_int().ok_or(MessageError::WrongShape("e"))?;
                let message = error_list[1]
                    .as_bytes()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .ok_or(MessageError::WrongShape("e"))?;
                MessageBody::Error { code, message }
            }
            _ => return Err(MessageError::WrongShape("y")),
        };
        let version = value.get(b"v").and_then(Value::as_bytes).map(|b| b.to_vec());
        let ip = value.get(b"ip").and_then(Value::as_bytes).and_then(|b| decode_connection(b).ok());
        Ok(Envelope {
            transaction_id,
            version,
            body,
            ip,
        })
    }
}
