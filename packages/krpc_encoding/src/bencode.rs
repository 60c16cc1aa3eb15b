//! Bencode codec: the self-delimiting nested encoding used on the wire.
//!
//! Grammar: `INT = 'i' <decimal> 'e'`, `STR = <len> ':' <bytes>`,
//! `LIST = 'l' VALUE* 'e'`, `DICT = 'd' (STR VALUE)* 'e'`. Dictionary keys
//! are byte strings and are always emitted in ascending lexicographic order
//! on encode, which falls out for free from storing them in a `BTreeMap`.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// A decoded (or to-be-encoded) bencoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("invalid bencoded data at offset {offset}")]
    InvalidEncoding { offset: usize },
    #[error("truncated bencoded data")]
    Truncated,
    #[error("trailing data after bencoded value at offset {offset}")]
    TrailingData { offset: usize },
}

impl Value {
    pub fn dict() -> Value {
        Value::Dict(BTreeMap::new())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key in a dict value; returns `None` if this isn't a dict
    /// or the key is absent.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    pub fn insert(&mut self, key: impl AsRef<[u8]>, value: impl Into<Value>) {
        if let Value::Dict(d) = self {
            d.insert(key.as_ref().to_vec(), value.into());
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Int(n)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Value {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Value {
        Value::Bytes(b.to_vec())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Value {
        Value::List(l)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Encodes `value` to its canonical bencoded representation.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            for (k, v) in map {
                encode_into(&Value::Bytes(k.clone()), out);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

/// Decodes the bencoded value prefixing `buf`, returning it together with
/// the offset of the first unconsumed byte. Needed by protocols (like ours)
/// that frame a bencoded value inside a larger datagram.
pub fn decode_prefix(buf: &[u8]) -> Result<(Value, usize), BencodeError> {
    parse_value(buf, 0)
}

/// Decodes `buf` as a single top-level bencoded value. Trailing bytes after
/// the value are an error.
pub fn decode(buf: &[u8]) -> Result<Value, BencodeError> {
    let (value, pos) = decode_prefix(buf)?;
    if pos != buf.len() {
        return Err(BencodeError::TrailingData { offset: pos });
    }
    Ok(value)
}

fn find_byte(buf: &[u8], from: usize, target: u8) -> Result<usize, BencodeError> {
    buf[from..]
        .iter()
        .position(|&b| b == target)
        .map(|i| from + i)
        .ok_or(BencodeError::Truncated)
}

fn parse_value(buf: &[u8], pos: usize) -> Result<(Value, usize), BencodeError> {
    match buf.get(pos) {
        None => Err(BencodeError::Truncated),
        Some(b'i') => parse_int(buf, pos),
        Some(b'l') => parse_list(buf, pos),
        Some(b'd') => parse_dict(buf, pos),
        Some(b'0'..=b'9') => parse_bytes(buf, pos),
        Some(_) => Err(BencodeError::InvalidEncoding { offset: pos }),
    }
}

fn parse_int(buf: &[u8], pos: usize) -> Result<(Value, usize), BencodeError> {
    let start = pos + 1;
    let end = find_byte(buf, start, b'e')?;
    if end == start {
        return Err(BencodeError::InvalidEncoding { offset: pos });
    }
    let text = std::str::from_utf8(&buf[start..end])
        .map_err(|_| BencodeError::InvalidEncoding { offset: pos })?;
    let n: i64 = text
        .parse()
        .map_err(|_| BencodeError::InvalidEncoding { offset: pos })?;
    Ok((Value::Int(n), end + 1))
}

fn parse_bytes(buf: &[u8], pos: usize) -> Result<(Value, usize), BencodeError> {
    let colon = find_byte(buf, pos, b':')?;
    let len_text = std::str::from_utf8(&buf[pos..colon])
        .map_err(|_| BencodeError::InvalidEncoding { offset: pos })?;
    let len: usize = len_text
        .parse()
        .map_err(|_| BencodeError::InvalidEncoding { offset: pos })?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .ok_or(BencodeError::InvalidEncoding { offset: pos })?;
    if end > buf.len() {
        return Err(BencodeError::Truncated);
    }
    Ok((Value::Bytes(buf[start..end].to_vec()), end))
}

fn parse_list(buf: &[u8], pos: usize) -> Result<(Value, usize), BencodeError> {
    let mut items = Vec::new();
    let mut p = pos + 1;
    loop {
        match buf.get(p) {
            None => return Err(BencodeError::Truncated),
            Some(b'e') => return Ok((Value::List(items), p + 1)),
            _ => {
                let (item, next) = parse_value(buf, p)?;
                items.push(item);
                p = next;
            }
        }
    }
}

fn parse_dict(buf: &[u8], pos: usize) -> Result<(Value, usize), BencodeError> {
    let mut map = BTreeMap::new();
    let mut p = pos + 1;
    loop {
        match buf.get(p) {
            None => return Err(BencodeError::Truncated),
            Some(b'e') => return Ok((Value::Dict(map), p + 1)),
            _ => {
                let (key, next) = parse_value(buf, p)?;
                let key = match key {
                    Value::Bytes(b) => b,
                    _ => return Err(BencodeError::InvalidEncoding { offset: p }),
                };
                let (val, next2) = parse_value(buf, next)?;
                map.insert(key, val);
                p = next2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: Vec<(&[u8], Value)>) -> Value {
        let mut m = BTreeMap::new();
        for (k, v) in pairs {
            m.insert(k.to_vec(), v);
        }
        Value::Dict(m)
    }

    #[test]
    fn encode_empty_dict() {
        assert_eq!(encode(&Value::dict()), b"de");
    }

    #[test]
    fn encode_strings() {
        assert_eq!(encode(&Value::from("")), b"0:");
        assert_eq!(encode(&Value::from("test")), b"4:test");
        assert_eq!(encode(&Value::from("longer string")), b"13:longer string");
    }

    #[test]
    fn encode_empty_list() {
        assert_eq!(encode(&Value::List(vec![])), b"le");
    }

    #[test]
    fn encode_ints() {
        assert_eq!(encode(&Value::Int(1)), b"i1e");
        assert_eq!(encode(&Value::Int(-1)), b"i-1e");
        assert_eq!(encode(&Value::Int(12345)), b"i12345e");
    }

    #[test]
    fn encode_sorts_dict_keys() {
        let v = dict(vec![
            (b"c", Value::Int(3)),
            (b"a", Value::Int(1)),
            (b"b", Value::Int(2)),
        ]);
        assert_eq!(encode(&v), b"d1:ai1e1:bi2e1:ci3ee");
    }

    #[test]
    fn encode_nested() {
        let inner = dict(vec![(b"0", Value::List(vec![Value::Int(1), Value::from("d")]))]);
        let v = Value::List(vec![
            Value::from("b"),
            Value::from("a"),
            Value::List(vec![Value::from("c"), inner]),
        ]);
        assert_eq!(encode(&v), b"l1:b1:al1:cdi0eli1e1:deeee");
    }

    #[test]
    fn decode_is_exact_inverse_of_nested_example() {
        let encoded: &[u8] = b"l1:b1:al1:cdi0eli1e1:deeee";
        let decoded = decode(encoded).unwrap();
        assert_eq!(encode(&decoded), encoded);
    }

    #[test]
    fn decode_empty_dict() {
        assert_eq!(decode(b"de").unwrap(), Value::dict());
    }

    #[test]
    fn decode_strings_and_bytes() {
        assert_eq!(decode(b"0:").unwrap().as_bytes().unwrap(), b"");
        assert_eq!(decode(b"4:test").unwrap().as_bytes().unwrap(), b"test");
        assert_eq!(decode(b"4:\0\0\0\0").unwrap().as_bytes().unwrap(), b"\0\0\0\0");
    }

    #[test]
    fn decode_empty_list() {
        assert_eq!(decode(b"le").unwrap(), Value::List(vec![]));
    }

    #[test]
    fn decode_ints() {
        assert_eq!(decode(b"i1e").unwrap().as_int(), Some(1));
        assert_eq!(decode(b"i-1e").unwrap().as_int(), Some(-1));
        assert_eq!(decode(b"i12345e").unwrap().as_int(), Some(12345));
    }

    #[test]
    fn decode_rejects_invalid_tokens() {
        assert!(decode(b"qqq not valid bencoded data").is_err());
        assert!(decode(b"i^e").is_err());
    }

    #[test]
    fn decode_rejects_trailing_data() {
        assert!(matches!(
            decode(b"4:too long"),
            Err(BencodeError::TrailingData { .. })
        ));
    }

    #[test]
    fn decode_rejects_truncated_input() {
        assert!(matches!(
            decode(b"4000:nelly the elephant packed her trunk wrong"),
            Err(BencodeError::Truncated)
        ));
    }

    #[test]
    fn round_trip_canonical_dict() {
        let v = dict(vec![
            (b"a", Value::Int(1)),
            (b"b", Value::List(vec![Value::from("x"), Value::from("y")])),
        ]);
        let encoded = encode(&v);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(encode(&decode(&encoded).unwrap()), encoded);
    }

    #[test]
    fn decode_prefix_reports_unconsumed_offset() {
        let framed = b"i42eTRAILING";
        let (value, offset) = decode_prefix(framed).unwrap();
        assert_eq!(value.as_int(), Some(42));
        assert_eq!(offset, 4);
        assert_eq!(&framed[offset..], b"TRAILING");
    }
}
