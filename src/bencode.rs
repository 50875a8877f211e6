//! # Bencode Codec
//!
//! This module implements the bencode serialization format used by the
//! BitTorrent protocol for torrent files and tracker responses.
//!
//! ## Value Kinds
//!
//! Bencode is self-describing and knows four kinds of values:
//!
//! - **Integer**: `i<decimal>e` (e.g. `i52e`)
//! - **Byte string**: `<length>:<bytes>` (e.g. `5:hello`)
//! - **List**: `l<values>e` (e.g. `l5:helloi52ee`)
//! - **Dictionary**: `d<key-value pairs>e` with byte string keys
//!
//! ## Canonical Encoding
//!
//! The encoder is deterministic: integers are minimal, strings are
//! length-prefixed raw bytes, and dictionary keys are emitted in
//! lexicographic byte order. This matters because the torrent info-hash is
//! the SHA-1 of the canonically re-encoded `info` dictionary.
//!
//! Byte strings are kept as raw bytes, never coerced to UTF-8: the `pieces`
//! field and compact peer lists are binary data.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors produced while decoding bencoded data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// The input violates the bencode grammar.
    #[error("bencode: {0}")]
    Syntax(String),
    /// The first byte of a value is not `i`, a digit, `l` or `d`.
    #[error("bencode: unknown value type `{}`", .0.escape_ascii())]
    UnknownType(u8),
    /// The input ended in the middle of a value.
    #[error("bencode: unexpected end of input")]
    UnexpectedEof,
}

/// A decoded bencode value.
///
/// Dictionaries use a `BTreeMap` keyed by raw bytes, which gives the
/// canonical key ordering for free when re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Returns the integer value, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the raw bytes, if this is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the bytes as `&str`, if this is a valid UTF-8 byte string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns the list elements, if this is a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the dictionary, if this is a dictionary.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a dictionary entry by key.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Project the value into JSON for display.
    ///
    /// Byte strings render as UTF-8 when valid, as lowercase hex otherwise
    /// (binary fields like `pieces` stay printable this way).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Integer(n) => serde_json::Value::from(*n),
            Value::Bytes(b) => serde_json::Value::String(render_bytes(b)),
            Value::List(l) => serde_json::Value::Array(l.iter().map(Value::to_json).collect()),
            Value::Dict(d) => serde_json::Value::Object(
                d.iter()
                    .map(|(k, v)| (render_bytes(k), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn render_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => hex::encode(bytes),
    }
}

/// Decode a complete bencoded buffer into a single value.
///
/// Trailing bytes after the value are a syntax error.
pub fn decode(input: &[u8]) -> Result<Value, BencodeError> {
    let mut decoder = Decoder::new(input);
    let value = decoder.decode_value()?;
    if decoder.pos != input.len() {
        return Err(BencodeError::Syntax(format!(
            "trailing bytes after value at offset {}",
            decoder.pos
        )));
    }
    Ok(value)
}

/// Streaming decoder over a byte slice.
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Decoder<'a> {
        Decoder { input, pos: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Decode the next value from the input.
    pub fn decode_value(&mut self) -> Result<Value, BencodeError> {
        match self.peek()? {
            b'i' => self.decode_integer(),
            b'0'..=b'9' => self.decode_bytes().map(Value::Bytes),
            b'l' => self.decode_list(),
            b'd' => self.decode_dict(),
            other => Err(BencodeError::UnknownType(other)),
        }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn next(&mut self) -> Result<u8, BencodeError> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn decode_integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1; // consume 'i'

        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.input[start..self.pos];
        self.pos += 1; // consume 'e'

        // Strict grammar: no empty body, no `-0`, no leading zeros.
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty() {
            return Err(BencodeError::Syntax("empty integer".into()));
        }
        if unsigned[0] == b'0' && (unsigned.len() > 1 || digits[0] == b'-') {
            return Err(BencodeError::Syntax(format!(
                "non-canonical integer `{}`",
                String::from_utf8_lossy(digits)
            )));
        }
        if !unsigned.iter().all(u8::is_ascii_digit) {
            return Err(BencodeError::Syntax(format!(
                "invalid integer `{}`",
                String::from_utf8_lossy(digits)
            )));
        }

        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::Integer)
            .ok_or_else(|| {
                BencodeError::Syntax(format!(
                    "integer `{}` out of range",
                    String::from_utf8_lossy(digits)
                ))
            })
    }

    fn decode_bytes(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.input[self.pos].is_ascii_digit() {
                return Err(BencodeError::Syntax(format!(
                    "invalid byte in string length at offset {}",
                    self.pos
                )));
            }
            self.pos += 1;
        }
        let length = std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| BencodeError::Syntax("invalid string length".into()))?;
        self.pos += 1; // consume ':'

        if self.input.len() - self.pos < length {
            return Err(BencodeError::UnexpectedEof);
        }
        let bytes = self.input[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(bytes)
    }

    fn decode_list(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1; // consume 'l'

        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.decode_value()?);
        }
        self.pos += 1; // consume 'e'

        Ok(Value::List(list))
    }

    fn decode_dict(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1; // consume 'd'

        let mut dict = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.input[self.pos].is_ascii_digit() {
                return Err(BencodeError::Syntax(format!(
                    "dictionary key must be a string at offset {}",
                    self.pos
                )));
            }
            let key = self.decode_bytes()?;
            let value = self.decode_value()?;
            dict.insert(key, value);
        }
        self.pos += 1; // consume 'e'

        Ok(Value::Dict(dict))
    }
}

/// Encode a value into its canonical bencode form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(l) => {
            out.push(b'l');
            for item in l {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(d) => {
            // BTreeMap iterates keys in lexicographic byte order.
            out.push(b'd');
            for (key, item) in d {
                encode_into(&Value::Bytes(key.clone()), out);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    #[test]
    fn decodes_integer() {
        assert_eq!(decode(b"i52e").unwrap(), Value::Integer(52));
        assert_eq!(decode(b"i-52e").unwrap(), Value::Integer(-52));
        assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
    }

    #[test]
    fn rejects_non_canonical_integers() {
        assert!(matches!(decode(b"ie"), Err(BencodeError::Syntax(_))));
        assert!(matches!(decode(b"i-0e"), Err(BencodeError::Syntax(_))));
        assert!(matches!(decode(b"i052e"), Err(BencodeError::Syntax(_))));
        assert!(matches!(decode(b"i-e"), Err(BencodeError::Syntax(_))));
        assert!(matches!(decode(b"i5x2e"), Err(BencodeError::Syntax(_))));
    }

    #[test]
    fn decodes_string() {
        assert_eq!(decode(b"5:hello").unwrap(), bytes("hello"));
        assert_eq!(decode(b"0:").unwrap(), bytes(""));
    }

    #[test]
    fn preserves_raw_bytes_in_strings() {
        let input = [b'3', b':', 0xde, 0xad, 0x00];
        assert_eq!(
            decode(&input).unwrap(),
            Value::Bytes(vec![0xde, 0xad, 0x00])
        );
    }

    #[test]
    fn decodes_list() {
        assert_eq!(
            decode(b"l5:helloi52ee").unwrap(),
            Value::List(vec![bytes("hello"), Value::Integer(52)])
        );
    }

    #[test]
    fn decodes_dict() {
        let decoded = decode(b"d3:foo3:bar5:helloi52ee").unwrap();
        assert_eq!(decoded.get(b"foo"), Some(&bytes("bar")));
        assert_eq!(decoded.get(b"hello"), Some(&Value::Integer(52)));
    }

    #[test]
    fn reencodes_canonical_dict_byte_for_byte() {
        let input = b"d3:foo3:bar5:helloi52ee";
        let decoded = decode(input).unwrap();
        assert_eq!(encode(&decoded), input.to_vec());
    }

    #[test]
    fn sorts_dict_keys_when_encoding() {
        // Out-of-order keys are accepted and re-emitted sorted.
        let decoded = decode(b"d5:helloi52ee3:foo3:bar").err();
        assert!(decoded.is_some()); // trailing garbage is rejected

        let decoded = decode(b"d5:helloi52e3:foo3:bare").unwrap();
        assert_eq!(encode(&decoded), b"d3:foo3:bar5:helloi52ee".to_vec());
    }

    #[test]
    fn rejects_unknown_type() {
        assert_eq!(decode(b"x"), Err(BencodeError::UnknownType(b'x')));
    }

    #[test]
    fn rejects_truncated_input() {
        assert_eq!(decode(b""), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"i52"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"5:hell"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"l5:hello"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"d3:foo"), Err(BencodeError::UnexpectedEof));
    }

    #[test]
    fn rejects_non_string_dict_key() {
        assert!(matches!(
            decode(b"di1ei2ee"),
            Err(BencodeError::Syntax(_))
        ));
    }

    #[test]
    fn round_trips_nested_values() {
        let mut dict = BTreeMap::new();
        dict.insert(b"a".to_vec(), Value::Integer(-7));
        dict.insert(
            b"b".to_vec(),
            Value::List(vec![bytes("x"), Value::Bytes(vec![0xff, 0x00])]),
        );
        let value = Value::List(vec![Value::Dict(dict), Value::Integer(0)]);

        let encoded = encode(&value);
        assert_eq!(decode(&encoded).unwrap(), value);
        // Canonical bytes re-encode to themselves.
        assert_eq!(encode(&decode(&encoded).unwrap()), encoded);
    }

    #[test]
    fn renders_json() {
        let decoded = decode(b"d3:numi1e3:str5:hello4:rawb2:\xde\xade").unwrap();
        let json = decoded.to_json();
        assert_eq!(json["num"], 1);
        assert_eq!(json["str"], "hello");
        assert_eq!(json["rawb"], "dead");
    }
}
