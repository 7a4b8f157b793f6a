//! AMP message codec
//!
//! Typed multi-field messages with a minimal length-prefixed framing.
//!
//! Packet structure (integers in big-endian):
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │ Header (1 byte): (version << 4) | field count    │
//! ├──────────────────────────────────────────────────┤
//! │ Field 0 length (4 bytes)                         │
//! ├──────────────────────────────────────────────────┤
//! │ Field 0 payload (variable)                       │
//! ├──────────────────────────────────────────────────┤
//! │ ... repeated per field                           │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Field payloads are tagged by a two-byte prefix: `s:` for UTF-8 strings,
//! `j:` for JSON text, `i:` for decimal 64-bit integers. Untagged payloads
//! are raw blobs. The header nibble limits a message to 15 fields.

use std::collections::VecDeque;
use std::io::Read;

use serde_json::Value;

use crate::error::{ParleyError, ParleyResult};

const VERSION: u8 = 1;

/// Maximum number of fields in one message (header nibble)
pub const MAX_FIELDS: usize = 15;

/// Decode guard against hostile or corrupt length prefixes
const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// One typed field of an AMP message
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// Raw bytes
    Blob(Vec<u8>),
    /// UTF-8 string
    Text(String),
    /// Signed 64-bit integer
    BigInt(i64),
    /// JSON value
    Json(Value),
}

impl Field {
    /// String payload, if this field is one
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Field::Text(s) => Some(s),
            _ => None,
        }
    }

    /// JSON payload, if this field is one
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Field::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Integer payload, if this field is one
    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Field::BigInt(n) => Some(*n),
            _ => None,
        }
    }

    /// Blob payload, if this field is one
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Field::Blob(b) => Some(b),
            _ => None,
        }
    }

    fn to_wire(&self) -> ParleyResult<Vec<u8>> {
        let payload = match self {
            Field::Blob(b) => b.clone(),
            Field::Text(s) => {
                let mut p = Vec::with_capacity(2 + s.len());
                p.extend_from_slice(b"s:");
                p.extend_from_slice(s.as_bytes());
                p
            }
            Field::BigInt(n) => format!("i:{}", n).into_bytes(),
            Field::Json(v) => {
                let text = serde_json::to_string(v)?;
                let mut p = Vec::with_capacity(2 + text.len());
                p.extend_from_slice(b"j:");
                p.extend_from_slice(text.as_bytes());
                p
            }
        };
        if payload.len() > MAX_FIELD_LEN {
            return Err(ParleyError::invalid_input("field exceeds maximum size"));
        }
        Ok(payload)
    }

    fn from_wire(payload: &[u8]) -> ParleyResult<Field> {
        match payload {
            [b's', b':', rest @ ..] => match std::str::from_utf8(rest) {
                Ok(s) => Ok(Field::Text(s.to_string())),
                // Tagged as string but not UTF-8: keep the bytes
                Err(_) => Ok(Field::Blob(payload.to_vec())),
            },
            [b'j', b':', rest @ ..] => {
                let v: Value = serde_json::from_slice(rest)
                    .map_err(|e| ParleyError::Serialization(format!("bad JSON field: {}", e)))?;
                Ok(Field::Json(v))
            }
            [b'i', b':', rest @ ..] => {
                let text = std::str::from_utf8(rest)
                    .map_err(|_| ParleyError::Serialization("bad integer field".to_string()))?;
                let n: i64 = text
                    .parse()
                    .map_err(|_| ParleyError::Serialization("bad integer field".to_string()))?;
                Ok(Field::BigInt(n))
            }
            _ => Ok(Field::Blob(payload.to_vec())),
        }
    }
}

/// An ordered sequence of typed fields
///
/// The first field carries routing for the pub/sub and req/rep conventions;
/// the router pops it off before handing the rest to user callbacks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    fields: VecDeque<Field>,
}

impl Message {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a message from a list of fields
    pub fn from_fields<I: IntoIterator<Item = Field>>(fields: I) -> Self {
        Message {
            fields: fields.into_iter().collect(),
        }
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the message carries no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Append a field
    pub fn push(&mut self, field: Field) {
        self.fields.push_back(field);
    }

    /// Prepend a field
    pub fn push_front(&mut self, field: Field) {
        self.fields.push_front(field);
    }

    /// Detach the first field
    pub fn pop_front(&mut self) -> Option<Field> {
        self.fields.pop_front()
    }

    /// Detach the last field
    pub fn pop_back(&mut self) -> Option<Field> {
        self.fields.pop_back()
    }

    /// First field, if any
    pub fn first(&self) -> Option<&Field> {
        self.fields.front()
    }

    /// Mutable first field, if any
    pub fn first_mut(&mut self) -> Option<&mut Field> {
        self.fields.front_mut()
    }

    /// Iterate the fields in order
    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> ParleyResult<Vec<u8>> {
        if self.fields.len() > MAX_FIELDS {
            return Err(ParleyError::invalid_input(format!(
                "message has {} fields, maximum is {}",
                self.fields.len(),
                MAX_FIELDS
            )));
        }
        let mut buf = vec![(VERSION << 4) | self.fields.len() as u8];
        for field in &self.fields {
            let payload = field.to_wire()?;
            buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            buf.extend_from_slice(&payload);
        }
        Ok(buf)
    }

    /// Decode from wire bytes
    pub fn decode(buf: &[u8]) -> ParleyResult<Message> {
        let mut cursor = buf;
        match Message::read_from(&mut cursor)? {
            Some(msg) => Ok(msg),
            None => Err(ParleyError::Serialization("empty buffer".to_string())),
        }
    }

    /// Read one framed message off a blocking stream
    ///
    /// Returns `Ok(None)` on clean EOF at a message boundary. EOF in the
    /// middle of a message is an error.
    pub fn read_from<R: Read>(reader: &mut R) -> ParleyResult<Option<Message>> {
        let mut header = [0u8; 1];
        loop {
            match reader.read(&mut header) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let version = header[0] >> 4;
        if version != VERSION {
            return Err(ParleyError::Serialization(format!(
                "unsupported message version {}",
                version
            )));
        }
        let count = (header[0] & 0x0f) as usize;
        let mut fields = VecDeque::with_capacity(count);
        for _ in 0..count {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_FIELD_LEN {
                return Err(ParleyError::Serialization(format!(
                    "field length {} exceeds maximum",
                    len
                )));
            }
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload)?;
            fields.push_back(Field::from_wire(&payload)?);
        }
        Ok(Some(Message { fields }))
    }
}

impl From<Vec<Field>> for Message {
    fn from(fields: Vec<Field>) -> Self {
        Message::from_fields(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_all_field_types() {
        let msg = Message::from_fields(vec![
            Field::Text("message::hello".to_string()),
            Field::Blob(vec![0x00, 0xff, 0x73, 0x3a]),
            Field::BigInt(-42),
            Field::Json(json!({"payload": "hi"})),
        ]);
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn blob_without_tag_survives() {
        // A blob that does not start with a known tag round-trips untouched
        let msg = Message::from_fields(vec![Field::Blob(b"world".to_vec())]);
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.first().unwrap().as_blob().unwrap(), b"world");
    }

    #[test]
    fn too_many_fields_rejected() {
        let msg = Message::from_fields((0..16).map(Field::BigInt));
        assert!(msg.encode().is_err());
    }

    #[test]
    fn stream_read_yields_messages_then_eof() {
        let a = Message::from_fields(vec![Field::Text("a".to_string())]);
        let b = Message::from_fields(vec![Field::BigInt(7)]);
        let mut bytes = a.encode().unwrap();
        bytes.extend_from_slice(&b.encode().unwrap());

        let mut cursor = &bytes[..];
        assert_eq!(Message::read_from(&mut cursor).unwrap().unwrap(), a);
        assert_eq!(Message::read_from(&mut cursor).unwrap().unwrap(), b);
        assert!(Message::read_from(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn truncated_message_is_an_error() {
        let msg = Message::from_fields(vec![Field::Text("truncate me".to_string())]);
        let bytes = msg.encode().unwrap();
        let mut cursor = &bytes[..bytes.len() - 3];
        assert!(Message::read_from(&mut cursor).is_err());
    }

    #[test]
    fn bad_json_field_is_an_error() {
        // header: version 1, one field; payload "j:{" (3 bytes)
        let bytes = [0x11, 0, 0, 0, 3, b'j', b':', b'{'];
        assert!(Message::decode(&bytes).is_err());
    }
}
