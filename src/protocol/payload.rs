//! Tagged payload codec
//!
//! A payload is encoded as a one-byte tag followed by its content:
//! `T` + UTF-8 text, `B` + raw bytes verbatim, `J` + JSON. Framing carries
//! an explicit length, so no escaping is needed.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

const TAG_TEXT: u8 = b'T';
const TAG_JSON: u8 = b'J';
const TAG_BYTES: u8 = b'B';

/// Payload codec errors
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Empty payload")]
    Empty,

    #[error("Unknown payload tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("Invalid UTF-8 in text payload: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is raw bytes, expected a structured value")]
    NotStructured,
}

pub type PayloadResult<T> = Result<T, PayloadError>;

/// An application value carried in a frame body
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// UTF-8 text, sent unescaped
    Text(String),
    /// Structured value, sent as JSON
    Json(Value),
    /// Raw bytes, sent verbatim
    Bytes(Bytes),
}

impl Payload {
    /// Build a structured payload from any serializable value
    pub fn json<T: Serialize>(value: &T) -> PayloadResult<Self> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    /// Encode into the tagged wire representation
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Payload::Text(text) => {
                buf.reserve(text.len() + 1);
                buf.put_u8(TAG_TEXT);
                buf.put_slice(text.as_bytes());
            }
            Payload::Bytes(bytes) => {
                buf.reserve(bytes.len() + 1);
                buf.put_u8(TAG_BYTES);
                buf.put_slice(bytes);
            }
            Payload::Json(value) => {
                buf.put_u8(TAG_JSON);
                buf.put_slice(value.to_string().as_bytes());
            }
        }
        buf.freeze()
    }

    /// Decode a tagged payload
    pub fn decode(encoded: &[u8]) -> PayloadResult<Self> {
        let (&tag, content) = encoded.split_first().ok_or(PayloadError::Empty)?;
        match tag {
            TAG_TEXT => Ok(Payload::Text(String::from_utf8(content.to_vec())?)),
            TAG_BYTES => Ok(Payload::Bytes(Bytes::copy_from_slice(content))),
            TAG_JSON => Ok(Payload::Json(serde_json::from_slice(content)?)),
            other => Err(PayloadError::UnknownTag(other)),
        }
    }

    /// Decode an optional frame body; an empty segment means "no payload"
    pub fn decode_body(body: Option<&[u8]>) -> PayloadResult<Option<Self>> {
        match body {
            Some(encoded) if !encoded.is_empty() => Self::decode(encoded).map(Some),
            _ => Ok(None),
        }
    }

    /// Deserialize the payload into a concrete type.
    ///
    /// Text payloads deserialize as a JSON string.
    pub fn parse<T: DeserializeOwned>(&self) -> PayloadResult<T> {
        match self {
            Payload::Json(value) => Ok(T::deserialize(value)?),
            Payload::Text(text) => Ok(T::deserialize(Value::String(text.clone()))?),
            Payload::Bytes(_) => Err(PayloadError::NotStructured),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_text_is_tagged_and_unescaped() {
        let encoded = Payload::from("a|b§c").encode();
        assert_eq!(&encoded[..], "Ta|b§c".as_bytes());
        assert_eq!(Payload::decode(&encoded).unwrap(), Payload::from("a|b§c"));
    }

    #[test]
    fn test_structured_values() {
        assert_eq!(&Payload::from(json!({})).encode()[..], b"J{}");
        assert_eq!(&Payload::from(json!([])).encode()[..], b"J[]");
        assert_eq!(&Payload::from(json!(null)).encode()[..], b"Jnull");
        assert_eq!(&Payload::from(json!(0)).encode()[..], b"J0");

        let value = json!({ "text": "hi", "nested": [1, 2.5, true, null] });
        let decoded = Payload::decode(&Payload::from(value.clone()).encode()).unwrap();
        assert_eq!(decoded, Payload::Json(value));
    }

    #[test]
    fn test_raw_bytes_verbatim() {
        let raw = vec![0u8, 255, b'|', b'J', 10];
        let encoded = Payload::from(raw.clone()).encode();
        assert_eq!(encoded[0], b'B');
        assert_eq!(&encoded[1..], &raw[..]);
        assert_eq!(
            Payload::decode(&encoded).unwrap().as_bytes().unwrap(),
            &Bytes::from(raw)
        );
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(matches!(
            Payload::decode(b"J{not json"),
            Err(PayloadError::Json(_))
        ));
    }

    #[test]
    fn test_unknown_tag_and_empty() {
        assert!(matches!(Payload::decode(b"Sfoo"), Err(PayloadError::UnknownTag(b'S'))));
        assert!(matches!(Payload::decode(b""), Err(PayloadError::Empty)));
        assert!(Payload::decode_body(Some(b"")).unwrap().is_none());
        assert!(Payload::decode_body(None).unwrap().is_none());
    }

    #[test]
    fn test_parse_typed() {
        #[derive(Debug, Deserialize, Serialize, PartialEq)]
        struct Sum {
            a: i64,
            b: i64,
        }

        let payload = Payload::json(&Sum { a: 2, b: 3 }).unwrap();
        assert_eq!(payload.parse::<Sum>().unwrap(), Sum { a: 2, b: 3 });
        assert_eq!(Payload::from("hi").parse::<String>().unwrap(), "hi");
        assert!(Payload::from(vec![1u8]).parse::<String>().is_err());
    }
}
