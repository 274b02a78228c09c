//! Opcode frames
//!
//! A frame body starts with a one-character opcode; the remaining segments are
//! separated by `|`. Only the last segment of a frame may contain `|`.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{ErrorCode, Payload, SEPARATOR};

/// Frame parsing errors
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("Invalid UTF-8 in {0}")]
    InvalidText(&'static str),

    #[error("Invalid correlation id: {0:?}")]
    InvalidId(String),

    #[error("Missing {0} segment")]
    MissingSegment(&'static str),
}

/// Leading character of a frame body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// One-way message or push (either direction)
    Push = b'!',
    /// Request (client to server)
    Request = b'?',
    /// Success response (server to client)
    ResponseOk = b'.',
    /// Error response (server to client)
    ResponseErr = b'X',
    /// Subscribe (client to server)
    Subscribe = b'+',
    /// Unsubscribe (client to server)
    Unsubscribe = b'-',
}

impl Opcode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'!' => Some(Opcode::Push),
            b'?' => Some(Opcode::Request),
            b'.' => Some(Opcode::ResponseOk),
            b'X' => Some(Opcode::ResponseErr),
            b'+' => Some(Opcode::Subscribe),
            b'-' => Some(Opcode::Unsubscribe),
            _ => None,
        }
    }
}

/// A protocol message. Bodies are kept encoded; decoding them is the
/// receiver's concern so codec errors stay local to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Push {
        topic: String,
        body: Option<Bytes>,
    },
    Request {
        topic: String,
        id: u64,
        body: Option<Bytes>,
    },
    ResponseOk {
        id: u64,
        body: Option<Bytes>,
    },
    ResponseErr {
        id: u64,
        code: ErrorCode,
        message: String,
    },
    Subscribe {
        topic: String,
        id: u64,
    },
    Unsubscribe {
        topic: String,
    },
}

/// Topics share the segment separator with the frame layout
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.as_bytes().contains(&SEPARATOR)
}

impl Frame {
    pub fn push(topic: impl Into<String>, payload: Option<&Payload>) -> Self {
        Frame::Push {
            topic: topic.into(),
            body: payload.map(Payload::encode),
        }
    }

    pub fn request(topic: impl Into<String>, id: u64, payload: Option<&Payload>) -> Self {
        Frame::Request {
            topic: topic.into(),
            id,
            body: payload.map(Payload::encode),
        }
    }

    pub fn response_ok(id: u64, payload: Option<&Payload>) -> Self {
        Frame::ResponseOk {
            id,
            body: payload.map(Payload::encode),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::Push { .. } => Opcode::Push,
            Frame::Request { .. } => Opcode::Request,
            Frame::ResponseOk { .. } => Opcode::ResponseOk,
            Frame::ResponseErr { .. } => Opcode::ResponseErr,
            Frame::Subscribe { .. } => Opcode::Subscribe,
            Frame::Unsubscribe { .. } => Opcode::Unsubscribe,
        }
    }

    /// Encode the frame body (without the length prefix)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.opcode().as_byte());

        match self {
            Frame::Push { topic, body } => {
                buf.put_slice(topic.as_bytes());
                buf.put_u8(SEPARATOR);
                if let Some(body) = body {
                    buf.put_slice(body);
                }
            }
            Frame::Request { topic, id, body } => {
                buf.put_slice(topic.as_bytes());
                buf.put_u8(SEPARATOR);
                buf.put_slice(id.to_string().as_bytes());
                buf.put_u8(SEPARATOR);
                if let Some(body) = body {
                    buf.put_slice(body);
                }
            }
            Frame::ResponseOk { id, body } => {
                buf.put_slice(id.to_string().as_bytes());
                // Absent results omit the segment entirely
                if let Some(body) = body {
                    buf.put_u8(SEPARATOR);
                    buf.put_slice(body);
                }
            }
            Frame::ResponseErr { id, code, message } => {
                buf.put_slice(id.to_string().as_bytes());
                buf.put_u8(SEPARATOR);
                buf.put_slice(code.to_string().as_bytes());
                buf.put_u8(SEPARATOR);
                buf.put_slice(message.as_bytes());
            }
            Frame::Subscribe { topic, id } => {
                buf.put_slice(topic.as_bytes());
                buf.put_u8(SEPARATOR);
                buf.put_slice(id.to_string().as_bytes());
            }
            Frame::Unsubscribe { topic } => {
                buf.put_slice(topic.as_bytes());
            }
        }

        buf.freeze()
    }

    /// Parse a complete frame body
    pub fn parse(frame: Bytes) -> Result<Self, FrameError> {
        let &first = frame.first().ok_or(FrameError::Empty)?;
        let opcode = Opcode::from_byte(first).ok_or(FrameError::UnknownOpcode(first))?;
        let rest = frame.slice(1..);

        let frame = match opcode {
            Opcode::Push => {
                let (topic, body) = split_segment(&rest);
                Frame::Push {
                    topic: text(&topic, "topic")?,
                    body: non_empty(body),
                }
            }
            Opcode::Request => {
                let (topic, tail) = split_segment(&rest);
                let tail = tail.ok_or(FrameError::MissingSegment("correlation id"))?;
                let (id, body) = split_segment(&tail);
                Frame::Request {
                    topic: text(&topic, "topic")?,
                    id: correlation_id(&id)?,
                    body: non_empty(body),
                }
            }
            Opcode::ResponseOk => {
                let (id, body) = split_segment(&rest);
                Frame::ResponseOk {
                    id: correlation_id(&id)?,
                    body: non_empty(body),
                }
            }
            Opcode::ResponseErr => {
                let (id, tail) = split_segment(&rest);
                let tail = tail.ok_or(FrameError::MissingSegment("error code"))?;
                let (code, message) = split_segment(&tail);
                Frame::ResponseErr {
                    id: correlation_id(&id)?,
                    code: ErrorCode::parse(&text(&code, "error code")?),
                    message: match message {
                        Some(message) => text(&message, "error message")?,
                        None => String::new(),
                    },
                }
            }
            Opcode::Subscribe => {
                let (topic, id) = split_segment(&rest);
                let id = id.ok_or(FrameError::MissingSegment("subscription id"))?;
                Frame::Subscribe {
                    topic: text(&topic, "topic")?,
                    id: correlation_id(&id)?,
                }
            }
            Opcode::Unsubscribe => Frame::Unsubscribe {
                topic: text(&rest, "topic")?,
            },
        };

        Ok(frame)
    }
}

/// Split at the first separator; the separator itself is dropped
fn split_segment(segment: &Bytes) -> (Bytes, Option<Bytes>) {
    match segment.iter().position(|&b| b == SEPARATOR) {
        Some(idx) => (segment.slice(..idx), Some(segment.slice(idx + 1..))),
        None => (segment.clone(), None),
    }
}

fn non_empty(body: Option<Bytes>) -> Option<Bytes> {
    body.filter(|b| !b.is_empty())
}

fn text(segment: &[u8], what: &'static str) -> Result<String, FrameError> {
    std::str::from_utf8(segment)
        .map(str::to_string)
        .map_err(|_| FrameError::InvalidText(what))
}

fn correlation_id(segment: &[u8]) -> Result<u64, FrameError> {
    std::str::from_utf8(segment)
        .ok()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FrameError::InvalidId(String::from_utf8_lossy(segment).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(wire: &'static [u8]) -> Result<Frame, FrameError> {
        Frame::parse(Bytes::from_static(wire))
    }

    #[test]
    fn test_wire_layout() {
        let hi = Payload::from(json!({ "text": "hi" }));
        assert_eq!(&Frame::push("greet", Some(&hi)).encode()[..], br#"!greet|J{"text":"hi"}"#);
        assert_eq!(&Frame::request("sum", 3, Some(&Payload::from("x"))).encode()[..], b"?sum|3|Tx");
        assert_eq!(&Frame::response_ok(3, None).encode()[..], b".3");
        assert_eq!(&Frame::response_ok(3, Some(&Payload::from(json!(5)))).encode()[..], b".3|J5");
        assert_eq!(
            &Frame::ResponseErr { id: 3, code: ErrorCode::Numeric(7), message: "bad input".into() }
                .encode()[..],
            b"X3|7|bad input"
        );
        assert_eq!(&Frame::Subscribe { topic: "tick".into(), id: 4 }.encode()[..], b"+tick|4");
        assert_eq!(&Frame::Unsubscribe { topic: "tick".into() }.encode()[..], b"-tick");
    }

    #[test]
    fn test_parse_each_opcode() {
        assert_eq!(
            parse(b"!greet|Thi|there").unwrap(),
            Frame::Push { topic: "greet".into(), body: Some(Bytes::from_static(b"Thi|there")) }
        );
        assert_eq!(
            parse(b"?sum|12|J5").unwrap(),
            Frame::Request { topic: "sum".into(), id: 12, body: Some(Bytes::from_static(b"J5")) }
        );
        assert_eq!(parse(b".12").unwrap(), Frame::ResponseOk { id: 12, body: None });
        assert_eq!(
            parse(b"X12|EBAD|no | good").unwrap(),
            Frame::ResponseErr {
                id: 12,
                code: ErrorCode::Text("EBAD".into()),
                message: "no | good".into()
            }
        );
        assert_eq!(parse(b"+tick|1").unwrap(), Frame::Subscribe { topic: "tick".into(), id: 1 });
        assert_eq!(parse(b"-tick").unwrap(), Frame::Unsubscribe { topic: "tick".into() });
    }

    #[test]
    fn test_empty_body_segment_is_absent() {
        assert_eq!(parse(b"!ping|").unwrap(), Frame::Push { topic: "ping".into(), body: None });
        assert_eq!(
            parse(b"?ping|2|").unwrap(),
            Frame::Request { topic: "ping".into(), id: 2, body: None }
        );
    }

    #[test]
    fn test_protocol_errors() {
        assert!(matches!(parse(b"#what"), Err(FrameError::UnknownOpcode(b'#'))));
        assert!(matches!(parse(b".abc|J1"), Err(FrameError::InvalidId(_))));
        assert!(matches!(parse(b"?sum"), Err(FrameError::MissingSegment(_))));
        assert!(matches!(parse(b"+tick"), Err(FrameError::MissingSegment(_))));
        assert!(matches!(Frame::parse(Bytes::new()), Err(FrameError::Empty)));
    }

    #[test]
    fn test_topic_validation() {
        assert!(is_valid_topic("tick"));
        assert!(!is_valid_topic("a|b"));
    }
}
