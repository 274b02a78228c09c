//! Protocol module - Defines the wire protocol for BeamNet communication
//!
//! Every frame on the wire is:
//! - the body length as decimal ASCII digits (no delimiter)
//! - the body: a one-character opcode followed by `|`-separated segments
//!
//! Payload segments carry a one-byte tag (`T` text, `J` JSON, `B` raw bytes).

mod codec;
mod error;
mod frame;
mod payload;

pub use codec::*;
pub use error::*;
pub use frame::*;
pub use payload::*;

/// Default TCP port for BeamNet endpoints
pub const DEFAULT_PORT: u16 = 7420;

/// Maximum frame body size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Segment separator inside a frame body
pub const SEPARATOR: u8 = b'|';
