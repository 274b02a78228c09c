//! BeamNet - lightweight RPC and publish/subscribe over byte-stream sockets
//!
//! A single persistent connection carries typed request/response calls,
//! one-way messages and topic-based pushes. The crate is split into:
//! - `protocol`: payload codec, length-prefix framing and opcode frames
//! - `network`: transports, the client multiplexer and the server dispatcher
//! - `config`: TOML configuration shared by the library and the CLI

pub mod config;
pub mod network;
pub mod protocol;

pub use network::{
    Client, ClientError, ClientEvent, ClientOptions, ClientState, Endpoint, ReconnectPolicy,
    Registration, Server, ServerError, ServerEvent, ServerOptions, Subscription,
};
pub use protocol::{ErrorCode, Payload, PayloadError, RequestError};
