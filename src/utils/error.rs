//! The `error` module defines the error type shared by every layer of
//! `popmesh`.
//!
//! Transport and protocol failures convert into [`Error`] through `#[from]`
//! so that `?` can be used throughout; registry conflicts reported by the
//! broker are lifted into dedicated variants carrying the response code.

use thiserror::Error;

use crate::transport::codec::DecodeError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("invalid type name: {0:?}")]
    InvalidTypeName(String),
    #[error("invalid message type: expected {expected}, got {actual}")]
    InvalidMessageType { expected: String, actual: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("rpc to {0} timed out")]
    RpcTimeout(String),
    #[error("rpc connection to {0} closed before a response arrived")]
    RpcClosed(String),
    #[error("unexpected rpc response: {0}")]
    UnexpectedResponse(String),

    #[error("registration of {client_id} failed with code {code}")]
    RegistrationFailed { client_id: String, code: i32 },
    #[error("advertising {topic} failed")]
    AdvertiseRejected { topic: String },
    #[error("subscribing to {topic} rejected with code {code}: {status}")]
    SubscribeRejected {
        topic: String,
        code: i32,
        status: String,
    },

    #[error("no available port on {host} starting from {start}")]
    NoAvailablePort { host: String, start: u16 },
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("node has not been started")]
    NotStarted,
    #[error("node has shut down")]
    NodeShutDown,
    #[error("no link to peer {0}")]
    UnknownPeer(String),
}
