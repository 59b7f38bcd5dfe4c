//! HDS: the auxiliary data-stream protocol
//!
//! A second, independently framed and encrypted binary protocol over its
//! own TCP listener, used for camera recording streams and remote audio.
//! It reuses only the crypto primitives and the pair-verify shared
//! secret; framing, key derivation and nonce counters are all its own.
//!
//! Connections are identified by trial decryption of their first frame
//! against every pending prepared session, must then speak a
//! `control.hello` request, and afterwards multiplex events, requests and
//! responses by header shape.

pub mod connection;
pub mod frame;
pub mod parser;
pub mod server;
pub mod session;
pub mod stream;

#[cfg(test)]
mod tests;

pub use connection::{DataStreamHandle, ProtocolHandler, RESPONSE_TIMEOUT};
pub use frame::{FrameCrypto, MAX_PAYLOAD_SIZE};
pub use parser::{DataStreamDict, DataStreamParseError, DataStreamValue};
pub use server::{DataStreamServer, PreparedSessionInfo};
pub use session::{PREPARED_SESSION_TTL, PreparedSession, SessionKeys};
pub use stream::{PayloadChunk, PayloadSource, send_payload_stream};

use thiserror::Error;

use crate::protocol::crypto::CryptoError;

/// Data-stream protocol errors
#[derive(Debug, Error)]
pub enum HdsError {
    /// Outbound payload over the frame limit — a caller bug
    #[error("payload of {0} bytes exceeds the maximum frame size")]
    PayloadTooLarge(usize),

    /// Malformed frame header from the peer (connection-fatal)
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// AEAD sealing failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD verification failed (connection-fatal)
    #[error("decryption failed")]
    DecryptionFailed,

    /// Malformed header/message encoding
    #[error("parse error: {0}")]
    Parse(#[from] DataStreamParseError),

    /// Crypto primitive failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The peer broke message-level rules (e.g. no hello)
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No response within [`connection::RESPONSE_TIMEOUT`]
    #[error("response timed out")]
    ResponseTimeout,

    /// The connection is gone
    #[error("connection closed")]
    ConnectionClosed,

    /// Listener failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Status codes carried in response headers
pub mod status {
    /// Request handled
    pub const SUCCESS: i64 = 0;
    /// Receiver out of memory
    pub const OUT_OF_MEMORY: i64 = 1;
    /// Request timed out
    pub const TIMEOUT: i64 = 2;
    /// Malformed header
    pub const HEADER_ERROR: i64 = 3;
    /// Malformed payload
    pub const PAYLOAD_ERROR: i64 = 4;
    /// No handler for the protocol/topic
    pub const MISSING_PROTOCOL: i64 = 5;
    /// Handler-specific failure
    pub const PROTOCOL_SPECIFIC_ERROR: i64 = 6;
}

/// Well-known protocol and topic names
pub mod names {
    /// The built-in control protocol
    pub const CONTROL: &str = "control";
    /// The mandatory first request on every connection
    pub const HELLO: &str = "hello";
}
