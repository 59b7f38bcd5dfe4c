use std::io;

use thiserror::Error;

use crate::hds::HdsError;
use crate::protocol::crypto::CryptoError;
use crate::protocol::http::ParseError;
use crate::protocol::tlv::TlvError;
use crate::transport::RecordError;

/// Errors surfaced by the HAP engine
#[derive(Debug, Error)]
pub enum HapError {
    /// TLV8 codec failure
    #[error("TLV error: {0}")]
    Tlv(#[from] TlvError),

    /// Cryptographic primitive failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Record-layer failure (connection-fatal)
    #[error("record layer error: {0}")]
    Record(#[from] RecordError),

    /// Request parsing failure (connection-fatal)
    #[error("request parse error: {0}")]
    Parse(#[from] ParseError),

    /// Data-stream protocol failure
    #[error("data stream error: {0}")]
    Hds(#[from] HdsError),

    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
