//! # hap-accessory
//!
//! Accessory-side engine for the `HomeKit` Accessory Protocol: the TLV8
//! codec, the SRP/Ed25519/X25519 pairing state machines, the chunked
//! ChaCha20-Poly1305 record layer with its HTTP-shaped connection
//! manager, the HAP request router, and the auxiliary data-stream (HDS)
//! protocol used for camera recording and remote audio transport.
//!
//! The accessory object model, key persistence and media pipelines stay
//! outside: the engine consumes them through the [`AccessoryDelegate`]
//! and [`ControllerStore`] collaborator traits.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hap_accessory::protocol::crypto::Ed25519KeyPair;
//! use hap_accessory::protocol::pairing::{AccessoryIdentity, MemoryControllerStore};
//! use hap_accessory::{HapServer, ServerConfig};
//!
//! # async fn example(delegate: Arc<dyn hap_accessory::AccessoryDelegate>) -> Result<(), hap_accessory::HapError> {
//! let identity = AccessoryIdentity {
//!     pairing_id: "11:22:33:44:55:66".to_string(),
//!     keypair: Ed25519KeyPair::generate(),
//! };
//! let mut server = HapServer::new(
//!     ServerConfig::default(),
//!     identity,
//!     Arc::new(MemoryControllerStore::new()),
//!     delegate,
//! );
//! let addr = server.start().await?;
//! println!("accessory listening on {addr}");
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! The crate is layered bottom-up:
//!
//! - [`protocol`] — sans-IO wire building blocks (TLV8, crypto, pseudo-HTTP,
//!   pairing machines)
//! - [`transport`] — the record layer and the tokio connection manager
//! - [`router`] — HAP request dispatch and the HAP status model
//! - [`hds`] — the independent data-stream protocol

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Error types
pub mod error;
/// Data-stream protocol
pub mod hds;
/// Wire-level protocol building blocks
pub mod protocol;
/// Request routing
pub mod router;
/// Encrypted transport and connection management
pub mod transport;

// Re-exports
pub use error::HapError;
pub use hds::DataStreamServer;
pub use protocol::pairing::{ControllerStore, MemoryControllerStore};
pub use router::{AccessoryDelegate, HapStatus};
pub use transport::{CharacteristicEvent, HapServer, ServerConfig, ServerEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
