//! `HomeKit` pairing protocol: pair-setup and pair-verify server machines
//!
//! Both exchanges carry TLV8 bodies whose `State` entry is the M-message
//! sequence number. The machines here hold per-connection scratch state;
//! anything long-lived (controller keys, the attempt counter) lives with
//! the caller.

pub mod setup;
pub mod store;
pub mod verify;


pub use setup::{PairSetup, SetupContext};
pub use store::{ControllerEntry, ControllerStore, MemoryControllerStore, StoreError};
pub use verify::{PairVerify, VerifiedSession};

use std::sync::atomic::{AtomicU32, Ordering};

use crate::protocol::crypto::Ed25519KeyPair;

/// TLV entry types used in pairing payloads
pub mod tlv_type {
    /// Pairing method
    pub const METHOD: u8 = 0x00;
    /// Pairing identifier (UTF-8)
    pub const IDENTIFIER: u8 = 0x01;
    /// SRP salt
    pub const SALT: u8 = 0x02;
    /// SRP or Curve25519 public key
    pub const PUBLIC_KEY: u8 = 0x03;
    /// SRP proof
    pub const PROOF: u8 = 0x04;
    /// ChaCha20-Poly1305 sealed sub-TLV
    pub const ENCRYPTED_DATA: u8 = 0x05;
    /// Sequence number (M1..M6)
    pub const STATE: u8 = 0x06;
    /// Error code
    pub const ERROR: u8 = 0x07;
    /// Retry delay
    pub const RETRY_DELAY: u8 = 0x08;
    /// Ed25519 signature
    pub const SIGNATURE: u8 = 0x0A;
    /// Controller permission bits
    pub const PERMISSIONS: u8 = 0x0B;
    /// Pairing type flags
    pub const FLAGS: u8 = 0x13;
    /// Zero-length separator between list-pairings records
    pub const SEPARATOR: u8 = 0xFF;
}

/// Pairing method values
pub mod method {
    /// Pair-Setup
    pub const PAIR_SETUP: u8 = 0;
    /// Pair-Setup with hardware authentication
    pub const PAIR_SETUP_WITH_AUTH: u8 = 1;
    /// Add pairing
    pub const ADD_PAIRING: u8 = 3;
    /// Remove pairing
    pub const REMOVE_PAIRING: u8 = 4;
    /// List pairings
    pub const LIST_PAIRINGS: u8 = 5;
}

/// Error codes carried in the `Error` TLV entry
pub mod error_code {
    /// Generic failure
    pub const UNKNOWN: u8 = 0x01;
    /// Proof or signature verification failed
    pub const AUTHENTICATION: u8 = 0x02;
    /// Client must back off before retrying
    pub const BACKOFF: u8 = 0x03;
    /// No capacity for additional pairings
    pub const MAX_PEERS: u8 = 0x04;
    /// Failed-attempt lockout reached
    pub const MAX_TRIES: u8 = 0x05;
    /// Accessory not accepting pairings (already paired)
    pub const UNAVAILABLE: u8 = 0x06;
    /// Another pairing setup is in progress
    pub const BUSY: u8 = 0x07;
}

/// Admin bit in the `Permissions` TLV entry
pub const PERMISSION_ADMIN: u8 = 0x01;

/// The accessory's long-term identity
pub struct AccessoryIdentity {
    /// Pairing identifier, conventionally a MAC-style string
    pub pairing_id: String,
    /// Long-term Ed25519 signing keypair
    pub keypair: Ed25519KeyPair,
}

/// Process-wide unsuccessful pair-setup attempt counter.
///
/// Lockout after [`PairAttemptCounter::MAX_ATTEMPTS`] failures; further
/// setup attempts answer `MaxTries`. The counter resets only on process
/// restart — a known limitation carried over from the deployed protocol,
/// not an oversight.
pub struct PairAttemptCounter {
    failures: AtomicU32,
}

impl PairAttemptCounter {
    /// Failures after which pair-setup is locked out
    pub const MAX_ATTEMPTS: u32 = 100;

    /// Create a fresh counter
    #[must_use]
    pub fn new() -> Self {
        Self {
            failures: AtomicU32::new(0),
        }
    }

    /// Record one failed attempt; returns the new total
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether the lockout threshold has been reached
    #[must_use]
    pub fn locked_out(&self) -> bool {
        self.failures.load(Ordering::Relaxed) >= Self::MAX_ATTEMPTS
    }

    /// Current failure count
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Default for PairAttemptCounter {
    fn default() -> Self {
        Self::new()
    }
}
