//! Prepared data-stream sessions
//!
//! When the HAP layer arranges a data-stream transport, both sides
//! contribute a 32-byte salt and derive direction keys from the
//! connection's pair-verify shared secret. The accessory then waits for a
//! TCP connection whose first frame decrypts under the session's
//! controller→accessory key — identity is established purely by trial
//! decryption, there is no session id on the wire.

use std::time::{Duration, Instant};

use crate::protocol::crypto::{CryptoError, HkdfSha512};

/// How long a prepared session waits for its connection
pub const PREPARED_SESSION_TTL: Duration = Duration::from_secs(10);

/// Direction keys for one data-stream session
#[derive(Clone)]
pub struct SessionKeys {
    /// Key for accessory → controller frames
    pub accessory_to_controller: [u8; 32],
    /// Key for controller → accessory frames
    pub controller_to_accessory: [u8; 32],
}

impl SessionKeys {
    /// Derive both directions from the pair-verify shared secret and the
    /// concatenated `controller salt || accessory salt`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if expansion fails.
    pub fn derive(
        shared_secret: &[u8],
        controller_salt: &[u8; 32],
        accessory_salt: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let mut salt = Vec::with_capacity(64);
        salt.extend_from_slice(controller_salt);
        salt.extend_from_slice(accessory_salt);

        let hkdf = HkdfSha512::new(Some(&salt), shared_secret);
        Ok(Self {
            accessory_to_controller: hkdf.expand_fixed::<32>(b"HDS-Read-Encryption-Key")?,
            controller_to_accessory: hkdf.expand_fixed::<32>(b"HDS-Write-Encryption-Key")?,
        })
    }
}

/// A session prepared by the HAP layer, waiting for its TCP connection
pub struct PreparedSession {
    /// Identifier handed back to the preparing caller
    pub id: u64,
    /// Derived direction keys
    pub keys: SessionKeys,
    created: Instant,
}

impl PreparedSession {
    /// Create a fresh prepared session
    #[must_use]
    pub fn new(id: u64, keys: SessionKeys) -> Self {
        Self {
            id,
            keys,
            created: Instant::now(),
        }
    }

    /// Whether the 10-second window has passed
    #[must_use]
    pub fn expired(&self) -> bool {
        self.created.elapsed() > PREPARED_SESSION_TTL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_directional_and_salted() {
        let secret = [0x42u8; 32];
        let keys = SessionKeys::derive(&secret, &[1u8; 32], &[2u8; 32]).unwrap();
        assert_ne!(keys.accessory_to_controller, keys.controller_to_accessory);

        let other_salt = SessionKeys::derive(&secret, &[1u8; 32], &[3u8; 32]).unwrap();
        assert_ne!(
            keys.accessory_to_controller,
            other_salt.accessory_to_controller
        );

        let same = SessionKeys::derive(&secret, &[1u8; 32], &[2u8; 32]).unwrap();
        assert_eq!(keys.accessory_to_controller, same.accessory_to_controller);
    }
}
