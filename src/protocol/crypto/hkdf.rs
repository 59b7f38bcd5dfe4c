use hkdf::Hkdf;
use sha2::Sha512;

use super::CryptoError;

/// HKDF-SHA512 for key derivation
pub struct HkdfSha512 {
    hkdf: Hkdf<Sha512>,
}

impl HkdfSha512 {
    /// Create HKDF instance from input key material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            hkdf: Hkdf::<Sha512>::new(salt, ikm),
        }
    }

    /// Expand to derive output key material of the requested length
    pub fn expand(&self, info: &[u8], length: usize) -> Result<Vec<u8>, CryptoError> {
        let mut okm = vec![0u8; length];
        self.hkdf
            .expand(info, &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed("HKDF expand failed".into()))?;
        Ok(okm)
    }

    /// Expand into a fixed-size array
    pub fn expand_fixed<const N: usize>(&self, info: &[u8]) -> Result<[u8; N], CryptoError> {
        let mut okm = [0u8; N];
        self.hkdf
            .expand(info, &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed("HKDF expand failed".into()))?;
        Ok(okm)
    }
}

/// One-shot key derivation
pub fn derive_key(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
    length: usize,
) -> Result<Vec<u8>, CryptoError> {
    HkdfSha512::new(salt, ikm).expand(info, length)
}

/// Direction-specific control-channel keys derived after pair-verify
///
/// `accessory_to_controller` encrypts responses and events going out;
/// `controller_to_accessory` decrypts incoming requests.
pub struct ControlChannelKeys {
    /// Key for accessory → controller frames
    pub accessory_to_controller: [u8; 32],
    /// Key for controller → accessory frames
    pub controller_to_accessory: [u8; 32],
}

impl ControlChannelKeys {
    /// Derive both directions from the pair-verify shared secret
    pub fn derive(shared_secret: &[u8]) -> Result<Self, CryptoError> {
        let hkdf = HkdfSha512::new(Some(b"Control-Salt"), shared_secret);

        Ok(Self {
            accessory_to_controller: hkdf.expand_fixed::<32>(b"Control-Read-Encryption-Key")?,
            controller_to_accessory: hkdf.expand_fixed::<32>(b"Control-Write-Encryption-Key")?,
        })
    }
}
