//! Data-stream frame codec
//!
//! Frames are `{type: u8 = 1, length: u24 BE}` followed by the sealed
//! payload and its 16-byte tag; the 4-byte header is the AEAD associated
//! data. Nonces are u64 LE counters, one per direction, independent of
//! the HAP record layer's counters.

use bytes::{Buf, BytesMut};

use crate::protocol::crypto::{ChaCha20Poly1305Cipher, CryptoError, Nonce};

use super::HdsError;
use super::session::SessionKeys;

/// Frame type marker for encrypted frames
pub const FRAME_TYPE_ENCRYPTED: u8 = 0x01;

/// Frame header length
pub const FRAME_HEADER_SIZE: usize = 4;

/// Poly1305 tag length
pub const TAG_SIZE: usize = 16;

/// Maximum payload bytes one frame may carry
pub const MAX_PAYLOAD_SIZE: usize = 0x000F_FFFF;

/// Per-connection frame crypto with direction counters
pub struct FrameCrypto {
    encrypt: ChaCha20Poly1305Cipher,
    decrypt: ChaCha20Poly1305Cipher,
    encrypt_nonce: u64,
    decrypt_nonce: u64,
}

impl FrameCrypto {
    /// Build from a session's derived keys
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if a key is rejected.
    pub fn new(keys: &SessionKeys) -> Result<Self, CryptoError> {
        Ok(Self {
            encrypt: ChaCha20Poly1305Cipher::new(&keys.accessory_to_controller)?,
            decrypt: ChaCha20Poly1305Cipher::new(&keys.controller_to_accessory)?,
            encrypt_nonce: 0,
            decrypt_nonce: 0,
        })
    }

    /// Counter state for a connection identified by a frame that was
    /// already decrypted once (trial identification consumes nonce 0).
    pub fn with_decrypt_counter(keys: &SessionKeys, decrypt_nonce: u64) -> Result<Self, CryptoError> {
        let mut crypto = Self::new(keys)?;
        crypto.decrypt_nonce = decrypt_nonce;
        Ok(crypto)
    }

    /// Seal one payload into a complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`HdsError::PayloadTooLarge`] for payloads over
    /// [`MAX_PAYLOAD_SIZE`] — that is a caller bug, not a peer one.
    pub fn encode_frame(&mut self, payload: &[u8]) -> Result<Vec<u8>, HdsError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(HdsError::PayloadTooLarge(payload.len()));
        }

        let header = frame_header(payload.len());
        let nonce = Nonce::from_counter(self.encrypt_nonce);

        let ciphertext = self
            .encrypt
            .encrypt_with_aad(&nonce, &header, payload)
            .map_err(|_| HdsError::EncryptionFailed)?;
        self.encrypt_nonce += 1;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + ciphertext.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Try to open the next frame in the buffer.
    ///
    /// Returns `Ok(None)` until a complete frame is buffered.
    ///
    /// # Errors
    ///
    /// [`HdsError::InvalidFrame`] on a bad type byte or oversized
    /// declared length, [`HdsError::DecryptionFailed`] on tag mismatch;
    /// both close the connection.
    pub fn decode_frame(&mut self, buffer: &mut BytesMut) -> Result<Option<Vec<u8>>, HdsError> {
        let Some((header, payload_len)) = peek_frame(buffer)? else {
            return Ok(None);
        };
        if buffer.len() < FRAME_HEADER_SIZE + payload_len + TAG_SIZE {
            return Ok(None);
        }

        buffer.advance(FRAME_HEADER_SIZE);
        let ciphertext: Vec<u8> = buffer.split_to(payload_len + TAG_SIZE).to_vec();

        let nonce = Nonce::from_counter(self.decrypt_nonce);
        let payload = self
            .decrypt
            .decrypt_with_aad(&nonce, &header, &ciphertext)
            .map_err(|_| HdsError::DecryptionFailed)?;
        self.decrypt_nonce += 1;

        Ok(Some(payload))
    }
}

/// Build the 4-byte frame header
fn frame_header(payload_len: usize) -> [u8; 4] {
    #[allow(clippy::cast_possible_truncation)]
    let len = payload_len as u32;
    [
        FRAME_TYPE_ENCRYPTED,
        (len >> 16) as u8,
        (len >> 8) as u8,
        len as u8,
    ]
}

/// Validate the buffered frame header; returns `(header, payload_len)`
/// once 4 header bytes are available.
///
/// # Errors
///
/// [`HdsError::InvalidFrame`] on a bad type byte or oversized length.
pub fn peek_frame(buffer: &BytesMut) -> Result<Option<([u8; 4], usize)>, HdsError> {
    if buffer.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let header: [u8; 4] = [buffer[0], buffer[1], buffer[2], buffer[3]];
    if header[0] != FRAME_TYPE_ENCRYPTED {
        return Err(HdsError::InvalidFrame(format!(
            "unknown frame type 0x{:02x}",
            header[0]
        )));
    }
    let payload_len =
        (usize::from(header[1]) << 16) | (usize::from(header[2]) << 8) | usize::from(header[3]);
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(HdsError::InvalidFrame(format!(
            "declared payload length {payload_len} exceeds maximum"
        )));
    }
    Ok(Some((header, payload_len)))
}

/// Trial-decrypt the first frame of an unidentified connection with a
/// candidate session's controller→accessory key, without mutating any
/// counter state on failure.
#[must_use]
pub fn trial_decrypt_first_frame(
    header: &[u8; 4],
    ciphertext: &[u8],
    keys: &SessionKeys,
) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305Cipher::new(&keys.controller_to_accessory).ok()?;
    cipher
        .decrypt_with_aad(&Nonce::from_counter(0), header, ciphertext)
        .ok()
}
