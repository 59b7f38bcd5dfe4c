//! Chunked authenticated-encryption record layer for the HAP connection
//!
//! After pair-verify, every byte on the connection travels in frames of
//! `2-byte LE plaintext length | ciphertext | 16-byte tag`, with the
//! length prefix doubling as AEAD associated data. Plaintext is split
//! into chunks of at most 1024 bytes, each sealed under a monotonically
//! increasing per-direction nonce counter. A verification failure
//! desynchronizes the counters permanently, so it is connection-fatal.

use bytes::{Buf, BytesMut};

use crate::protocol::crypto::{ChaCha20Poly1305Cipher, ControlChannelKeys, CryptoError, Nonce};

/// Maximum plaintext bytes per frame
pub const MAX_CHUNK_SIZE: usize = 1024;

/// Poly1305 tag length
const TAG_SIZE: usize = 16;

/// Length prefix size
const LENGTH_SIZE: usize = 2;

/// Record layer errors
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// A frame declared more plaintext than the protocol allows.
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(usize),

    /// AEAD sealing failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD verification failed; the connection cannot continue.
    #[error("decryption failed, record stream is unrecoverable")]
    DecryptionFailed,
}

struct SessionCrypto {
    encrypt: ChaCha20Poly1305Cipher,
    decrypt: ChaCha20Poly1305Cipher,
    /// Accessory → controller counter
    encrypt_nonce: u64,
    /// Controller → accessory counter
    decrypt_nonce: u64,
    /// Set once the first inbound frame has verified; outbound encryption
    /// stays off until then so a response raced with session activation
    /// can never be sealed while the controller still reads plaintext.
    received_encrypted: bool,
}

/// Per-connection record layer state
///
/// Starts in pass-through mode; [`RecordLayer::activate`] installs the
/// session keys at the pair-verify completion boundary.
pub struct RecordLayer {
    session: Option<SessionCrypto>,
    input_buffer: BytesMut,
}

impl RecordLayer {
    /// Create a pass-through record layer
    #[must_use]
    pub fn new() -> Self {
        Self {
            session: None,
            input_buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Whether session keys have been installed
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Install the control-channel keys derived by pair-verify.
    ///
    /// Counters start at zero and never reset for the connection's
    /// lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if either key is rejected by the cipher.
    pub fn activate(&mut self, keys: &ControlChannelKeys) -> Result<(), CryptoError> {
        self.session = Some(SessionCrypto {
            encrypt: ChaCha20Poly1305Cipher::new(&keys.accessory_to_controller)?,
            decrypt: ChaCha20Poly1305Cipher::new(&keys.controller_to_accessory)?,
            encrypt_nonce: 0,
            decrypt_nonce: 0,
            received_encrypted: false,
        });
        Ok(())
    }

    /// Encrypt outbound plaintext into one or more frames.
    ///
    /// Pass-through (returns the input unchanged) until the session is
    /// active *and* at least one inbound frame has decrypted.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::EncryptionFailed`] if sealing fails.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, RecordError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(plaintext.to_vec());
        };
        if !session.received_encrypted {
            return Ok(plaintext.to_vec());
        }

        let mut output = Vec::with_capacity(plaintext.len() + 64);
        for chunk in plaintext.chunks(MAX_CHUNK_SIZE) {
            #[allow(clippy::cast_possible_truncation)]
            let aad = (chunk.len() as u16).to_le_bytes();
            let nonce = Nonce::from_counter(session.encrypt_nonce);
            session.encrypt_nonce += 1;

            let ciphertext = session
                .encrypt
                .encrypt_with_aad(&nonce, &aad, chunk)
                .map_err(|_| RecordError::EncryptionFailed)?;

            output.extend_from_slice(&aad);
            output.extend_from_slice(&ciphertext);
        }

        Ok(output)
    }

    /// Feed raw socket bytes into the reassembly buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.input_buffer.extend_from_slice(data);
    }

    /// Try to produce the next plaintext.
    ///
    /// In pass-through mode drains the whole buffer; otherwise decrypts
    /// one complete frame, leaving partial frames buffered until more
    /// bytes arrive.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::DecryptionFailed`] on tag mismatch and
    /// [`RecordError::InvalidFrameLength`] on an oversized declared
    /// length; both are connection-fatal.
    pub fn decrypt(&mut self) -> Result<Option<Vec<u8>>, RecordError> {
        let Some(session) = self.session.as_mut() else {
            if self.input_buffer.is_empty() {
                return Ok(None);
            }
            return Ok(Some(self.input_buffer.split().to_vec()));
        };

        if self.input_buffer.len() < LENGTH_SIZE {
            return Ok(None);
        }

        let plaintext_len =
            u16::from_le_bytes([self.input_buffer[0], self.input_buffer[1]]) as usize;
        if plaintext_len > MAX_CHUNK_SIZE {
            return Err(RecordError::InvalidFrameLength(plaintext_len));
        }

        let frame_size = LENGTH_SIZE + plaintext_len + TAG_SIZE;
        if self.input_buffer.len() < frame_size {
            return Ok(None);
        }

        let aad = [self.input_buffer[0], self.input_buffer[1]];
        self.input_buffer.advance(LENGTH_SIZE);
        let ciphertext: Vec<u8> = self.input_buffer.split_to(plaintext_len + TAG_SIZE).to_vec();

        let nonce = Nonce::from_counter(session.decrypt_nonce);
        let plaintext = session
            .decrypt
            .decrypt_with_aad(&nonce, &aad, &ciphertext)
            .map_err(|_| RecordError::DecryptionFailed)?;

        session.decrypt_nonce += 1;
        session.received_encrypted = true;

        Ok(Some(plaintext))
    }

    /// Drain every complete frame currently buffered
    ///
    /// # Errors
    ///
    /// Propagates the first frame error; see [`RecordLayer::decrypt`].
    pub fn decrypt_all(&mut self) -> Result<Vec<Vec<u8>>, RecordError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decrypt()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

impl Default for RecordLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked_pair() -> (RecordLayer, RecordLayer) {
        // Controller-side layer mirrors the accessory's keys.
        let accessory_keys = ControlChannelKeys {
            accessory_to_controller: [0x11; 32],
            controller_to_accessory: [0x22; 32],
        };
        let controller_keys = ControlChannelKeys {
            accessory_to_controller: [0x22; 32],
            controller_to_accessory: [0x11; 32],
        };

        let mut accessory = RecordLayer::new();
        accessory.activate(&accessory_keys).unwrap();
        let mut controller = RecordLayer::new();
        controller.activate(&controller_keys).unwrap();
        (accessory, controller)
    }

    /// Lets a layer encrypt without a prior inbound frame.
    fn force_started(layer: &mut RecordLayer) {
        layer.session.as_mut().unwrap().received_encrypted = true;
    }

    #[test]
    fn passthrough_before_activation() {
        let mut layer = RecordLayer::new();
        assert_eq!(layer.encrypt(b"plain").unwrap(), b"plain");

        layer.feed(b"raw bytes");
        assert_eq!(layer.decrypt().unwrap().unwrap(), b"raw bytes");
        assert!(layer.decrypt().unwrap().is_none());
    }

    #[test]
    fn outbound_stays_plain_until_first_inbound_decrypt() {
        let (mut accessory, mut controller) = linked_pair();
        force_started(&mut controller);

        // Accessory has keys but has not yet seen an encrypted frame.
        assert_eq!(accessory.encrypt(b"tail").unwrap(), b"tail");

        let frame = controller.encrypt(b"first encrypted request").unwrap();
        accessory.feed(&frame);
        assert_eq!(
            accessory.decrypt().unwrap().unwrap(),
            b"first encrypted request"
        );

        // Now outbound encryption is on.
        let sealed = accessory.encrypt(b"response").unwrap();
        assert_ne!(sealed, b"response");
    }

    #[test]
    fn five_kilobytes_split_into_five_chunks() {
        let (mut accessory, mut controller) = linked_pair();
        force_started(&mut accessory);

        let plaintext: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let wire = accessory.encrypt(&plaintext).unwrap();

        // ceil(5000/1024) = 5 frames, each adding 2+16 bytes of framing.
        assert_eq!(wire.len(), 5000 + 5 * (2 + 16));

        controller.feed(&wire);
        let mut recovered = Vec::new();
        let frames = controller.decrypt_all().unwrap();
        assert_eq!(frames.len(), 5);
        for frame in frames {
            recovered.extend_from_slice(&frame);
        }
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn fragmented_frame_is_reassembled() {
        let (mut accessory, mut controller) = linked_pair();
        force_started(&mut accessory);

        let wire = accessory.encrypt(b"split across tcp segments").unwrap();
        let (first, second) = wire.split_at(7);

        controller.feed(first);
        assert!(controller.decrypt().unwrap().is_none());

        controller.feed(second);
        assert_eq!(
            controller.decrypt().unwrap().unwrap(),
            b"split across tcp segments"
        );
    }

    #[test]
    fn flipped_tag_byte_fails_decrypt() {
        let (mut accessory, mut controller) = linked_pair();
        force_started(&mut accessory);

        let mut wire = accessory.encrypt(b"authentic").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        controller.feed(&wire);
        assert!(matches!(
            controller.decrypt(),
            Err(RecordError::DecryptionFailed)
        ));
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        let (_, mut controller) = linked_pair();
        controller.feed(&2000u16.to_le_bytes());
        controller.feed(&[0u8; 64]);
        assert!(matches!(
            controller.decrypt(),
            Err(RecordError::InvalidFrameLength(2000))
        ));
    }

    #[test]
    fn nonce_counters_advance_per_chunk() {
        let (mut accessory, mut controller) = linked_pair();
        force_started(&mut accessory);

        let first = accessory.encrypt(b"one").unwrap();
        let second = accessory.encrypt(b"two").unwrap();

        // Frames decrypt only in order; replaying the second first fails.
        let mut out_of_order = RecordLayer::new();
        out_of_order
            .activate(&ControlChannelKeys {
                accessory_to_controller: [0x22; 32],
                controller_to_accessory: [0x11; 32],
            })
            .unwrap();
        out_of_order.feed(&second);
        assert!(out_of_order.decrypt().is_err());

        controller.feed(&first);
        controller.feed(&second);
        assert_eq!(controller.decrypt().unwrap().unwrap(), b"one");
        assert_eq!(controller.decrypt().unwrap().unwrap(), b"two");
    }
}
