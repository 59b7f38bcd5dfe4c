//! Pair-verify: per-connection session establishment (M1–M4)
//!
//! An X25519 agreement authenticated by both sides' long-term Ed25519
//! keys. Success hands the caller the direction-specific control-channel
//! keys; from that exact point on the connection must encrypt.

use tracing::{debug, warn};

use crate::protocol::crypto::{
    ChaCha20Poly1305Cipher, ControlChannelKeys, Ed25519PublicKey, Ed25519Signature, HkdfSha512,
    Nonce, X25519KeyPair, X25519PublicKey,
};
use crate::protocol::tlv::{TlvEncoder, TlvReader};

use super::{AccessoryIdentity, ControllerStore, error_code, tlv_type};

/// Outcome of a completed pair-verify exchange
pub struct VerifiedSession {
    /// The verified controller's pairing identifier
    pub pairing_id: String,
    /// Raw X25519 shared secret (the data-stream protocol derives from it)
    pub shared_secret: [u8; 32],
    /// Control-channel keys for the record layer
    pub keys: ControlChannelKeys,
}

enum Stage {
    Idle,
    AwaitingM3 {
        shared_secret: [u8; 32],
        session_key: [u8; 32],
        server_public: [u8; 32],
        client_public: [u8; 32],
    },
}

/// Per-connection pair-verify state machine
pub struct PairVerify {
    stage: Stage,
}

impl PairVerify {
    /// Create an idle machine
    #[must_use]
    pub fn new() -> Self {
        Self { stage: Stage::Idle }
    }

    /// Process one pair-verify request body.
    ///
    /// Returns the response TLV and, once M3 verifies, the established
    /// session. Failures reset the machine but never the TCP connection —
    /// the controller may retry from M1.
    pub async fn handle(
        &mut self,
        body: &[u8],
        identity: &AccessoryIdentity,
        store: &dyn ControllerStore,
    ) -> (Vec<u8>, Option<VerifiedSession>) {
        let reader = match TlvReader::decode(body) {
            Ok(reader) => reader,
            Err(err) => {
                warn!("pair-verify: malformed TLV: {err}");
                self.stage = Stage::Idle;
                return (error_tlv(2, error_code::UNKNOWN), None);
            }
        };

        let state = reader.get_u8(tlv_type::STATE).unwrap_or(0);
        match state {
            1 => (self.handle_m1(&reader, identity), None),
            3 => self.handle_m3(&reader, store).await,
            other => {
                warn!("pair-verify: unexpected state {other}");
                self.stage = Stage::Idle;
                (error_tlv(state.saturating_add(1), error_code::UNKNOWN), None)
            }
        }
    }

    fn handle_m1(&mut self, reader: &TlvReader, identity: &AccessoryIdentity) -> Vec<u8> {
        self.stage = Stage::Idle;

        let Some(client_public_bytes) = reader.get(tlv_type::PUBLIC_KEY) else {
            warn!("pair-verify M1: missing public key");
            return error_tlv(2, error_code::UNKNOWN);
        };
        let Ok(client_public) = X25519PublicKey::from_bytes(client_public_bytes) else {
            warn!("pair-verify M1: invalid public key");
            return error_tlv(2, error_code::UNKNOWN);
        };

        let keypair = X25519KeyPair::generate();
        let server_public = *keypair.public_key().as_bytes();
        let shared = keypair.diffie_hellman(&client_public);

        // Accessory proves possession of its long-term key over both
        // ephemeral public keys.
        let mut accessory_info = Vec::with_capacity(32 + identity.pairing_id.len() + 32);
        accessory_info.extend_from_slice(&server_public);
        accessory_info.extend_from_slice(identity.pairing_id.as_bytes());
        accessory_info.extend_from_slice(client_public.as_bytes());
        let signature = identity.keypair.sign(&accessory_info);

        let hkdf = HkdfSha512::new(Some(b"Pair-Verify-Encrypt-Salt"), shared.as_bytes());
        let Ok(session_key) = hkdf.expand_fixed::<32>(b"Pair-Verify-Encrypt-Info") else {
            return error_tlv(2, error_code::UNKNOWN);
        };

        let sub_tlv = TlvEncoder::new()
            .add(tlv_type::IDENTIFIER, identity.pairing_id.as_bytes())
            .add(tlv_type::SIGNATURE, &signature.to_bytes())
            .build();

        let sealed = ChaCha20Poly1305Cipher::new(&session_key)
            .and_then(|cipher| cipher.encrypt(&Nonce::from_label(b"PV-Msg02"), &sub_tlv));
        let Ok(sealed) = sealed else {
            return error_tlv(2, error_code::UNKNOWN);
        };

        debug!("pair-verify M1 → M2");
        self.stage = Stage::AwaitingM3 {
            shared_secret: *shared.as_bytes(),
            session_key,
            server_public,
            client_public: *client_public.as_bytes(),
        };

        TlvEncoder::new()
            .add_u8(tlv_type::STATE, 2)
            .add(tlv_type::PUBLIC_KEY, &server_public)
            .add(tlv_type::ENCRYPTED_DATA, &sealed)
            .build()
    }

    async fn handle_m3(
        &mut self,
        reader: &TlvReader,
        store: &dyn ControllerStore,
    ) -> (Vec<u8>, Option<VerifiedSession>) {
        let Stage::AwaitingM3 {
            shared_secret,
            session_key,
            server_public,
            client_public,
        } = std::mem::replace(&mut self.stage, Stage::Idle)
        else {
            warn!("pair-verify M3: no preceding M1");
            return (error_tlv(4, error_code::UNKNOWN), None);
        };

        let Some(encrypted) = reader.get(tlv_type::ENCRYPTED_DATA) else {
            warn!("pair-verify M3: missing encrypted data");
            return (error_tlv(4, error_code::UNKNOWN), None);
        };

        let opened = ChaCha20Poly1305Cipher::new(&session_key)
            .and_then(|cipher| cipher.decrypt(&Nonce::from_label(b"PV-Msg03"), encrypted));
        let Ok(sub_tlv_bytes) = opened else {
            warn!("pair-verify M3: decryption failed");
            return (error_tlv(4, error_code::AUTHENTICATION), None);
        };

        let Ok(sub_tlv) = TlvReader::decode(&sub_tlv_bytes) else {
            warn!("pair-verify M3: malformed inner TLV");
            return (error_tlv(4, error_code::UNKNOWN), None);
        };

        let (Some(identifier), Some(signature_bytes)) = (
            sub_tlv.get(tlv_type::IDENTIFIER),
            sub_tlv.get(tlv_type::SIGNATURE),
        ) else {
            warn!("pair-verify M3: incomplete inner TLV");
            return (error_tlv(4, error_code::UNKNOWN), None);
        };

        let Ok(pairing_id) = std::str::from_utf8(identifier) else {
            return (error_tlv(4, error_code::UNKNOWN), None);
        };

        let Some(ltpk) = store.controller_ltpk(pairing_id).await else {
            warn!("pair-verify M3: unknown controller {pairing_id}");
            return (error_tlv(4, error_code::AUTHENTICATION), None);
        };

        let mut controller_info = Vec::with_capacity(32 + identifier.len() + 32);
        controller_info.extend_from_slice(&client_public);
        controller_info.extend_from_slice(identifier);
        controller_info.extend_from_slice(&server_public);

        let verified = Ed25519PublicKey::from_bytes(&ltpk)
            .and_then(|key| {
                Ed25519Signature::from_bytes(signature_bytes)
                    .and_then(|sig| key.verify(&controller_info, &sig))
            })
            .is_ok();
        if !verified {
            warn!("pair-verify M3: controller signature invalid");
            return (error_tlv(4, error_code::AUTHENTICATION), None);
        }

        let Ok(keys) = ControlChannelKeys::derive(&shared_secret) else {
            return (error_tlv(4, error_code::UNKNOWN), None);
        };

        debug!("pair-verify M3 → M4, session for {pairing_id}");
        let response = TlvEncoder::new().add_u8(tlv_type::STATE, 4).build();

        (
            response,
            Some(VerifiedSession {
                pairing_id: pairing_id.to_string(),
                shared_secret,
                keys,
            }),
        )
    }
}

impl Default for PairVerify {
    fn default() -> Self {
        Self::new()
    }
}

fn error_tlv(state: u8, code: u8) -> Vec<u8> {
    TlvEncoder::new()
        .add_u8(tlv_type::STATE, state)
        .add_u8(tlv_type::ERROR, code)
        .build()
}
