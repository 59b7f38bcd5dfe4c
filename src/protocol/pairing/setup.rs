//! Pair-setup: the SRP-based first-time pairing exchange (M1–M6)
//!
//! Each connection owns one [`PairSetup`]; any failure abandons the
//! attempt and the controller must restart from M1. Only one setup may be
//! in flight across the whole accessory — a second controller gets `Busy`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::protocol::crypto::{
    ChaCha20Poly1305Cipher, Ed25519PublicKey, Ed25519Signature, HkdfSha512, Nonce, SrpParams,
    SrpServer,
};
use crate::protocol::tlv::{TlvEncoder, TlvReader};

use super::store::ControllerEntry;
use super::{
    AccessoryIdentity, ControllerStore, PERMISSION_ADMIN, PairAttemptCounter, error_code, method,
    tlv_type,
};

/// SRP username fixed by the protocol
const SRP_USERNAME: &[u8] = b"Pair-Setup";

/// Everything the setup machine needs from its surroundings
pub struct SetupContext<'a> {
    /// Accessory identity to sign M6 with
    pub identity: &'a AccessoryIdentity,
    /// Pairing persistence collaborator
    pub store: &'a dyn ControllerStore,
    /// Process-wide failed-attempt counter
    pub attempts: &'a PairAttemptCounter,
    /// Slot enforcing a single concurrent setup across connections
    pub setup_slot: &'a Arc<AtomicBool>,
    /// Accessory setup pincode, e.g. `031-45-154`
    pub pincode: &'a str,
    /// Accept pair-setup even when already paired (test/dev mode)
    pub allow_insecure: bool,
}

/// Releases the accessory-wide setup slot when the attempt ends
struct SetupSlotGuard {
    slot: Arc<AtomicBool>,
}

impl SetupSlotGuard {
    fn acquire(slot: &Arc<AtomicBool>) -> Option<Self> {
        slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { slot: slot.clone() })
    }
}

impl Drop for SetupSlotGuard {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
    }
}

enum Stage {
    Idle,
    AwaitingM3 {
        srp: SrpServer,
        salt: [u8; 16],
        _slot: SetupSlotGuard,
    },
    AwaitingM5 {
        session_key: Box<[u8; 64]>,
        _slot: SetupSlotGuard,
    },
}

/// Per-connection pair-setup state machine
pub struct PairSetup {
    stage: Stage,
}

impl PairSetup {
    /// Create an idle machine
    #[must_use]
    pub fn new() -> Self {
        Self { stage: Stage::Idle }
    }

    /// Process one pair-setup request body; always yields a response TLV.
    pub async fn handle(&mut self, body: &[u8], ctx: &SetupContext<'_>) -> Vec<u8> {
        let reader = match TlvReader::decode(body) {
            Ok(reader) => reader,
            Err(err) => {
                warn!("pair-setup: malformed TLV: {err}");
                self.stage = Stage::Idle;
                return error_tlv(2, error_code::UNKNOWN);
            }
        };

        let state = reader.get_u8(tlv_type::STATE).unwrap_or(0);
        match state {
            1 => self.handle_m1(&reader, ctx).await,
            3 => self.handle_m3(&reader, ctx),
            5 => self.handle_m5(&reader, ctx).await,
            other => {
                warn!("pair-setup: unexpected state {other}");
                self.stage = Stage::Idle;
                error_tlv(state.saturating_add(1), error_code::UNKNOWN)
            }
        }
    }

    async fn handle_m1(&mut self, reader: &TlvReader, ctx: &SetupContext<'_>) -> Vec<u8> {
        // A fresh M1 abandons whatever was in flight on this connection.
        self.stage = Stage::Idle;

        let pair_method = reader.get_u8(tlv_type::METHOD).unwrap_or(method::PAIR_SETUP);
        if pair_method != method::PAIR_SETUP && pair_method != method::PAIR_SETUP_WITH_AUTH {
            warn!("pair-setup M1: unsupported method {pair_method}");
            return error_tlv(2, error_code::UNKNOWN);
        }

        if ctx.attempts.locked_out() {
            warn!(
                "pair-setup M1: rejected, {} failed attempts",
                ctx.attempts.failures()
            );
            return error_tlv(2, error_code::MAX_TRIES);
        }

        if ctx.store.paired().await && !ctx.allow_insecure {
            debug!("pair-setup M1: already paired, rejecting");
            return error_tlv(2, error_code::UNAVAILABLE);
        }

        let Some(slot) = SetupSlotGuard::acquire(ctx.setup_slot) else {
            debug!("pair-setup M1: another setup is in progress");
            return error_tlv(2, error_code::BUSY);
        };

        let mut salt = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);

        let params = SrpParams::RFC5054_3072;
        let verifier = match SrpServer::compute_verifier(
            SRP_USERNAME,
            ctx.pincode.as_bytes(),
            &salt,
            &params,
        ) {
            Ok(verifier) => verifier,
            Err(err) => {
                warn!("pair-setup M1: verifier derivation failed: {err}");
                return error_tlv(2, error_code::UNKNOWN);
            }
        };

        let srp = match SrpServer::new(&verifier, &params) {
            Ok(srp) => srp,
            Err(err) => {
                warn!("pair-setup M1: SRP server init failed: {err}");
                return error_tlv(2, error_code::UNKNOWN);
            }
        };

        let response = TlvEncoder::new()
            .add_u8(tlv_type::STATE, 2)
            .add(tlv_type::SALT, &salt)
            .add(tlv_type::PUBLIC_KEY, srp.public_key())
            .build();

        debug!("pair-setup M1 → M2");
        self.stage = Stage::AwaitingM3 {
            srp,
            salt,
            _slot: slot,
        };
        response
    }

    fn handle_m3(&mut self, reader: &TlvReader, ctx: &SetupContext<'_>) -> Vec<u8> {
        let Stage::AwaitingM3 { srp, salt, _slot } = std::mem::replace(&mut self.stage, Stage::Idle)
        else {
            warn!("pair-setup M3: no preceding M1");
            return error_tlv(4, error_code::UNKNOWN);
        };

        let (Some(client_public), Some(client_proof)) = (
            reader.get(tlv_type::PUBLIC_KEY),
            reader.get(tlv_type::PROOF),
        ) else {
            warn!("pair-setup M3: missing public key or proof");
            return error_tlv(4, error_code::UNKNOWN);
        };

        match srp.verify_client(SRP_USERNAME, &salt, client_public, client_proof) {
            Ok((session_key, server_proof)) => {
                let mut key = Box::new([0u8; 64]);
                key.copy_from_slice(session_key.as_bytes());

                debug!("pair-setup M3 → M4");
                self.stage = Stage::AwaitingM5 {
                    session_key: key,
                    _slot,
                };

                TlvEncoder::new()
                    .add_u8(tlv_type::STATE, 4)
                    .add(tlv_type::PROOF, &server_proof)
                    .build()
            }
            Err(_) => {
                let failures = ctx.attempts.record_failure();
                warn!("pair-setup M3: SRP proof mismatch (failure #{failures})");
                if ctx.attempts.locked_out() {
                    error_tlv(4, error_code::MAX_TRIES)
                } else {
                    error_tlv(4, error_code::AUTHENTICATION)
                }
            }
        }
    }

    async fn handle_m5(&mut self, reader: &TlvReader, ctx: &SetupContext<'_>) -> Vec<u8> {
        let Stage::AwaitingM5 { session_key, _slot } =
            std::mem::replace(&mut self.stage, Stage::Idle)
        else {
            warn!("pair-setup M5: no preceding M3");
            return error_tlv(6, error_code::UNKNOWN);
        };

        let Some(encrypted) = reader.get(tlv_type::ENCRYPTED_DATA) else {
            warn!("pair-setup M5: missing encrypted data");
            return error_tlv(6, error_code::UNKNOWN);
        };

        let hkdf = HkdfSha512::new(Some(b"Pair-Setup-Encrypt-Salt"), session_key.as_slice());
        let Ok(encrypt_key) = hkdf.expand_fixed::<32>(b"Pair-Setup-Encrypt-Info") else {
            return error_tlv(6, error_code::UNKNOWN);
        };
        let Ok(cipher) = ChaCha20Poly1305Cipher::new(&encrypt_key) else {
            return error_tlv(6, error_code::UNKNOWN);
        };

        let Ok(sub_tlv_bytes) = cipher.decrypt(&Nonce::from_label(b"PS-Msg05"), encrypted) else {
            warn!("pair-setup M5: decryption failed");
            return error_tlv(6, error_code::AUTHENTICATION);
        };

        let Ok(sub_tlv) = TlvReader::decode(&sub_tlv_bytes) else {
            warn!("pair-setup M5: malformed inner TLV");
            return error_tlv(6, error_code::UNKNOWN);
        };

        let (Some(identifier), Some(ltpk_bytes), Some(signature_bytes)) = (
            sub_tlv.get(tlv_type::IDENTIFIER),
            sub_tlv.get(tlv_type::PUBLIC_KEY),
            sub_tlv.get(tlv_type::SIGNATURE),
        ) else {
            warn!("pair-setup M5: incomplete inner TLV");
            return error_tlv(6, error_code::UNKNOWN);
        };

        let Ok(pairing_id) = std::str::from_utf8(identifier) else {
            return error_tlv(6, error_code::UNKNOWN);
        };

        // Controller signs HKDF(K, controller-sign salts) || id || LTPK.
        let controller_hkdf =
            HkdfSha512::new(Some(b"Pair-Setup-Controller-Sign-Salt"), session_key.as_slice());
        let Ok(controller_x) =
            controller_hkdf.expand_fixed::<32>(b"Pair-Setup-Controller-Sign-Info")
        else {
            return error_tlv(6, error_code::UNKNOWN);
        };

        let mut signed_info = Vec::with_capacity(32 + identifier.len() + ltpk_bytes.len());
        signed_info.extend_from_slice(&controller_x);
        signed_info.extend_from_slice(identifier);
        signed_info.extend_from_slice(ltpk_bytes);

        let verified = Ed25519PublicKey::from_bytes(ltpk_bytes)
            .and_then(|key| {
                Ed25519Signature::from_bytes(signature_bytes)
                    .and_then(|sig| key.verify(&signed_info, &sig))
            })
            .is_ok();
        if !verified {
            warn!("pair-setup M5: controller signature invalid");
            return error_tlv(6, error_code::AUTHENTICATION);
        }

        // Accessory signs under a third, independently-salted derivation.
        let accessory_hkdf =
            HkdfSha512::new(Some(b"Pair-Setup-Accessory-Sign-Salt"), session_key.as_slice());
        let Ok(accessory_x) = accessory_hkdf.expand_fixed::<32>(b"Pair-Setup-Accessory-Sign-Info")
        else {
            return error_tlv(6, error_code::UNKNOWN);
        };

        let accessory_ltpk = ctx.identity.keypair.public_key();
        let mut accessory_info =
            Vec::with_capacity(32 + ctx.identity.pairing_id.len() + 32);
        accessory_info.extend_from_slice(&accessory_x);
        accessory_info.extend_from_slice(ctx.identity.pairing_id.as_bytes());
        accessory_info.extend_from_slice(accessory_ltpk.as_bytes());

        let signature = ctx.identity.keypair.sign(&accessory_info);

        let response_sub_tlv = TlvEncoder::new()
            .add(tlv_type::IDENTIFIER, ctx.identity.pairing_id.as_bytes())
            .add(tlv_type::PUBLIC_KEY, accessory_ltpk.as_bytes())
            .add(tlv_type::SIGNATURE, &signature.to_bytes())
            .build();

        let Ok(sealed) = cipher.encrypt(&Nonce::from_label(b"PS-Msg06"), &response_sub_tlv) else {
            return error_tlv(6, error_code::UNKNOWN);
        };

        let mut ltpk = [0u8; 32];
        if ltpk_bytes.len() != 32 {
            return error_tlv(6, error_code::UNKNOWN);
        }
        ltpk.copy_from_slice(ltpk_bytes);

        // The store's verdict decides the final M6.
        match ctx
            .store
            .add_controller(ControllerEntry {
                pairing_id: pairing_id.to_string(),
                ltpk,
                permissions: PERMISSION_ADMIN,
            })
            .await
        {
            Ok(()) => {
                debug!("pair-setup M5 → M6, paired with {pairing_id}");
                TlvEncoder::new()
                    .add_u8(tlv_type::STATE, 6)
                    .add(tlv_type::ENCRYPTED_DATA, &sealed)
                    .build()
            }
            Err(err) => {
                warn!("pair-setup M6: store rejected pairing: {err}");
                error_tlv(6, err.error_code())
            }
        }
    }
}

impl Default for PairSetup {
    fn default() -> Self {
        Self::new()
    }
}

/// Build `State + Error` response TLV
fn error_tlv(state: u8, code: u8) -> Vec<u8> {
    TlvEncoder::new()
        .add_u8(tlv_type::STATE, state)
        .add_u8(tlv_type::ERROR, code)
        .build()
}
