//! `/pairings` endpoint: ADD / REMOVE / LIST over TLV8
//!
//! Unlike the JSON endpoints, pairing management always answers
//! `application/pairing+tlv8`, with failures carried as error TLVs inside
//! a 200 response. All three operations require an admin controller.

use tracing::{debug, warn};

use crate::protocol::http::{HttpRequest, HttpResponse, ResponseBuilder, content_type};
use crate::protocol::pairing::store::{ControllerEntry, ControllerStore};
use crate::protocol::pairing::{PERMISSION_ADMIN, error_code, method, tlv_type};
use crate::protocol::tlv::{TlvEncoder, TlvReader};

/// Result of a pairings operation; a removal may require connection
/// teardown by the transport layer.
pub struct PairingsOutcome {
    /// The TLV response
    pub response: HttpResponse,
    /// Pairing id whose connections must be torn down
    pub removed_pairing: Option<String>,
}

fn tlv_response(body: Vec<u8>) -> HttpResponse {
    ResponseBuilder::ok()
        .body(body, content_type::PAIRING_TLV8)
        .build()
}

fn error_response(code: u8) -> PairingsOutcome {
    PairingsOutcome {
        response: tlv_response(
            TlvEncoder::new()
                .add_u8(tlv_type::STATE, 2)
                .add_u8(tlv_type::ERROR, code)
                .build(),
        ),
        removed_pairing: None,
    }
}

/// Handle `POST /pairings`.
///
/// `requester` is the verified controller; `None` only occurs in
/// insecure mode, where the admin check is waived.
pub async fn handle(
    request: &HttpRequest,
    requester: Option<&str>,
    store: &dyn ControllerStore,
) -> PairingsOutcome {
    let Ok(reader) = TlvReader::decode(&request.body) else {
        warn!("pairings: malformed TLV body");
        return error_response(error_code::UNKNOWN);
    };

    if reader.get_u8(tlv_type::STATE) != Some(1) {
        return error_response(error_code::UNKNOWN);
    }

    if let Some(requester) = requester {
        let is_admin = store
            .controller_permissions(requester)
            .await
            .is_some_and(|p| p & PERMISSION_ADMIN != 0);
        if !is_admin {
            warn!("pairings: {requester} lacks admin permission");
            return error_response(error_code::AUTHENTICATION);
        }
    }

    match reader.get_u8(tlv_type::METHOD) {
        Some(method::ADD_PAIRING) => add_pairing(&reader, store).await,
        Some(method::REMOVE_PAIRING) => remove_pairing(&reader, store).await,
        Some(method::LIST_PAIRINGS) => list_pairings(store).await,
        other => {
            warn!("pairings: unsupported method {other:?}");
            error_response(error_code::UNKNOWN)
        }
    }
}

async fn add_pairing(reader: &TlvReader, store: &dyn ControllerStore) -> PairingsOutcome {
    let (Some(identifier), Some(ltpk_bytes)) = (
        reader.get(tlv_type::IDENTIFIER),
        reader.get(tlv_type::PUBLIC_KEY),
    ) else {
        return error_response(error_code::UNKNOWN);
    };
    let Ok(pairing_id) = std::str::from_utf8(identifier) else {
        return error_response(error_code::UNKNOWN);
    };
    if ltpk_bytes.len() != 32 {
        return error_response(error_code::UNKNOWN);
    }
    let mut ltpk = [0u8; 32];
    ltpk.copy_from_slice(ltpk_bytes);

    let permissions = reader.get_u8(tlv_type::PERMISSIONS).unwrap_or(0);

    match store
        .add_controller(ControllerEntry {
            pairing_id: pairing_id.to_string(),
            ltpk,
            permissions,
        })
        .await
    {
        Ok(()) => {
            debug!("pairings: added {pairing_id}");
            PairingsOutcome {
                response: tlv_response(TlvEncoder::new().add_u8(tlv_type::STATE, 2).build()),
                removed_pairing: None,
            }
        }
        Err(err) => {
            warn!("pairings: add failed: {err}");
            error_response(err.error_code())
        }
    }
}

async fn remove_pairing(reader: &TlvReader, store: &dyn ControllerStore) -> PairingsOutcome {
    let Some(identifier) = reader.get(tlv_type::IDENTIFIER) else {
        return error_response(error_code::UNKNOWN);
    };
    let Ok(pairing_id) = std::str::from_utf8(identifier) else {
        return error_response(error_code::UNKNOWN);
    };

    // Removing an unknown pairing is treated as already done.
    let removed = store.remove_controller(pairing_id).await.is_ok();
    debug!("pairings: removed {pairing_id} (existed: {removed})");

    PairingsOutcome {
        response: tlv_response(TlvEncoder::new().add_u8(tlv_type::STATE, 2).build()),
        removed_pairing: removed.then(|| pairing_id.to_string()),
    }
}

async fn list_pairings(store: &dyn ControllerStore) -> PairingsOutcome {
    let controllers = store.list_controllers().await;

    let mut encoder = TlvEncoder::new().add_u8(tlv_type::STATE, 2);
    let mut first = true;
    for entry in controllers {
        if !first {
            encoder = encoder.add(tlv_type::SEPARATOR, &[]);
        }
        first = false;
        encoder = encoder
            .add(tlv_type::IDENTIFIER, entry.pairing_id.as_bytes())
            .add(tlv_type::PUBLIC_KEY, &entry.ltpk)
            .add_u8(tlv_type::PERMISSIONS, entry.permissions);
    }

    PairingsOutcome {
        response: tlv_response(encoder.build()),
        removed_pairing: None,
    }
}
