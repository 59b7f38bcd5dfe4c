//! `/characteristics` and `/prepare` endpoints
//!
//! GET reads a comma-separated `aid.iid` list from the query string; PUT
//! carries a JSON batch of writes and subscription changes. Whenever any
//! entry in a batch carries a non-success outcome (or a write returns a
//! value), the whole response is promoted to HTTP 207 and every entry
//! gains an explicit `status`.

use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::protocol::http::{HttpRequest, HttpResponse, ResponseBuilder, content_type};

use super::delegate::{AccessoryDelegate, CharacteristicRead, CharacteristicWrite};
use super::session::ConnectionSession;
use super::status::{HapStatus, status_body};

/// Parse the `id=1.9,2.14` query parameter
fn parse_id_list(query: &str) -> Option<Vec<(u64, u64)>> {
    let mut ids = Vec::new();
    for pair in query.split(',') {
        let (aid, iid) = pair.split_once('.')?;
        ids.push((aid.parse().ok()?, iid.parse().ok()?));
    }
    if ids.is_empty() { None } else { Some(ids) }
}

/// Handle `GET /characteristics`
pub async fn handle_get(
    request: &HttpRequest,
    delegate: &dyn AccessoryDelegate,
) -> HttpResponse {
    let Some(ids) = request.query_param("id").and_then(parse_id_list) else {
        return ResponseBuilder::new(400)
            .body(status_body(HapStatus::InvalidValueInRequest), content_type::HAP_JSON)
            .build();
    };

    let flag = |name: &str| request.query_param(name) == Some("1");
    let (include_meta, include_perms, include_type, include_ev) =
        (flag("meta"), flag("perms"), flag("type"), flag("ev"));

    let reads = ids
        .iter()
        .map(|&(aid, iid)| CharacteristicRead {
            aid,
            iid,
            include_meta,
            include_perms,
            include_type,
            include_ev,
        })
        .collect();

    let mut results = delegate.read_characteristics(reads).await;

    let any_error = results
        .iter()
        .any(|r| r.status.is_some_and(|s| !s.is_success()));

    if any_error {
        // Multi-status: every entry carries an explicit status.
        for result in &mut results {
            if result.status.is_none() {
                result.status = Some(HapStatus::Success);
            }
        }
    } else {
        for result in &mut results {
            result.status = None;
        }
    }

    let status_code = if any_error { 207 } else { 200 };
    let body = serde_json::to_vec(&json!({ "characteristics": results }))
        .unwrap_or_else(|_| status_body(HapStatus::ServiceCommunicationFailure));

    ResponseBuilder::new(status_code)
        .body(body, content_type::HAP_JSON)
        .build()
}

#[derive(Deserialize)]
struct PutBody {
    characteristics: Vec<CharacteristicWrite>,
    #[serde(default)]
    pid: Option<u64>,
}

#[derive(Deserialize)]
struct PrepareBody {
    /// Time to live in milliseconds
    ttl: u64,
    /// Timed-write token
    pid: u64,
}

/// Handle `PUT /characteristics`
pub async fn handle_put(
    request: &HttpRequest,
    session: &mut ConnectionSession,
    delegate: &dyn AccessoryDelegate,
) -> HttpResponse {
    let Ok(body) = serde_json::from_slice::<PutBody>(&request.body) else {
        return ResponseBuilder::new(400)
            .body(status_body(HapStatus::InvalidValueInRequest), content_type::HAP_JSON)
            .build();
    };

    // A timed write must present a prepared, unexpired token.
    let pid_valid = match body.pid {
        None => true,
        Some(pid) => session
            .timed_writes
            .remove(&pid)
            .is_some_and(|deadline| deadline > Instant::now()),
    };
    if !pid_valid {
        debug!("characteristics PUT: invalid or expired timed-write pid");
        let entries: Vec<_> = body
            .characteristics
            .iter()
            .map(|w| {
                json!({
                    "aid": w.aid,
                    "iid": w.iid,
                    "status": HapStatus::InvalidValueInRequest.as_i32(),
                })
            })
            .collect();
        let body = serde_json::to_vec(&json!({ "characteristics": entries }))
            .unwrap_or_default();
        return ResponseBuilder::new(207)
            .body(body, content_type::HAP_JSON)
            .build();
    }

    // Subscription-only entries are resolved locally; value writes go to
    // the delegate as one batch.
    struct Slot {
        aid: u64,
        iid: u64,
        status: HapStatus,
        value: Option<serde_json::Value>,
        write_index: Option<usize>,
    }

    let mut slots = Vec::with_capacity(body.characteristics.len());
    let mut writes = Vec::new();

    for entry in body.characteristics {
        if let Some(subscribe) = entry.ev {
            if subscribe {
                session.subscriptions.insert((entry.aid, entry.iid));
                debug!(aid = entry.aid, iid = entry.iid, "event subscription added");
            } else {
                session.subscriptions.remove(&(entry.aid, entry.iid));
                debug!(aid = entry.aid, iid = entry.iid, "event subscription removed");
            }
        }

        if entry.value.is_some() {
            slots.push(Slot {
                aid: entry.aid,
                iid: entry.iid,
                status: HapStatus::Success,
                value: None,
                write_index: Some(writes.len()),
            });
            writes.push(entry);
        } else {
            slots.push(Slot {
                aid: entry.aid,
                iid: entry.iid,
                status: HapStatus::Success,
                value: None,
                write_index: None,
            });
        }
    }

    if !writes.is_empty() {
        let results = delegate.write_characteristics(writes).await;
        for slot in &mut slots {
            if let Some(index) = slot.write_index {
                if let Some(result) = results.get(index) {
                    slot.status = result.status;
                    slot.value = result.value.clone();
                }
            }
        }
    }

    let needs_multi_status = slots
        .iter()
        .any(|slot| !slot.status.is_success() || slot.value.is_some());

    if !needs_multi_status {
        return ResponseBuilder::no_content().build();
    }

    let entries: Vec<_> = slots
        .iter()
        .map(|slot| {
            let mut entry = json!({
                "aid": slot.aid,
                "iid": slot.iid,
                "status": slot.status.as_i32(),
            });
            if let Some(value) = &slot.value {
                entry["value"] = value.clone();
            }
            entry
        })
        .collect();

    let body = serde_json::to_vec(&json!({ "characteristics": entries })).unwrap_or_default();
    ResponseBuilder::new(207)
        .body(body, content_type::HAP_JSON)
        .build()
}

/// Handle `PUT /prepare` (timed-write arming)
pub fn handle_prepare(request: &HttpRequest, session: &mut ConnectionSession) -> HttpResponse {
    let Ok(body) = serde_json::from_slice::<PrepareBody>(&request.body) else {
        return ResponseBuilder::new(400)
            .body(status_body(HapStatus::InvalidValueInRequest), content_type::HAP_JSON)
            .build();
    };

    session
        .timed_writes
        .insert(body.pid, Instant::now() + Duration::from_millis(body.ttl));
    debug!(pid = body.pid, ttl_ms = body.ttl, "timed write prepared");

    ResponseBuilder::ok()
        .body(status_body(HapStatus::Success), content_type::HAP_JSON)
        .build()
}
