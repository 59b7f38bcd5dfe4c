//! HAP request router
//!
//! Dispatches parsed requests to the pairing, accessories,
//! characteristics and resource handlers. Domain outcomes travel as HAP
//! status bodies; the HTTP status line only reflects framing and
//! authorization. Everything except `/identify`, `/pair-setup` and
//! `/pair-verify` requires a verified session (or the insecure override),
//! answered otherwise with HTTP 470.

mod characteristics;
mod delegate;
mod pairings;
mod session;
mod status;


pub use delegate::{
    AccessoryDelegate, CharacteristicRead, CharacteristicReadResult, CharacteristicWrite,
    CharacteristicWriteResult, ResourceRequest, ResourceResponse,
};
pub use session::ConnectionSession;
pub use status::{HapStatus, status_body};

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::{debug, warn};

use crate::protocol::http::{
    HttpRequest, HttpResponse, Method, ResponseBuilder, content_type,
};
use crate::protocol::pairing::store::ControllerStore;
use crate::protocol::pairing::{
    AccessoryIdentity, PairAttemptCounter, SetupContext, VerifiedSession,
};

/// Server-wide state the router needs; shared by every connection
pub struct RouterContext {
    /// Accessory identity (pairing id + long-term keypair)
    pub identity: AccessoryIdentity,
    /// Pairing persistence collaborator
    pub store: Arc<dyn ControllerStore>,
    /// Accessory object-graph collaborator
    pub delegate: Arc<dyn AccessoryDelegate>,
    /// Process-wide failed pair-setup counter
    pub attempts: PairAttemptCounter,
    /// Accessory-wide single-setup slot
    pub setup_slot: Arc<AtomicBool>,
    /// Setup pincode
    pub pincode: String,
    /// Serve protected routes without pair-verify (test/dev mode)
    pub allow_insecure: bool,
}

/// What the transport layer must do after writing the response
pub struct RouterOutcome {
    /// The response to send
    pub response: HttpResponse,
    /// Session keys to install once the response has been written
    pub established: Option<VerifiedSession>,
    /// A pairing was removed; its connections must be torn down
    pub removed_pairing: Option<String>,
}

impl RouterOutcome {
    fn plain(response: HttpResponse) -> Self {
        Self {
            response,
            established: None,
            removed_pairing: None,
        }
    }
}

/// Dispatch one request
pub async fn handle_request(
    request: &HttpRequest,
    session: &mut ConnectionSession,
    ctx: &RouterContext,
) -> RouterOutcome {
    let path = request.path();
    debug!(method = %request.method, path, "dispatching request");

    match (request.method, path) {
        (Method::Post, "/identify") => RouterOutcome::plain(handle_identify(ctx).await),
        (Method::Post, "/pair-setup") => {
            let setup_ctx = SetupContext {
                identity: &ctx.identity,
                store: ctx.store.as_ref(),
                attempts: &ctx.attempts,
                setup_slot: &ctx.setup_slot,
                pincode: &ctx.pincode,
                allow_insecure: ctx.allow_insecure,
            };
            let body = session.pair_setup.handle(&request.body, &setup_ctx).await;
            RouterOutcome::plain(
                ResponseBuilder::ok()
                    .body(body, content_type::PAIRING_TLV8)
                    .build(),
            )
        }
        (Method::Post, "/pair-verify") => {
            let (body, established) = session
                .pair_verify
                .handle(&request.body, &ctx.identity, ctx.store.as_ref())
                .await;
            RouterOutcome {
                response: ResponseBuilder::ok()
                    .body(body, content_type::PAIRING_TLV8)
                    .build(),
                established,
                removed_pairing: None,
            }
        }
        _ => handle_protected(request, session, ctx).await,
    }
}

async fn handle_protected(
    request: &HttpRequest,
    session: &mut ConnectionSession,
    ctx: &RouterContext,
) -> RouterOutcome {
    if !session.authenticated() && !ctx.allow_insecure {
        warn!(path = request.path(), "unauthenticated access rejected");
        return RouterOutcome::plain(
            ResponseBuilder::new(470)
                .body(
                    status_body(HapStatus::InsufficientAuthorization),
                    content_type::HAP_JSON,
                )
                .build(),
        );
    }

    match (request.method, request.path()) {
        (Method::Post, "/pairings") => {
            let outcome =
                pairings::handle(request, session.username.as_deref(), ctx.store.as_ref()).await;
            RouterOutcome {
                response: outcome.response,
                established: None,
                removed_pairing: outcome.removed_pairing,
            }
        }
        (Method::Get, "/accessories") => {
            RouterOutcome::plain(handle_accessories(ctx).await)
        }
        (Method::Get, "/characteristics") => RouterOutcome::plain(
            characteristics::handle_get(request, ctx.delegate.as_ref()).await,
        ),
        (Method::Put, "/characteristics") => {
            if let Some(rejection) = check_write_authorization(request, session, ctx) {
                return RouterOutcome::plain(rejection);
            }
            RouterOutcome::plain(
                characteristics::handle_put(request, session, ctx.delegate.as_ref()).await,
            )
        }
        (Method::Put, "/prepare") => {
            RouterOutcome::plain(characteristics::handle_prepare(request, session))
        }
        (Method::Post, "/resource") => RouterOutcome::plain(handle_resource(request, ctx).await),
        (_, path) => {
            warn!(path, "no route");
            RouterOutcome::plain(
                ResponseBuilder::new(404)
                    .body(
                        status_body(HapStatus::ResourceDoesNotExist),
                        content_type::HAP_JSON,
                    )
                    .build(),
            )
        }
    }
}

/// Write-response requests on an unauthenticated (insecure-mode)
/// connection must present the pincode in the `Authorization` header.
fn check_write_authorization(
    request: &HttpRequest,
    session: &ConnectionSession,
    ctx: &RouterContext,
) -> Option<HttpResponse> {
    if session.authenticated() {
        return None;
    }
    let wants_write_response = serde_json::from_slice::<serde_json::Value>(&request.body)
        .ok()
        .and_then(|v| {
            v.get("characteristics")?.as_array().map(|entries| {
                entries
                    .iter()
                    .any(|e| e.get("r").and_then(serde_json::Value::as_bool) == Some(true))
            })
        })
        .unwrap_or(false);

    if wants_write_response && request.headers.get("Authorization") != Some(ctx.pincode.as_str()) {
        warn!("write-response request without valid pincode header");
        return Some(
            ResponseBuilder::new(470)
                .body(
                    status_body(HapStatus::InsufficientAuthorization),
                    content_type::HAP_JSON,
                )
                .build(),
        );
    }
    None
}

async fn handle_identify(ctx: &RouterContext) -> HttpResponse {
    if ctx.store.paired().await && !ctx.allow_insecure {
        debug!("identify rejected: accessory is paired");
        return ResponseBuilder::new(400)
            .body(
                status_body(HapStatus::InsufficientPrivileges),
                content_type::HAP_JSON,
            )
            .build();
    }

    match ctx.delegate.identify().await {
        Ok(()) => ResponseBuilder::no_content().build(),
        Err(status) => ResponseBuilder::new(500)
            .body(status_body(status), content_type::HAP_JSON)
            .build(),
    }
}

async fn handle_accessories(ctx: &RouterContext) -> HttpResponse {
    match ctx.delegate.accessories().await {
        Ok(value) => {
            let body = serde_json::to_vec(&value).unwrap_or_default();
            ResponseBuilder::ok()
                .body(body, content_type::HAP_JSON)
                .build()
        }
        Err(status) => ResponseBuilder::new(500)
            .body(status_body(status), content_type::HAP_JSON)
            .build(),
    }
}

async fn handle_resource(request: &HttpRequest, ctx: &RouterContext) -> HttpResponse {
    let Ok(resource_request) = serde_json::from_slice::<ResourceRequest>(&request.body) else {
        return ResponseBuilder::new(400)
            .body(
                status_body(HapStatus::InvalidValueInRequest),
                content_type::HAP_JSON,
            )
            .build();
    };

    match ctx.delegate.resource(resource_request).await {
        Ok(resource) => ResponseBuilder::ok()
            .body(resource.body, &resource.content_type)
            .build(),
        Err(status) => ResponseBuilder::new(500)
            .body(status_body(status), content_type::HAP_JSON)
            .build(),
    }
}
