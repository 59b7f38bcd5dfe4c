//! Per-connection task: byte pump, request dispatch, event delivery
//!
//! Each accepted socket runs one task owning the record layer, the HTTP
//! codec and the connection's session state. Requests are handled
//! strictly sequentially; queued events are flushed only between
//! responses, so an `EVENT/1.0` frame can never interleave with an
//! in-flight response.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::BytesMut;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::HapError;
use crate::protocol::http::{HttpServerCodec, content_type, encode_event, encode_response};
use crate::router::{self, ConnectionSession};

use super::record::RecordLayer;
use super::server::{CharacteristicEvent, ConnectionId, ConnectionShared, ServerContext, ServerEvent};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, parser not yet ready
    Connecting,
    /// Parser ready, serving plaintext handshake traffic
    FullySetUp,
    /// Pair-verify completed; record layer active
    Authenticated,
    /// Self-initiated unpair; finish the in-flight response, then close
    ToBeTearedDown,
    /// Shutting down
    Closing,
    /// Gone
    Closed,
}

impl ConnectionState {
    /// Whether the connection still serves requests
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::FullySetUp | Self::Authenticated)
    }
}

/// Commands the server side sends into a connection task
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Queue a characteristic-change notification
    Event(CharacteristicEvent),
    /// Close the connection; graceful waits for the in-flight response
    Teardown {
        /// Finish the current response before closing
        graceful: bool,
    },
}

/// Drives one accepted connection to completion.
pub(crate) async fn run_connection(
    id: ConnectionId,
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: &Arc<ServerContext>,
    mut command_rx: tokio::sync::mpsc::UnboundedReceiver<ConnectionCommand>,
    shared: Arc<Mutex<ConnectionShared>>,
) -> Result<(), HapError> {
    let mut state = ConnectionState::Connecting;
    let mut record = RecordLayer::new();
    let mut codec = HttpServerCodec::new();
    let mut session = ConnectionSession::new();
    let mut read_buf = BytesMut::with_capacity(4096);

    let mut pending_events: Vec<CharacteristicEvent> = Vec::new();
    let mut flush_deadline: Option<tokio::time::Instant> = None;

    state = transition(id, state, ConnectionState::FullySetUp);

    loop {
        let coalesce = async {
            match flush_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            read = stream.read_buf(&mut read_buf) => {
                let n = read?;
                if n == 0 {
                    debug!(id, %peer, "socket closed by peer");
                    break;
                }
                touch(&shared);
                record.feed(&read_buf.split());

                match process_incoming(
                    id,
                    &mut stream,
                    &mut record,
                    &mut codec,
                    &mut session,
                    &mut state,
                    ctx,
                    &shared,
                )
                .await
                {
                    Ok(()) => {}
                    Err(err) => {
                        warn!(id, "connection fatal: {err}");
                        break;
                    }
                }
                if state == ConnectionState::ToBeTearedDown {
                    debug!(id, "graceful teardown after unpair response");
                    break;
                }

                // Immediate events queued while a request was in flight.
                if pending_events.iter().any(|e| e.immediate) {
                    flush_events(&mut stream, &mut record, &mut pending_events, &mut flush_deadline).await?;
                }
            }
            command = command_rx.recv() => {
                match command {
                    Some(ConnectionCommand::Event(event)) => {
                        let immediate = event.immediate;
                        if queue_event(&session, &mut pending_events, event) {
                            if immediate {
                                flush_events(&mut stream, &mut record, &mut pending_events, &mut flush_deadline).await?;
                            } else if flush_deadline.is_none() {
                                flush_deadline = Some(
                                    tokio::time::Instant::now() + ctx.config.event_coalesce_delay,
                                );
                            }
                        }
                    }
                    Some(ConnectionCommand::Teardown { graceful }) => {
                        debug!(id, graceful, "teardown requested");
                        state = transition(id, state, ConnectionState::ToBeTearedDown);
                        break;
                    }
                    None => break,
                }
            }
            () = coalesce => {
                flush_events(&mut stream, &mut record, &mut pending_events, &mut flush_deadline).await?;
            }
        }
    }

    state = transition(id, state, ConnectionState::Closing);
    let _ = stream.shutdown().await;
    let _ = transition(id, state, ConnectionState::Closed);
    Ok(())
}

/// Decrypt, parse and answer every complete request currently buffered.
#[allow(clippy::too_many_arguments)]
async fn process_incoming(
    id: ConnectionId,
    stream: &mut TcpStream,
    record: &mut RecordLayer,
    codec: &mut HttpServerCodec,
    session: &mut ConnectionSession,
    state: &mut ConnectionState,
    ctx: &Arc<ServerContext>,
    shared: &Arc<Mutex<ConnectionShared>>,
) -> Result<(), HapError> {
    while let Some(plaintext) = record.decrypt()? {
        codec.feed(&plaintext);

        while let Some(request) = codec.decode()? {
            let outcome = router::handle_request(&request, session, &ctx.router).await;

            let response_bytes = encode_response(&outcome.response);
            let wire = record.encrypt(&response_bytes)?;
            stream.write_all(&wire).await?;
            touch(shared);

            // Pair-verify completion: the M4 response just went out in
            // plaintext; everything after it is encrypted.
            if let Some(established) = outcome.established {
                record.activate(&established.keys)?;
                session.username = Some(established.pairing_id.clone());
                {
                    let mut shared = shared.lock().expect("connection shared lock");
                    shared.username = Some(established.pairing_id.clone());
                    shared.shared_secret = Some(established.shared_secret);
                }
                *state = transition(id, *state, ConnectionState::Authenticated);
                let _ = ctx.events.send(ServerEvent::SessionVerified {
                    pairing_id: established.pairing_id,
                });
            }

            if let Some(removed) = outcome.removed_pairing {
                let self_affected = ctx.registry.teardown_username(&removed, id);
                if self_affected {
                    *state = transition(id, *state, ConnectionState::ToBeTearedDown);
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

/// Queue an event if this connection subscribes to it. Returns whether it
/// was queued. A duplicate of an already-queued, not-yet-flushed event
/// with the identical value is dropped; changed values are always kept.
pub(crate) fn queue_event(
    session: &ConnectionSession,
    pending: &mut Vec<CharacteristicEvent>,
    event: CharacteristicEvent,
) -> bool {
    if !session.subscriptions.contains(&(event.aid, event.iid)) {
        return false;
    }
    let duplicate = pending
        .iter()
        .any(|e| e.aid == event.aid && e.iid == event.iid && e.value == event.value);
    if duplicate {
        return false;
    }
    pending.push(event);
    true
}

/// Render and write all pending events as one `EVENT/1.0` frame.
async fn flush_events(
    stream: &mut TcpStream,
    record: &mut RecordLayer,
    pending: &mut Vec<CharacteristicEvent>,
    flush_deadline: &mut Option<tokio::time::Instant>,
) -> Result<(), HapError> {
    *flush_deadline = None;
    if pending.is_empty() {
        return Ok(());
    }

    let entries: Vec<_> = pending
        .drain(..)
        .map(|e| json!({ "aid": e.aid, "iid": e.iid, "value": e.value }))
        .collect();
    let body = serde_json::to_vec(&json!({ "characteristics": entries })).unwrap_or_default();

    let frame = encode_event(&body, content_type::HAP_JSON);
    let wire = record.encrypt(&frame)?;
    stream.write_all(&wire).await?;
    Ok(())
}

fn touch(shared: &Arc<Mutex<ConnectionShared>>) {
    shared.lock().expect("connection shared lock").last_active = Instant::now();
}

fn transition(id: ConnectionId, from: ConnectionState, to: ConnectionState) -> ConnectionState {
    if from != to {
        debug!(id, ?from, ?to, "connection state");
    }
    to
}
