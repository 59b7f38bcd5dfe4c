//! One identified data-stream connection
//!
//! The task owns the socket and frame crypto; handlers and the accessory
//! side talk to it through a [`DataStreamHandle`]. Requests carry a
//! random, collision-checked id; the matching response resolves a
//! oneshot, and a 10-second wait force-closes the connection with a
//! synthesized timeout error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::frame::{FRAME_HEADER_SIZE, FrameCrypto, TAG_SIZE, peek_frame, trial_decrypt_first_frame};
use super::parser::{DataStreamDict, DataStreamValue, decode_payload, encode_payload};
use super::server::DataStreamServer;
use super::session::SessionKeys;
use super::{HdsError, names, status};

/// How long a request waits for its response
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handler for one `(protocol, topic)` key
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Answer a request; `Err` becomes the response status
    async fn handle_request(
        &self,
        connection: &DataStreamHandle,
        message: DataStreamDict,
    ) -> Result<DataStreamDict, i64>;

    /// Consume an event
    async fn handle_event(&self, connection: &DataStreamHandle, message: DataStreamDict);
}

pub(crate) type HandlerMap = HashMap<(String, String), Arc<dyn ProtocolHandler>>;
type PendingMap = HashMap<i64, oneshot::Sender<(i64, DataStreamDict)>>;

enum Outgoing {
    Message(DataStreamDict, DataStreamDict),
    ForceClose,
}

/// Cheap, cloneable handle to a running connection
#[derive(Clone)]
pub struct DataStreamHandle {
    id: u64,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    pending: Arc<Mutex<PendingMap>>,
    local_handlers: Arc<Mutex<HandlerMap>>,
}

impl DataStreamHandle {
    /// Connection id within the data-stream server
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Register a connection-local handler; shadows any global one for
    /// the same `(protocol, topic)` key.
    pub fn register_handler(
        &self,
        protocol: &str,
        topic: &str,
        handler: Arc<dyn ProtocolHandler>,
    ) {
        self.local_handlers
            .lock()
            .expect("handler lock")
            .insert((protocol.to_string(), topic.to_string()), handler);
    }

    /// Send an event message
    ///
    /// # Errors
    ///
    /// Returns [`HdsError::ConnectionClosed`] if the connection is gone.
    pub fn send_event(
        &self,
        protocol: &str,
        topic: &str,
        message: DataStreamDict,
    ) -> Result<(), HdsError> {
        let mut header = DataStreamDict::new();
        header.insert("protocol".to_string(), protocol.into());
        header.insert("event".to_string(), topic.into());
        self.outgoing_tx
            .send(Outgoing::Message(header, message))
            .map_err(|_| HdsError::ConnectionClosed)
    }

    /// Send a request and wait for the matching response.
    ///
    /// Returns `(status, message)` from the response header and body.
    ///
    /// # Errors
    ///
    /// [`HdsError::ResponseTimeout`] after 10 s (the connection is then
    /// force-closed), or [`HdsError::ConnectionClosed`].
    pub async fn send_request(
        &self,
        protocol: &str,
        topic: &str,
        message: DataStreamDict,
    ) -> Result<(i64, DataStreamDict), HdsError> {
        let (id, rx) = {
            let mut pending = self.pending.lock().expect("pending lock");
            // Random id, collision-checked against outstanding requests.
            let mut id = i64::from(rand::random::<u32>());
            while pending.contains_key(&id) {
                id = i64::from(rand::random::<u32>());
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(id, tx);
            (id, rx)
        };

        let mut header = DataStreamDict::new();
        header.insert("protocol".to_string(), protocol.into());
        header.insert("request".to_string(), topic.into());
        header.insert("id".to_string(), id.into());

        if self
            .outgoing_tx
            .send(Outgoing::Message(header, message))
            .is_err()
        {
            self.pending.lock().expect("pending lock").remove(&id);
            return Err(HdsError::ConnectionClosed);
        }

        match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(HdsError::ConnectionClosed),
            Err(_) => {
                warn!(connection = self.id, id, "request timed out, closing connection");
                self.pending.lock().expect("pending lock").remove(&id);
                let _ = self.outgoing_tx.send(Outgoing::ForceClose);
                Err(HdsError::ResponseTimeout)
            }
        }
    }

    /// Close the connection
    pub fn close(&self) {
        let _ = self.outgoing_tx.send(Outgoing::ForceClose);
    }

    fn send_response(
        &self,
        protocol: &str,
        topic: &str,
        id: i64,
        response_status: i64,
        message: DataStreamDict,
    ) {
        let mut header = DataStreamDict::new();
        header.insert("protocol".to_string(), protocol.into());
        header.insert("response".to_string(), topic.into());
        header.insert("id".to_string(), id.into());
        header.insert("status".to_string(), response_status.into());
        let _ = self.outgoing_tx.send(Outgoing::Message(header, message));
    }
}

enum MessageState {
    ExpectingHello,
    Ready,
}

/// Drive one accepted data-stream connection to completion.
pub(crate) async fn run_connection(
    id: u64,
    mut stream: TcpStream,
    peer: SocketAddr,
    server: Arc<DataStreamServer>,
) {
    let mut buffer = BytesMut::with_capacity(4096);

    // UNIDENTIFIED: collect the first complete frame and try it against
    // every pending prepared session.
    let identified = identify(&mut stream, &mut buffer, &server).await;
    let Some((keys, first_payload)) = identified else {
        debug!(id, %peer, "unidentifiable data-stream connection, dropping");
        let _ = stream.shutdown().await;
        return;
    };

    let Ok(mut crypto) = FrameCrypto::with_decrypt_counter(&keys, 1) else {
        let _ = stream.shutdown().await;
        return;
    };

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel();
    let handle = DataStreamHandle {
        id,
        outgoing_tx,
        pending: Arc::new(Mutex::new(PendingMap::new())),
        local_handlers: Arc::new(Mutex::new(HandlerMap::new())),
    };
    let mut state = MessageState::ExpectingHello;

    debug!(id, %peer, "data-stream connection identified");

    // The identification frame is also the first logical message.
    if let Err(err) = handle_payload(&first_payload, &mut state, &handle, &server).await {
        debug!(id, "first message rejected: {err}");
        let _ = stream.shutdown().await;
        return;
    }

    loop {
        tokio::select! {
            read = stream.read_buf(&mut buffer) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(id, "read error: {err}");
                        break;
                    }
                }
                let result = async {
                    while let Some(payload) = crypto.decode_frame(&mut buffer)? {
                        handle_payload(&payload, &mut state, &handle, &server).await?;
                    }
                    Ok::<(), HdsError>(())
                }
                .await;
                if let Err(err) = result {
                    warn!(id, "data-stream connection fatal: {err}");
                    break;
                }
            }
            outgoing = outgoing_rx.recv() => {
                match outgoing {
                    Some(Outgoing::Message(header, message)) => {
                        match encode_payload(&header, &message)
                            .map_err(HdsError::from)
                            .and_then(|payload| crypto.encode_frame(&payload))
                        {
                            Ok(frame) => {
                                if stream.write_all(&frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(id, "failed to send message: {err}");
                            }
                        }
                    }
                    Some(Outgoing::ForceClose) | None => break,
                }
            }
        }
    }

    let _ = stream.shutdown().await;
    // Outstanding requests resolve as ConnectionClosed when their
    // oneshot senders drop here.
    handle.pending.lock().expect("pending lock").clear();
    debug!(id, %peer, "data-stream connection closed");
}

/// Read until one complete frame is buffered, then trial-decrypt it
/// against every pending session.
async fn identify(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    server: &DataStreamServer,
) -> Option<(SessionKeys, Vec<u8>)> {
    loop {
        match peek_frame(buffer) {
            Err(_) => return None,
            Ok(Some((header, payload_len)))
                if buffer.len() >= FRAME_HEADER_SIZE + payload_len + TAG_SIZE =>
            {
                let ciphertext =
                    &buffer[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload_len + TAG_SIZE];
                let matched = server.take_matching_session(|keys| {
                    trial_decrypt_first_frame(&header, ciphertext, keys)
                });
                let consumed = FRAME_HEADER_SIZE + payload_len + TAG_SIZE;
                return match matched {
                    Some((keys, payload)) => {
                        let _ = buffer.split_to(consumed);
                        Some((keys, payload))
                    }
                    // Unidentifiable within one read cycle: drop it.
                    None => None,
                };
            }
            Ok(_) => {}
        }

        match stream.read_buf(buffer).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Decode and dispatch one logical message.
async fn handle_payload(
    payload: &[u8],
    state: &mut MessageState,
    handle: &DataStreamHandle,
    server: &DataStreamServer,
) -> Result<(), HdsError> {
    let (header, message) = decode_payload(payload)?;

    let Some(protocol) = header.get("protocol").and_then(DataStreamValue::as_str) else {
        return Err(HdsError::ProtocolViolation("header missing protocol".into()));
    };
    let protocol = protocol.to_string();

    let request_topic = header.get("request").and_then(DataStreamValue::as_str);
    let response_topic = header.get("response").and_then(DataStreamValue::as_str);
    let event_topic = header.get("event").and_then(DataStreamValue::as_str);

    // Exactly one of event / request / response.
    let shape_count =
        usize::from(request_topic.is_some()) + usize::from(response_topic.is_some())
            + usize::from(event_topic.is_some());
    if shape_count != 1 {
        return Err(HdsError::ProtocolViolation(
            "header must carry exactly one of event, request, response".into(),
        ));
    }

    if let Some(topic) = request_topic {
        let topic = topic.to_string();
        let Some(id) = header.get("id").and_then(DataStreamValue::as_int) else {
            return Err(HdsError::ProtocolViolation("request without id".into()));
        };

        if matches!(state, MessageState::ExpectingHello) {
            if protocol != names::CONTROL || topic != names::HELLO {
                return Err(HdsError::ProtocolViolation(format!(
                    "expected control.hello, got {protocol}.{topic}"
                )));
            }
            handle.send_response(&protocol, &topic, id, status::SUCCESS, DataStreamDict::new());
            *state = MessageState::Ready;
            server.notify_connected(handle.clone());
            return Ok(());
        }

        match server.find_handler(&handle.local_handlers, &protocol, &topic) {
            Some(handler) => {
                let (response_status, response) =
                    match handler.handle_request(handle, message).await {
                        Ok(response) => (status::SUCCESS, response),
                        Err(error_status) => (error_status, DataStreamDict::new()),
                    };
                handle.send_response(&protocol, &topic, id, response_status, response);
            }
            None => {
                debug!("no handler for {protocol}.{topic}");
                handle.send_response(
                    &protocol,
                    &topic,
                    id,
                    status::MISSING_PROTOCOL,
                    DataStreamDict::new(),
                );
            }
        }
        return Ok(());
    }

    if let Some(topic) = response_topic {
        let Some(id) = header.get("id").and_then(DataStreamValue::as_int) else {
            return Err(HdsError::ProtocolViolation("response without id".into()));
        };
        let response_status = header
            .get("status")
            .and_then(DataStreamValue::as_int)
            .unwrap_or(status::HEADER_ERROR);

        let waiter = handle.pending.lock().expect("pending lock").remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send((response_status, message));
            }
            None => {
                debug!("unmatched response for {protocol}.{topic} id {id}");
            }
        }
        return Ok(());
    }

    if let Some(topic) = event_topic {
        if matches!(state, MessageState::ExpectingHello) {
            return Err(HdsError::ProtocolViolation(
                "event before control.hello".into(),
            ));
        }
        if let Some(handler) = server.find_handler(&handle.local_handlers, &protocol, topic) {
            handler.handle_event(handle, message).await;
        } else {
            debug!("unhandled event {protocol}.{topic}");
        }
    }

    Ok(())
}
