//! The shared data-stream listener
//!
//! One instance serves every session of an accessory bridge. The TCP
//! listener starts lazily on the first prepared session and is torn down
//! once the last connection and the last pending session are gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::connection::{HandlerMap, ProtocolHandler, run_connection};
use super::session::{PREPARED_SESSION_TTL, PreparedSession, SessionKeys};
use super::HdsError;

/// What the HAP layer reports back to the controller after preparing a
/// session (via the transport-setup characteristic exchange).
pub struct PreparedSessionInfo {
    /// Identifier of the prepared session
    pub session_id: u64,
    /// Port the shared listener is bound to
    pub port: u16,
    /// The accessory's freshly generated key salt
    pub accessory_salt: [u8; 32],
}

struct ListenerState {
    port: u16,
    shutdown: mpsc::Sender<()>,
}

#[derive(Default)]
struct Inner {
    pending: Vec<PreparedSession>,
    listener: Option<ListenerState>,
    connections: usize,
}

/// Data-stream server: pending sessions, listener lifecycle, global
/// handler registry
#[derive(Default)]
pub struct DataStreamServer {
    inner: Mutex<Inner>,
    global_handlers: Mutex<HandlerMap>,
    connected_tx: Mutex<Option<mpsc::UnboundedSender<super::connection::DataStreamHandle>>>,
    next_session_id: AtomicU64,
    next_connection_id: AtomicU64,
}

impl DataStreamServer {
    /// Create a server; wrap in `Arc` to share with the HAP layer
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Receive the handle of every connection that completes its
    /// `control.hello`; integrators use these to register connection-local
    /// handlers and to send requests and events.
    pub fn subscribe_connections(
        &self,
    ) -> mpsc::UnboundedReceiver<super::connection::DataStreamHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.connected_tx.lock().expect("connected lock") = Some(tx);
        rx
    }

    pub(crate) fn notify_connected(&self, handle: super::connection::DataStreamHandle) {
        if let Some(tx) = self.connected_tx.lock().expect("connected lock").as_ref() {
            let _ = tx.send(handle);
        }
    }

    /// Register a global fallback handler for `(protocol, topic)`.
    /// Connection-local registrations take priority over these.
    pub fn register_handler(
        &self,
        protocol: &str,
        topic: &str,
        handler: Arc<dyn ProtocolHandler>,
    ) {
        self.global_handlers
            .lock()
            .expect("handler lock")
            .insert((protocol.to_string(), topic.to_string()), handler);
    }

    /// Prepare a session for an authenticated HAP connection.
    ///
    /// Derives direction keys from the connection's pair-verify shared
    /// secret and both salts, starts the listener if needed, and arms the
    /// 10-second expiry.
    ///
    /// # Errors
    ///
    /// Returns [`HdsError`] if key derivation or the listener bind fails.
    pub async fn prepare_session(
        self: &Arc<Self>,
        shared_secret: &[u8],
        controller_salt: &[u8; 32],
    ) -> Result<PreparedSessionInfo, HdsError> {
        let mut accessory_salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut accessory_salt);

        let keys = SessionKeys::derive(shared_secret, controller_salt, &accessory_salt)?;
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        let port = self.ensure_listener().await?;

        self.inner
            .lock()
            .expect("hds inner lock")
            .pending
            .push(PreparedSession::new(session_id, keys));
        debug!(session_id, port, "data-stream session prepared");

        // Expiry: an unclaimed session is discarded after its window.
        let server = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PREPARED_SESSION_TTL).await;
            server.expire_session(session_id);
        });

        Ok(PreparedSessionInfo {
            session_id,
            port,
            accessory_salt,
        })
    }

    /// Number of sessions still waiting for their connection
    #[must_use]
    pub fn pending_sessions(&self) -> usize {
        self.inner.lock().expect("hds inner lock").pending.len()
    }

    /// Port of the running listener, if any
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.inner
            .lock()
            .expect("hds inner lock")
            .listener
            .as_ref()
            .map(|l| l.port)
    }

    async fn ensure_listener(self: &Arc<Self>) -> Result<u16, HdsError> {
        if let Some(port) = self.port() {
            return Ok(port);
        }

        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        {
            let mut inner = self.inner.lock().expect("hds inner lock");
            if let Some(existing) = inner.listener.as_ref() {
                // Raced with another prepare; keep the existing listener.
                return Ok(existing.port);
            }
            inner.listener = Some(ListenerState {
                port,
                shutdown: shutdown_tx,
            });
        }

        info!(port, "data-stream listener started");
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                let id = server
                                    .next_connection_id
                                    .fetch_add(1, Ordering::Relaxed);
                                server.inner.lock().expect("hds inner lock").connections += 1;
                                debug!(id, %peer, "data-stream connection accepted");
                                let server = server.clone();
                                tokio::spawn(async move {
                                    run_connection(id, stream, peer, server.clone()).await;
                                    server.connection_closed();
                                });
                            }
                            Err(err) => {
                                error!("data-stream accept error: {err}");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("data-stream listener stopped");
        });

        Ok(port)
    }

    /// Run the trial decryption against every pending, unexpired session;
    /// the first hit claims the session.
    pub(crate) fn take_matching_session<F>(&self, try_decrypt: F) -> Option<(SessionKeys, Vec<u8>)>
    where
        F: Fn(&SessionKeys) -> Option<Vec<u8>>,
    {
        let mut inner = self.inner.lock().expect("hds inner lock");
        inner.pending.retain(|session| !session.expired());

        let mut matched = None;
        for (index, session) in inner.pending.iter().enumerate() {
            if let Some(payload) = try_decrypt(&session.keys) {
                matched = Some((index, payload));
                break;
            }
        }
        let (index, payload) = matched?;
        let session = inner.pending.remove(index);
        Some((session.keys, payload))
    }

    /// Local registrations shadow global ones.
    pub(crate) fn find_handler(
        &self,
        local: &Arc<Mutex<HandlerMap>>,
        protocol: &str,
        topic: &str,
    ) -> Option<Arc<dyn ProtocolHandler>> {
        let key = (protocol.to_string(), topic.to_string());
        if let Some(handler) = local.lock().expect("handler lock").get(&key) {
            return Some(handler.clone());
        }
        self.global_handlers
            .lock()
            .expect("handler lock")
            .get(&key)
            .cloned()
    }

    fn expire_session(&self, session_id: u64) {
        {
            let mut inner = self.inner.lock().expect("hds inner lock");
            let before = inner.pending.len();
            inner.pending.retain(|s| s.id != session_id && !s.expired());
            if inner.pending.len() < before {
                debug!(session_id, "prepared data-stream session expired");
            }
        }
        self.maybe_teardown();
    }

    pub(crate) fn connection_closed(&self) {
        {
            let mut inner = self.inner.lock().expect("hds inner lock");
            inner.connections = inner.connections.saturating_sub(1);
        }
        self.maybe_teardown();
    }

    /// Stop the listener once nothing is pending and nothing is open.
    fn maybe_teardown(&self) {
        let shutdown = {
            let mut inner = self.inner.lock().expect("hds inner lock");
            if inner.pending.is_empty() && inner.connections == 0 {
                inner.listener.take().map(|l| l.shutdown)
            } else {
                None
            }
        };
        if let Some(shutdown) = shutdown {
            debug!("tearing down idle data-stream listener");
            let _ = shutdown.try_send(());
        }
    }
}
