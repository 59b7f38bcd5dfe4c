//! HAP server: TCP accept loop, connection registry, idle reaping
//!
//! The server owns connections in an id-indexed table; connections refer
//! back only by id. Characteristic-change events fan out through
//! per-connection command channels and are filtered against each
//! connection's own subscription set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::HapError;
use crate::protocol::pairing::{AccessoryIdentity, PairAttemptCounter};
use crate::router::{AccessoryDelegate, RouterContext};
use crate::protocol::pairing::store::ControllerStore;

use super::connection::{ConnectionCommand, run_connection};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, usually `0.0.0.0`
    pub bind_address: String,
    /// Port to listen on; 0 picks an ephemeral port
    pub port: u16,
    /// Setup pincode, e.g. `031-45-154`
    pub pincode: String,
    /// Serve protected routes without pair-verify (test/dev mode)
    pub allow_insecure: bool,
    /// Close connections idle longer than this during a sweep
    pub idle_timeout: Duration,
    /// Only sweep once this many connections exist
    pub idle_sweep_threshold: usize,
    /// How often the idle sweep runs
    pub idle_sweep_interval: Duration,
    /// Event coalescing delay for non-immediate characteristic events
    pub event_coalesce_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 0,
            pincode: "031-45-154".to_string(),
            allow_insecure: false,
            idle_timeout: Duration::from_secs(3600),
            idle_sweep_threshold: 16,
            idle_sweep_interval: Duration::from_secs(60),
            event_coalesce_delay: Duration::from_millis(250),
        }
    }
}

/// Lifecycle events observers can subscribe to
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Listener is up
    Started {
        /// Bound port
        port: u16,
    },
    /// A controller connected
    ClientConnected {
        /// Peer address
        address: SocketAddr,
    },
    /// A controller connection closed
    ClientDisconnected {
        /// Peer address
        address: SocketAddr,
    },
    /// Pair-verify completed on a connection
    SessionVerified {
        /// The verified controller
        pairing_id: String,
    },
    /// Listener shut down
    Stopped,
}

/// Connection identifier within the registry
pub type ConnectionId = u64;

/// State a connection publishes for the server to read
pub struct ConnectionShared {
    /// Verified username, set at pair-verify completion
    pub username: Option<String>,
    /// Pair-verify shared secret, kept for data-stream session setup
    pub shared_secret: Option<[u8; 32]>,
    /// Last socket activity, for idle reaping
    pub last_active: Instant,
}

struct ConnectionHandle {
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    shared: Arc<Mutex<ConnectionShared>>,
}

/// Id-indexed connection table
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    fn insert(
        &self,
        command_tx: mpsc::UnboundedSender<ConnectionCommand>,
        shared: Arc<Mutex<ConnectionShared>>,
    ) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .expect("registry lock")
            .insert(id, ConnectionHandle { command_tx, shared });
        id
    }

    pub(crate) fn remove(&self, id: ConnectionId) {
        self.connections.lock().expect("registry lock").remove(&id);
    }

    /// Number of live connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.lock().expect("registry lock").len()
    }

    /// Whether no connections exist
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fan an event out to every connection except the originator.
    pub(crate) fn broadcast_event(&self, event: &CharacteristicEvent, origin: Option<ConnectionId>) {
        let connections = self.connections.lock().expect("registry lock");
        for (&id, handle) in connections.iter() {
            if Some(id) == origin {
                continue;
            }
            let _ = handle
                .command_tx
                .send(ConnectionCommand::Event(event.clone()));
        }
    }

    /// Tear down every connection authenticated as `username`. The
    /// issuing connection (if among them) is skipped and must finish its
    /// in-flight response before closing; returns whether it was.
    pub(crate) fn teardown_username(&self, username: &str, issuer: ConnectionId) -> bool {
        let connections = self.connections.lock().expect("registry lock");
        let mut issuer_affected = false;
        for (&id, handle) in connections.iter() {
            let matches = handle
                .shared
                .lock()
                .expect("connection shared lock")
                .username
                .as_deref()
                == Some(username);
            if !matches {
                continue;
            }
            if id == issuer {
                issuer_affected = true;
            } else {
                debug!(id, username, "tearing down connection of removed pairing");
                let _ = handle
                    .command_tx
                    .send(ConnectionCommand::Teardown { graceful: false });
            }
        }
        issuer_affected
    }

    /// Close connections idle beyond `timeout`, but only when at least
    /// `threshold` connections exist.
    fn reap_idle(&self, threshold: usize, timeout: Duration) {
        let connections = self.connections.lock().expect("registry lock");
        if connections.len() < threshold {
            return;
        }
        let now = Instant::now();
        for (&id, handle) in connections.iter() {
            let idle = now
                .duration_since(handle.shared.lock().expect("connection shared lock").last_active);
            if idle > timeout {
                warn!(id, idle_secs = idle.as_secs(), "reaping idle connection");
                let _ = handle
                    .command_tx
                    .send(ConnectionCommand::Teardown { graceful: false });
            }
        }
    }

    /// Pair-verify shared secret of a connection, if established
    #[must_use]
    pub fn session_secret(&self, id: ConnectionId) -> Option<[u8; 32]> {
        self.connections
            .lock()
            .expect("registry lock")
            .get(&id)?
            .shared
            .lock()
            .expect("connection shared lock")
            .shared_secret
    }
}

/// A queued characteristic-change notification
#[derive(Debug, Clone)]
pub struct CharacteristicEvent {
    /// Accessory instance id
    pub aid: u64,
    /// Characteristic instance id
    pub iid: u64,
    /// The new value
    pub value: Value,
    /// Deliver without the coalescing delay
    pub immediate: bool,
}

/// Shared state for the whole server; one per accessory
pub struct ServerContext {
    /// Server configuration
    pub config: ServerConfig,
    /// Router state (identity, collaborators, pairing counters)
    pub router: RouterContext,
    /// Connection table
    pub registry: ConnectionRegistry,
    /// Lifecycle event channel
    pub events: broadcast::Sender<ServerEvent>,
}

/// The accessory-side HAP server
pub struct HapServer {
    context: Arc<ServerContext>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl HapServer {
    /// Create a server from its configuration and collaborators
    #[must_use]
    pub fn new(
        config: ServerConfig,
        identity: AccessoryIdentity,
        store: Arc<dyn ControllerStore>,
        delegate: Arc<dyn AccessoryDelegate>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let router = RouterContext {
            identity,
            store,
            delegate,
            attempts: PairAttemptCounter::new(),
            setup_slot: Arc::new(AtomicBool::new(false)),
            pincode: config.pincode.clone(),
            allow_insecure: config.allow_insecure,
        };
        Self {
            context: Arc::new(ServerContext {
                config,
                router,
                registry: ConnectionRegistry::default(),
                events,
            }),
            shutdown_tx: None,
            local_addr: None,
        }
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.context.events.subscribe()
    }

    /// Shared context (registry access for integrators)
    #[must_use]
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Bound address once started
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`HapError::Io`] if the listener cannot bind.
    pub async fn start(&mut self) -> Result<SocketAddr, HapError> {
        let listener = TcpListener::bind((
            self.context.config.bind_address.as_str(),
            self.context.config.port,
        ))
        .await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let context = self.context.clone();
        let _ = context.events.send(ServerEvent::Started {
            port: local_addr.port(),
        });
        info!(%local_addr, "HAP server listening");

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(context.config.idle_sweep_interval);
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                Self::spawn_connection(&context, stream, peer);
                            }
                            Err(err) => {
                                error!("accept error: {err}");
                            }
                        }
                    }
                    _ = sweep.tick() => {
                        context.registry.reap_idle(
                            context.config.idle_sweep_threshold,
                            context.config.idle_timeout,
                        );
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
            let _ = context.events.send(ServerEvent::Stopped);
            info!("HAP server stopped");
        });

        Ok(local_addr)
    }

    fn spawn_connection(context: &Arc<ServerContext>, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(ConnectionShared {
            username: None,
            shared_secret: None,
            last_active: Instant::now(),
        }));
        let id = context.registry.insert(command_tx, shared.clone());
        let _ = context.events.send(ServerEvent::ClientConnected { address: peer });
        debug!(id, %peer, "connection accepted");

        let context = context.clone();
        tokio::spawn(async move {
            if let Err(err) = run_connection(id, stream, peer, &context, command_rx, shared).await {
                debug!(id, "connection ended with error: {err}");
            }
            context.registry.remove(id);
            let _ = context
                .events
                .send(ServerEvent::ClientDisconnected { address: peer });
            debug!(id, %peer, "connection closed");
        });
    }

    /// Queue a characteristic-change event for every subscribed
    /// connection, except `origin` (the connection that caused the
    /// change, which already knows).
    pub fn publish_event(&self, event: CharacteristicEvent, origin: Option<ConnectionId>) {
        self.context.registry.broadcast_event(&event, origin);
    }

    /// Stop accepting and shut the listener down
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}
