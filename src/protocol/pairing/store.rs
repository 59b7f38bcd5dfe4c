//! Controller key store — the persistence collaborator behind pairing
//!
//! The engine never touches disk; whoever constructs the server supplies
//! an implementation. [`MemoryControllerStore`] backs the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use super::error_code;

/// One paired controller
#[derive(Debug, Clone)]
pub struct ControllerEntry {
    /// Controller pairing identifier
    pub pairing_id: String,
    /// Controller long-term Ed25519 public key
    pub ltpk: [u8; 32],
    /// Permission bits ([`super::PERMISSION_ADMIN`])
    pub permissions: u8,
}

/// Store-side failures, mapped onto pairing error TLVs by the caller
#[derive(Debug, Error)]
pub enum StoreError {
    /// No capacity for further pairings
    #[error("maximum number of pairings reached")]
    MaxPeers,

    /// The referenced pairing does not exist
    #[error("unknown pairing: {0}")]
    UnknownPairing(String),

    /// A pairing exists under this id with a different public key
    #[error("pairing id collision for {0}")]
    KeyMismatch(String),

    /// Backend failure
    #[error("store failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// The pairing error TLV code this failure maps to
    #[must_use]
    pub fn error_code(&self) -> u8 {
        match self {
            Self::MaxPeers => error_code::MAX_PEERS,
            Self::KeyMismatch(_) => error_code::UNKNOWN,
            Self::UnknownPairing(_) | Self::Backend(_) => error_code::UNKNOWN,
        }
    }
}

/// Persistence interface for paired controllers
#[async_trait]
pub trait ControllerStore: Send + Sync {
    /// Whether at least one controller is paired
    async fn paired(&self) -> bool;

    /// Look up a controller's long-term public key
    async fn controller_ltpk(&self, pairing_id: &str) -> Option<[u8; 32]>;

    /// Look up a controller's permission bits
    async fn controller_permissions(&self, pairing_id: &str) -> Option<u8>;

    /// Persist a new controller (or update permissions of an identical one)
    async fn add_controller(&self, entry: ControllerEntry) -> Result<(), StoreError>;

    /// Remove a controller
    async fn remove_controller(&self, pairing_id: &str) -> Result<(), StoreError>;

    /// Enumerate all paired controllers
    async fn list_controllers(&self) -> Vec<ControllerEntry>;
}

/// In-memory store used by tests and examples
#[derive(Default)]
pub struct MemoryControllerStore {
    controllers: RwLock<HashMap<String, ControllerEntry>>,
}

impl MemoryControllerStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ControllerStore for MemoryControllerStore {
    async fn paired(&self) -> bool {
        !self.controllers.read().await.is_empty()
    }

    async fn controller_ltpk(&self, pairing_id: &str) -> Option<[u8; 32]> {
        self.controllers.read().await.get(pairing_id).map(|e| e.ltpk)
    }

    async fn controller_permissions(&self, pairing_id: &str) -> Option<u8> {
        self.controllers
            .read()
            .await
            .get(pairing_id)
            .map(|e| e.permissions)
    }

    async fn add_controller(&self, entry: ControllerEntry) -> Result<(), StoreError> {
        let mut controllers = self.controllers.write().await;
        if let Some(existing) = controllers.get(&entry.pairing_id) {
            if existing.ltpk != entry.ltpk {
                return Err(StoreError::KeyMismatch(entry.pairing_id));
            }
        }
        controllers.insert(entry.pairing_id.clone(), entry);
        Ok(())
    }

    async fn remove_controller(&self, pairing_id: &str) -> Result<(), StoreError> {
        self.controllers
            .write()
            .await
            .remove(pairing_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::UnknownPairing(pairing_id.to_string()))
    }

    async fn list_controllers(&self) -> Vec<ControllerEntry> {
        self.controllers.read().await.values().cloned().collect()
    }
}
