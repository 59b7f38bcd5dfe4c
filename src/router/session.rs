//! Per-connection HAP session state consumed by the router

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::protocol::pairing::{PairSetup, PairVerify};

/// Mutable per-connection state: pairing scratch machines, the verified
/// username, event subscriptions and armed timed writes.
pub struct ConnectionSession {
    /// Pair-setup handshake scratch state
    pub pair_setup: PairSetup,
    /// Pair-verify handshake scratch state
    pub pair_verify: PairVerify,
    /// Verified controller pairing id, set at pair-verify completion
    pub username: Option<String>,
    /// Subscribed event keys
    pub subscriptions: HashSet<(u64, u64)>,
    /// Armed timed-write tokens and their deadlines
    pub timed_writes: HashMap<u64, Instant>,
}

impl ConnectionSession {
    /// Fresh state for a newly accepted connection
    #[must_use]
    pub fn new() -> Self {
        Self {
            pair_setup: PairSetup::new(),
            pair_verify: PairVerify::new(),
            username: None,
            subscriptions: HashSet::new(),
            timed_writes: HashMap::new(),
        }
    }

    /// Whether pair-verify has completed on this connection
    #[must_use]
    pub fn authenticated(&self) -> bool {
        self.username.is_some()
    }
}

impl Default for ConnectionSession {
    fn default() -> Self {
        Self::new()
    }
}
