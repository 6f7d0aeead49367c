//! Peer (node) table.
//!
//! Nodes are keyed by mesh identity and created lazily on first reference —
//! never explicitly deleted. A node with a live multiplexer is usable for
//! forwarding without a fresh dial. The multiplexer slot is replaced
//! wholesale on each supersession; an epoch tag lets a finished session
//! clear only the muxer it installed, so a newer connection is never torn
//! down by an older one's cleanup.

use crate::mux::Muxer;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Reconnect backoff: starts at the minimum, doubles per consecutive
/// failure, capped; one success resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

pub const BACKOFF_MIN: Duration = Duration::from_secs(1);
pub const BACKOFF_MAX: Duration = Duration::from_secs(15 * 60);

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: BACKOFF_MIN,
        }
    }
}

impl Backoff {
    /// The delay to use for the next attempt; advances the sequence.
    pub fn next(&mut self) -> Duration {
        let d = self.current;
        self.current = (self.current * 2).min(BACKOFF_MAX);
        d
    }

    pub fn reset(&mut self) {
        self.current = BACKOFF_MIN;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[derive(Debug, Default)]
struct NodeState {
    addr: Option<String>,
    muxer: Option<Muxer>,
    backoff: Backoff,
    last_seen_ms: u64,
}

/// One peer record.
#[derive(Debug)]
pub struct Node {
    pub id: String,
    first_seen: Instant,
    state: Mutex<NodeState>,
}

impl Node {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            first_seen: Instant::now(),
            state: Mutex::new(NodeState::default()),
        }
    }

    pub fn addr(&self) -> Option<String> {
        self.state.lock().unwrap().addr.clone()
    }

    pub fn set_addr(&self, addr: &str) {
        self.state.lock().unwrap().addr = Some(addr.to_string());
    }

    /// The current live multiplexer, if any.
    pub fn muxer(&self) -> Option<Muxer> {
        self.state.lock().unwrap().muxer.clone()
    }

    /// Install a multiplexer, superseding any previous one wholesale. A
    /// session that lost the establishment race (older epoch) is ignored, so
    /// the table always holds the most recently established muxer.
    pub fn set_muxer(&self, mux: Muxer) {
        let mut state = self.state.lock().unwrap();
        match &state.muxer {
            Some(current) if current.epoch > mux.epoch => {
                debug!(node = %mgate_core::short_id(&self.id), stale = mux.epoch, current = current.epoch, "stale muxer ignored");
            }
            Some(old) => {
                debug!(node = %mgate_core::short_id(&self.id), old_epoch = old.epoch, new_epoch = mux.epoch, "muxer superseded");
                state.muxer = Some(mux);
            }
            None => state.muxer = Some(mux),
        }
    }

    /// Clear the multiplexer installed with `epoch`. A no-op when a newer
    /// session has already replaced it.
    pub fn clear_muxer(&self, epoch: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        match &state.muxer {
            Some(current) if current.epoch == epoch => {
                state.muxer = None;
                true
            }
            _ => false,
        }
    }

    /// Record activity from this peer.
    pub fn touch(&self) {
        self.state.lock().unwrap().last_seen_ms = self.first_seen.elapsed().as_millis() as u64;
    }

    /// Next reconnect delay (advances the backoff sequence).
    pub fn backoff_next(&self) -> Duration {
        self.state.lock().unwrap().backoff.next()
    }

    /// Reset backoff after a successful connection.
    pub fn backoff_reset(&self) {
        self.state.lock().unwrap().backoff.reset();
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.lock().unwrap();
        NodeSnapshot {
            id: self.id.clone(),
            addr: state.addr.clone(),
            has_muxer: state.muxer.is_some(),
            backoff_ms: state.backoff.current().as_millis() as u64,
            age_ms: self.first_seen.elapsed().as_millis() as u64,
            last_seen_ms: state.last_seen_ms,
        }
    }
}

/// Point-in-time copy of one node's state, for the debug surface.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub addr: Option<String>,
    pub has_muxer: bool,
    pub backoff_ms: u64,
    pub age_ms: u64,
    pub last_seen_ms: u64,
}

/// Concurrent map from identity to node record.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    epoch: AtomicU64,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.read().unwrap().get(id).cloned()
    }

    /// Look up a node, creating it on first reference.
    pub fn get_or_create(&self, id: &str) -> Arc<Node> {
        if let Some(n) = self.get(id) {
            return n;
        }
        let mut nodes = self.nodes.write().unwrap();
        nodes
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Node::new(id)))
            .clone()
    }

    /// Epoch for a newly established multiplexer.
    pub fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.nodes
            .read()
            .unwrap()
            .values()
            .map(|n| n.snapshot())
            .collect()
    }
}
