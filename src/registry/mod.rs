//! The in-memory registry of known workers.
//!
//! A single readers-writer lock guards the node map. Change notifications
//! are snapshots pushed into unbounded subscriber channels: senders never
//! block, and each subscriber drains on its own task, treating every
//! message as the current state rather than a delta.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::sync::mpsc;

mod node;

pub use self::node::{Node, NodeLoad, NodeStats, NodeStatus, LATENCY_ALPHA};

use wire::Capability;

#[derive(Clone)]
pub struct NodeRegistry {
    inner: Arc<RwLock<Inner>>,
    max_nodes: usize,
    node_timeout: Duration,
}

struct Inner {
    nodes: HashMap<String, Node>,
    subscribers: Vec<mpsc::UnboundedSender<Vec<Node>>>,
}

impl NodeRegistry {
    pub fn new(max_nodes: usize, node_timeout: Duration) -> NodeRegistry {
        NodeRegistry {
            inner: Arc::new(RwLock::new(Inner {
                nodes: HashMap::new(),
                subscribers: Vec::new(),
            })),
            max_nodes: max_nodes,
            node_timeout: node_timeout,
        }
    }

    pub fn node_timeout(&self) -> Duration {
        self.node_timeout
    }

    /// A stable copy of the current node set.
    pub fn snapshot(&self) -> Vec<Node> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.nodes.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Node> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.nodes.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(active, total)` node counts.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read().expect("registry lock poisoned");
        let active = inner.nodes.values().filter(|n| n.status == NodeStatus::Active).count();
        (active, inner.nodes.len())
    }

    /// Inserts a sighted node or merges it into an existing entry.
    ///
    /// Address, name, weight, and metadata are always overwritten and
    /// `last_seen` is bumped; status is left alone for known nodes so a
    /// re-sighted erroring node stays in error until a probe clears it.
    /// New nodes beyond `max_nodes` are dropped with a warning.
    pub fn upsert(&self, candidate: Node) {
        {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            let known = inner.nodes.contains_key(&candidate.id);
            if !known && inner.nodes.len() >= self.max_nodes {
                warn!("registry full ({} nodes), dropping {}",
                      self.max_nodes,
                      candidate.id);
                return;
            }
            if known {
                if let Some(existing) = inner.nodes.get_mut(&candidate.id) {
                    existing.addr = candidate.addr;
                    existing.name = candidate.name;
                    existing.weight = candidate.weight;
                    existing.meta = candidate.meta;
                    if candidate.load.is_some() {
                        existing.load = candidate.load;
                    }
                    existing.last_seen = Instant::now();
                }
            } else {
                let mut node = candidate;
                node.status = NodeStatus::Starting;
                node.last_seen = Instant::now();
                info!("discovered {} at {}", node.id, node.addr);
                inner.nodes.insert(node.id.clone(), node);
            }
        }
        self.notify();
    }

    /// Applies the outcome of a capability probe.
    pub fn apply_probe(&self, id: &str, outcome: Result<Capability, String>) {
        {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            let node = match inner.nodes.get_mut(id) {
                Some(n) => n,
                None => return,
            };
            match outcome {
                Ok(cap) => {
                    debug!("{} capabilities: runtime={} tasks={:?}",
                           id,
                           cap.runtime,
                           cap.task_names());
                    node.apply_capability(cap);
                    node.status = NodeStatus::Active;
                    node.last_seen = Instant::now();
                }
                Err(msg) => {
                    warn!("capability probe failed for {}: {}", id, msg);
                    node.status = NodeStatus::Error;
                }
            }
        }
        self.notify();
    }

    pub fn set_status(&self, id: &str, status: NodeStatus) {
        let changed = {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            match inner.nodes.get_mut(id) {
                Some(node) if node.status != status => {
                    debug!("{}: {:?} -> {:?}", id, node.status, status);
                    node.status = status;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notify();
        }
    }

    /// Records one finished request against a node.
    pub fn record_request(&self, id: &str, latency_ms: f64, ok: bool) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(node) = inner.nodes.get_mut(id) {
            node.stats.record(latency_ms, ok);
        }
    }

    /// Drops nodes not seen within the node timeout. Emits one change
    /// notification if anything was removed.
    pub fn remove_stale(&self, now: Instant) -> usize {
        let removed = {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            let timeout = self.node_timeout;
            let stale: Vec<String> = inner.nodes
                .values()
                .filter(|n| n.is_stale(now, timeout))
                .map(|n| n.id.clone())
                .collect();
            for id in &stale {
                info!("removing stale node {}", id);
                inner.nodes.remove(id);
            }
            stale.len()
        };
        if removed > 0 {
            self.notify();
        }
        removed
    }

    /// Registers a change listener. Every registry change pushes a full
    /// snapshot into the channel; if any nodes already exist, the current
    /// snapshot is delivered immediately.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<Node>> {
        let (tx, rx) = mpsc::unbounded();
        let snapshot = {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            inner.subscribers.push(tx.clone());
            inner.nodes.values().cloned().collect::<Vec<Node>>()
        };
        if !snapshot.is_empty() {
            let _ = tx.unbounded_send(snapshot);
        }
        rx
    }

    fn notify(&self) {
        // Snapshot and sender list are taken under the lock; sends happen
        // outside it and never block.
        let (snapshot, senders) = {
            let inner = self.inner.read().expect("registry lock poisoned");
            let snapshot: Vec<Node> = inner.nodes.values().cloned().collect();
            (snapshot, inner.subscribers.clone())
        };
        let mut dead = false;
        for tx in &senders {
            if tx.unbounded_send(snapshot.clone()).is_err() {
                dead = true;
            }
        }
        if dead {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            inner.subscribers.retain(|tx| !tx.is_closed());
        }
    }
}
