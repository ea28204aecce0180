use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use wire::Capability;

/// Smoothing factor for the per-node latency EMA.
pub const LATENCY_ALPHA: f64 = 0.1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    Unknown,
    Starting,
    Active,
    Error,
}

/// Utilisation fractions in `[0, 1]`, as advertised by the worker.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct NodeLoad {
    pub cpu: f64,
    pub memory: f64,
    pub gpu: f64,
    pub disk: f64,
}

#[derive(Clone, Debug, Default)]
pub struct NodeStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub latency_ema_ms: f64,
    pub last_request: Option<Instant>,
}

impl NodeStats {
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }

    pub fn record(&mut self, latency_ms: f64, ok: bool) {
        self.total_requests += 1;
        if ok {
            self.successful_requests += 1;
            if self.successful_requests == 1 {
                self.latency_ema_ms = latency_ms;
            } else {
                self.latency_ema_ms = LATENCY_ALPHA * latency_ms +
                                      (1.0 - LATENCY_ALPHA) * self.latency_ema_ms;
            }
        } else {
            self.failed_requests += 1;
        }
        self.last_request = Some(Instant::now());
    }
}

/// A known worker.
///
/// Nodes are created by discovery on first sighting and mutated only
/// through the registry. Cloned snapshots share the live `connections`
/// counter, so balancing decisions see dispatcher increments without
/// taking the registry lock.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub addr: SocketAddr,
    pub status: NodeStatus,
    pub last_seen: Instant,
    pub capabilities: Vec<Capability>,
    pub tasks: Vec<String>,
    pub weight: f32,
    pub load: Option<NodeLoad>,
    pub stats: NodeStats,
    pub meta: HashMap<String, String>,
    pub runtime: String,
    pub model_ids: Vec<String>,
    pub version: String,

    connections: Arc<AtomicUsize>,
    supported: HashSet<String>,
}

impl Node {
    pub fn new(id: String, name: String, addr: SocketAddr) -> Node {
        Node {
            id: id,
            name: name,
            addr: addr,
            status: NodeStatus::Unknown,
            last_seen: Instant::now(),
            capabilities: Vec::new(),
            tasks: Vec::new(),
            weight: 1.0,
            load: None,
            stats: NodeStats::default(),
            meta: HashMap::new(),
            runtime: String::new(),
            model_ids: Vec::new(),
            version: String::new(),
            connections: Arc::new(AtomicUsize::new(0)),
            supported: HashSet::new(),
        }
    }

    /// True iff `task` is in `tasks` or in any capability's task list.
    pub fn supports(&self, task: &str) -> bool {
        self.supported.contains(task)
    }

    pub fn supported_tasks(&self) -> &HashSet<String> {
        &self.supported
    }

    pub fn set_tasks(&mut self, tasks: Vec<String>) {
        self.tasks = tasks;
        self.recompute_supported();
    }

    pub fn set_capabilities(&mut self, capabilities: Vec<Capability>) {
        self.capabilities = capabilities;
        self.recompute_supported();
    }

    /// Copies a successful capability probe into the node.
    pub fn apply_capability(&mut self, cap: Capability) {
        self.runtime = cap.runtime.clone();
        self.model_ids = cap.model_ids.clone();
        self.version = cap.version.clone();
        self.tasks = cap.task_names();
        self.capabilities = vec![cap];
        self.recompute_supported();
    }

    fn recompute_supported(&mut self) {
        let mut set = HashSet::new();
        for t in &self.tasks {
            set.insert(t.clone());
        }
        for cap in &self.capabilities {
            for t in &cap.tasks {
                set.insert(t.name.clone());
            }
        }
        self.supported = set;
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn incr_connections(&self) -> usize {
        self.connections.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decr_connections(&self) -> usize {
        let mut current = self.connections.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return 0;
            }
            match self.connections
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_seen) > timeout
    }
}
