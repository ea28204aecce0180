//! The connection pool.
//!
//! Owns at most one `Channel` per node id. Channels are created lazily on
//! first use and on node activation, retired when unhealthy, and dropped
//! when their node leaves the registry. A maintenance loop sweeps idle
//! and expired channels; an optional per-channel health loop probes the
//! health RPC and marks failing channels.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use futures::{Future, Stream};
use tokio_core::reactor::Handle;
use tokio_timer::Timer;

mod channel;

pub use self::channel::{Channel, ChannelState, ChannelStatus, RpcReceiver, RpcSender};

use Shutdown;
use config::{ConnectionConfig, PoolConfig};
use registry::{NodeRegistry, NodeStatus};
use retry::with_deadline;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Deadline on one health RPC, shared with the balancer's live probes.
pub const HEALTH_RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoolStats {
    pub connected: usize,
    pub disconnected: usize,
    pub error: usize,
    pub total: usize,
}

#[derive(Clone)]
pub struct ConnectionPool {
    channels: Rc<RefCell<HashMap<String, Channel>>>,
    config: PoolConfig,
    keep_alive: bool,
    max_frame: usize,
    handle: Handle,
    timer: Timer,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig,
               connection: &ConnectionConfig,
               handle: &Handle,
               timer: &Timer)
               -> ConnectionPool {
        if !connection.insecure() {
            warn!("secure dials are not supported yet; connecting insecurely");
        }
        if connection.compression() {
            debug!("compression requested but not negotiated on this transport");
        }
        ConnectionPool {
            channels: Rc::new(RefCell::new(HashMap::new())),
            config: config,
            keep_alive: connection.keep_alive(),
            max_frame: connection.max_message_size(),
            handle: handle.clone(),
            timer: timer.clone(),
        }
    }

    /// Returns the node's channel, creating one iff none exists or the
    /// existing one is unhealthy or re-addressed. Idempotent.
    pub fn ensure(&self, node_id: &str, addr: SocketAddr) -> Channel {
        let now = Instant::now();
        let mut channels = self.channels.borrow_mut();

        if let Some(existing) = channels.get(node_id) {
            if existing.addr() == addr &&
               existing.is_healthy(now, self.config.max_idle(), self.config.max_lifetime()) {
                return existing.clone();
            }
            debug!("retiring channel to {}", node_id);
        }

        if !channels.contains_key(node_id) && channels.len() >= self.config.max_connections() {
            // Make room by dropping the least-recently-used channel.
            let lru = channels.iter()
                .min_by_key(|entry| entry.1.state().last_used)
                .map(|entry| entry.0.clone());
            if let Some(id) = lru {
                warn!("pool full ({} channels), evicting {}",
                      channels.len(),
                      id);
                channels.remove(&id);
            }
        }

        let channel = Channel::connect(node_id.to_owned(),
                                       addr,
                                       self.config.connection_ttl(),
                                       self.keep_alive,
                                       self.max_frame,
                                       &self.handle,
                                       &self.timer);
        channels.insert(node_id.to_owned(), channel.clone());
        channel
    }

    /// The channel for a node, with usage bookkeeping updated.
    pub fn acquire(&self, node_id: &str, addr: SocketAddr) -> Channel {
        let channel = self.ensure(node_id, addr);
        channel.touch();
        channel
    }

    /// Bookkeeping hook: the pool owns the channel, so releasing is a
    /// no-op beyond tracing. Callers must not reuse a released handle.
    pub fn release(&self, node_id: &str) {
        trace!("released channel to {}", node_id);
    }

    pub fn remove(&self, node_id: &str) {
        if self.channels.borrow_mut().remove(node_id).is_some() {
            debug!("dropped channel to {}", node_id);
        }
    }

    pub fn len(&self) -> usize {
        self.channels.borrow().len()
    }

    pub fn get(&self, node_id: &str) -> Option<Channel> {
        self.channels.borrow().get(node_id).cloned()
    }

    pub fn stats(&self) -> PoolStats {
        let channels = self.channels.borrow();
        let mut stats = PoolStats::default();
        for channel in channels.values() {
            match channel.status() {
                ChannelStatus::Connected => stats.connected += 1,
                ChannelStatus::Disconnected => stats.disconnected += 1,
                ChannelStatus::Error => stats.error += 1,
            }
        }
        stats.total = channels.len();
        stats
    }

    /// Evicts channels that are no longer healthy.
    fn sweep(&self) {
        let now = Instant::now();
        let mut channels = self.channels.borrow_mut();
        let max_idle = self.config.max_idle();
        let max_lifetime = self.config.max_lifetime();
        let dead: Vec<String> = channels.iter()
            .filter(|&(_, c)| !c.is_healthy(now, max_idle, max_lifetime))
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            debug!("evicting unhealthy channel to {}", id);
            channels.remove(&id);
        }
    }

    /// Spawns the maintenance sweep and, when enabled, the per-channel
    /// health loop. Also tracks the registry so channels follow node
    /// activation and departure.
    pub fn spawn(&self, registry: &NodeRegistry, shutdown: Shutdown) {
        let maintenance = {
            let pool = self.clone();
            self.timer
                .interval(MAINTENANCE_INTERVAL)
                .for_each(move |_| {
                    pool.sweep();
                    Ok(())
                })
                .map_err(|e| error!("pool maintenance failed: {}", e))
        };
        self.handle.spawn(maintenance.select2(shutdown.clone()).then(|_| Ok(())));

        if self.config.health_check() {
            let health = {
                let pool = self.clone();
                self.timer
                    .interval(self.config.health_interval())
                    .for_each(move |_| {
                        pool.check_health();
                        Ok(())
                    })
                    .map_err(|e| error!("pool health loop failed: {}", e))
            };
            self.handle.spawn(health.select2(shutdown.clone()).then(|_| Ok(())));
        }

        // Follow registry changes: warm channels for active nodes, drop
        // channels for departed ones.
        let updates = registry.subscribe();
        let pool = self.clone();
        let follow = updates.for_each(move |nodes| {
            {
                let known: Vec<String> = pool.channels.borrow().keys().cloned().collect();
                for id in known {
                    if !nodes.iter().any(|n| n.id == id) {
                        pool.remove(&id);
                    }
                }
            }
            for node in &nodes {
                if node.status == NodeStatus::Active {
                    pool.ensure(&node.id, node.addr);
                }
            }
            Ok(())
        });
        self.handle.spawn(follow.select2(shutdown).then(|_| Ok(())));
    }

    /// One round of health probes over connected channels.
    fn check_health(&self) {
        let channels: Vec<Channel> = self.channels
            .borrow()
            .values()
            .filter(|c| c.status() == ChannelStatus::Connected)
            .cloned()
            .collect();
        for channel in channels {
            let probe = with_deadline(&self.timer,
                                      HEALTH_RPC_TIMEOUT,
                                      "health reply",
                                      channel.health());
            let id = channel.node_id().to_owned();
            let failed = channel.clone();
            self.handle.spawn(probe.then(move |res| {
                match res {
                    Ok(()) => trace!("{} healthy", id),
                    Err(e) => {
                        warn!("health check failed for {}: {}", id, e);
                        failed.record_error();
                    }
                }
                Ok(())
            }));
        }
    }
}
