//! Node selection.
//!
//! The balancer holds a candidate list refreshed from registry change
//! notifications and delegates the actual pick to a configured strategy.
//! A hit in the selection cache short-circuits everything; the cache is
//! advisory, so a cached node may no longer be healthy by the time the
//! dispatcher uses it and retry is what restores correctness.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use futures::{Future, Stream};
use tokio_core::reactor::Handle;
use tokio_timer::Timer;

mod cache;
pub mod strategy;

pub use self::cache::SelectionCache;
pub use self::strategy::{Strategy, by_name, task_fit};

use Shutdown;
use config::LoadBalancerConfig;
use error::Error;
use registry::{Node, NodeRegistry, NodeStatus};

/// A live health probe injected by the dispatcher, so the balancer's
/// health loop can use real RPCs instead of recorded status alone.
pub type HealthProbe = Box<Fn(&Node) -> Box<Future<Item = bool, Error = ()>>>;

#[derive(Clone, Debug, Default)]
pub struct BalancerStats {
    pub selections: u64,
    pub cache_hits: u64,
    pub failures: u64,
}

#[derive(Clone)]
pub struct LoadBalancer {
    inner: Rc<RefCell<Inner>>,
    cache: SelectionCache,
    config: LoadBalancerConfig,
}

struct Inner {
    strategy: Box<Strategy>,
    candidates: Vec<Node>,
    stats: BalancerStats,
    probe: Option<HealthProbe>,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig) -> Result<LoadBalancer, Error> {
        let strategy = strategy::by_name(&config.strategy())?;
        info!("balancing with {} (cache {})",
              strategy.name(),
              if config.cache_enabled() { "on" } else { "off" });
        Ok(LoadBalancer {
            inner: Rc::new(RefCell::new(Inner {
                strategy: strategy,
                candidates: Vec::new(),
                stats: BalancerStats::default(),
                probe: None,
            })),
            cache: SelectionCache::new(config.cache_ttl()),
            config: config,
        })
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    pub fn stats(&self) -> BalancerStats {
        self.inner.borrow().stats.clone()
    }

    pub fn candidates(&self) -> Vec<Node> {
        self.inner.borrow().candidates.clone()
    }

    /// Replaces the candidate list; called with each registry snapshot.
    pub fn update(&self, nodes: Vec<Node>) {
        trace!("balancer sees {} nodes", nodes.len());
        self.inner.borrow_mut().candidates = nodes;
    }

    /// Installs the live health probe used by the health loop.
    pub fn set_health_probe(&self, probe: HealthProbe) {
        self.inner.borrow_mut().probe = Some(probe);
    }

    /// Picks a node for a task.
    pub fn select_node(&self, task: &str) -> Result<Node, Error> {
        let mut inner = self.inner.borrow_mut();

        if self.config.cache_enabled() {
            if let Some(node_id) = self.cache.get(task) {
                if let Some(node) = inner.candidates.iter().find(|n| n.id == node_id) {
                    trace!("cache hit: {} -> {}", task, node_id);
                    let node = node.clone();
                    inner.stats.cache_hits += 1;
                    inner.stats.selections += 1;
                    return Ok(node);
                }
            }
        }

        let picked = {
            let health_check = self.config.health_check();
            let eligible: Vec<Node> = inner.candidates
                .iter()
                .filter(|n| n.status == NodeStatus::Active && n.supports(task))
                .filter(|n| !(health_check && n.status == NodeStatus::Error))
                .cloned()
                .collect();
            if eligible.is_empty() {
                None
            } else {
                inner.strategy.select(&eligible, task).map(|idx| eligible[idx].clone())
            }
        };

        match picked {
            Some(node) => {
                debug!("selected {} for {}", node.id, task);
                if self.config.cache_enabled() {
                    self.cache.put(task, &node.id);
                }
                inner.stats.selections += 1;
                Ok(node)
            }
            None => {
                inner.stats.failures += 1;
                Err(Error::NoCandidates(task.to_owned()))
            }
        }
    }

    /// Spawns the registry subscription, the cache sweep, and (when
    /// enabled and a probe is installed) the health loop.
    pub fn spawn(&self,
                 registry: &NodeRegistry,
                 handle: &Handle,
                 timer: &Timer,
                 shutdown: Shutdown) {
        let updates = registry.subscribe();
        let balancer = self.clone();
        let follow = updates.for_each(move |nodes| {
            balancer.update(nodes);
            Ok(())
        });
        handle.spawn(follow.select2(shutdown.clone()).then(|_| Ok(())));

        if self.config.cache_enabled() {
            let sweep_every = half(self.cache.ttl());
            let cache = self.cache.clone();
            let sweep = timer.interval(sweep_every)
                .for_each(move |_| {
                    cache.clear();
                    Ok(())
                })
                .map_err(|e| error!("cache sweep failed: {}", e));
            handle.spawn(sweep.select2(shutdown.clone()).then(|_| Ok(())));
        }

        if self.config.health_check() {
            let balancer = self.clone();
            let registry = registry.clone();
            let handle2 = handle.clone();
            let checks = timer.interval(self.config.check_interval())
                .for_each(move |_| {
                    balancer.check_candidates(&registry, &handle2);
                    Ok(())
                })
                .map_err(|e| error!("balancer health loop failed: {}", e));
            handle.spawn(checks.select2(shutdown).then(|_| Ok(())));
        }
    }

    /// One health round: probe every candidate and flip its registry
    /// status on the outcome.
    fn check_candidates(&self, registry: &NodeRegistry, handle: &Handle) {
        let inner = self.inner.borrow();
        let probe = match inner.probe {
            Some(ref probe) => probe,
            None => return,
        };
        for node in &inner.candidates {
            if node.status != NodeStatus::Active && node.status != NodeStatus::Error {
                continue;
            }
            let registry = registry.clone();
            let id = node.id.clone();
            handle.spawn(probe(node).then(move |res| {
                match res {
                    Ok(true) => registry.set_status(&id, NodeStatus::Active),
                    _ => registry.set_status(&id, NodeStatus::Error),
                }
                Ok(())
            }));
        }
    }
}

fn half(d: Duration) -> Duration {
    Duration::from_millis((d.as_secs() * 1_000 + (d.subsec_nanos() / 1_000_000) as u64) / 2)
}
