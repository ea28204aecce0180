//! Request metrics.
//!
//! One mutex-guarded core accumulates counters and a latency EMA as the
//! dispatcher reports request outcomes. A collector task refreshes the
//! registry-derived gauges every ten seconds and computes throughput from
//! the successes landed in that window. `snapshot` hands out a by-value
//! copy, so readers never hold the lock while formatting or serving it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{Future, Stream};
use tokio_core::reactor::Handle;
use tokio_timer::Timer;

use Shutdown;
use registry::{NodeRegistry, LATENCY_ALPHA};

const COLLECT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub latency_ema_ms: f64,
    pub error_rate: f64,
    pub throughput_qps: f64,
    pub active_nodes: usize,
    pub total_nodes: usize,
    pub last_updated: Option<Instant>,
}

struct Inner {
    snapshot: MetricsSnapshot,
    window_successes: u64,
}

#[derive(Clone)]
pub struct MetricsCore {
    inner: Arc<Mutex<Inner>>,
}

impl MetricsCore {
    pub fn new() -> MetricsCore {
        MetricsCore {
            inner: Arc::new(Mutex::new(Inner {
                snapshot: MetricsSnapshot::default(),
                window_successes: 0,
            })),
        }
    }

    /// Records one completed request.
    pub fn record_request(&self, latency_ms: f64, ok: bool) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        let snap = &mut inner.snapshot;
        snap.total_requests += 1;
        if ok {
            snap.successful_requests += 1;
            if snap.successful_requests == 1 {
                snap.latency_ema_ms = latency_ms;
            } else {
                snap.latency_ema_ms = LATENCY_ALPHA * latency_ms +
                                      (1.0 - LATENCY_ALPHA) * snap.latency_ema_ms;
            }
        } else {
            snap.failed_requests += 1;
        }
        snap.error_rate = snap.failed_requests as f64 / snap.total_requests as f64;
    }

    /// Records a request that failed before reaching a worker, so there
    /// is no latency sample to fold in.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        let snap = &mut inner.snapshot;
        snap.total_requests += 1;
        snap.failed_requests += 1;
        snap.error_rate = snap.failed_requests as f64 / snap.total_requests as f64;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().expect("metrics lock poisoned").snapshot.clone()
    }

    /// One collection pass: node gauges, error rate, and the per-window
    /// throughput estimate.
    fn collect(&self, registry: &NodeRegistry) {
        let (active, total) = registry.counts();
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        let window = {
            let successes = inner.snapshot.successful_requests;
            let landed = successes - inner.window_successes;
            inner.window_successes = successes;
            landed
        };
        let snap = &mut inner.snapshot;
        snap.active_nodes = active;
        snap.total_nodes = total;
        snap.throughput_qps = window as f64 / COLLECT_INTERVAL.as_secs() as f64;
        if snap.total_requests > 0 {
            snap.error_rate = snap.failed_requests as f64 / snap.total_requests as f64;
        }
        snap.last_updated = Some(Instant::now());
        trace!("metrics: {}/{} nodes active, {:.2} qps, {:.1}% errors",
               active,
               total,
               snap.throughput_qps,
               snap.error_rate * 100.0);
    }

    /// Spawns the periodic collector.
    pub fn spawn(&self,
                 registry: &NodeRegistry,
                 handle: &Handle,
                 timer: &Timer,
                 shutdown: Shutdown) {
        let metrics = self.clone();
        let registry = registry.clone();
        let collector = timer.interval(COLLECT_INTERVAL)
            .for_each(move |_| {
                metrics.collect(&registry);
                Ok(())
            })
            .map_err(|e| error!("metrics collector failed: {}", e));
        handle.spawn(collector.select2(shutdown).then(|_| Ok(())));
    }
}
