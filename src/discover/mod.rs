//! Service discovery.
//!
//! A `Browser` performs one mDNS browse and yields the services it saw;
//! the packet layer behind it belongs to a collaborator. Discovery runs
//! two loops: a scan loop that upserts every sighted worker into the
//! registry and probes its capabilities over a short-lived connection,
//! and a cleanup loop that evicts nodes not seen within the node timeout.
//!
//! The scan itself is fallible network work, so each tick runs under an
//! exponential-backoff retry for transient failures, inside a circuit
//! breaker that backs off entirely after repeated broken scans.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use futures::{Async, Future, Poll, Sink, Stream, future};
use tokio_core::net::TcpStream;
use tokio_core::reactor::Handle;
use tokio_io::AsyncRead;
use tokio_timer::{Interval, Timer};

use Shutdown;
use config::DiscoveryConfig;
use error::Error;
use registry::{Node, NodeLoad, NodeRegistry};
use retry::{is_scan_transient, with_deadline, Backoff, Breaker, Retry};
use wire::{ClientCodec, ClientEnvelope, WorkerEnvelope};

const SCAN_DEADLINE: Duration = Duration::from_secs(10);
const SCAN_ATTEMPTS: usize = 3;
const SCAN_CIRCUIT: &'static str = "discovery.scan";
const SCAN_FAILURE_THRESHOLD: usize = 5;
const SCAN_RESET_TIMEOUT: Duration = Duration::from_secs(120);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const PROBE_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_RPC_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_CORRELATION: &'static str = "cap-0";

/// One advertised service instance, as seen by a single browse.
#[derive(Clone, Debug, Default)]
pub struct ServiceEntry {
    pub instance: String,
    pub addrs: Vec<Ipv4Addr>,
    pub port: u16,
    pub txt: HashMap<String, String>,
}

/// The mDNS collaborator: one browse over a service type in a domain.
pub trait Browser {
    type Browse: Future<Item = Vec<ServiceEntry>, Error = io::Error>;
    fn browse(&self, service_type: &str, domain: &str) -> Self::Browse;
}

pub struct Discovery<B> {
    browser: B,
    config: DiscoveryConfig,
    registry: NodeRegistry,
    max_frame: usize,
    breaker: Breaker,
}

impl<B> Discovery<B>
    where B: Browser + Clone + 'static,
          B::Browse: 'static
{
    pub fn new(config: DiscoveryConfig,
               registry: NodeRegistry,
               browser: B,
               max_frame: usize)
               -> Discovery<B> {
        Discovery {
            browser: browser,
            config: config,
            registry: registry,
            max_frame: max_frame,
            breaker: Breaker::new(SCAN_FAILURE_THRESHOLD, SCAN_RESET_TIMEOUT),
        }
    }

    /// Spawns the scan and cleanup loops. Both stop when `shutdown`
    /// resolves. A disabled discovery section spawns nothing.
    pub fn spawn(self, handle: &Handle, timer: &Timer, shutdown: Shutdown) {
        if !self.config.enabled() {
            info!("discovery disabled");
            return;
        }

        let Discovery { browser, config, registry, max_frame, breaker } = self;

        info!("discovering {} in {} every {}s",
              config.service_type(),
              config.domain(),
              config.scan_interval().as_secs());

        let scans = Scans::new(browser,
                               timer.clone(),
                               config.service_type(),
                               config.domain(),
                               config.scan_interval(),
                               breaker);
        let scan_loop = {
            let registry = registry.clone();
            let handle2 = handle.clone();
            let timer = timer.clone();
            scans.for_each(move |result| {
                    match result {
                        Ok(entries) => {
                            sight(&registry, &handle2, &timer, max_frame, entries);
                        }
                        Err(e) => warn!("discovery scan failed: {}", e),
                    }
                    Ok(())
                })
                .map_err(|e| error!("discovery loop failed: {}", e))
        };
        handle.spawn(scan_loop.select2(shutdown.clone()).then(|_| Ok(())));

        let cleanup_loop = {
            let registry = registry.clone();
            timer.interval(CLEANUP_INTERVAL)
                .for_each(move |_| {
                    registry.remove_stale(Instant::now());
                    Ok(())
                })
                .map_err(|e| error!("cleanup loop failed: {}", e))
        };
        handle.spawn(cleanup_loop.select2(shutdown).then(|_| Ok(())));
    }
}

/// Upserts every candidate from a scan and probes it asynchronously.
fn sight(registry: &NodeRegistry,
         handle: &Handle,
         timer: &Timer,
         max_frame: usize,
         entries: Vec<ServiceEntry>) {
    trace!("scan yielded {} entries", entries.len());
    for entry in entries {
        for ip in &entry.addrs {
            let addr = SocketAddr::V4(SocketAddrV4::new(*ip, entry.port));
            let id = format!("{}@{}", entry.instance, addr);

            let mut node = Node::new(id.clone(), entry.instance.clone(), addr);
            node.meta = entry.txt.clone();
            if let Some(w) = entry.txt.get("weight").and_then(|s| s.parse().ok()) {
                node.weight = w;
            }
            node.load = load_of(&entry.txt);
            registry.upsert(node);

            handle.spawn(probe(handle, timer, registry, id, addr, max_frame));
        }
    }
}

/// Utilisation hints advertised over TXT records, when present.
fn load_of(txt: &HashMap<String, String>) -> Option<NodeLoad> {
    fn fraction(txt: &HashMap<String, String>, key: &str) -> Option<f64> {
        txt.get(key)
            .and_then(|s| s.parse::<f64>().ok())
            .map(|v| v.max(0.0).min(1.0))
    }

    let cpu = fraction(txt, "cpu");
    let memory = fraction(txt, "memory");
    let gpu = fraction(txt, "gpu");
    let disk = fraction(txt, "disk");
    if cpu.is_none() && memory.is_none() && gpu.is_none() && disk.is_none() {
        return None;
    }
    Some(NodeLoad {
        cpu: cpu.unwrap_or(0.0),
        memory: memory.unwrap_or(0.0),
        gpu: gpu.unwrap_or(0.0),
        disk: disk.unwrap_or(0.0),
    })
}

/// Fetches a candidate's capabilities over a short-lived connection and
/// records the outcome in the registry.
fn probe(handle: &Handle,
         timer: &Timer,
         registry: &NodeRegistry,
         id: String,
         addr: SocketAddr,
         max_frame: usize)
         -> Box<Future<Item = (), Error = ()>> {
    trace!("probing {}", id);
    let dial = TcpStream::connect(&addr, handle).map_err(|e| Error::Connect(format!("{}", e)));
    let dial = with_deadline(timer, PROBE_DIAL_TIMEOUT, "capability dial", dial);

    let rpc = dial.and_then(move |tcp| {
        let framed = tcp.framed(ClientCodec::new(max_frame));
        framed.send(ClientEnvelope::Capabilities {
                correlation_id: PROBE_CORRELATION.into(),
            })
            .map_err(Error::from)
            .and_then(|framed| framed.into_future().map_err(|(e, _)| Error::from(e)))
            .and_then(|(reply, _framed)| match reply {
                Some(WorkerEnvelope::Capabilities { capability, .. }) => Ok(capability),
                Some(WorkerEnvelope::Error { message, .. }) => Err(Error::Internal(message)),
                Some(other) => {
                    Err(Error::Protocol(format!("unexpected capability reply: {:?}", other)))
                }
                None => Err(Error::Stream("closed before capability reply".into())),
            })
    });
    let rpc = with_deadline(timer, PROBE_RPC_TIMEOUT, "capability reply", rpc);

    let registry = registry.clone();
    Box::new(rpc.then(move |outcome| {
        registry.apply_probe(&id, outcome.map_err(|e| format!("{}", e)));
        Ok(())
    }))
}

/// A stream of scan outcomes: one browse per interval tick, each wrapped
/// in retry and admitted through the circuit breaker.
struct Scans<B> {
    browser: B,
    timer: Timer,
    service_type: String,
    domain: String,
    breaker: Breaker,
    state: Option<State>,
}

enum State {
    Pending(Box<Future<Item = Vec<ServiceEntry>, Error = Error>>, Interval),
    Waiting(Interval),
}

impl<B> Scans<B>
    where B: Browser + Clone + 'static,
          B::Browse: 'static
{
    fn new(browser: B,
           timer: Timer,
           service_type: String,
           domain: String,
           period: Duration,
           breaker: Breaker)
           -> Scans<B> {
        let interval = timer.interval(period);
        let mut scans = Scans {
            browser: browser,
            timer: timer,
            service_type: service_type,
            domain: domain,
            breaker: breaker,
            state: None,
        };
        scans.state = Some(State::Pending(scans.tick(), interval));
        scans
    }

    fn tick(&self) -> Box<Future<Item = Vec<ServiceEntry>, Error = Error>> {
        if !self.breaker.admit(SCAN_CIRCUIT) {
            return Box::new(future::err(Error::Internal("discovery scan circuit open".into())));
        }

        let browser = self.browser.clone();
        let timer = self.timer.clone();
        let service_type = self.service_type.clone();
        let domain = self.domain.clone();
        let attempt = Retry::new(&self.timer,
                                 Backoff {
                                     max_attempts: SCAN_ATTEMPTS,
                                     ..Backoff::default()
                                 },
                                 is_scan_transient,
                                 move || {
            let browse = browser.browse(&service_type, &domain)
                .map_err(|e| Error::Internal(format!("mdns browse: {}", e)));
            with_deadline(&timer, SCAN_DEADLINE, "mdns scan", browse)
        });

        let breaker = self.breaker.clone();
        Box::new(attempt.then(move |res| {
            match res {
                Ok(entries) => {
                    breaker.record_success(SCAN_CIRCUIT);
                    Ok(entries)
                }
                Err(e) => {
                    breaker.record_failure(SCAN_CIRCUIT);
                    Err(e)
                }
            }
        }))
    }
}

impl<B> Stream for Scans<B>
    where B: Browser + Clone + 'static,
          B::Browse: 'static
{
    type Item = Result<Vec<ServiceEntry>, Error>;
    type Error = Error;

    fn poll(&mut self) -> Poll<Option<Self::Item>, Error> {
        loop {
            match self.state.take().expect("polled after completion") {
                State::Waiting(mut interval) => {
                    match interval.poll() {
                        Err(e) => {
                            self.state = Some(State::Waiting(interval));
                            return Err(Error::from(e));
                        }
                        Ok(Async::NotReady) => {
                            self.state = Some(State::Waiting(interval));
                            return Ok(Async::NotReady);
                        }
                        Ok(Async::Ready(_)) => {
                            let scan = self.tick();
                            self.state = Some(State::Pending(scan, interval));
                        }
                    }
                }
                State::Pending(mut scan, interval) => {
                    match scan.poll() {
                        Err(e) => {
                            self.state = Some(State::Waiting(interval));
                            return Ok(Async::Ready(Some(Err(e))));
                        }
                        Ok(Async::Ready(entries)) => {
                            self.state = Some(State::Waiting(interval));
                            return Ok(Async::Ready(Some(Ok(entries))));
                        }
                        Ok(Async::NotReady) => {
                            self.state = Some(State::Pending(scan, interval));
                            return Ok(Async::NotReady);
                        }
                    }
                }
            }
        }
    }
}
