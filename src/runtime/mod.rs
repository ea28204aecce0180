//! Runtime lifecycle.
//!
//! `Runtime::start` wires every subsystem onto a caller-owned reactor —
//! the composition the tests drive directly. `Client::initialize` is the
//! process-wide surface for collaborators such as the HTTP façade: it
//! owns a dedicated reactor thread and a cloneable handle that submits
//! operations over a channel and resolves their replies off-thread.

use std::io;
use std::sync::mpsc as sync_mpsc;
use std::thread;
use std::time::{Duration, Instant};

use futures::{Async, Future, Poll, Sink, Stream, future};
use futures::sync::{mpsc, oneshot};
use tokio_core::reactor::{Core, Handle};
use tokio_timer::Timer;

use Shutdown;
use balance::{BalancerStats, LoadBalancer};
use config::ClientConfig;
use discover::{Browser, Discovery};
use dispatch::{Dispatcher, InferOptions, InferRequest, InferResponse};
use error::Error;
use metrics::{MetricsCore, MetricsSnapshot};
use pool::{ConnectionPool, PoolStats};
use registry::{Node, NodeRegistry};
use wire::ResponseFrame;

const TASK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Every subsystem, wired and running on one reactor.
pub struct Runtime {
    pub registry: NodeRegistry,
    pub balancer: LoadBalancer,
    pub pool: ConnectionPool,
    pub metrics: MetricsCore,
    pub dispatcher: Dispatcher,
    timer: Timer,
}

impl Runtime {
    /// Builds the registry, balancer, pool, metrics, and dispatcher, and
    /// spawns their background loops bound to `shutdown`.
    pub fn start<B>(config: &ClientConfig,
                    browser: B,
                    handle: &Handle,
                    timer: &Timer,
                    shutdown: Shutdown)
                    -> Result<Runtime, Error>
        where B: Browser + Clone + 'static,
              B::Browse: 'static
    {
        let discovery_cfg = config.discovery();
        let registry = NodeRegistry::new(discovery_cfg.max_nodes(), discovery_cfg.node_timeout());
        let metrics = MetricsCore::new();
        let balancer = LoadBalancer::new(config.load_balancer())?;
        let pool = ConnectionPool::new(config.pool(), &config.connection(), handle, timer);
        let dispatcher = Dispatcher::new(registry.clone(),
                                         balancer.clone(),
                                         pool.clone(),
                                         metrics.clone(),
                                         config.chunk(),
                                         config.load_balancer().default_timeout(),
                                         handle,
                                         timer);

        balancer.set_health_probe(dispatcher.health_probe());
        balancer.spawn(&registry, handle, timer, shutdown.clone());
        pool.spawn(&registry, shutdown.clone());
        metrics.spawn(&registry, handle, timer, shutdown.clone());

        let discovery = Discovery::new(discovery_cfg,
                                       registry.clone(),
                                       browser,
                                       config.connection().max_message_size());
        discovery.spawn(handle, timer, shutdown);

        Ok(Runtime {
            registry: registry,
            balancer: balancer,
            pool: pool,
            metrics: metrics,
            dispatcher: dispatcher,
            timer: timer.clone(),
        })
    }
}

enum Op {
    Infer(InferRequest, oneshot::Sender<Result<InferResponse, Error>>),
    InferWithRetry(InferRequest, InferOptions, oneshot::Sender<Result<InferResponse, Error>>),
    InferStream(InferRequest, mpsc::UnboundedSender<Result<ResponseFrame, Error>>),
    Nodes(oneshot::Sender<Vec<Node>>),
    Metrics(oneshot::Sender<MetricsSnapshot>),
    PoolStats(oneshot::Sender<PoolStats>),
    BalancerStats(oneshot::Sender<BalancerStats>),
    WaitForTask(String, Duration, oneshot::Sender<bool>),
}

/// Serves handle operations on the runtime's reactor. Each operation is
/// spawned on its own task so a slow inference never blocks the queue.
fn drive_ops(runtime: Runtime,
             ops: mpsc::UnboundedReceiver<Op>,
             handle: Handle)
             -> Box<Future<Item = (), Error = ()>> {
    Box::new(ops.for_each(move |op| {
        match op {
            Op::Infer(request, reply) => {
                let fut = runtime.dispatcher.infer(request);
                handle.spawn(fut.then(move |res| {
                    let _ = reply.send(res);
                    Ok(())
                }));
            }
            Op::InferWithRetry(request, opts, reply) => {
                let fut = runtime.dispatcher.infer_with_retry(request, opts);
                handle.spawn(fut.then(move |res| {
                    let _ = reply.send(res);
                    Ok(())
                }));
            }
            Op::InferStream(request, frames) => {
                let out = runtime.dispatcher
                    .infer_stream(request)
                    .then(|res| Ok(res))
                    .forward(frames.sink_map_err(|_| ()))
                    .map(|_| ());
                handle.spawn(out);
            }
            Op::Nodes(reply) => {
                let _ = reply.send(runtime.registry.snapshot());
            }
            Op::Metrics(reply) => {
                let _ = reply.send(runtime.metrics.snapshot());
            }
            Op::PoolStats(reply) => {
                let _ = reply.send(runtime.pool.stats());
            }
            Op::BalancerStats(reply) => {
                let _ = reply.send(runtime.balancer.stats());
            }
            Op::WaitForTask(task, wait, reply) => {
                let dispatcher = runtime.dispatcher.clone();
                let timer = runtime.timer.clone();
                let deadline = Instant::now() + wait;
                let poll = future::loop_fn(reply, move |reply| {
                    if dispatcher.task_available(&task) {
                        let out: Box<Future<Item = _, Error = ()>> =
                            Box::new(future::ok(future::Loop::Break((reply, true))));
                        return out;
                    }
                    if Instant::now() + TASK_POLL_INTERVAL > deadline {
                        return Box::new(future::ok(future::Loop::Break((reply, false))));
                    }
                    Box::new(timer.sleep(TASK_POLL_INTERVAL)
                        .map_err(|_| ())
                        .map(move |_| future::Loop::Continue(reply)))
                });
                handle.spawn(poll.map(|(reply, available)| {
                    let _ = reply.send(available);
                }));
            }
        }
        Ok(())
    }))
}

/// A reply delivered from the runtime thread.
pub struct Reply<T>(oneshot::Receiver<T>);

impl<T> Future for Reply<T> {
    type Item = T;
    type Error = Error;

    fn poll(&mut self) -> Poll<T, Error> {
        match self.0.poll() {
            Ok(Async::Ready(v)) => Ok(Async::Ready(v)),
            Ok(Async::NotReady) => Ok(Async::NotReady),
            Err(_) => Err(Error::Internal("runtime stopped".into())),
        }
    }
}

/// An inference outcome delivered from the runtime thread.
pub struct InferFuture(oneshot::Receiver<Result<InferResponse, Error>>);

impl Future for InferFuture {
    type Item = InferResponse;
    type Error = Error;

    fn poll(&mut self) -> Poll<InferResponse, Error> {
        match self.0.poll() {
            Ok(Async::Ready(Ok(response))) => Ok(Async::Ready(response)),
            Ok(Async::Ready(Err(e))) => Err(e),
            Ok(Async::NotReady) => Ok(Async::NotReady),
            Err(_) => Err(Error::Internal("runtime stopped".into())),
        }
    }
}

/// Response frames delivered from the runtime thread.
pub struct InferFrames(mpsc::UnboundedReceiver<Result<ResponseFrame, Error>>);

impl Stream for InferFrames {
    type Item = ResponseFrame;
    type Error = Error;

    fn poll(&mut self) -> Poll<Option<ResponseFrame>, Error> {
        match self.0.poll() {
            Ok(Async::Ready(Some(Ok(frame)))) => Ok(Async::Ready(Some(frame))),
            Ok(Async::Ready(Some(Err(e)))) => Err(e),
            Ok(Async::Ready(None)) => Ok(Async::Ready(None)),
            Ok(Async::NotReady) => Ok(Async::NotReady),
            Err(_) => Err(Error::Internal("runtime stopped".into())),
        }
    }
}

/// The process-wide client handle.
///
/// One `initialize` per process lifecycle; `close` tears the runtime
/// down. Operations may be submitted from any thread and resolve on
/// futures delivered back from the runtime's reactor.
pub struct Client {
    ops: mpsc::UnboundedSender<Op>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Client {
    /// Spawns the runtime reactor thread and wires every subsystem.
    /// `mk_browser` builds the mDNS collaborator on the runtime thread.
    pub fn initialize<B, F>(config: ClientConfig, mk_browser: F) -> io::Result<Client>
        where F: FnOnce(&Handle) -> B + Send + 'static,
              B: Browser + Clone + 'static,
              B::Browse: 'static
    {
        let (ops_tx, ops_rx) = mpsc::unbounded();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = sync_mpsc::channel::<io::Result<()>>();

        let thread = thread::Builder::new().name("lumen-mesh".into())
            .spawn(move || {
                let mut core = match Core::new() {
                    Ok(core) => core,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let handle = core.handle();
                let timer = Timer::default();
                let shutdown: Shutdown = shutdown_rx.shared();
                let browser = mk_browser(&handle);

                let runtime =
                    match Runtime::start(&config, browser, &handle, &timer, shutdown.clone()) {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            let _ = ready_tx.send(Err(io::Error::new(io::ErrorKind::Other, e)));
                            return;
                        }
                    };
                let _ = ready_tx.send(Ok(()));

                let driver = drive_ops(runtime, ops_rx, handle.clone());
                drop(core.run(driver.select2(shutdown).then(|_| Ok(()) as Result<(), ()>)));
                info!("runtime stopped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                Ok(Client {
                    ops: ops_tx,
                    shutdown: Some(shutdown_tx),
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                drop(thread.join());
                Err(e)
            }
            Err(_) => {
                drop(thread.join());
                Err(io::Error::new(io::ErrorKind::Other, "runtime thread died during startup"))
            }
        }
    }

    pub fn infer(&self, request: InferRequest) -> InferFuture {
        let (tx, rx) = oneshot::channel();
        let _ = self.ops.unbounded_send(Op::Infer(request, tx));
        InferFuture(rx)
    }

    pub fn infer_with_retry(&self, request: InferRequest, opts: InferOptions) -> InferFuture {
        let (tx, rx) = oneshot::channel();
        let _ = self.ops.unbounded_send(Op::InferWithRetry(request, opts, tx));
        InferFuture(rx)
    }

    pub fn infer_stream(&self, request: InferRequest) -> InferFrames {
        let (tx, rx) = mpsc::unbounded();
        let _ = self.ops.unbounded_send(Op::InferStream(request, tx));
        InferFrames(rx)
    }

    pub fn nodes(&self) -> Reply<Vec<Node>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.ops.unbounded_send(Op::Nodes(tx));
        Reply(rx)
    }

    pub fn metrics(&self) -> Reply<MetricsSnapshot> {
        let (tx, rx) = oneshot::channel();
        let _ = self.ops.unbounded_send(Op::Metrics(tx));
        Reply(rx)
    }

    pub fn pool_stats(&self) -> Reply<PoolStats> {
        let (tx, rx) = oneshot::channel();
        let _ = self.ops.unbounded_send(Op::PoolStats(tx));
        Reply(rx)
    }

    pub fn balancer_stats(&self) -> Reply<BalancerStats> {
        let (tx, rx) = oneshot::channel();
        let _ = self.ops.unbounded_send(Op::BalancerStats(tx));
        Reply(rx)
    }

    /// Resolves to true once some active node advertises the task, or
    /// false when `wait` elapses first.
    pub fn wait_for_task(&self, task: &str, wait: Duration) -> Reply<bool> {
        let (tx, rx) = oneshot::channel();
        let _ = self.ops.unbounded_send(Op::WaitForTask(task.to_owned(), wait, tx));
        Reply(rx)
    }

    /// Stops every background loop and joins the runtime thread.
    pub fn close(mut self) {
        self.shutdown_runtime();
    }

    fn shutdown_runtime(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            drop(thread.join());
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown_runtime();
    }
}
