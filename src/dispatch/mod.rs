//! Request dispatch.
//!
//! `infer` binds a request to a node, drives the bidirectional stream
//! (one frame for small payloads, an ordered multi-frame send for chunked
//! payloads), and resolves to the single final response. `infer_stream`
//! forwards every response frame instead. `infer_with_retry` layers
//! exponential waiting and message-based retry classification on top.
//!
//! A chunked request runs as two cooperating halves: a spawned sender
//! task that writes frames in `seq` order and always half-closes, and the
//! receiver driven by the returned future. They are joined by a
//! cancellation signal and a latched sender error; when both halves fail,
//! the sender's error wins because it is causally earlier.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use futures::{Async, Future, Poll, Stream, future, stream};
use futures::future::Either;
use futures::sync::oneshot;
use tokio_core::reactor::Handle;
use tokio_timer::Timer;

use balance::{HealthProbe, LoadBalancer};
use chunk;
use config::ChunkConfig;
use error::Error;
use metrics::MetricsCore;
use pool::{Channel, ConnectionPool, RpcReceiver, RpcSender, HEALTH_RPC_TIMEOUT};
use registry::{Node, NodeRegistry, NodeStatus};
use retry::{is_retryable, with_deadline};
use wire::{RequestFrame, ResponseFrame, WorkerEnvelope};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Default)]
pub struct InferRequest {
    pub task: String,
    pub payload: Vec<u8>,
    pub payload_mime: String,
    pub meta: HashMap<String, String>,
}

impl InferRequest {
    pub fn new(task: &str, payload: Vec<u8>, payload_mime: &str) -> InferRequest {
        InferRequest {
            task: task.to_owned(),
            payload: payload,
            payload_mime: payload_mime.to_owned(),
            meta: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InferResponse {
    pub node_id: String,
    pub result: Vec<u8>,
    pub result_mime: String,
}

#[derive(Clone, Debug)]
pub struct InferOptions {
    pub max_retries: Option<usize>,
    pub max_wait_time: Duration,
    pub retry_interval: Duration,
    pub wait_for_task: bool,
}

impl Default for InferOptions {
    fn default() -> InferOptions {
        InferOptions {
            max_retries: None,
            max_wait_time: DEFAULT_MAX_WAIT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            wait_for_task: false,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: NodeRegistry,
    balancer: LoadBalancer,
    pool: ConnectionPool,
    metrics: MetricsCore,
    chunk_cfg: ChunkConfig,
    request_timeout: Duration,
    handle: Handle,
    timer: Timer,
    correlations: Rc<Cell<u64>>,
}

impl Dispatcher {
    pub fn new(registry: NodeRegistry,
               balancer: LoadBalancer,
               pool: ConnectionPool,
               metrics: MetricsCore,
               chunk_cfg: ChunkConfig,
               request_timeout: Duration,
               handle: &Handle,
               timer: &Timer)
               -> Dispatcher {
        Dispatcher {
            registry: registry,
            balancer: balancer,
            pool: pool,
            metrics: metrics,
            chunk_cfg: chunk_cfg,
            request_timeout: request_timeout,
            handle: handle.clone(),
            timer: timer.clone(),
            correlations: Rc::new(Cell::new(0)),
        }
    }

    /// A live health probe over pooled channels, for the balancer's
    /// health loop.
    pub fn health_probe(&self) -> HealthProbe {
        let pool = self.pool.clone();
        let timer = self.timer.clone();
        Box::new(move |node: &Node| -> Box<Future<Item = bool, Error = ()>> {
            let channel = pool.ensure(&node.id, node.addr);
            let probe = with_deadline(&timer, HEALTH_RPC_TIMEOUT, "health reply", channel.health());
            Box::new(probe.then(|res| Ok(res.is_ok())))
        })
    }

    fn next_correlation(&self) -> String {
        let n = self.correlations.get();
        self.correlations.set(n + 1);
        format!("req-{}", n)
    }

    /// Splits a request into frames. `seq` counts from zero, `offset` is
    /// the running payload length, `total` is constant.
    fn frames(&self, correlation_id: &str, request: &InferRequest) -> Result<Vec<RequestFrame>, Error> {
        let chunks = chunk::chunk(&request.payload, &self.chunk_cfg)?;
        let total = chunks.len() as u64;
        let mut frames = Vec::with_capacity(chunks.len());
        let mut offset = 0u64;
        for (seq, piece) in chunks.into_iter().enumerate() {
            frames.push(RequestFrame {
                correlation_id: correlation_id.to_owned(),
                task: request.task.clone(),
                payload: piece.to_vec(),
                payload_mime: request.payload_mime.clone(),
                seq: seq as u64,
                total: total,
                offset: offset,
                meta: request.meta.clone(),
            });
            offset += piece.len() as u64;
        }
        Ok(frames)
    }

    /// Dispatches one inference and resolves to its final response.
    pub fn infer(&self, request: InferRequest) -> Box<Future<Item = InferResponse, Error = Error>> {
        let correlation_id = self.next_correlation();
        let frames = match self.frames(&correlation_id, &request) {
            Ok(frames) => frames,
            Err(e) => return Box::new(future::err(e)),
        };

        let node = match self.balancer.select_node(&request.task) {
            Ok(node) => node,
            Err(e) => {
                self.metrics.record_failure();
                return Box::new(future::err(e));
            }
        };

        let guard = DispatchGuard::enter(self, &node);
        let channel = self.pool.acquire(&node.id, node.addr);

        debug!("{}: {} frame(s) of {} to {}",
               correlation_id,
               frames.len(),
               request.task,
               node.id);

        let response = if frames.len() == 1 {
            let frame = frames.into_iter().next().expect("one frame");
            channel.unary_send(frame)
        } else {
            self.streaming_call(&channel, correlation_id, frames)
        };
        let response = with_deadline(&self.timer, self.request_timeout, "inference response", response);

        Box::new(response.then(move |res| match res {
            Ok(frame) => {
                let node_id = guard.complete(true);
                Ok(InferResponse {
                    node_id: node_id,
                    result: frame.result,
                    result_mime: frame.result_mime,
                })
            }
            Err(e) => {
                guard.complete(false);
                Err(e.context("inference failed"))
            }
        }))
    }

    /// Dispatches one inference and yields every response frame. The
    /// stream closes after the final frame, on end-of-stream, or on
    /// error; the node's connection slot is freed exactly once, also when
    /// the stream is abandoned early.
    pub fn infer_stream(&self,
                        request: InferRequest)
                        -> Box<Stream<Item = ResponseFrame, Error = Error>> {
        let correlation_id = self.next_correlation();
        let frames = match self.frames(&correlation_id, &request) {
            Ok(frames) => frames,
            Err(e) => return Box::new(stream::once(Err(e))),
        };

        let node = match self.balancer.select_node(&request.task) {
            Ok(node) => node,
            Err(e) => {
                self.metrics.record_failure();
                return Box::new(stream::once(Err(e)));
            }
        };

        let guard = DispatchGuard::enter(self, &node);
        let channel = self.pool.acquire(&node.id, node.addr);
        let (receiver, latched, failed, cancel) =
            self.send_frames(&channel, correlation_id, frames);

        Box::new(ResponseStream {
            receiver: receiver,
            latched: latched,
            failed: Some(failed),
            cancel: Some(cancel),
            guard: Some(guard),
            done: false,
        })
    }

    /// Starts the sender task for a one-or-many frame request. Returns
    /// the receive half, the sender's latched error, its failure signal,
    /// and the cancellation handle whose drop stops the sender.
    fn send_frames(&self,
                   channel: &Channel,
                   correlation_id: String,
                   frames: Vec<RequestFrame>)
                   -> (RpcReceiver,
                       Rc<RefCell<Option<Error>>>,
                       oneshot::Receiver<()>,
                       oneshot::Sender<()>) {
        let (sender, receiver) = channel.open_stream(correlation_id.clone());
        let latched: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));
        let (failed_tx, failed_rx) = oneshot::channel::<()>();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        let sends = stream::iter_ok::<_, Error>(frames)
            .fold(sender, |sender: RpcSender, frame| sender.send_frame(frame))
            .and_then(|sender| sender.close_send());

        let task = {
            let channel = channel.clone();
            let latched = latched.clone();
            sends.select2(cancel_rx).then(move |res| {
                match res {
                    Ok(Either::A(((), _))) => {}
                    Err(Either::A((e, _))) => {
                        warn!("{}: send failed: {}", correlation_id, e);
                        channel.record_error();
                        // Latch first: the receiver wakes on the signal
                        // and reads the latched cause.
                        *latched.borrow_mut() = Some(e);
                        channel.half_close(&correlation_id);
                        let _ = failed_tx.send(());
                    }
                    Ok(Either::B(((), _))) |
                    Err(Either::B((_, _))) => {
                        // The caller went away; stop sending but still
                        // half-close so the worker sees end-of-request.
                        trace!("{}: send cancelled", correlation_id);
                        channel.half_close(&correlation_id);
                    }
                }
                Ok(())
            })
        };
        self.handle.spawn(task);

        (receiver, latched, failed_rx, cancel_tx)
    }

    /// The chunked send path: spawned sender, receiver resolving to the
    /// final response with sender-first error attribution.
    fn streaming_call(&self,
                      channel: &Channel,
                      correlation_id: String,
                      frames: Vec<RequestFrame>)
                      -> Box<Future<Item = ResponseFrame, Error = Error>> {
        let (receiver, latched, failed_rx, cancel_tx) =
            self.send_frames(channel, correlation_id, frames);

        let attributed = latched.clone();
        Box::new(receiver.final_response().select2(failed_rx).then(move |res| {
            // Held for the future's lifetime: dropping the request future
            // before this point cancels the sender task.
            drop(cancel_tx);
            let outcome: Box<Future<Item = ResponseFrame, Error = Error>> = match res {
                Ok(Either::A((frame, _))) => Box::new(future::ok(frame)),
                Ok(Either::B(((), _))) => {
                    let e = attributed.borrow_mut()
                        .take()
                        .unwrap_or_else(|| Error::Stream("sender task failed".into()));
                    Box::new(future::err(e))
                }
                Err(Either::A((recv_err, _))) => {
                    let e = attributed.borrow_mut().take().unwrap_or(recv_err);
                    Box::new(future::err(e))
                }
                // The sender finished without error; keep receiving.
                Err(Either::B((_, rest))) => rest,
            };
            outcome
        }))
    }

    /// `infer` in a loop bounded by `max_wait_time` and, optionally,
    /// `max_retries`. With `wait_for_task`, the loop first waits for some
    /// active node to advertise the task.
    pub fn infer_with_retry(&self,
                            request: InferRequest,
                            opts: InferOptions)
                            -> Box<Future<Item = InferResponse, Error = Error>> {
        let this = self.clone();
        let deadline = Instant::now() + opts.max_wait_time;

        Box::new(future::loop_fn((request, 0usize), move |(request, attempts)| {
            let this = this.clone();
            let opts = opts.clone();

            if opts.wait_for_task && !this.task_available(&request.task) {
                if Instant::now() + opts.retry_interval > deadline {
                    let out: Box<Future<Item = _, Error = Error>> =
                        Box::new(future::err(Error::CapabilityUnavailable(request.task.clone())));
                    return out;
                }
                trace!("waiting for {} to become available", request.task);
                return Box::new(this.timer
                    .sleep(opts.retry_interval)
                    .map_err(Error::from)
                    .map(move |_| future::Loop::Continue((request, attempts))));
            }

            let timer = this.timer.clone();
            Box::new(this.infer(request.clone()).then(move |res| {
                let outcome: Box<Future<Item = _, Error = Error>> = match res {
                    Ok(response) => Box::new(future::ok(future::Loop::Break(response))),
                    Err(e) => {
                        let attempts = attempts + 1;
                        let budget_spent = opts.max_retries
                            .map(|max| attempts > max)
                            .unwrap_or(false);
                        if !is_retryable(&e) || budget_spent ||
                           Instant::now() + opts.retry_interval > deadline {
                            Box::new(future::err(e))
                        } else {
                            debug!("attempt {} failed ({}), retrying in {:?}",
                                   attempts,
                                   e,
                                   opts.retry_interval);
                            Box::new(timer.sleep(opts.retry_interval)
                                .map_err(Error::from)
                                .map(move |_| future::Loop::Continue((request, attempts))))
                        }
                    }
                };
                outcome
            }))
        }))
    }

    /// Whether some active node currently advertises the task.
    pub fn task_available(&self, task: &str) -> bool {
        self.registry
            .snapshot()
            .iter()
            .any(|n| n.status == NodeStatus::Active && n.supports(task))
    }
}

/// Per-dispatch bookkeeping that must happen exactly once: the node's
/// connection slot, the request record, and the channel release. Dropping
/// an unfinished guard (an abandoned call) settles it as a failure.
struct DispatchGuard {
    node: Node,
    registry: NodeRegistry,
    pool: ConnectionPool,
    metrics: MetricsCore,
    started_at: Instant,
    finished: bool,
}

impl DispatchGuard {
    fn enter(dispatcher: &Dispatcher, node: &Node) -> DispatchGuard {
        node.incr_connections();
        DispatchGuard {
            node: node.clone(),
            registry: dispatcher.registry.clone(),
            pool: dispatcher.pool.clone(),
            metrics: dispatcher.metrics.clone(),
            started_at: Instant::now(),
            finished: false,
        }
    }

    fn settle(&mut self, ok: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        let elapsed = self.started_at.elapsed();
        let latency_ms = elapsed.as_secs() as f64 * 1_000.0 +
                         elapsed.subsec_nanos() as f64 / 1_000_000.0;
        self.node.decr_connections();
        self.registry.record_request(&self.node.id, latency_ms, ok);
        self.metrics.record_request(latency_ms, ok);
        self.pool.release(&self.node.id);
    }

    fn complete(mut self, ok: bool) -> String {
        self.settle(ok);
        self.node.id.clone()
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.settle(false);
    }
}

/// The `infer_stream` output: forwards response frames until the final
/// frame, end-of-stream, or an error, settling the dispatch exactly once.
struct ResponseStream {
    receiver: RpcReceiver,
    latched: Rc<RefCell<Option<Error>>>,
    failed: Option<oneshot::Receiver<()>>,
    cancel: Option<oneshot::Sender<()>>,
    guard: Option<DispatchGuard>,
    done: bool,
}

impl ResponseStream {
    fn settle(&mut self, ok: bool) {
        self.done = true;
        // Dropping the handle stops a still-running sender task.
        drop(self.cancel.take());
        if let Some(mut guard) = self.guard.take() {
            guard.settle(ok);
        }
    }

    fn sender_error(&self) -> Error {
        self.latched
            .borrow_mut()
            .take()
            .unwrap_or_else(|| Error::Stream("sender task failed".into()))
    }
}

impl Stream for ResponseStream {
    type Item = ResponseFrame;
    type Error = Error;

    fn poll(&mut self) -> Poll<Option<ResponseFrame>, Error> {
        if self.done {
            return Ok(Async::Ready(None));
        }

        if let Some(mut failed) = self.failed.take() {
            match failed.poll() {
                Ok(Async::Ready(())) => {
                    let e = self.sender_error();
                    self.settle(false);
                    return Err(e);
                }
                Ok(Async::NotReady) => self.failed = Some(failed),
                // The sender finished without error.
                Err(_) => {}
            }
        }

        match self.receiver.poll() {
            Ok(Async::NotReady) => Ok(Async::NotReady),
            Ok(Async::Ready(Some(WorkerEnvelope::Frame(frame)))) => {
                if frame.is_final {
                    self.settle(true);
                }
                Ok(Async::Ready(Some(frame)))
            }
            Ok(Async::Ready(Some(WorkerEnvelope::Error { message, .. }))) => {
                self.settle(false);
                Err(Error::Stream(message))
            }
            Ok(Async::Ready(Some(other))) => {
                self.settle(false);
                Err(Error::Protocol(format!("unexpected reply: {:?}", other)))
            }
            Ok(Async::Ready(None)) => {
                // End-of-stream without a final frame still closes the
                // output; a sender failure is the likelier cause.
                let latched = self.latched.borrow_mut().take();
                match latched {
                    Some(e) => {
                        self.settle(false);
                        Err(e)
                    }
                    None => {
                        self.settle(true);
                        Ok(Async::Ready(None))
                    }
                }
            }
            Err(e) => {
                self.settle(false);
                Err(e)
            }
        }
    }
}
