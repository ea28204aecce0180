//! One streaming RPC channel to one worker.
//!
//! A channel owns a single TCP connection. A writer task drains a send
//! queue into the framed sink; a reader task demultiplexes worker
//! envelopes to per-stream queues keyed by `correlation_id`. Logical
//! streams share the connection: `open_stream` yields a sender/receiver
//! pair bound to one correlation id.
//!
//! The channel handle is created before the dial completes; envelopes
//! queued in the meantime flush once the connection is up, and a failed
//! dial fails every queued sender.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use futures::{Future, Poll, Sink, Stream, future};
use futures::future::Loop;
use futures::sync::mpsc;
use tokio_core::net::TcpStream;
use tokio_core::reactor::Handle;
use tokio_io::AsyncRead;
use tokio_timer::Timer;

use driver::Driver;
use error::Error;
use retry::with_deadline;
use wire::{ClientCodec, ClientEnvelope, RequestFrame, ResponseFrame, WorkerEnvelope};

/// Send-queue depth shared by all logical streams on one channel.
const SEND_QUEUE: usize = 32;

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    Connected,
    Disconnected,
    Error,
}

#[derive(Clone, Debug)]
pub struct ChannelState {
    pub status: ChannelStatus,
    pub established_at: Instant,
    pub last_used: Instant,
    pub usage_count: u64,
    pub error_count: u64,
}

impl ChannelState {
    fn new() -> ChannelState {
        let now = Instant::now();
        ChannelState {
            status: ChannelStatus::Disconnected,
            established_at: now,
            last_used: now,
            usage_count: 0,
            error_count: 0,
        }
    }
}

type Demux = HashMap<String, mpsc::UnboundedSender<WorkerEnvelope>>;

#[derive(Clone)]
pub struct Channel {
    node_id: String,
    addr: SocketAddr,
    tx: mpsc::Sender<ClientEnvelope>,
    demux: Rc<RefCell<Demux>>,
    state: Rc<RefCell<ChannelState>>,
    correlations: Rc<Cell<u64>>,
}

impl Channel {
    /// Creates the channel and starts its connection in the background.
    pub fn connect(node_id: String,
                   addr: SocketAddr,
                   dial_timeout: Duration,
                   keep_alive: bool,
                   max_frame: usize,
                   handle: &Handle,
                   timer: &Timer)
                   -> Channel {
        let (tx, rx) = mpsc::channel(SEND_QUEUE);
        let channel = Channel {
            node_id: node_id,
            addr: addr,
            tx: tx,
            demux: Rc::new(RefCell::new(HashMap::new())),
            state: Rc::new(RefCell::new(ChannelState::new())),
            correlations: Rc::new(Cell::new(0)),
        };

        debug!("dialing {} at {}", channel.node_id, addr);
        let dial = TcpStream::connect(&addr, handle).map_err(|e| Error::Connect(format!("{}", e)));
        let dial = with_deadline(timer, dial_timeout, "worker dial", dial);

        let established = {
            let chan = channel.clone();
            let handle = handle.clone();
            dial.then(move |res| {
                match res {
                    Ok(tcp) => chan.establish(tcp, rx, keep_alive, max_frame, &handle),
                    Err(e) => {
                        warn!("dial failed for {}: {}", chan.node_id, e);
                        chan.record_error();
                        // Dropping rx fails every queued sender, and the
                        // demux entries end every waiting receiver.
                        drop(rx);
                        chan.demux.borrow_mut().clear();
                    }
                }
                Ok(())
            })
        };
        handle.spawn(established);

        channel
    }

    /// Wires the writer and reader tasks onto an established connection.
    fn establish(&self,
                 tcp: TcpStream,
                 rx: mpsc::Receiver<ClientEnvelope>,
                 keep_alive: bool,
                 max_frame: usize,
                 handle: &Handle) {
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", self.node_id, e);
        }
        let keepalive = if keep_alive { Some(KEEPALIVE_PERIOD) } else { None };
        if let Err(e) = tcp.set_keepalive(keepalive) {
            debug!("set_keepalive failed for {}: {}", self.node_id, e);
        }

        {
            let mut state = self.state.borrow_mut();
            state.status = ChannelStatus::Connected;
            state.established_at = Instant::now();
        }
        info!("connected to {} at {}", self.node_id, self.addr);

        let (sink, stream) = tcp.framed(ClientCodec::new(max_frame)).split();

        let writer = {
            let node_id = self.node_id.clone();
            let state = self.state.clone();
            let outbound =
                rx.map_err(|_| io::Error::new(io::ErrorKind::Other, "send queue failed"));
            Driver::new(outbound, sink).then(move |res| {
                if let Err(e) = res {
                    warn!("writer for {} failed: {}", node_id, e);
                    let mut state = state.borrow_mut();
                    state.status = ChannelStatus::Error;
                    state.error_count += 1;
                }
                Ok(())
            })
        };
        handle.spawn(writer);

        let reader = {
            let node_id = self.node_id.clone();
            let state = self.state.clone();
            let demux = self.demux.clone();
            let routes = self.demux.clone();
            stream.for_each(move |env| {
                    let entry = routes.borrow().get(env.correlation_id()).cloned();
                    match entry {
                        Some(tx) => {
                            // A gone receiver just means the caller lost
                            // interest in this stream.
                            let _ = tx.unbounded_send(env);
                        }
                        None => trace!("dropping orphan reply {}", env.correlation_id()),
                    }
                    Ok(())
                })
                .then(move |res| {
                    match res {
                        Ok(()) => {
                            debug!("connection to {} closed", node_id);
                            let mut state = state.borrow_mut();
                            if state.status != ChannelStatus::Error {
                                state.status = ChannelStatus::Disconnected;
                            }
                        }
                        Err(e) => {
                            warn!("reader for {} failed: {}", node_id, e);
                            let mut state = state.borrow_mut();
                            state.status = ChannelStatus::Error;
                            state.error_count += 1;
                        }
                    }
                    // Ends every open logical stream on this channel.
                    demux.borrow_mut().clear();
                    Ok(())
                })
        };
        handle.spawn(reader);
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> ChannelStatus {
        self.state.borrow().status
    }

    /// Bumps the usage bookkeeping. Called on every acquisition.
    pub fn touch(&self) {
        let mut state = self.state.borrow_mut();
        state.last_used = Instant::now();
        state.usage_count += 1;
    }

    pub fn record_error(&self) {
        let mut state = self.state.borrow_mut();
        state.status = ChannelStatus::Error;
        state.error_count += 1;
    }

    /// A channel is healthy while it has not erred, has not outlived its
    /// lifetime, and has been used within the idle bound.
    pub fn is_healthy(&self, now: Instant, max_idle: Duration, max_lifetime: Duration) -> bool {
        let state = self.state.borrow();
        state.status != ChannelStatus::Error &&
        now.duration_since(state.established_at) <= max_lifetime &&
        now.duration_since(state.last_used) <= max_idle
    }

    pub fn next_correlation(&self, prefix: &str) -> String {
        let n = self.correlations.get();
        self.correlations.set(n + 1);
        format!("{}-{}", prefix, n)
    }

    /// Opens a logical stream for `correlation_id`, registering it with
    /// the reader's demultiplexer.
    pub fn open_stream(&self, correlation_id: String) -> (RpcSender, RpcReceiver) {
        let (tx, rx) = mpsc::unbounded();
        self.demux.borrow_mut().insert(correlation_id.clone(), tx);
        trace!("{}: opened stream {}", self.node_id, correlation_id);
        let sender = RpcSender {
            correlation_id: correlation_id.clone(),
            tx: self.tx.clone(),
        };
        let receiver = RpcReceiver {
            correlation_id: correlation_id,
            rx: rx,
            demux: Rc::downgrade(&self.demux),
        };
        (sender, receiver)
    }

    /// Best-effort half-close for a logical stream whose sender is no
    /// longer reachable (cancellation, send failure).
    pub fn half_close(&self, correlation_id: &str) {
        let env = ClientEnvelope::CloseSend { correlation_id: correlation_id.to_owned() };
        let mut tx = self.tx.clone();
        if tx.try_send(env).is_err() {
            trace!("{}: half-close for {} not sent", self.node_id, correlation_id);
        }
    }

    /// Sends one request frame on its own logical stream, closes the send
    /// side, and resolves to the single final response.
    pub fn unary_send(&self,
                      frame: RequestFrame)
                      -> Box<Future<Item = ResponseFrame, Error = Error>> {
        let (sender, receiver) = self.open_stream(frame.correlation_id.clone());
        Box::new(sender.send_frame(frame)
            .and_then(|sender| sender.close_send())
            .and_then(move |_| receiver.final_response()))
    }

    /// The health RPC, used by the pool's per-channel health loop.
    pub fn health(&self) -> Box<Future<Item = (), Error = Error>> {
        let correlation_id = self.next_correlation("health");
        let (sender, receiver) = self.open_stream(correlation_id.clone());
        let send = sender.send_envelope(ClientEnvelope::Health { correlation_id: correlation_id });
        Box::new(send.and_then(move |_sender| receiver.into_future().map_err(|(e, _)| e))
            .and_then(|(reply, _receiver)| match reply {
                Some(WorkerEnvelope::Health { .. }) => Ok(()),
                Some(WorkerEnvelope::Error { message, .. }) => Err(Error::Stream(message)),
                Some(other) => {
                    Err(Error::Protocol(format!("unexpected health reply: {:?}", other)))
                }
                None => Err(Error::Stream("closed before health reply".into())),
            }))
    }
}

/// The send half of one logical stream.
pub struct RpcSender {
    correlation_id: String,
    tx: mpsc::Sender<ClientEnvelope>,
}

impl RpcSender {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn send_frame(self, frame: RequestFrame) -> Box<Future<Item = RpcSender, Error = Error>> {
        self.send_envelope(ClientEnvelope::Frame(frame))
    }

    pub fn send_envelope(self,
                         env: ClientEnvelope)
                         -> Box<Future<Item = RpcSender, Error = Error>> {
        let RpcSender { correlation_id, tx } = self;
        Box::new(tx.send(env)
            .map_err(|_| Error::Stream("connection writer gone".into()))
            .map(move |tx| {
                RpcSender {
                    correlation_id: correlation_id,
                    tx: tx,
                }
            }))
    }

    /// Half-closes the stream: the worker sees end-of-request after any
    /// queued frames. Consumes the sender, so nothing can follow it.
    pub fn close_send(self) -> Box<Future<Item = (), Error = Error>> {
        let env = ClientEnvelope::CloseSend { correlation_id: self.correlation_id.clone() };
        Box::new(self.tx
            .send(env)
            .map_err(|_| Error::Stream("connection writer gone".into()))
            .map(|_tx| ()))
    }
}

/// The receive half of one logical stream: every worker envelope sent for
/// this correlation id, in arrival order. Dropping it deregisters the id.
pub struct RpcReceiver {
    correlation_id: String,
    rx: mpsc::UnboundedReceiver<WorkerEnvelope>,
    demux: Weak<RefCell<Demux>>,
}

impl RpcReceiver {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Reads until the final response frame, discarding non-final frames.
    pub fn final_response(self) -> Box<Future<Item = ResponseFrame, Error = Error>> {
        Box::new(future::loop_fn(self, |receiver| {
            receiver.into_future()
                .map_err(|(e, _)| e)
                .and_then(|(reply, receiver)| match reply {
                    Some(WorkerEnvelope::Frame(frame)) => {
                        if frame.is_final {
                            Ok(Loop::Break(frame))
                        } else {
                            trace!("discarding non-final frame for {}",
                                   receiver.correlation_id());
                            Ok(Loop::Continue(receiver))
                        }
                    }
                    Some(WorkerEnvelope::Error { message, .. }) => Err(Error::Stream(message)),
                    Some(other) => {
                        Err(Error::Protocol(format!("unexpected reply: {:?}", other)))
                    }
                    None => Err(Error::Stream("stream closed before final response".into())),
                })
        }))
    }
}

impl Stream for RpcReceiver {
    type Item = WorkerEnvelope;
    type Error = Error;

    fn poll(&mut self) -> Poll<Option<WorkerEnvelope>, Error> {
        self.rx.poll().map_err(|_| Error::Stream("connection reader gone".into()))
    }
}

impl Drop for RpcReceiver {
    fn drop(&mut self) {
        if let Some(demux) = self.demux.upgrade() {
            demux.borrow_mut().remove(&self.correlation_id);
        }
    }
}
