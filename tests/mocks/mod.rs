//! Test doubles: a scripted worker speaking the wire protocol on a real
//! listener, and a browser that always reports the same services.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::sync::mpsc as sync_mpsc;
use std::thread;

use futures::{Future, Stream, future, stream};
use futures::sync::oneshot;
use tokio_core::net::{TcpListener, TcpStream};
use tokio_core::reactor::Core;
use tokio_io::AsyncRead;

use lumen_mesh::discover::{Browser, ServiceEntry};
use lumen_mesh::wire::{Capability, ClientEnvelope, RequestFrame, ResponseFrame, TaskSpec,
                       WorkerCodec, WorkerEnvelope};

const MAX_FRAME: usize = 8 * 1024 * 1024;

/// What the scripted worker advertises and how it behaves.
#[derive(Clone)]
pub struct WorkerConfig {
    pub tasks: Vec<String>,
    pub runtime: String,
    /// Non-final frames emitted before the final response.
    pub progress_frames: usize,
    /// Fail this many inference calls before succeeding.
    pub fail_first: usize,
    pub fail_message: String,
}

impl Default for WorkerConfig {
    fn default() -> WorkerConfig {
        WorkerConfig {
            tasks: vec!["echo".to_owned()],
            runtime: "cpu".to_owned(),
            progress_frames: 0,
            fail_first: 0,
            fail_message: "temporary failure".to_owned(),
        }
    }
}

/// A worker on its own reactor thread. Inference echoes the concatenated
/// request payload back as the final response.
pub struct MockWorker {
    pub addr: SocketAddr,
    frames: Arc<Mutex<Vec<RequestFrame>>>,
    infers: Arc<Mutex<usize>>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MockWorker {
    pub fn start(config: WorkerConfig) -> MockWorker {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let infers = Arc::new(Mutex::new(0usize));
        let (addr_tx, addr_rx) = sync_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = {
            let frames = frames.clone();
            let infers = infers.clone();
            thread::Builder::new().name("mock-worker".into())
                .spawn(move || {
                    let mut core = Core::new().expect("mock worker reactor");
                    let handle = core.handle();
                    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
                    let listener = TcpListener::bind(&bind, &handle).expect("bind mock worker");
                    addr_tx.send(listener.local_addr().unwrap()).unwrap();

                    let accept = {
                        let handle = handle.clone();
                        listener.incoming().for_each(move |(socket, _peer)| {
                            handle.spawn(serve(socket,
                                               config.clone(),
                                               frames.clone(),
                                               infers.clone()));
                            Ok(())
                        })
                    };
                    drop(core.run(accept.select2(shutdown_rx).then(|_| Ok(()) as Result<(), ()>)));
                })
                .expect("spawn mock worker")
        };

        let addr = addr_rx.recv().expect("mock worker address");
        MockWorker {
            addr: addr,
            frames: frames,
            infers: infers,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    /// The service entry a browser would have seen for this worker.
    pub fn entry(&self, instance: &str) -> ServiceEntry {
        let ip = match self.addr.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => unreachable!("mock worker binds v4"),
        };
        ServiceEntry {
            instance: instance.to_owned(),
            addrs: vec![ip],
            port: self.addr.port(),
            txt: HashMap::new(),
        }
    }

    pub fn node_id(&self, instance: &str) -> String {
        format!("{}@{}", instance, self.addr)
    }

    /// Every request frame received so far, in arrival order.
    pub fn received_frames(&self) -> Vec<RequestFrame> {
        self.frames.lock().unwrap().clone()
    }

    /// How many inference calls reached the worker.
    pub fn infer_calls(&self) -> usize {
        *self.infers.lock().unwrap()
    }
}

impl Drop for MockWorker {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            drop(thread.join());
        }
    }
}

fn serve(socket: TcpStream,
         config: WorkerConfig,
         frames: Arc<Mutex<Vec<RequestFrame>>>,
         infers: Arc<Mutex<usize>>)
         -> Box<Future<Item = (), Error = ()>> {
    let (sink, stream) = socket.framed(WorkerCodec::new(MAX_FRAME)).split();
    let mut pending: HashMap<String, Vec<RequestFrame>> = HashMap::new();

    let replies = stream.map(move |env| {
            let out: Vec<WorkerEnvelope> = match env {
                ClientEnvelope::Capabilities { correlation_id } => {
                    vec![WorkerEnvelope::Capabilities {
                             correlation_id: correlation_id,
                             capability: capability_of(&config),
                         }]
                }
                ClientEnvelope::Health { correlation_id } => {
                    vec![WorkerEnvelope::Health { correlation_id: correlation_id }]
                }
                ClientEnvelope::Frame(frame) => {
                    frames.lock().unwrap().push(frame.clone());
                    pending.entry(frame.correlation_id.clone())
                        .or_insert_with(Vec::new)
                        .push(frame);
                    vec![]
                }
                ClientEnvelope::CloseSend { correlation_id } => {
                    let collected = pending.remove(&correlation_id).unwrap_or_default();
                    let calls = {
                        let mut n = infers.lock().unwrap();
                        *n += 1;
                        *n
                    };
                    if calls <= config.fail_first {
                        vec![WorkerEnvelope::Error {
                                 correlation_id: correlation_id,
                                 message: config.fail_message.clone(),
                             }]
                    } else {
                        respond(correlation_id, collected, config.progress_frames)
                    }
                }
            };
            stream::iter_ok::<_, io::Error>(out)
        })
        .flatten();

    Box::new(replies.forward(sink).map(|_| ()).map_err(|_| ()))
}

fn capability_of(config: &WorkerConfig) -> Capability {
    Capability {
        runtime: config.runtime.clone(),
        model_ids: vec!["echo-v1".to_owned()],
        tasks: config.tasks
            .iter()
            .map(|name| {
                TaskSpec {
                    name: name.clone(),
                    extra: HashMap::new(),
                }
            })
            .collect(),
        precisions: vec!["fp16".to_owned()],
        max_concurrency: 4,
        version: "0.0.3".to_owned(),
        extra: HashMap::new(),
    }
}

fn respond(correlation_id: String,
           collected: Vec<RequestFrame>,
           progress: usize)
           -> Vec<WorkerEnvelope> {
    let mime = collected.first().map(|f| f.payload_mime.clone()).unwrap_or_default();
    let mut result = Vec::new();
    for frame in &collected {
        result.extend_from_slice(&frame.payload);
    }

    let mut out = Vec::new();
    for i in 0..progress {
        out.push(WorkerEnvelope::Frame(ResponseFrame {
            correlation_id: correlation_id.clone(),
            result: vec![i as u8],
            result_mime: "application/x-progress".to_owned(),
            is_final: false,
        }));
    }
    out.push(WorkerEnvelope::Frame(ResponseFrame {
        correlation_id: correlation_id,
        result: result,
        result_mime: mime,
        is_final: true,
    }));
    out
}

/// A browser that always sees the same services.
#[derive(Clone)]
pub struct StaticBrowser {
    entries: Vec<ServiceEntry>,
}

impl StaticBrowser {
    pub fn new(entries: Vec<ServiceEntry>) -> StaticBrowser {
        StaticBrowser { entries: entries }
    }
}

impl Browser for StaticBrowser {
    type Browse = future::FutureResult<Vec<ServiceEntry>, io::Error>;

    fn browse(&self, _service_type: &str, _domain: &str) -> Self::Browse {
        future::ok(self.entries.clone())
    }
}
