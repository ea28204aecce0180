extern crate env_logger;
extern crate futures;
extern crate lumen_mesh;
extern crate tokio_core;
extern crate tokio_io;
extern crate tokio_timer;

mod mocks;

use std::collections::HashMap;
use std::net::TcpListener as StdTcpListener;
use std::time::{Duration, Instant};

use futures::{Future, future};
use futures::sync::oneshot;
use tokio_core::reactor::Core;
use tokio_timer::Timer;

use lumen_mesh::Shutdown;
use lumen_mesh::config::DiscoveryConfig;
use lumen_mesh::discover::{Discovery, ServiceEntry};
use lumen_mesh::registry::{NodeRegistry, NodeStatus};
use mocks::{MockWorker, StaticBrowser, WorkerConfig};

const MAX_FRAME: usize = 4 * 1024 * 1024;

fn discovery_config() -> DiscoveryConfig {
    DiscoveryConfig {
        scan_interval_secs: Some(1),
        ..Default::default()
    }
}

/// Polls the registry on the reactor until `pred` holds or `wait` runs
/// out, resolving to whether it held.
fn wait_until<F>(timer: &Timer,
                 registry: &NodeRegistry,
                 wait: Duration,
                 pred: F)
                 -> Box<Future<Item = bool, Error = ()>>
    where F: Fn(&NodeRegistry) -> bool + 'static
{
    let deadline = Instant::now() + wait;
    let timer = timer.clone();
    let registry = registry.clone();
    Box::new(future::loop_fn((), move |()| {
        if pred(&registry) {
            let done: Box<Future<Item = _, Error = ()>> =
                Box::new(future::ok(future::Loop::Break(true)));
            return done;
        }
        if Instant::now() > deadline {
            return Box::new(future::ok(future::Loop::Break(false)));
        }
        Box::new(timer.sleep(Duration::from_millis(50))
            .map_err(|_| ())
            .map(|_| future::Loop::Continue(())))
    }))
}

#[test]
/// A browsed worker lands in the registry as starting and turns active
/// once its capability probe answers.
fn discovery_activates_sighted_workers() {
    drop(env_logger::init());
    let worker = MockWorker::start(WorkerConfig::default());

    let mut core = Core::new().unwrap();
    let handle = core.handle();
    let timer = Timer::default();
    let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let shutdown: Shutdown = shutdown_rx.shared();

    let registry = NodeRegistry::new(8, Duration::from_secs(60));
    let browser = StaticBrowser::new(vec![worker.entry("worker-a")]);
    Discovery::new(discovery_config(), registry.clone(), browser, MAX_FRAME)
        .spawn(&handle, &timer, shutdown);

    let id = worker.node_id("worker-a");
    let activated = {
        let id = id.clone();
        wait_until(&timer, &registry, Duration::from_secs(5), move |reg| {
            reg.get(&id).map(|n| n.status == NodeStatus::Active).unwrap_or(false)
        })
    };
    assert!(core.run(activated).unwrap());

    let node = registry.get(&id).unwrap();
    assert!(node.supports("echo"));
    assert_eq!(node.runtime, "cpu");
    assert_eq!(node.model_ids, vec!["echo-v1".to_owned()]);
    assert_eq!(node.version, "0.0.3");
}

#[test]
/// A candidate that cannot be probed is kept, in error state.
fn unreachable_candidate_is_marked_error() {
    drop(env_logger::init());

    // A port with nothing behind it.
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut core = Core::new().unwrap();
    let handle = core.handle();
    let timer = Timer::default();
    let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let shutdown: Shutdown = shutdown_rx.shared();

    let registry = NodeRegistry::new(8, Duration::from_secs(60));
    let ip = match addr.ip() {
        ::std::net::IpAddr::V4(ip) => ip,
        _ => unreachable!(),
    };
    let entry = ServiceEntry {
        instance: "ghost".to_owned(),
        addrs: vec![ip],
        port: addr.port(),
        txt: HashMap::new(),
    };
    Discovery::new(discovery_config(), registry.clone(), StaticBrowser::new(vec![entry]), MAX_FRAME)
        .spawn(&handle, &timer, shutdown);

    let id = format!("ghost@{}", addr);
    let errored = {
        let id = id.clone();
        wait_until(&timer, &registry, Duration::from_secs(5), move |reg| {
            reg.get(&id).map(|n| n.status == NodeStatus::Error).unwrap_or(false)
        })
    };
    assert!(core.run(errored).unwrap());
    assert!(registry.get(&id).is_some());
}

#[test]
/// TXT records become node metadata, weight, and load hints.
fn txt_records_enrich_the_node() {
    drop(env_logger::init());
    let worker = MockWorker::start(WorkerConfig::default());

    let mut core = Core::new().unwrap();
    let handle = core.handle();
    let timer = Timer::default();
    let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let shutdown: Shutdown = shutdown_rx.shared();

    let registry = NodeRegistry::new(8, Duration::from_secs(60));
    let mut entry = worker.entry("worker-a");
    entry.txt.insert("weight".to_owned(), "2.5".to_owned());
    entry.txt.insert("cpu".to_owned(), "0.25".to_owned());
    entry.txt.insert("memory".to_owned(), "0.5".to_owned());
    entry.txt.insert("rack".to_owned(), "b12".to_owned());
    Discovery::new(discovery_config(), registry.clone(), StaticBrowser::new(vec![entry]), MAX_FRAME)
        .spawn(&handle, &timer, shutdown);

    let id = worker.node_id("worker-a");
    let seen = {
        let id = id.clone();
        wait_until(&timer, &registry, Duration::from_secs(5), move |reg| {
            reg.get(&id).is_some()
        })
    };
    assert!(core.run(seen).unwrap());

    let node = registry.get(&id).unwrap();
    assert_eq!(node.weight, 2.5);
    assert_eq!(node.meta.get("rack").map(|s| s.as_str()), Some("b12"));
    let load = node.load.expect("load hints");
    assert_eq!(load.cpu, 0.25);
    assert_eq!(load.memory, 0.5);
    assert_eq!(load.gpu, 0.0);
}
