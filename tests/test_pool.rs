extern crate env_logger;
extern crate futures;
extern crate lumen_mesh;
extern crate tokio_core;
extern crate tokio_io;
extern crate tokio_timer;

mod mocks;

use std::net::SocketAddr;
use std::net::TcpListener as StdTcpListener;

use tokio_core::reactor::Core;
use tokio_timer::Timer;

use lumen_mesh::config::{ConnectionConfig, PoolConfig};
use lumen_mesh::pool::{ChannelStatus, ConnectionPool};
use lumen_mesh::wire::RequestFrame;
use mocks::{MockWorker, WorkerConfig};

/// An address with nothing listening on it.
fn dead_addr() -> SocketAddr {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn frame(correlation_id: &str, payload: &[u8]) -> RequestFrame {
    RequestFrame {
        correlation_id: correlation_id.to_owned(),
        task: "echo".to_owned(),
        payload: payload.to_vec(),
        payload_mime: "application/octet-stream".to_owned(),
        seq: 0,
        total: 1,
        offset: 0,
        meta: Default::default(),
    }
}

#[test]
/// `ensure` is idempotent: one channel per node id, however often it is
/// asked for.
fn one_channel_per_node() {
    drop(env_logger::init());
    let core = Core::new().unwrap();
    let timer = Timer::default();
    let pool = ConnectionPool::new(PoolConfig::default(),
                                   &ConnectionConfig::default(),
                                   &core.handle(),
                                   &timer);

    let addr = dead_addr();
    let id = format!("w@{}", addr);
    let first = pool.ensure(&id, addr);
    let second = pool.ensure(&id, addr);
    assert_eq!(pool.len(), 1);
    assert_eq!(first.node_id(), second.node_id());

    pool.acquire(&id, addr);
    pool.acquire(&id, addr);
    assert_eq!(pool.get(&id).unwrap().state().usage_count, 2);
    assert_eq!(pool.stats().total, 1);

    pool.remove(&id);
    assert_eq!(pool.len(), 0);
}

#[test]
/// A dial failure fails the in-flight call and marks the channel.
fn dead_worker_fails_the_call() {
    drop(env_logger::init());
    let mut core = Core::new().unwrap();
    let timer = Timer::default();
    let pool = ConnectionPool::new(PoolConfig::default(),
                                   &ConnectionConfig::default(),
                                   &core.handle(),
                                   &timer);

    let addr = dead_addr();
    let id = format!("w@{}", addr);
    let channel = pool.acquire(&id, addr);

    let res = core.run(channel.unary_send(frame("req-0", b"hello")));
    assert!(res.is_err());
    assert_eq!(channel.status(), ChannelStatus::Error);
    assert!(channel.state().error_count >= 1);

    // The next ensure retires the broken channel for a fresh one.
    let replacement = pool.ensure(&id, addr);
    assert_eq!(pool.len(), 1);
    assert_eq!(replacement.status(), ChannelStatus::Disconnected);
}

#[test]
/// A live worker answers the health RPC and a unary inference on the
/// same multiplexed connection.
fn healthy_worker_serves_unary_and_health() {
    drop(env_logger::init());
    let worker = MockWorker::start(WorkerConfig::default());

    let mut core = Core::new().unwrap();
    let timer = Timer::default();
    let pool = ConnectionPool::new(PoolConfig::default(),
                                   &ConnectionConfig::default(),
                                   &core.handle(),
                                   &timer);

    let id = worker.node_id("worker-a");
    let channel = pool.acquire(&id, worker.addr);

    core.run(channel.health()).expect("health rpc");
    let reply = core.run(channel.unary_send(frame("req-0", b"hello")))
        .expect("unary inference");
    assert!(reply.is_final);
    assert_eq!(reply.result, b"hello".to_vec());
    assert_eq!(channel.status(), ChannelStatus::Connected);
    assert_eq!(pool.stats().connected, 1);
}
