//! A client runtime for the Lumen inference mesh.
//!
//! The runtime discovers worker nodes on the local network, pools one
//! streaming RPC channel per node, and routes each inference request to a
//! suitable worker through a pluggable load-balancing strategy. Oversized
//! payloads are split into ordered chunks carried on a single
//! bidirectional stream.
//!
//! Construction is explicit: `runtime::Client::initialize` owns a reactor
//! thread and wires every subsystem together, while the individual pieces
//! (`registry`, `discover`, `pool`, `balance`, `dispatch`) may be composed
//! directly on a caller-owned reactor, which is how the tests drive them.

extern crate bytes;
#[macro_use]
extern crate futures;
#[macro_use]
extern crate log;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate serde_yaml;
extern crate tokio_core;
extern crate tokio_io;
extern crate tokio_timer;

pub mod balance;
pub mod chunk;
pub mod config;
pub mod discover;
pub mod dispatch;
mod driver;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod wire;

use futures::future::Shared;
use futures::sync::oneshot;

pub use config::ClientConfig;
pub use dispatch::{Dispatcher, InferOptions, InferRequest, InferResponse};
pub use error::Error;
pub use registry::{Node, NodeRegistry, NodeStatus};
pub use runtime::Client;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Cloneable shutdown signal observed by every background loop.
///
/// Loops run `select2` against a clone and stop when the runtime fires or
/// drops the paired sender.
pub type Shutdown = Shared<oneshot::Receiver<()>>;

