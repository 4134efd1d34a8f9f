//! framedb-router: routing and backpressure core for sharded cache clusters
//!
//! The library sits between data producers ("sources") and sharded cache
//! backends ("framedb" nodes). Each source owns one [`Router`] holding a
//! dynamically-updated routing table, per-shard asynchronous writers with
//! local retry buffering, a three-tier failure-absorption chain (retry
//! buffer → on-disk backpressure log → persistent failure log) and a
//! batched actuation notifier for downstream flow control.

pub mod actuation;
pub mod backend;
pub mod config;
pub mod discovery;
pub mod error;
pub mod log;
pub mod metrics;
pub mod notifier;
pub mod persistence;
pub mod reader;
pub mod router;
pub mod validator;
pub mod writer;

pub use actuation::{ActuationController, ActuationPacket, ActuationSink, ShardMetadata};
pub use backend::{BackendConnector, Endpoint, ReadBackend, ShardBackend, WriteOp};
pub use config::RouterConfig;
pub use error::{Result, RouterError};
pub use persistence::{BackpressureLog, CorruptFrameLog, DiskLog, FailureLog};
pub use router::listener::ControlMessage;
pub use router::table::{RoutingTable, ShardDescriptor, ShardView};
pub use router::{MappedWrites, Router};
pub use writer::{AsyncShardWriter, QueuedWrite, ShardWriter, WriteEvent, WriteNotification};
