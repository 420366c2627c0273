//! KV Scheduler
//!
//! Reconciles a desired key-value configuration against a southbound plane.
//! Pluggable descriptors implement CRUD for their slice of the key space and
//! declare dependencies between values; the scheduler keeps the dependency
//! graph, orders operations so that nothing is created before what it
//! depends on, and records every transaction.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod fakes;
pub mod graph;
pub mod history;
pub mod metrics;
pub mod obs;
pub mod query;
pub mod registry;
pub(crate) mod resync;
pub mod scheduler;
pub mod state;
pub mod telemetry;
pub mod txn;
pub mod value;

pub use config::{HistoryConfig, SchedulerConfig};
pub use descriptor::{
    DescriptorAdapter, Dependency, DependencyTarget, ErasedDescriptor, ErasedKv, KvDescriptor,
    KvWithMetadata,
};
pub use error::{
    DescriptorError, KeyWithError, Result, SchedulerError, TransactionError, ValueError,
};
pub use graph::{Graph, GraphSnapshot, Node, RecordedNode, Timeline};
pub use history::{HistoryStore, JsonlHistory, MemoryHistory};
pub use metrics::METRICS;
pub use query::{DumpView, DumpedKv, MetadataMap, ValueStatus};
pub use registry::DescriptorRegistry;
pub use scheduler::Scheduler;
pub use state::{TxnOperation, ValueState};
pub use telemetry::{default_directives, init_tracing, LOG_ENV};
pub use txn::record::{RecordedKv, RecordedOp, RecordedTxn, RetrieveFailure};
pub use txn::retry::{RetryPolicy, RetryState};
pub use txn::{CancelToken, ResyncMode, Txn, TxnKind, TxnOptions};
pub use value::{AnyMetadata, AnyValue, KeyValuePair, ValueOrigin};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
