//! Parallel out-of-core window function operator over Arrow record batches.
//!
//! Architecture role:
//! - sink phase: per-thread hash partitioning of input batches, then per-bin
//!   sorting by (PARTITION BY, ORDER BY) keys at finalize
//! - source phase: a three-stage task scheduler drives worker threads through
//!   per-group SINK → FINALIZE → GETDATA passes, releasing each group's
//!   memory as soon as its last task completes
//! - window function algorithms plug in behind the executor interface and are
//!   dispatched per descriptor kind
//!
//! Key modules:
//! - [`operator`]: the façade the pipeline driver talks to
//! - [`partition`]: hash partitioner and per-bin sorter
//! - [`group`]: per-partition state and phase counters
//! - [`source`]: task scheduler and worker drive loop
//! - [`executor`] / [`executors`]: the window function algorithms
//! - [`exec`]: embedded multi-threaded driver

pub mod block;
pub mod exec;
pub mod executor;
pub mod executors;
pub mod group;
pub mod mask;
pub mod operator;
pub mod partition;
pub mod scalar;
pub mod source;

pub use exec::{run_operator, run_window};
pub use executor::{create_executor, ExecutorState, GroupMasks, WindowExecutor};
pub use group::{GroupStage, WindowHashGroup};
pub use mask::{BoundaryMask, BoundaryMaskBuilder};
pub use operator::{
    OrderPreservation, SinkCombineResult, SinkFinalize, SinkResult, SourceResult, WindowGlobalSink,
    WindowLocalSink, WindowOperator,
};
pub use partition::{HashPartitioner, PartitionMergeEvent, SortSpec, SortedBin};
pub use scalar::ScalarValue;
pub use source::{InterruptSignal, Task, TaskPoll, WindowSourceState, WindowWorkerState, WorkerPoll};
