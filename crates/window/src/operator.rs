//! The window operator façade: sink, combine, finalize, and the source-phase
//! entry points the pipeline driver calls per worker.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema, SchemaRef};
use tracing::{info, warn};
use wf_common::{global_metrics, EngineConfig, Result, WfError};
use wf_plan::WindowExpr;

use crate::executor::{create_executor, WindowExecutor};
use crate::group::WindowHashGroup;
use crate::partition::{HashPartitioner, LocalPartitionSink, PartitionMergeEvent, SortSpec};
use crate::source::{InterruptSignal, WindowSourceState, WindowWorkerState, WorkerPoll};

/// Sink outcome; the operator is a pipeline breaker and always wants more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkResult {
    /// Keep feeding input batches.
    NeedMoreInput,
}

/// Combine outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkCombineResult {
    /// The local state has been folded into the global state.
    Finished,
}

/// Finalize outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFinalize {
    /// Sorted groups are (or will be) available; the source phase may start.
    Ready,
    /// No rows were sunk; the source phase would produce nothing.
    NoOutputPossible,
}

/// One `get_data` poll outcome.
#[derive(Debug)]
pub enum SourceResult {
    /// An output batch; poll again for more.
    HaveMoreOutput(RecordBatch),
    /// No schedulable task; wait on the interrupt handle and poll again.
    Blocked,
    /// This worker is done.
    Finished,
}

/// Whether downstream operators can rely on batch-index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPreservation {
    /// Single sorted stream; batch indices are monotone.
    FixedOrder,
    /// Work stealing across groups makes batch order arbitrary.
    NoOrder,
}

/// Global sink state: the executor list, the partitioner, and the hash groups
/// produced by sorting.
pub struct WindowGlobalSink {
    /// One executor per descriptor, in output-column order.
    pub executors: Vec<Box<dyn WindowExecutor>>,
    /// The partition/sort collaborator.
    pub partition: Arc<HashPartitioner>,
    /// Input columns followed by executor output columns.
    pub output_schema: SchemaRef,
    partition_prefix: usize,
    prefix_lens: BTreeSet<usize>,
    window_hash_groups: Mutex<Vec<Option<Arc<WindowHashGroup>>>>,
}

impl WindowGlobalSink {
    /// The group at `idx`, if it exists and has not been released.
    pub fn group(&self, idx: usize) -> Option<Arc<WindowHashGroup>> {
        self.window_hash_groups
            .lock()
            .ok()?
            .get(idx)
            .and_then(|g| g.as_ref().map(Arc::clone))
    }

    /// Snapshot of every group slot.
    pub fn groups_snapshot(&self) -> Vec<Option<Arc<WindowHashGroup>>> {
        self.window_hash_groups
            .lock()
            .map(|groups| groups.clone())
            .unwrap_or_default()
    }

    /// Remove and return the group at `idx` (last-task release path).
    pub fn take_group(&self, idx: usize) -> Option<Arc<WindowHashGroup>> {
        self.window_hash_groups
            .lock()
            .ok()?
            .get_mut(idx)
            .and_then(Option::take)
    }

    fn set_group(&self, idx: usize, group: Arc<WindowHashGroup>) -> Result<()> {
        let mut groups = self
            .window_hash_groups
            .lock()
            .map_err(|_| WfError::Internal("hash group table lock poisoned".to_string()))?;
        if idx >= groups.len() {
            return Err(WfError::Internal(format!(
                "hash bin {idx} out of range for {} bins",
                groups.len()
            )));
        }
        groups[idx] = Some(group);
        Ok(())
    }

    fn no_groups(&self) -> bool {
        self.window_hash_groups
            .lock()
            .map(|groups| groups.iter().all(Option::is_none))
            .unwrap_or(true)
    }
}

/// Per-thread sink state wrapping the partitioner's local sink.
pub struct WindowLocalSink {
    local: LocalPartitionSink,
    rows: usize,
}

/// Parallel out-of-core window operator over Arrow record batches.
///
/// Built once per query from the bound window descriptors; per-query mutable
/// state lives in the global sink/source states so one operator instance can
/// be shared by every worker thread.
#[derive(Debug)]
pub struct WindowOperator {
    input_schema: SchemaRef,
    output_schema: SchemaRef,
    exprs: Vec<WindowExpr>,
    canonical: usize,
    is_order_dependent: bool,
    config: EngineConfig,
}

impl WindowOperator {
    /// Validate descriptors and pick the canonical one (most order keys); it
    /// determines the global partition/sort grouping.
    pub fn new(
        input_schema: SchemaRef,
        exprs: Vec<WindowExpr>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        if exprs.is_empty() {
            return Err(WfError::Plan(
                "window operator requires at least one descriptor".to_string(),
            ));
        }

        let mut canonical = 0;
        let mut max_orders = 0;
        let mut is_order_dependent = false;
        for (idx, w) in exprs.iter().enumerate() {
            if w.partition_by.is_empty() && w.order_by.is_empty() {
                is_order_dependent = true;
            }
            if w.order_by.len() > max_orders {
                canonical = idx;
                max_orders = w.order_by.len();
            }
        }

        let canonical_keys = exprs[canonical].key_prefix_len();
        let mut fields: Vec<Field> = input_schema
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        for w in &exprs {
            if w.key_prefix_len() > canonical_keys {
                return Err(WfError::Plan(format!(
                    "descriptor '{}' uses {} keys but the canonical grouping has {}",
                    w.output_name,
                    w.key_prefix_len(),
                    canonical_keys
                )));
            }
            fields.push(Field::new(
                &w.output_name,
                w.output_type(&input_schema)?,
                w.output_nullable(),
            ));
        }
        let output_schema = Arc::new(Schema::new(fields));

        Ok(Self {
            input_schema,
            output_schema,
            exprs,
            canonical,
            is_order_dependent,
            config,
        })
    }

    /// Input schema.
    pub fn input_schema(&self) -> &SchemaRef {
        &self.input_schema
    }

    /// Output schema: input columns followed by one column per descriptor.
    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    /// Engine configuration this operator runs under.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether any descriptor needs rows in input order.
    pub fn is_order_dependent(&self) -> bool {
        self.is_order_dependent
    }

    /// Order is only preserved for the single sorted stream; partitioned work
    /// stealing produces batches out of order.
    pub fn supports_batch_index(&self) -> bool {
        let canonical = &self.exprs[self.canonical];
        canonical.partition_by.is_empty() && !canonical.order_by.is_empty()
    }

    /// Ordering contract towards downstream operators.
    pub fn source_order(&self) -> OrderPreservation {
        if self.supports_batch_index() {
            OrderPreservation::FixedOrder
        } else {
            OrderPreservation::NoOrder
        }
    }

    /// Newline-separated descriptor names for EXPLAIN output.
    pub fn params_to_string(&self) -> String {
        self.exprs
            .iter()
            .map(WindowExpr::display_name)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Build the global sink state: executors plus the partitioner.
    pub fn global_sink(&self) -> Result<Arc<WindowGlobalSink>> {
        let executors = self
            .exprs
            .iter()
            .map(|w| create_executor(w, &self.input_schema, self.config.window_mode))
            .collect::<Result<Vec<_>>>()?;
        let prefix_lens: BTreeSet<usize> =
            self.exprs.iter().map(WindowExpr::key_prefix_len).collect();

        let canonical = &self.exprs[self.canonical];
        let spec = SortSpec {
            partition_by: canonical.partition_by.clone(),
            order_by: canonical.order_by.clone(),
        };
        let partition_prefix = spec.partition_by.len();
        let partition = Arc::new(HashPartitioner::new(
            Arc::clone(&self.input_schema),
            spec,
            self.config.clone(),
        ));
        let bins = partition.bins();

        Ok(Arc::new(WindowGlobalSink {
            executors,
            partition,
            output_schema: Arc::clone(&self.output_schema),
            partition_prefix,
            prefix_lens,
            window_hash_groups: Mutex::new(vec![None; bins]),
        }))
    }

    /// Build a per-thread sink state.
    pub fn local_sink(&self, gsink: &Arc<WindowGlobalSink>) -> WindowLocalSink {
        WindowLocalSink {
            local: gsink.partition.local_sink(),
            rows: 0,
        }
    }

    /// Route one input batch into the thread-local partition sink.
    pub fn sink(&self, lsink: &mut WindowLocalSink, batch: &RecordBatch) -> Result<SinkResult> {
        lsink.local.sink(batch)?;
        lsink.rows += batch.num_rows();
        Ok(SinkResult::NeedMoreInput)
    }

    /// Fold a thread-local sink into the global partition state.
    pub fn combine(
        &self,
        gsink: &Arc<WindowGlobalSink>,
        lsink: WindowLocalSink,
    ) -> Result<SinkCombineResult> {
        global_metrics().record_rows_in("Window", lsink.rows as u64);
        gsink.partition.combine(lsink.local)?;
        Ok(SinkCombineResult::Finished)
    }

    /// Finish the sink phase. Sorts every non-empty bin and instantiates its
    /// hash group; the fully unkeyed shape skips sorting and is materialized
    /// by `global_source` instead.
    pub fn finalize(&self, gsink: &Arc<WindowGlobalSink>) -> Result<SinkFinalize> {
        if gsink.partition.count() == 0 {
            return Ok(SinkFinalize::NoOutputPossible);
        }
        if !gsink.partition.has_sort_work() {
            return Ok(SinkFinalize::Ready);
        }
        if !gsink.partition.has_merge_tasks() {
            return Ok(SinkFinalize::NoOutputPossible);
        }

        let event = PartitionMergeEvent::new(Arc::clone(&gsink.partition));
        let schema = Arc::clone(&self.input_schema);
        event.schedule(|hash_bin, bin| {
            let group = WindowHashGroup::from_sorted_bin(
                hash_bin,
                bin,
                Arc::clone(&schema),
                gsink.partition_prefix,
                &gsink.prefix_lens,
            );
            gsink.set_group(hash_bin, Arc::new(group))
        })?;
        info!(
            rows = gsink.partition.count(),
            external = gsink.partition.external(),
            "window sink finalized"
        );
        Ok(SinkFinalize::Ready)
    }

    /// Build the shared source state and enumerate its task list.
    pub fn global_source(&self, gsink: &Arc<WindowGlobalSink>) -> Result<Arc<WindowSourceState>> {
        // OVER (): nothing was sorted, so the singleton group is built here.
        if gsink.no_groups() && !gsink.partition.has_sort_work() && gsink.partition.count() > 0 {
            let batches = gsink.partition.take_raw_rows()?;
            if !batches.is_empty() {
                let group = WindowHashGroup::from_unsorted(
                    batches,
                    Arc::clone(&self.input_schema),
                    &gsink.prefix_lens,
                );
                gsink.set_group(0, Arc::new(group))?;
            }
        }
        let threads = self.config.effective_worker_threads();
        Ok(Arc::new(WindowSourceState::new(Arc::clone(gsink), threads)?))
    }

    /// Build a per-worker source state.
    pub fn local_source(&self, gsource: &Arc<WindowSourceState>) -> WindowWorkerState {
        WindowWorkerState::new(Arc::clone(gsource))
    }

    /// Poll one worker. A `Blocked` result has registered `interrupt` on the
    /// blocked-task queue; any worker that later makes progress flushes the
    /// queue, so the caller should wait on the handle and poll again. Errors
    /// stop the source and wake every parked worker before propagating.
    pub fn get_data(
        &self,
        gsource: &Arc<WindowSourceState>,
        worker: &mut WindowWorkerState,
        interrupt: &InterruptSignal,
    ) -> Result<SourceResult> {
        match worker.get_data() {
            Ok(WorkerPoll::Batch(batch)) => {
                gsource.update_blocked_tasks(false, interrupt);
                gsource
                    .returned
                    .fetch_add(batch.num_rows(), Ordering::SeqCst);
                global_metrics().record_batch_out("Window", batch.num_rows() as u64);
                Ok(SourceResult::HaveMoreOutput(batch))
            }
            Ok(WorkerPoll::Blocked) => {
                gsource.update_blocked_tasks(true, interrupt);
                Ok(SourceResult::Blocked)
            }
            Ok(WorkerPoll::Finished) => {
                gsource.update_blocked_tasks(false, interrupt);
                Ok(SourceResult::Finished)
            }
            Err(e) => {
                warn!(error = %e, "window worker failed; stopping source");
                gsource.stop();
                Err(e)
            }
        }
    }

    /// Fraction of rows returned, or -1 when the total is unknown.
    pub fn get_progress(&self, gsource: &Arc<WindowSourceState>) -> f64 {
        let count = gsource.gsink().partition.count();
        if count == 0 {
            return -1.0;
        }
        gsource.returned.load(Ordering::SeqCst) as f64 / count as f64
    }

    /// Batch index of the worker's most recent output batch.
    pub fn get_batch_index(&self, worker: &WindowWorkerState) -> usize {
        worker.batch_index
    }
}
