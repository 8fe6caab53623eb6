//! Executor capability interface and the descriptor-kind factory.
//!
//! Each window function kind is an executor invoked in three phases over a
//! hash group: `sink` streams the sorted rows once, `finalize` builds any
//! auxiliary structure, and `evaluate` produces one output cell per row.
//! Executors are dispatched as a tagged set behind one trait; the factory maps
//! a descriptor to its concrete family.

use std::any::Any;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Schema};
use wf_common::{Result, WfError, WindowMode};
use wf_plan::{WindowExpr, WindowFunc};

use crate::executors::aggregate::AggregateExecutor;
use crate::executors::rank::{RankExecutor, RankKind};
use crate::executors::value::{ValueExecutor, ValueKind};
use crate::mask::BoundaryMask;

/// Opaque executor state, downcast by its owning executor.
pub trait ExecutorState: Send + Sync {
    /// Shared-reference downcast hook.
    fn as_any(&self) -> &dyn Any;
    /// Mutable downcast hook.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send + Sync> ExecutorState for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Row-span context every executor global state is built over.
#[derive(Debug, Clone)]
pub struct GroupMasks {
    /// Rows in the hash group.
    pub count: usize,
    /// Partition boundary mask.
    pub partition: Arc<BoundaryMask>,
    /// Peer-group boundary mask for this executor's key prefix.
    pub order: Arc<BoundaryMask>,
}

impl GroupMasks {
    /// Bounds `[start, end)` of the partition containing `pos`.
    pub fn partition_bounds(&self, pos: usize) -> (usize, usize) {
        (self.partition.span_start(pos), self.partition.span_end(pos))
    }
}

/// One window function algorithm, invoked in sink / finalize / evaluate phases.
///
/// Calls on non-overlapping row ranges of the same global state must be safe;
/// that is this trait's side of the scheduler contract.
pub trait WindowExecutor: Send + Sync {
    /// Stable name for logging and EXPLAIN output.
    fn name(&self) -> &'static str;

    /// Length of the descriptor's key prefix; selects the shared order mask.
    fn key_prefix_len(&self) -> usize;

    /// Output column type.
    fn output_type(&self) -> &DataType;

    /// Per-group state sized to the partition. Built lazily, once per group.
    fn global_state(&self, masks: GroupMasks) -> Result<Arc<dyn ExecutorState>>;

    /// Per-worker state.
    fn local_state(&self, gstate: &dyn ExecutorState) -> Result<Box<dyn ExecutorState>>;

    /// Stream one sorted block through the executor. `row_idx` is the global
    /// position of the block's first row; `total_count` the group size.
    fn sink(
        &self,
        _input: &RecordBatch,
        _row_idx: usize,
        _total_count: usize,
        _gstate: &dyn ExecutorState,
        _lstate: &mut dyn ExecutorState,
    ) -> Result<()> {
        Ok(())
    }

    /// Build auxiliary state once every row is sunk. Concurrent calls on the
    /// same global state must be idempotent.
    fn finalize(&self, _gstate: &dyn ExecutorState, _lstate: &mut dyn ExecutorState) -> Result<()> {
        Ok(())
    }

    /// Compute output values for every row of `input`, whose first row sits at
    /// global position `pos`.
    fn evaluate(
        &self,
        pos: usize,
        input: &RecordBatch,
        gstate: &dyn ExecutorState,
        lstate: &mut dyn ExecutorState,
    ) -> Result<ArrayRef>;
}

/// Map a descriptor to its executor.
pub fn create_executor(
    w: &WindowExpr,
    input_schema: &Schema,
    mode: WindowMode,
) -> Result<Box<dyn WindowExecutor>> {
    let out_type = w.output_type(input_schema)?;
    let prefix_len = w.key_prefix_len();
    let executor: Box<dyn WindowExecutor> = match &w.func {
        WindowFunc::RowNumber => Box::new(RankExecutor::new(RankKind::RowNumber, prefix_len, out_type)),
        WindowFunc::Rank => Box::new(RankExecutor::new(RankKind::Rank, prefix_len, out_type)),
        WindowFunc::DenseRank => {
            Box::new(RankExecutor::new(RankKind::DenseRank, prefix_len, out_type))
        }
        WindowFunc::PercentRank => {
            Box::new(RankExecutor::new(RankKind::PercentRank, prefix_len, out_type))
        }
        WindowFunc::CumeDist => Box::new(RankExecutor::new(RankKind::CumeDist, prefix_len, out_type)),
        WindowFunc::Ntile { buckets } => Box::new(RankExecutor::new(
            RankKind::Ntile(*buckets),
            prefix_len,
            out_type,
        )),
        WindowFunc::Lag {
            expr,
            offset,
            default,
        } => Box::new(ValueExecutor::new(
            ValueKind::Lag(*offset),
            expr.clone(),
            default.clone(),
            prefix_len,
            out_type,
        )),
        WindowFunc::Lead {
            expr,
            offset,
            default,
        } => Box::new(ValueExecutor::new(
            ValueKind::Lead(*offset),
            expr.clone(),
            default.clone(),
            prefix_len,
            out_type,
        )),
        WindowFunc::FirstValue(expr) => Box::new(ValueExecutor::new(
            ValueKind::First,
            expr.clone(),
            None,
            prefix_len,
            out_type,
        )),
        WindowFunc::LastValue(expr) => Box::new(ValueExecutor::new(
            ValueKind::Last,
            expr.clone(),
            None,
            prefix_len,
            out_type,
        )),
        WindowFunc::NthValue { expr, n } => Box::new(ValueExecutor::new(
            ValueKind::Nth(*n),
            expr.clone(),
            None,
            prefix_len,
            out_type,
        )),
        WindowFunc::Aggregate { agg, arg } => Box::new(AggregateExecutor::new(
            *agg,
            arg.clone(),
            w.effective_frame(),
            prefix_len,
            out_type,
            mode,
        )),
    };
    Ok(executor)
}

/// Downcast helper with a uniform internal error.
pub(crate) fn downcast_gstate<'a, T: Any>(gstate: &'a dyn ExecutorState, who: &str) -> Result<&'a T> {
    gstate
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| WfError::Internal(format!("{who}: unexpected global state type")))
}

/// Mutable downcast helper for local states.
pub(crate) fn downcast_lstate<'a, T: Any>(
    lstate: &'a mut dyn ExecutorState,
    who: &str,
) -> Result<&'a mut T> {
    lstate
        .as_any_mut()
        .downcast_mut::<T>()
        .ok_or_else(|| WfError::Internal(format!("{who}: unexpected local state type")))
}

/// Placeholder local state for executors that keep none.
#[derive(Debug, Default)]
pub(crate) struct NoLocalState;
