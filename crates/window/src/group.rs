//! Per-partition hash group: sorted rows, boundary masks, executor states, and
//! the phase counters the task scheduler gates on.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use tracing::debug;
use wf_common::{Result, WfError};

use crate::block::{BlockCollection, BlockScanner, RowBlock};
use crate::executor::{ExecutorState, GroupMasks, WindowExecutor};
use crate::mask::{BoundaryMask, BoundaryMaskBuilder};
use crate::partition::SortedBin;

/// Processing stage of a hash group. Transitions are monotone:
/// SINK → FINALIZE → GETDATA → DONE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStage {
    /// Streaming sorted rows through executor sinks.
    Sink,
    /// Building executor auxiliary state.
    Finalize,
    /// Emitting output blocks.
    GetData,
    /// Released; all tasks finished.
    Done,
}

/// One partition bin's worth of sorted rows plus everything the three source
/// stages need. Created when the bin finishes sorting, destroyed as soon as
/// its last task completes.
pub struct WindowHashGroup {
    /// Bin number within the partitioner.
    pub hash_bin: usize,
    /// Rows in this group.
    pub count: usize,
    /// Number of row blocks.
    pub blocks: usize,
    /// Whether the blocks live in spill files.
    pub external: bool,
    rows: BlockCollection,
    /// Partition boundary mask.
    pub partition_mask: Arc<BoundaryMask>,
    /// Peer boundary masks keyed by key-prefix length.
    pub order_masks: HashMap<usize, Arc<BoundaryMask>>,
    gestates: Mutex<Vec<Arc<dyn ExecutorState>>>,
    /// Rows delivered to executor sinks.
    pub sunk: AtomicUsize,
    /// Blocks that completed finalize.
    pub finalized: AtomicUsize,
    /// Scheduled tasks not yet finished; memory is reclaimed at zero.
    pub tasks_remaining: AtomicUsize,
    /// Output batch-index origin for ordered emission.
    pub batch_base: AtomicUsize,
    released: AtomicBool,
}

impl WindowHashGroup {
    /// Build a group from a sorted bin. Masks are computed from the bin's key
    /// tuples, which are dropped here along with the rest of the sort data.
    pub fn from_sorted_bin(
        hash_bin: usize,
        bin: SortedBin,
        schema: SchemaRef,
        partition_prefix: usize,
        prefix_lens: &BTreeSet<usize>,
    ) -> Self {
        let (partition_mask, order_masks) = bin.compute_masks(partition_prefix, prefix_lens);
        let external = bin.external;
        let rows = BlockCollection::new(schema, bin.blocks);
        Self::assemble(hash_bin, rows, external, partition_mask, order_masks)
    }

    /// Build the singleton group for fully unkeyed input: arrival batches
    /// become the blocks, and every mask holds the single universal span.
    pub fn from_unsorted(
        batches: Vec<RecordBatch>,
        schema: SchemaRef,
        prefix_lens: &BTreeSet<usize>,
    ) -> Self {
        let blocks: Vec<RowBlock> = batches
            .into_iter()
            .filter(|b| b.num_rows() > 0)
            .map(RowBlock::Resident)
            .collect();
        let rows = BlockCollection::new(schema, blocks);
        let count = rows.count();
        let single_span = |count: usize| {
            let mut b = BoundaryMaskBuilder::new(count);
            if count > 0 {
                b.set(0);
            }
            b.finish()
        };
        let partition_mask = single_span(count);
        let order_masks = prefix_lens
            .iter()
            .map(|&p| (p, single_span(count)))
            .collect();
        Self::assemble(0, rows, false, partition_mask, order_masks)
    }

    fn assemble(
        hash_bin: usize,
        rows: BlockCollection,
        external: bool,
        partition_mask: BoundaryMask,
        order_masks: HashMap<usize, BoundaryMask>,
    ) -> Self {
        Self {
            hash_bin,
            count: rows.count(),
            blocks: rows.len(),
            external,
            rows,
            partition_mask: Arc::new(partition_mask),
            order_masks: order_masks
                .into_iter()
                .map(|(p, m)| (p, Arc::new(m)))
                .collect(),
            gestates: Mutex::new(Vec::new()),
            sunk: AtomicUsize::new(0),
            finalized: AtomicUsize::new(0),
            tasks_remaining: AtomicUsize::new(0),
            batch_base: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    /// Current stage, derived from the phase counters.
    pub fn stage(&self) -> GroupStage {
        if self.released.load(Ordering::SeqCst) {
            return GroupStage::Done;
        }
        let mut stage = GroupStage::Sink;
        if self.sunk.load(Ordering::SeqCst) == self.count {
            stage = GroupStage::Finalize;
        }
        if self.finalized.load(Ordering::SeqCst) == self.blocks {
            stage = GroupStage::GetData;
        }
        stage
    }

    /// Record rows streamed through executor sinks.
    pub fn add_sunk(&self, rows: usize) -> Result<()> {
        let total = self.sunk.fetch_add(rows, Ordering::SeqCst) + rows;
        if total > self.count {
            return Err(WfError::Internal(format!(
                "group {} sunk {total} of {} rows",
                self.hash_bin, self.count
            )));
        }
        Ok(())
    }

    /// Record blocks that completed finalize.
    pub fn add_finalized(&self, blocks: usize) -> Result<()> {
        let total = self.finalized.fetch_add(blocks, Ordering::SeqCst) + blocks;
        if total > self.blocks {
            return Err(WfError::Internal(format!(
                "group {} finalized {total} of {} blocks",
                self.hash_bin, self.blocks
            )));
        }
        Ok(())
    }

    /// Lazily build per-executor global states, once per group.
    ///
    /// Construction can allocate partition-sized buffers, so it is deferred
    /// until a worker actually starts on the group.
    pub fn initialize(
        &self,
        executors: &[Box<dyn WindowExecutor>],
    ) -> Result<Vec<Arc<dyn ExecutorState>>> {
        let mut gestates = self
            .gestates
            .lock()
            .map_err(|_| WfError::Internal("group state lock poisoned".to_string()))?;
        if gestates.len() == executors.len() {
            return Ok(gestates.clone());
        }
        for executor in executors {
            let order = self
                .order_masks
                .get(&executor.key_prefix_len())
                .ok_or_else(|| {
                    WfError::Internal(format!(
                        "no order mask for key prefix {}",
                        executor.key_prefix_len()
                    ))
                })?;
            let masks = GroupMasks {
                count: self.count,
                partition: Arc::clone(&self.partition_mask),
                order: Arc::clone(order),
            };
            gestates.push(executor.global_state(masks)?);
        }
        Ok(gestates.clone())
    }

    /// Non-flushing scanner for the build (SINK) pass; the block stays
    /// resident for the later evaluate pass.
    pub fn build_scanner(&self, block_idx: usize) -> Result<BlockScanner> {
        self.rows.scan(block_idx, false)
    }

    /// Flushing scanner for the evaluate (GETDATA) pass; the block's memory
    /// is released once scanned.
    pub fn evaluate_scanner(&self, block_idx: usize) -> Result<BlockScanner> {
        self.rows.scan(block_idx, true)
    }

    /// Drop row blocks, masks and executor states. Idempotent.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.rows.release_all();
        if let Ok(mut gestates) = self.gestates.lock() {
            gestates.clear();
        }
        debug!(bin = self.hash_bin, rows = self.count, "hash group released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{HashPartitioner, PartitionMergeEvent, SortSpec};
    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use wf_common::EngineConfig;
    use wf_plan::{Expr, WindowOrderExpr};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    fn batch(values: &[i64]) -> RecordBatch {
        RecordBatch::try_new(
            schema(),
            vec![Arc::new(Int64Array::from(values.to_vec())) as _],
        )
        .expect("batch")
    }

    fn sorted_group(values: &[i64], batch_size: usize) -> WindowHashGroup {
        let config = EngineConfig {
            hash_bins: 1,
            batch_size_rows: batch_size,
            ..EngineConfig::default()
        };
        let part = Arc::new(HashPartitioner::new(
            schema(),
            SortSpec {
                partition_by: vec![],
                order_by: vec![WindowOrderExpr {
                    expr: Expr::Column("v".to_string()),
                    asc: true,
                    nulls_first: false,
                }],
            },
            config,
        ));
        let mut local = part.local_sink();
        local.sink(&batch(values)).expect("sink");
        part.combine(local).expect("combine");
        let out = Mutex::new(None);
        PartitionMergeEvent::new(Arc::clone(&part))
            .schedule(|_, bin| {
                let mut lens = BTreeSet::new();
                lens.insert(1_usize);
                *out.lock().unwrap() = Some(WindowHashGroup::from_sorted_bin(
                    0,
                    bin,
                    schema(),
                    0,
                    &lens,
                ));
                Ok(())
            })
            .expect("schedule");
        out.into_inner().unwrap().expect("group")
    }

    #[test]
    fn stage_follows_counters() {
        let group = sorted_group(&[3, 1, 2, 5], 2);
        assert_eq!(group.count, 4);
        assert_eq!(group.blocks, 2);
        assert_eq!(group.stage(), GroupStage::Sink);
        group.add_sunk(4).expect("sunk");
        assert_eq!(group.stage(), GroupStage::Finalize);
        group.add_finalized(2).expect("finalized");
        assert_eq!(group.stage(), GroupStage::GetData);
        group.release();
        assert_eq!(group.stage(), GroupStage::Done);
    }

    #[test]
    fn counter_overflow_is_an_internal_error() {
        let group = sorted_group(&[1, 2], 2);
        group.add_sunk(2).expect("sunk");
        assert!(group.add_sunk(1).is_err());
    }

    #[test]
    fn unsorted_group_keeps_arrival_blocks() {
        let mut lens = BTreeSet::new();
        lens.insert(0_usize);
        let group =
            WindowHashGroup::from_unsorted(vec![batch(&[7, 3]), batch(&[9, 1])], schema(), &lens);
        assert_eq!(group.count, 4);
        assert_eq!(group.blocks, 2);
        assert!(group.partition_mask.is_boundary(0));
        assert_eq!(group.partition_mask.span_end(0), 4);
        let mut s = group.build_scanner(0).expect("scanner");
        let b = s.scan().expect("rows");
        let vs = arrow::array::Array::as_any(b.column(0))
            .downcast_ref::<Int64Array>()
            .expect("ints");
        assert_eq!(&vs.values()[..], &[7, 3]);
    }

    #[test]
    fn evaluate_scan_flushes_blocks() {
        let group = sorted_group(&[4, 2, 3, 1], 2);
        let mut s = group.evaluate_scanner(0).expect("scanner");
        assert!(s.scan().is_some());
        assert!(group.build_scanner(0).is_err());
        // Block 1 is untouched.
        assert!(group.build_scanner(1).is_ok());
    }
}
