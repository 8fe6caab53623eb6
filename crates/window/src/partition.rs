//! Hash partitioning and per-bin sorting for the window sink.
//!
//! Architecture role:
//! - per-thread sinks scatter input rows into hash bins keyed on the canonical
//!   PARTITION BY expressions
//! - `combine` folds thread-local buffers into the global state
//! - the merge event sorts every non-empty bin by (partition, order) keys and
//!   hands sorted bins to the window sink, which turns them into hash groups
//!
//! Three partition shapes exist, mirroring the operator's planning rules:
//! 1. no partition keys, no order keys: a single unsorted bin in input order
//! 2. no partition keys, order keys: a single globally sorted bin
//! 3. partition keys: `hash_bins` bins, each sorted independently

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use rayon::prelude::*;
use tracing::{debug, info};
use wf_common::{global_metrics, EngineConfig, Result, WfError};
use wf_plan::{Expr, WindowOrderExpr};

use crate::block::{spill_write, RowBlock};
use crate::mask::{BoundaryMask, BoundaryMaskBuilder};
use crate::scalar::{
    batch_to_rows, cmp_key_sets, cmp_order_key_sets, cmp_scalar, evaluate_expr_scalars,
    rows_to_batch, ScalarValue,
};

/// Canonical grouping and ordering keys shared by every bin.
#[derive(Debug, Clone)]
pub struct SortSpec {
    /// PARTITION BY expressions of the canonical descriptor.
    pub partition_by: Vec<Expr>,
    /// ORDER BY expressions of the canonical descriptor.
    pub order_by: Vec<WindowOrderExpr>,
}

impl SortSpec {
    /// Total key count: partition keys followed by order keys.
    pub fn key_count(&self) -> usize {
        self.partition_by.len() + self.order_by.len()
    }

    /// Whether finalize has to sort anything at all.
    pub fn has_sort_work(&self) -> bool {
        !self.partition_by.is_empty() || !self.order_by.is_empty()
    }
}

/// One sorted hash bin, ready to become a window hash group.
///
/// Holds the sorted payload blocks plus the sorted key tuples the masks are
/// computed from; the key tuples are dropped as soon as the group materializes.
#[derive(Debug)]
pub struct SortedBin {
    /// Row count in this bin.
    pub count: usize,
    /// Whether the blocks live in spill files.
    pub external: bool,
    /// Sorted payload blocks of at most `batch_size_rows` rows each.
    pub blocks: Vec<RowBlock>,
    key_rows: Vec<Vec<ScalarValue>>,
}

impl SortedBin {
    /// Walk the sorted key tuples once and mark every prefix-change boundary.
    ///
    /// Returns the partition mask (prefix = `partition_prefix`) and one order
    /// mask per requested prefix length. Bit 0 is always set.
    pub fn compute_masks(
        &self,
        partition_prefix: usize,
        prefix_lens: &BTreeSet<usize>,
    ) -> (BoundaryMask, HashMap<usize, BoundaryMask>) {
        let key_count = self.key_rows.first().map(|r| r.len()).unwrap_or(0);
        let mut partition = BoundaryMaskBuilder::new(self.count);
        let mut orders: HashMap<usize, BoundaryMaskBuilder> = prefix_lens
            .iter()
            .map(|&p| (p, BoundaryMaskBuilder::new(self.count)))
            .collect();
        for i in 0..self.count {
            let lcp = if i == 0 {
                // Row 0 starts every span.
                0
            } else {
                shared_prefix_len(&self.key_rows[i - 1], &self.key_rows[i])
            };
            if i == 0 || lcp < partition_prefix.min(key_count) {
                partition.set(i);
            }
            for (&p, builder) in orders.iter_mut() {
                if i == 0 || lcp < p.min(key_count) {
                    builder.set(i);
                }
            }
        }
        (
            partition.finish(),
            orders.into_iter().map(|(p, b)| (p, b.finish())).collect(),
        )
    }
}

fn shared_prefix_len(a: &[ScalarValue], b: &[ScalarValue]) -> usize {
    let mut lcp = 0;
    while lcp < a.len() && cmp_scalar(&a[lcp], &b[lcp], false, true) == Ordering::Equal {
        lcp += 1;
    }
    lcp
}

/// Global partitioning state shared by every sink thread.
#[derive(Debug)]
pub struct HashPartitioner {
    schema: SchemaRef,
    spec: SortSpec,
    config: EngineConfig,
    bins: usize,
    spill_tag: String,
    count: AtomicUsize,
    external: AtomicBool,
    buffered: Mutex<Vec<Vec<RecordBatch>>>,
}

impl HashPartitioner {
    /// Create the global state. Single-key-less shapes collapse to one bin.
    pub fn new(schema: SchemaRef, spec: SortSpec, config: EngineConfig) -> Self {
        let bins = if spec.partition_by.is_empty() {
            1
        } else {
            config.hash_bins
        };
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Self {
            schema,
            spec,
            config,
            bins,
            spill_tag: format!("wf_sort_{nanos}"),
            count: AtomicUsize::new(0),
            external: AtomicBool::new(false),
            buffered: Mutex::new(vec![Vec::new(); bins]),
        }
    }

    /// Number of hash bins.
    pub fn bins(&self) -> usize {
        self.bins
    }

    /// Input schema of the partitioned payload.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Canonical sort keys.
    pub fn sort_spec(&self) -> &SortSpec {
        &self.spec
    }

    /// Rows sunk so far across all threads.
    pub fn count(&self) -> usize {
        self.count.load(AtomicOrdering::SeqCst)
    }

    /// Whether any bin spilled its sorted blocks.
    pub fn external(&self) -> bool {
        self.external.load(AtomicOrdering::SeqCst)
    }

    /// Whether finalize needs to schedule the merge event.
    pub fn has_sort_work(&self) -> bool {
        self.spec.has_sort_work()
    }

    /// Whether the merge event would have anything to do.
    pub fn has_merge_tasks(&self) -> bool {
        self.buffered
            .lock()
            .map(|buffered| buffered.iter().any(|b| !b.is_empty()))
            .unwrap_or(false)
    }

    /// Create a per-thread sink.
    pub fn local_sink(self: &Arc<Self>) -> LocalPartitionSink {
        LocalPartitionSink {
            part: Arc::clone(self),
            pending: vec![Vec::new(); self.bins],
            batches: vec![Vec::new(); self.bins],
            rows: 0,
        }
    }

    /// Fold one thread-local sink into the global state.
    pub fn combine(&self, mut local: LocalPartitionSink) -> Result<()> {
        for k in 0..self.bins {
            local.flush_bin(k)?;
        }
        let mut buffered = self
            .buffered
            .lock()
            .map_err(|_| WfError::Internal("partition buffer lock poisoned".to_string()))?;
        for (k, batches) in local.batches.into_iter().enumerate() {
            buffered[k].extend(batches);
        }
        self.count.fetch_add(local.rows, AtomicOrdering::SeqCst);
        Ok(())
    }

    /// Take the raw arrival-order batches of the single unsorted bin.
    pub fn take_raw_rows(&self) -> Result<Vec<RecordBatch>> {
        self.take_bin(0)
    }

    fn take_bin(&self, k: usize) -> Result<Vec<RecordBatch>> {
        let mut buffered = self
            .buffered
            .lock()
            .map_err(|_| WfError::Internal("partition buffer lock poisoned".to_string()))?;
        Ok(std::mem::take(&mut buffered[k]))
    }

    fn sort_bin(&self, k: usize) -> Result<Option<SortedBin>> {
        let batches = self.take_bin(k)?;
        if batches.is_empty() {
            return Ok(None);
        }

        let mut rows = Vec::new();
        let mut keys: Vec<Vec<ScalarValue>> = vec![Vec::new(); self.spec.key_count()];
        for batch in &batches {
            rows.extend(batch_to_rows(batch)?);
            let mut key_idx = 0;
            for expr in &self.spec.partition_by {
                keys[key_idx].extend(evaluate_expr_scalars(expr, batch)?);
                key_idx += 1;
            }
            for order in &self.spec.order_by {
                keys[key_idx].extend(evaluate_expr_scalars(&order.expr, batch)?);
                key_idx += 1;
            }
        }

        let partition_prefix = self.spec.partition_by.len();
        let mut index: Vec<usize> = (0..rows.len()).collect();
        // Stable sort keeps arrival order as the final tiebreak.
        index.sort_by(|&a, &b| {
            cmp_key_sets(&keys[..partition_prefix], a, b).then_with(|| {
                cmp_order_key_sets(&keys[partition_prefix..], &self.spec.order_by, a, b)
            })
        });

        let key_rows: Vec<Vec<ScalarValue>> = index
            .iter()
            .map(|&i| keys.iter().map(|key| key[i].clone()).collect())
            .collect();
        let sorted_rows: Vec<Vec<ScalarValue>> =
            index.into_iter().map(|i| std::mem::take(&mut rows[i])).collect();

        let estimated_bytes: usize = sorted_rows
            .iter()
            .flat_map(|r| r.iter())
            .map(ScalarValue::estimated_bytes)
            .sum();
        let budget = self.config.mem_budget_bytes / self.bins.max(1);
        let external = estimated_bytes > budget;

        let mut blocks = Vec::new();
        let spill_started = Instant::now();
        let mut spill_bytes = 0_u64;
        for (block_idx, chunk) in sorted_rows.chunks(self.config.batch_size_rows).enumerate() {
            let batch = rows_to_batch(&self.schema, chunk)?;
            if external {
                let path = std::path::Path::new(&self.config.spill_dir)
                    .join(format!("{}_bin{k}_block{block_idx}.ipc", self.spill_tag));
                spill_bytes += spill_write(&batch, &path)?;
                blocks.push(RowBlock::Spilled {
                    path,
                    rows: batch.num_rows(),
                });
            } else {
                blocks.push(RowBlock::Resident(batch));
            }
        }
        if external {
            self.external.store(true, AtomicOrdering::SeqCst);
            global_metrics().record_spill(
                "Window",
                spill_bytes,
                spill_started.elapsed().as_secs_f64(),
            );
            debug!(bin = k, bytes = spill_bytes, "sorted bin spilled");
        }

        Ok(Some(SortedBin {
            count: key_rows.len(),
            external,
            blocks,
            key_rows,
        }))
    }
}

/// Per-thread partition sink.
#[derive(Debug)]
pub struct LocalPartitionSink {
    part: Arc<HashPartitioner>,
    pending: Vec<Vec<Vec<ScalarValue>>>,
    batches: Vec<Vec<RecordBatch>>,
    rows: usize,
}

impl LocalPartitionSink {
    /// Route one input batch into this thread's bin buffers.
    pub fn sink(&mut self, batch: &RecordBatch) -> Result<()> {
        self.rows += batch.num_rows();
        if self.part.spec.partition_by.is_empty() {
            // Single-bin shapes keep arrival batches whole; the merge event
            // (or direct materialization) re-slices them.
            self.batches[0].push(batch.clone());
            return Ok(());
        }

        let keys = self
            .part
            .spec
            .partition_by
            .iter()
            .map(|e| evaluate_expr_scalars(e, batch))
            .collect::<Result<Vec<_>>>()?;
        let rows = batch_to_rows(batch)?;
        for (row_idx, row) in rows.into_iter().enumerate() {
            let mut hasher = DefaultHasher::new();
            for key in &keys {
                key[row_idx].hash(&mut hasher);
            }
            let bin = (hasher.finish() as usize) % self.part.bins;
            self.pending[bin].push(row);
            if self.pending[bin].len() >= self.part.config.batch_size_rows {
                self.flush_bin(bin)?;
            }
        }
        Ok(())
    }

    fn flush_bin(&mut self, k: usize) -> Result<()> {
        if self.pending[k].is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.pending[k]);
        let batch = rows_to_batch(&self.part.schema, &rows)?;
        self.batches[k].push(batch);
        Ok(())
    }
}

/// Sorts every non-empty bin and reports each to the window sink.
pub struct PartitionMergeEvent {
    part: Arc<HashPartitioner>,
}

impl PartitionMergeEvent {
    /// Wrap the global partition state.
    pub fn new(part: Arc<HashPartitioner>) -> Self {
        Self { part }
    }

    /// Run all bin sorts, largest fan-out first is unnecessary here: rayon
    /// work-steals across bins. `on_sorted` fires once per non-empty bin.
    pub fn schedule<F>(&self, on_sorted: F) -> Result<()>
    where
        F: Fn(usize, SortedBin) -> Result<()> + Send + Sync,
    {
        let bins = self.part.bins();
        info!(
            bins,
            rows = self.part.count(),
            "window partition sort scheduled"
        );
        (0..bins)
            .into_par_iter()
            .map(|k| {
                if let Some(sorted) = self.part.sort_bin(k)? {
                    debug!(bin = k, rows = sorted.count, "bin sorted");
                    on_sorted(k, sorted)?;
                }
                Ok(())
            })
            .collect::<Result<Vec<()>>>()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow_schema::{DataType, Field, Schema};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("g", DataType::Utf8, false),
            Field::new("v", DataType::Int64, false),
        ]))
    }

    fn batch(gs: &[&str], vs: &[i64]) -> RecordBatch {
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(StringArray::from(gs.to_vec())) as _,
                Arc::new(Int64Array::from(vs.to_vec())) as _,
            ],
        )
        .expect("batch")
    }

    fn spec_partition_g_order_v() -> SortSpec {
        SortSpec {
            partition_by: vec![Expr::Column("g".to_string())],
            order_by: vec![WindowOrderExpr {
                expr: Expr::Column("v".to_string()),
                asc: true,
                nulls_first: false,
            }],
        }
    }

    fn sort_all(part: &Arc<HashPartitioner>) -> Vec<(usize, SortedBin)> {
        let collected = Mutex::new(Vec::new());
        PartitionMergeEvent::new(Arc::clone(part))
            .schedule(|k, bin| {
                collected.lock().unwrap().push((k, bin));
                Ok(())
            })
            .expect("schedule");
        let mut bins = collected.into_inner().unwrap();
        bins.sort_by_key(|(k, _)| *k);
        bins
    }

    #[test]
    fn bin_counts_sum_to_input_rows() {
        let config = EngineConfig {
            hash_bins: 4,
            batch_size_rows: 2,
            ..EngineConfig::default()
        };
        let part = Arc::new(HashPartitioner::new(
            schema(),
            spec_partition_g_order_v(),
            config,
        ));
        let mut local = part.local_sink();
        local
            .sink(&batch(&["a", "b", "a", "c", "b"], &[3, 1, 2, 9, 4]))
            .expect("sink");
        part.combine(local).expect("combine");
        assert_eq!(part.count(), 5);

        let bins = sort_all(&part);
        let total: usize = bins.iter().map(|(_, b)| b.count).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn rows_of_one_partition_land_in_one_bin_sorted() {
        let config = EngineConfig {
            hash_bins: 4,
            batch_size_rows: 1024,
            ..EngineConfig::default()
        };
        let part = Arc::new(HashPartitioner::new(
            schema(),
            spec_partition_g_order_v(),
            config,
        ));
        let mut local = part.local_sink();
        local
            .sink(&batch(&["a", "a", "a"], &[3, 1, 2]))
            .expect("sink");
        part.combine(local).expect("combine");

        let bins = sort_all(&part);
        assert_eq!(bins.len(), 1);
        let bin = &bins[0].1;
        assert_eq!(bin.count, 3);
        let RowBlock::Resident(block) = &bin.blocks[0] else {
            panic!("expected resident block");
        };
        let vs = block
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("v");
        assert_eq!(&vs.values()[..], &[1, 2, 3]);
    }

    #[test]
    fn masks_mark_partition_and_peer_boundaries() {
        let config = EngineConfig {
            hash_bins: 1,
            ..EngineConfig::default()
        };
        let part = Arc::new(HashPartitioner::new(
            schema(),
            spec_partition_g_order_v(),
            config,
        ));
        let mut local = part.local_sink();
        local
            .sink(&batch(&["a", "a", "a", "b"], &[1, 1, 2, 5]))
            .expect("sink");
        part.combine(local).expect("combine");

        let bins = sort_all(&part);
        let bin = &bins[0].1;
        let mut lens = BTreeSet::new();
        lens.insert(2_usize);
        let (partition_mask, order_masks) = bin.compute_masks(1, &lens);
        // Sorted: (a,1) (a,1) (a,2) (b,5)
        assert_eq!(partition_mask.boundaries_in(0, 4), vec![0, 3]);
        assert_eq!(order_masks[&2].boundaries_in(0, 4), vec![0, 2, 3]);
    }

    #[test]
    fn tiny_budget_spills_sorted_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            hash_bins: 1,
            batch_size_rows: 2,
            mem_budget_bytes: 1,
            spill_dir: dir.path().to_string_lossy().into_owned(),
            ..EngineConfig::default()
        };
        let part = Arc::new(HashPartitioner::new(
            schema(),
            spec_partition_g_order_v(),
            config,
        ));
        let mut local = part.local_sink();
        local
            .sink(&batch(&["a", "a", "a", "a"], &[4, 3, 2, 1]))
            .expect("sink");
        part.combine(local).expect("combine");

        let bins = sort_all(&part);
        let bin = &bins[0].1;
        assert!(bin.external);
        assert!(part.external());
        assert_eq!(bin.blocks.len(), 2);
        assert!(matches!(bin.blocks[0], RowBlock::Spilled { .. }));
    }
}
