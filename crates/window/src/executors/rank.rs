//! Rank-family executors: ROW_NUMBER, RANK, DENSE_RANK, PERCENT_RANK,
//! CUME_DIST, NTILE.
//!
//! These are pure mask readers: sink and finalize are no-ops, and evaluate
//! derives every value from the partition and peer boundary masks.

use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use wf_common::{Result, WfError};

use crate::executor::{
    downcast_gstate, ExecutorState, GroupMasks, NoLocalState, WindowExecutor,
};
use crate::scalar::{scalars_to_array, ScalarValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RankKind {
    RowNumber,
    Rank,
    DenseRank,
    PercentRank,
    CumeDist,
    Ntile(i64),
}

pub(crate) struct RankExecutor {
    kind: RankKind,
    prefix_len: usize,
    out_type: DataType,
}

struct RankGlobalState {
    masks: GroupMasks,
}

impl RankExecutor {
    pub(crate) fn new(kind: RankKind, prefix_len: usize, out_type: DataType) -> Self {
        Self {
            kind,
            prefix_len,
            out_type,
        }
    }
}

impl WindowExecutor for RankExecutor {
    fn name(&self) -> &'static str {
        match self.kind {
            RankKind::RowNumber => "row_number",
            RankKind::Rank => "rank",
            RankKind::DenseRank => "dense_rank",
            RankKind::PercentRank => "percent_rank",
            RankKind::CumeDist => "cume_dist",
            RankKind::Ntile(_) => "ntile",
        }
    }

    fn key_prefix_len(&self) -> usize {
        self.prefix_len
    }

    fn output_type(&self) -> &DataType {
        &self.out_type
    }

    fn global_state(&self, masks: GroupMasks) -> Result<Arc<dyn ExecutorState>> {
        Ok(Arc::new(RankGlobalState { masks }))
    }

    fn local_state(&self, _gstate: &dyn ExecutorState) -> Result<Box<dyn ExecutorState>> {
        Ok(Box::new(NoLocalState))
    }

    fn evaluate(
        &self,
        pos: usize,
        input: &RecordBatch,
        gstate: &dyn ExecutorState,
        _lstate: &mut dyn ExecutorState,
    ) -> Result<ArrayRef> {
        let gstate = downcast_gstate::<RankGlobalState>(gstate, self.name())?;
        let masks = &gstate.masks;
        let mut out = Vec::with_capacity(input.num_rows());
        for row in 0..input.num_rows() {
            let p = pos + row;
            let (ps, pe) = masks.partition_bounds(p);
            let value = match self.kind {
                RankKind::RowNumber => ScalarValue::Int64((p - ps + 1) as i64),
                RankKind::Rank => {
                    let peer_start = masks.order.span_start(p).max(ps);
                    ScalarValue::Int64((peer_start - ps + 1) as i64)
                }
                RankKind::DenseRank => {
                    ScalarValue::Int64(masks.order.count_boundaries(ps, p + 1).max(1) as i64)
                }
                RankKind::PercentRank => {
                    let part_len = pe - ps;
                    if part_len <= 1 {
                        ScalarValue::Float64Bits(0.0_f64.to_bits())
                    } else {
                        let peer_start = masks.order.span_start(p).max(ps);
                        let rank = (peer_start - ps + 1) as f64;
                        ScalarValue::Float64Bits(
                            ((rank - 1.0) / (part_len as f64 - 1.0)).to_bits(),
                        )
                    }
                }
                RankKind::CumeDist => {
                    let peer_end = masks.order.span_end(p).min(pe);
                    let cume = (peer_end - ps) as f64 / (pe - ps) as f64;
                    ScalarValue::Float64Bits(cume.to_bits())
                }
                RankKind::Ntile(buckets) => {
                    if buckets <= 0 {
                        return Err(WfError::Execution(format!(
                            "NTILE must be greater than zero, got {buckets}"
                        )));
                    }
                    let buckets = buckets as usize;
                    let part_len = pe - ps;
                    let i = p - ps;
                    let base = part_len / buckets;
                    let rem = part_len % buckets;
                    let tile = if i < rem * (base + 1) {
                        i / (base + 1)
                    } else {
                        rem + (i - rem * (base + 1)) / base.max(1)
                    };
                    ScalarValue::Int64((tile + 1) as i64)
                }
            };
            out.push(value);
        }
        scalars_to_array(&out, &self.out_type)
    }
}
