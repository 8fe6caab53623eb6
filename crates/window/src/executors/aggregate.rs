//! Framed aggregate window executor.
//!
//! Sink gathers the argument column into a partition-sized buffer. Finalize
//! builds a fanout-16 segment tree of combinable aggregate states; the build
//! is idempotent so concurrent finalize tasks over disjoint block ranges are
//! safe. Evaluate resolves the frame for each row (ROWS in row offsets,
//! RANGE/GROUPS in peer-group offsets) and answers it from O(log n) tree
//! slices, or by re-aggregating raw values in `separate` mode.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use arrow::array::ArrayRef;
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use wf_common::{Result, WfError, WindowMode};
use wf_plan::{AggKind, Expr, WindowFrameBound, WindowFrameExclusion, WindowFrameSpec, WindowFrameUnits};

use crate::executor::{downcast_gstate, downcast_lstate, ExecutorState, GroupMasks, WindowExecutor};
use crate::scalar::{cmp_scalar, evaluate_expr_scalars, scalar_to_f64, scalars_to_array, ScalarValue};

const TREE_FANOUT: usize = 16;

/// Combinable aggregate accumulator.
#[derive(Debug, Clone)]
enum AggState {
    Count(i64),
    Sum { sum: f64, seen: bool },
    Min(Option<ScalarValue>),
    Max(Option<ScalarValue>),
    Avg { sum: f64, count: i64 },
}

impl AggState {
    fn new(kind: AggKind) -> Self {
        match kind {
            AggKind::Count => AggState::Count(0),
            AggKind::Sum => AggState::Sum {
                sum: 0.0,
                seen: false,
            },
            AggKind::Min => AggState::Min(None),
            AggKind::Max => AggState::Max(None),
            AggKind::Avg => AggState::Avg { sum: 0.0, count: 0 },
        }
    }

    fn accumulate(&mut self, v: &ScalarValue) -> Result<()> {
        if v.is_null() {
            return Ok(());
        }
        match self {
            AggState::Count(n) => *n += 1,
            AggState::Sum { sum, seen } => {
                let x = scalar_to_f64(v).ok_or_else(|| {
                    WfError::Execution("SUM window only supports numeric types".to_string())
                })?;
                *sum += x;
                *seen = true;
            }
            AggState::Avg { sum, count } => {
                let x = scalar_to_f64(v).ok_or_else(|| {
                    WfError::Execution("AVG window only supports numeric types".to_string())
                })?;
                *sum += x;
                *count += 1;
            }
            AggState::Min(current) => {
                let replace = match current {
                    None => true,
                    Some(existing) => cmp_scalar(v, existing, false, true) == Ordering::Less,
                };
                if replace {
                    *current = Some(v.clone());
                }
            }
            AggState::Max(current) => {
                let replace = match current {
                    None => true,
                    Some(existing) => cmp_scalar(v, existing, false, true) == Ordering::Greater,
                };
                if replace {
                    *current = Some(v.clone());
                }
            }
        }
        Ok(())
    }

    fn combine(&mut self, other: &AggState) -> Result<()> {
        match (self, other) {
            (AggState::Count(a), AggState::Count(b)) => *a += b,
            (
                AggState::Sum { sum, seen },
                AggState::Sum {
                    sum: other_sum,
                    seen: other_seen,
                },
            ) => {
                *sum += other_sum;
                *seen |= other_seen;
            }
            (
                AggState::Avg { sum, count },
                AggState::Avg {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *sum += other_sum;
                *count += other_count;
            }
            (AggState::Min(a), AggState::Min(b)) => {
                if let Some(bv) = b {
                    let replace = match a.as_ref() {
                        None => true,
                        Some(av) => cmp_scalar(bv, av, false, true) == Ordering::Less,
                    };
                    if replace {
                        *a = Some(bv.clone());
                    }
                }
            }
            (AggState::Max(a), AggState::Max(b)) => {
                if let Some(bv) = b {
                    let replace = match a.as_ref() {
                        None => true,
                        Some(av) => cmp_scalar(bv, av, false, true) == Ordering::Greater,
                    };
                    if replace {
                        *a = Some(bv.clone());
                    }
                }
            }
            _ => {
                return Err(WfError::Internal(
                    "combined aggregate states of different kinds".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn finish(&self) -> ScalarValue {
        match self {
            AggState::Count(n) => ScalarValue::Int64(*n),
            AggState::Sum { sum, seen } => {
                if *seen {
                    ScalarValue::Float64Bits(sum.to_bits())
                } else {
                    ScalarValue::Null
                }
            }
            AggState::Avg { sum, count } => {
                if *count > 0 {
                    ScalarValue::Float64Bits((sum / *count as f64).to_bits())
                } else {
                    ScalarValue::Null
                }
            }
            AggState::Min(v) | AggState::Max(v) => v.clone().unwrap_or(ScalarValue::Null),
        }
    }
}

/// Segment tree over the gathered argument values.
///
/// Level `l` node `n` covers rows `[n * F^(l+1), (n+1) * F^(l+1))`.
#[derive(Debug)]
struct SegmentTree {
    kind: AggKind,
    levels: Vec<Vec<AggState>>,
}

impl SegmentTree {
    fn build(kind: AggKind, values: &[ScalarValue]) -> Result<Self> {
        let mut levels: Vec<Vec<AggState>> = Vec::new();
        if !values.is_empty() {
            let mut level0 = Vec::with_capacity(values.len().div_ceil(TREE_FANOUT));
            for chunk in values.chunks(TREE_FANOUT) {
                let mut state = AggState::new(kind);
                for v in chunk {
                    state.accumulate(v)?;
                }
                level0.push(state);
            }
            levels.push(level0);
            while levels.last().map(Vec::len).unwrap_or(0) > 1 {
                let next = {
                    let prev = &levels[levels.len() - 1];
                    let mut next = Vec::with_capacity(prev.len().div_ceil(TREE_FANOUT));
                    for chunk in prev.chunks(TREE_FANOUT) {
                        let mut state = AggState::new(kind);
                        for p in chunk {
                            state.combine(p)?;
                        }
                        next.push(state);
                    }
                    next
                };
                levels.push(next);
            }
        }
        Ok(Self { kind, levels })
    }

    fn query(&self, values: &[ScalarValue], begin: usize, end: usize) -> Result<AggState> {
        let mut state = AggState::new(self.kind);
        if begin < end {
            if self.levels.is_empty() {
                for v in &values[begin..end] {
                    state.accumulate(v)?;
                }
            } else {
                self.add_range(values, self.levels.len() - 1, begin, end, &mut state)?;
            }
        }
        Ok(state)
    }

    fn add_range(
        &self,
        values: &[ScalarValue],
        level: usize,
        begin: usize,
        end: usize,
        state: &mut AggState,
    ) -> Result<()> {
        if begin >= end {
            return Ok(());
        }
        let node_cover = TREE_FANOUT.pow(level as u32 + 1);
        let first_node = begin.div_ceil(node_cover);
        let last_node = end / node_cover;
        if first_node >= last_node {
            // No fully covered node here; descend into the ragged span.
            return self.add_below(values, level, begin, end, state);
        }
        let left_end = first_node * node_cover;
        self.add_below(values, level, begin, left_end, state)?;
        for node in first_node..last_node {
            state.combine(&self.levels[level][node])?;
        }
        let right_start = last_node * node_cover;
        self.add_below(values, level, right_start, end, state)
    }

    fn add_below(
        &self,
        values: &[ScalarValue],
        level: usize,
        begin: usize,
        end: usize,
        state: &mut AggState,
    ) -> Result<()> {
        if begin >= end {
            return Ok(());
        }
        if level == 0 {
            for v in &values[begin..end] {
                state.accumulate(v)?;
            }
            Ok(())
        } else {
            self.add_range(values, level - 1, begin, end, state)
        }
    }
}

pub(crate) struct AggregateExecutor {
    agg: AggKind,
    arg: Expr,
    frame: WindowFrameSpec,
    prefix_len: usize,
    out_type: DataType,
    mode: WindowMode,
}

struct AggGlobalState {
    masks: GroupMasks,
    values: Mutex<Vec<ScalarValue>>,
    tree: Mutex<Option<Arc<SegmentTree>>>,
}

/// Per-worker cache of the current partition's peer-group starts.
#[derive(Default)]
struct AggLocalState {
    partition: Option<(usize, usize)>,
    peer_starts: Vec<usize>,
}

impl AggregateExecutor {
    pub(crate) fn new(
        agg: AggKind,
        arg: Expr,
        frame: WindowFrameSpec,
        prefix_len: usize,
        out_type: DataType,
        mode: WindowMode,
    ) -> Self {
        Self {
            agg,
            arg,
            frame,
            prefix_len,
            out_type,
            mode,
        }
    }

    /// Resolve the frame of the row at relative position `i` into row ranges
    /// relative to the partition start.
    fn frame_ranges(
        &self,
        i: usize,
        part_len: usize,
        peer_starts_rel: &[usize],
    ) -> Vec<(usize, usize)> {
        let (fs, fe) = match self.frame.units {
            WindowFrameUnits::Rows => resolve_rows_frame(&self.frame, i, part_len),
            WindowFrameUnits::Range | WindowFrameUnits::Groups => {
                resolve_group_frame(&self.frame, i, part_len, peer_starts_rel)
            }
        };
        let (gs, ge) = peer_bounds(i, part_len, peer_starts_rel);
        apply_exclusion(self.frame.exclusion, i, fs, fe, gs, ge)
    }
}

impl WindowExecutor for AggregateExecutor {
    fn name(&self) -> &'static str {
        match self.agg {
            AggKind::Count => "count",
            AggKind::Sum => "sum",
            AggKind::Min => "min",
            AggKind::Max => "max",
            AggKind::Avg => "avg",
        }
    }

    fn key_prefix_len(&self) -> usize {
        self.prefix_len
    }

    fn output_type(&self) -> &DataType {
        &self.out_type
    }

    fn global_state(&self, masks: GroupMasks) -> Result<Arc<dyn ExecutorState>> {
        let count = masks.count;
        Ok(Arc::new(AggGlobalState {
            masks,
            values: Mutex::new(vec![ScalarValue::Null; count]),
            tree: Mutex::new(None),
        }))
    }

    fn local_state(&self, _gstate: &dyn ExecutorState) -> Result<Box<dyn ExecutorState>> {
        Ok(Box::new(AggLocalState::default()))
    }

    fn sink(
        &self,
        input: &RecordBatch,
        row_idx: usize,
        _total_count: usize,
        gstate: &dyn ExecutorState,
        _lstate: &mut dyn ExecutorState,
    ) -> Result<()> {
        let gstate = downcast_gstate::<AggGlobalState>(gstate, self.name())?;
        let incoming = evaluate_expr_scalars(&self.arg, input)?;
        let mut values = gstate
            .values
            .lock()
            .map_err(|_| WfError::Internal("aggregate buffer lock poisoned".to_string()))?;
        if row_idx + incoming.len() > values.len() {
            return Err(WfError::Internal(format!(
                "aggregate sink range {}..{} exceeds group of {} rows",
                row_idx,
                row_idx + incoming.len(),
                values.len()
            )));
        }
        for (i, v) in incoming.into_iter().enumerate() {
            values[row_idx + i] = v;
        }
        Ok(())
    }

    fn finalize(&self, gstate: &dyn ExecutorState, _lstate: &mut dyn ExecutorState) -> Result<()> {
        if !self.mode.builds_tree() {
            return Ok(());
        }
        let gstate = downcast_gstate::<AggGlobalState>(gstate, self.name())?;
        let mut tree = gstate
            .tree
            .lock()
            .map_err(|_| WfError::Internal("aggregate tree lock poisoned".to_string()))?;
        if tree.is_some() {
            // Another finalize task already built it.
            return Ok(());
        }
        let values = gstate
            .values
            .lock()
            .map_err(|_| WfError::Internal("aggregate buffer lock poisoned".to_string()))?;
        *tree = Some(Arc::new(SegmentTree::build(self.agg, &values)?));
        Ok(())
    }

    fn evaluate(
        &self,
        pos: usize,
        input: &RecordBatch,
        gstate: &dyn ExecutorState,
        lstate: &mut dyn ExecutorState,
    ) -> Result<ArrayRef> {
        let gstate = downcast_gstate::<AggGlobalState>(gstate, self.name())?;
        let lstate = downcast_lstate::<AggLocalState>(lstate, self.name())?;
        let tree = {
            let guard = gstate
                .tree
                .lock()
                .map_err(|_| WfError::Internal("aggregate tree lock poisoned".to_string()))?;
            guard.clone()
        };
        let values = gstate
            .values
            .lock()
            .map_err(|_| WfError::Internal("aggregate buffer lock poisoned".to_string()))?;

        let mut out = Vec::with_capacity(input.num_rows());
        for row in 0..input.num_rows() {
            let p = pos + row;
            let (ps, pe) = gstate.masks.partition_bounds(p);
            if lstate.partition != Some((ps, pe)) {
                lstate.peer_starts = gstate
                    .masks
                    .order
                    .boundaries_in(ps, pe)
                    .into_iter()
                    .map(|b| b - ps)
                    .collect();
                // A coarser order mask may not mark the partition head.
                if lstate.peer_starts.first() != Some(&0) {
                    lstate.peer_starts.insert(0, 0);
                }
                lstate.partition = Some((ps, pe));
            }
            let mut state = AggState::new(self.agg);
            for (rs, re) in self.frame_ranges(p - ps, pe - ps, &lstate.peer_starts) {
                let (abs_start, abs_end) = (ps + rs, ps + re);
                match &tree {
                    Some(tree) => {
                        let part = tree.query(&values, abs_start, abs_end)?;
                        state.combine(&part)?;
                    }
                    None => {
                        for v in &values[abs_start..abs_end] {
                            state.accumulate(v)?;
                        }
                    }
                }
            }
            out.push(state.finish());
        }
        scalars_to_array(&out, &self.out_type)
    }
}

fn resolve_rows_frame(frame: &WindowFrameSpec, i: usize, part_len: usize) -> (usize, usize) {
    let i = i as i64;
    let n = part_len as i64;
    let start = match frame.start_bound {
        WindowFrameBound::UnboundedPreceding => 0,
        WindowFrameBound::Preceding(k) => i - k as i64,
        WindowFrameBound::CurrentRow => i,
        WindowFrameBound::Following(k) => i + k as i64,
        WindowFrameBound::UnboundedFollowing => n,
    };
    let end_inclusive = match frame.end_bound {
        WindowFrameBound::UnboundedPreceding => -1,
        WindowFrameBound::Preceding(k) => i - k as i64,
        WindowFrameBound::CurrentRow => i,
        WindowFrameBound::Following(k) => i + k as i64,
        WindowFrameBound::UnboundedFollowing => n - 1,
    };
    let start = start.clamp(0, n);
    let end = (end_inclusive + 1).clamp(0, n);
    if start >= end {
        (0, 0)
    } else {
        (start as usize, end as usize)
    }
}

/// RANGE and GROUPS frames step over peer groups rather than rows.
fn resolve_group_frame(
    frame: &WindowFrameSpec,
    i: usize,
    part_len: usize,
    peer_starts: &[usize],
) -> (usize, usize) {
    let glen = peer_starts.len() as i64;
    let gcur = peer_starts.partition_point(|&b| b <= i) as i64 - 1;
    let start_g = match frame.start_bound {
        WindowFrameBound::UnboundedPreceding => 0,
        WindowFrameBound::Preceding(k) => gcur - k as i64,
        WindowFrameBound::CurrentRow => gcur,
        WindowFrameBound::Following(k) => gcur + k as i64,
        WindowFrameBound::UnboundedFollowing => glen,
    }
    .clamp(0, glen);
    let end_g_inclusive = match frame.end_bound {
        WindowFrameBound::UnboundedPreceding => -1,
        WindowFrameBound::Preceding(k) => gcur - k as i64,
        WindowFrameBound::CurrentRow => gcur,
        WindowFrameBound::Following(k) => gcur + k as i64,
        WindowFrameBound::UnboundedFollowing => glen - 1,
    }
    .clamp(-1, glen - 1);
    if start_g > end_g_inclusive || start_g >= glen {
        return (0, 0);
    }
    let start_row = peer_starts[start_g as usize];
    let end_row = peer_starts
        .get(end_g_inclusive as usize + 1)
        .copied()
        .unwrap_or(part_len);
    (start_row, end_row)
}

fn peer_bounds(i: usize, part_len: usize, peer_starts: &[usize]) -> (usize, usize) {
    let g = peer_starts.partition_point(|&b| b <= i) - 1;
    let start = peer_starts[g];
    let end = peer_starts.get(g + 1).copied().unwrap_or(part_len);
    (start, end)
}

fn subtract_range(fs: usize, fe: usize, xs: usize, xe: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    if fs < xs.min(fe) {
        out.push((fs, xs.min(fe)));
    }
    if xe.max(fs) < fe {
        out.push((xe.max(fs), fe));
    }
    out
}

fn apply_exclusion(
    exclusion: WindowFrameExclusion,
    i: usize,
    fs: usize,
    fe: usize,
    gs: usize,
    ge: usize,
) -> Vec<(usize, usize)> {
    if fs >= fe {
        return Vec::new();
    }
    match exclusion {
        WindowFrameExclusion::NoOthers => vec![(fs, fe)],
        WindowFrameExclusion::CurrentRow => subtract_range(fs, fe, i, i + 1),
        WindowFrameExclusion::Group => subtract_range(fs, fe, gs, ge),
        WindowFrameExclusion::Ties => {
            let mut out = subtract_range(fs, fe, gs, ge);
            if i >= fs && i < fe {
                out.push((i, i + 1));
            }
            out.sort_unstable();
            out
        }
    }
}
