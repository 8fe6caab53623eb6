//! Value-family executors: LEAD, LAG, FIRST_VALUE, LAST_VALUE, NTH_VALUE.
//!
//! Sink gathers the argument column (and the LEAD/LAG default column) into a
//! partition-sized buffer at the block's row positions; evaluate indexes the
//! buffer within partition bounds.

use std::sync::{Arc, Mutex};

use arrow::array::ArrayRef;
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use wf_common::{Result, WfError};
use wf_plan::Expr;

use crate::executor::{
    downcast_gstate, ExecutorState, GroupMasks, NoLocalState, WindowExecutor,
};
use crate::scalar::{evaluate_expr_scalars, scalars_to_array, ScalarValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueKind {
    Lag(usize),
    Lead(usize),
    First,
    Last,
    Nth(i64),
}

pub(crate) struct ValueExecutor {
    kind: ValueKind,
    arg: Expr,
    default: Option<Expr>,
    prefix_len: usize,
    out_type: DataType,
}

struct GatherState {
    masks: GroupMasks,
    values: Mutex<Vec<ScalarValue>>,
    defaults: Option<Mutex<Vec<ScalarValue>>>,
}

impl ValueExecutor {
    pub(crate) fn new(
        kind: ValueKind,
        arg: Expr,
        default: Option<Expr>,
        prefix_len: usize,
        out_type: DataType,
    ) -> Self {
        Self {
            kind,
            arg,
            default,
            prefix_len,
            out_type,
        }
    }

    fn gather(dest: &Mutex<Vec<ScalarValue>>, row_idx: usize, values: Vec<ScalarValue>) -> Result<()> {
        let mut dest = dest
            .lock()
            .map_err(|_| WfError::Internal("gather buffer lock poisoned".to_string()))?;
        if row_idx + values.len() > dest.len() {
            return Err(WfError::Internal(format!(
                "gather range {}..{} exceeds group of {} rows",
                row_idx,
                row_idx + values.len(),
                dest.len()
            )));
        }
        for (i, v) in values.into_iter().enumerate() {
            dest[row_idx + i] = v;
        }
        Ok(())
    }
}

impl WindowExecutor for ValueExecutor {
    fn name(&self) -> &'static str {
        match self.kind {
            ValueKind::Lag(_) => "lag",
            ValueKind::Lead(_) => "lead",
            ValueKind::First => "first_value",
            ValueKind::Last => "last_value",
            ValueKind::Nth(_) => "nth_value",
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
        Ok(Arc::new(GatherState {
            masks,
            values: Mutex::new(vec![ScalarValue::Null; count]),
            defaults: self
                .default
                .as_ref()
                .map(|_| Mutex::new(vec![ScalarValue::Null; count])),
        }))
    }

    fn local_state(&self, _gstate: &dyn ExecutorState) -> Result<Box<dyn ExecutorState>> {
        Ok(Box::new(NoLocalState))
    }

    fn sink(
        &self,
        input: &RecordBatch,
        row_idx: usize,
        _total_count: usize,
        gstate: &dyn ExecutorState,
        _lstate: &mut dyn ExecutorState,
    ) -> Result<()> {
        let gstate = downcast_gstate::<GatherState>(gstate, self.name())?;
        Self::gather(&gstate.values, row_idx, evaluate_expr_scalars(&self.arg, input)?)?;
        if let (Some(default), Some(dest)) = (&self.default, &gstate.defaults) {
            Self::gather(dest, row_idx, evaluate_expr_scalars(default, input)?)?;
        }
        Ok(())
    }

    fn evaluate(
        &self,
        pos: usize,
        input: &RecordBatch,
        gstate: &dyn ExecutorState,
        _lstate: &mut dyn ExecutorState,
    ) -> Result<ArrayRef> {
        let gstate = downcast_gstate::<GatherState>(gstate, self.name())?;
        let values = gstate
            .values
            .lock()
            .map_err(|_| WfError::Internal("gather buffer lock poisoned".to_string()))?;
        let defaults = match &gstate.defaults {
            Some(d) => Some(
                d.lock()
                    .map_err(|_| WfError::Internal("gather buffer lock poisoned".to_string()))?,
            ),
            None => None,
        };

        let mut out = Vec::with_capacity(input.num_rows());
        for row in 0..input.num_rows() {
            let p = pos + row;
            let (ps, pe) = gstate.masks.partition_bounds(p);
            let value = match self.kind {
                ValueKind::Lag(offset) => {
                    if p >= ps + offset {
                        values[p - offset].clone()
                    } else if let Some(d) = &defaults {
                        d[p].clone()
                    } else {
                        ScalarValue::Null
                    }
                }
                ValueKind::Lead(offset) => {
                    if p + offset < pe {
                        values[p + offset].clone()
                    } else if let Some(d) = &defaults {
                        d[p].clone()
                    } else {
                        ScalarValue::Null
                    }
                }
                ValueKind::First => values[ps].clone(),
                ValueKind::Last => values[pe - 1].clone(),
                ValueKind::Nth(n) => {
                    if n < 1 {
                        return Err(WfError::Execution(format!(
                            "NTH_VALUE requires a positive index, got {n}"
                        )));
                    }
                    let target = ps + (n as usize) - 1;
                    if target < pe {
                        values[target].clone()
                    } else {
                        ScalarValue::Null
                    }
                }
            };
            out.push(value);
        }
        scalars_to_array(&out, &self.out_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::BoundaryMaskBuilder;
    use arrow::array::{Array, Int64Array};
    use arrow_schema::{Field, Schema};
    use wf_plan::LiteralValue;

    fn masks(count: usize, partitions: &[usize]) -> GroupMasks {
        let mut p = BoundaryMaskBuilder::new(count);
        for &i in partitions {
            p.set(i);
        }
        let mut o = BoundaryMaskBuilder::new(count);
        o.set(0);
        GroupMasks {
            count,
            partition: Arc::new(p.finish()),
            order: Arc::new(o.finish()),
        }
    }

    fn batch(values: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(values.to_vec())) as _],
        )
        .expect("batch")
    }

    fn eval_kind(kind: ValueKind, default: Option<Expr>, parts: &[usize], values: &[i64]) -> Vec<Option<i64>> {
        let exec = ValueExecutor::new(
            kind,
            Expr::Column("v".to_string()),
            default,
            0,
            DataType::Int64,
        );
        let g = exec
            .global_state(masks(values.len(), parts))
            .expect("gstate");
        let mut l = exec.local_state(g.as_ref()).expect("lstate");
        let input = batch(values);
        exec.sink(&input, 0, values.len(), g.as_ref(), l.as_mut())
            .expect("sink");
        let arr = exec
            .evaluate(0, &input, g.as_ref(), l.as_mut())
            .expect("evaluate");
        let ints = arrow::array::Array::as_any(&arr)
            .downcast_ref::<Int64Array>()
            .expect("ints");
        (0..ints.len())
            .map(|i| (!ints.is_null(i)).then(|| ints.value(i)))
            .collect()
    }

    #[test]
    fn lead_with_default_stops_at_partition_end() {
        // Partitions [0,3) and [3,4).
        let out = eval_kind(
            ValueKind::Lead(1),
            Some(Expr::Literal(LiteralValue::Int64(-1))),
            &[0, 3],
            &[10, 20, 30, 100],
        );
        assert_eq!(
            out,
            vec![Some(20), Some(30), Some(-1), Some(-1)]
        );
    }

    #[test]
    fn lag_without_default_yields_null() {
        let out = eval_kind(ValueKind::Lag(2), None, &[0], &[1, 2, 3]);
        assert_eq!(out, vec![None, None, Some(1)]);
    }

    #[test]
    fn first_last_and_nth() {
        let out = eval_kind(ValueKind::First, None, &[0, 2], &[5, 6, 7, 8]);
        assert_eq!(out, vec![Some(5), Some(5), Some(7), Some(7)]);
        let out = eval_kind(ValueKind::Last, None, &[0, 2], &[5, 6, 7, 8]);
        assert_eq!(out, vec![Some(6), Some(6), Some(8), Some(8)]);
        let out = eval_kind(ValueKind::Nth(2), None, &[0, 2], &[5, 6, 7, 8]);
        assert_eq!(out, vec![Some(6), Some(6), Some(8), Some(8)]);
        let out = eval_kind(ValueKind::Nth(3), None, &[0, 2], &[5, 6, 7, 8]);
        assert_eq!(out, vec![None, None, None, None]);
    }

    #[test]
    fn nth_below_one_is_a_user_error() {
        let exec = ValueExecutor::new(
            ValueKind::Nth(0),
            Expr::Column("v".to_string()),
            None,
            0,
            DataType::Int64,
        );
        let g = exec.global_state(masks(2, &[0])).expect("gstate");
        let mut l = exec.local_state(g.as_ref()).expect("lstate");
        let input = batch(&[1, 2]);
        exec.sink(&input, 0, 2, g.as_ref(), l.as_mut()).expect("sink");
        let err = exec
            .evaluate(0, &input, g.as_ref(), l.as_mut())
            .unwrap_err();
        assert!(err.to_string().contains("NTH_VALUE"));
    }
}
