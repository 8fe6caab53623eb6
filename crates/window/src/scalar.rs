//! Scalar row values used for key comparison, row scatter, and executor state.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder,
};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use wf_common::{Result, WfError};
use wf_plan::{Expr, LiteralValue, WindowOrderExpr};

/// One cell of a row, detached from its Arrow column.
///
/// Floats are carried as bit patterns so the type can be `Eq + Hash` and usable
/// as a partition key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalarValue {
    Int64(i64),
    Float64Bits(u64),
    Utf8(String),
    Boolean(bool),
    Null,
}

impl ScalarValue {
    /// Whether this value is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    /// Rough heap footprint, used for spill decisions.
    pub fn estimated_bytes(&self) -> usize {
        match self {
            ScalarValue::Utf8(s) => 8 + s.len(),
            _ => 8,
        }
    }
}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Int64(v) => {
                0_u8.hash(state);
                v.hash(state);
            }
            Self::Float64Bits(v) => {
                1_u8.hash(state);
                v.hash(state);
            }
            Self::Utf8(v) => {
                2_u8.hash(state);
                v.hash(state);
            }
            Self::Boolean(v) => {
                3_u8.hash(state);
                v.hash(state);
            }
            Self::Null => 4_u8.hash(state),
        }
    }
}

/// Read one cell out of an array.
pub fn scalar_from_array(array: &ArrayRef, row: usize) -> Result<ScalarValue> {
    if array.is_null(row) {
        return Ok(ScalarValue::Null);
    }
    match array.data_type() {
        DataType::Int64 => {
            let a = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| WfError::Execution("expected Int64Array".to_string()))?;
            Ok(ScalarValue::Int64(a.value(row)))
        }
        DataType::Float64 => {
            let a = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| WfError::Execution("expected Float64Array".to_string()))?;
            Ok(ScalarValue::Float64Bits(a.value(row).to_bits()))
        }
        DataType::Utf8 => {
            let a = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| WfError::Execution("expected StringArray".to_string()))?;
            Ok(ScalarValue::Utf8(a.value(row).to_string()))
        }
        DataType::Boolean => {
            let a = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| WfError::Execution("expected BooleanArray".to_string()))?;
            Ok(ScalarValue::Boolean(a.value(row)))
        }
        other => Err(WfError::Unsupported(format!(
            "scalar type not supported yet: {other:?}"
        ))),
    }
}

/// Build a typed array back out of scalar cells.
pub fn scalars_to_array(values: &[ScalarValue], dt: &DataType) -> Result<ArrayRef> {
    match dt {
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Int64(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    _ => {
                        return Err(WfError::Execution(
                            "type mismatch while building Int64 array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Float64Bits(x) => b.append_value(f64::from_bits(*x)),
                    ScalarValue::Int64(x) => b.append_value(*x as f64),
                    ScalarValue::Null => b.append_null(),
                    _ => {
                        return Err(WfError::Execution(
                            "type mismatch while building Float64 array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::new();
            for v in values {
                match v {
                    ScalarValue::Utf8(x) => b.append_value(x),
                    ScalarValue::Null => b.append_null(),
                    _ => {
                        return Err(WfError::Execution(
                            "type mismatch while building Utf8 array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Boolean(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    _ => {
                        return Err(WfError::Execution(
                            "type mismatch while building Boolean array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        other => Err(WfError::Unsupported(format!(
            "output type not supported yet: {other:?}"
        ))),
    }
}

/// Numeric view of a scalar, if it has one.
pub fn scalar_to_f64(v: &ScalarValue) -> Option<f64> {
    match v {
        ScalarValue::Int64(x) => Some(*x as f64),
        ScalarValue::Float64Bits(x) => Some(f64::from_bits(*x)),
        _ => None,
    }
}

/// Compare two scalars under sort-key semantics.
pub fn cmp_scalar(a: &ScalarValue, b: &ScalarValue, descending: bool, nulls_first: bool) -> Ordering {
    use ScalarValue::*;
    match (a, b) {
        (Null, Null) => return Ordering::Equal,
        (Null, _) => {
            return if nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }
        (_, Null) => {
            return if nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }
        _ => {}
    }
    let ord = match (a, b) {
        (Int64(x), Int64(y)) => x.cmp(y),
        (Float64Bits(x), Float64Bits(y)) => cmp_f64(f64::from_bits(*x), f64::from_bits(*y)),
        (Int64(x), Float64Bits(y)) => cmp_f64(*x as f64, f64::from_bits(*y)),
        (Float64Bits(x), Int64(y)) => cmp_f64(f64::from_bits(*x), *y as f64),
        (Utf8(x), Utf8(y)) => x.cmp(y),
        (Boolean(x), Boolean(y)) => x.cmp(y),
        _ => format!("{a:?}").cmp(&format!("{b:?}")),
    };
    if descending {
        ord.reverse()
    } else {
        ord
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.total_cmp(&b),
    }
}

/// Compare two rows of an equality-key matrix (column-major).
pub fn cmp_key_sets(keys: &[Vec<ScalarValue>], a: usize, b: usize) -> Ordering {
    for k in keys {
        let ord = cmp_scalar(&k[a], &k[b], false, true);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Compare two rows of an order-key matrix under each key's direction.
pub fn cmp_order_key_sets(
    keys: &[Vec<ScalarValue>],
    order_exprs: &[WindowOrderExpr],
    a: usize,
    b: usize,
) -> Ordering {
    for (i, o) in order_exprs.iter().enumerate() {
        let ord = cmp_scalar(&keys[i][a], &keys[i][b], !o.asc, o.nulls_first);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Evaluate a descriptor expression over a batch.
pub fn evaluate_expr(expr: &Expr, batch: &RecordBatch) -> Result<ArrayRef> {
    match expr {
        Expr::Literal(v) => literal_array(v, batch.num_rows()),
        _ => {
            let idx = expr
                .column_index(batch.schema_ref())?
                .ok_or_else(|| WfError::Internal("column expr without index".to_string()))?;
            Ok(Arc::clone(batch.column(idx)))
        }
    }
}

/// Evaluate a descriptor expression to one scalar per row.
pub fn evaluate_expr_scalars(expr: &Expr, batch: &RecordBatch) -> Result<Vec<ScalarValue>> {
    let arr = evaluate_expr(expr, batch)?;
    (0..batch.num_rows())
        .map(|row| scalar_from_array(&arr, row))
        .collect()
}

fn literal_array(v: &LiteralValue, rows: usize) -> Result<ArrayRef> {
    let arr: ArrayRef = match v {
        LiteralValue::Int64(x) => Arc::new(Int64Array::from(vec![*x; rows])),
        LiteralValue::Float64(x) => Arc::new(Float64Array::from(vec![*x; rows])),
        LiteralValue::Utf8(x) => Arc::new(StringArray::from(vec![x.as_str(); rows])),
        LiteralValue::Boolean(x) => Arc::new(BooleanArray::from(vec![*x; rows])),
        LiteralValue::Null => Arc::new(Int64Array::from(vec![None::<i64>; rows])),
    };
    Ok(arr)
}

/// Convert a batch into scalar rows.
pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Vec<ScalarValue>>> {
    let mut out = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let mut values = Vec::with_capacity(batch.num_columns());
        for col in 0..batch.num_columns() {
            values.push(scalar_from_array(batch.column(col), row)?);
        }
        out.push(values);
    }
    Ok(out)
}

/// Convert scalar rows back into a batch with the given schema.
pub fn rows_to_batch(schema: &SchemaRef, rows: &[Vec<ScalarValue>]) -> Result<RecordBatch> {
    let mut cols = vec![Vec::<ScalarValue>::with_capacity(rows.len()); schema.fields().len()];
    for row in rows {
        for (idx, value) in row.iter().enumerate() {
            cols[idx].push(value.clone());
        }
    }
    let arrays = cols
        .iter()
        .enumerate()
        .map(|(idx, col)| scalars_to_array(col, schema.field(idx).data_type()))
        .collect::<Result<Vec<_>>>()?;
    RecordBatch::try_new(schema.clone(), arrays)
        .map_err(|e| WfError::Execution(format!("row block batch failed: {e}")))
}
