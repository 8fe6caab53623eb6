#![allow(dead_code)]

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use wf_plan::{Expr, WindowOrderExpr};

pub fn int_schema(names: &[&str]) -> SchemaRef {
    Arc::new(Schema::new(
        names
            .iter()
            .map(|n| Field::new(*n, DataType::Int64, false))
            .collect::<Vec<_>>(),
    ))
}

pub fn int_batch(schema: &SchemaRef, columns: Vec<Vec<i64>>) -> RecordBatch {
    let arrays = columns
        .into_iter()
        .map(|c| Arc::new(Int64Array::from(c)) as ArrayRef)
        .collect();
    RecordBatch::try_new(Arc::clone(schema), arrays).expect("batch")
}

pub fn group_value_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("g", DataType::Utf8, false),
        Field::new("t", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]))
}

pub fn group_value_batch(rows: &[(&str, i64, i64)]) -> RecordBatch {
    RecordBatch::try_new(
        group_value_schema(),
        vec![
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.0).collect::<Vec<_>>(),
            )) as ArrayRef,
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.1).collect::<Vec<_>>(),
            )) as ArrayRef,
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.2).collect::<Vec<_>>(),
            )) as ArrayRef,
        ],
    )
    .expect("batch")
}

pub fn col(name: &str) -> Expr {
    Expr::Column(name.to_string())
}

pub fn asc(name: &str) -> WindowOrderExpr {
    WindowOrderExpr {
        expr: col(name),
        asc: true,
        nulls_first: false,
    }
}

pub fn i64_column(batch: &RecordBatch, idx: usize) -> Vec<i64> {
    let a = batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column");
    (0..a.len()).map(|i| a.value(i)).collect()
}

pub fn opt_i64_column(batch: &RecordBatch, idx: usize) -> Vec<Option<i64>> {
    let a = batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column");
    (0..a.len())
        .map(|i| (!a.is_null(i)).then(|| a.value(i)))
        .collect()
}

pub fn f64_column(batch: &RecordBatch, idx: usize) -> Vec<f64> {
    let a = batch
        .column(idx)
        .as_any()
        .downcast_ref::<Float64Array>()
        .expect("float64 column");
    (0..a.len()).map(|i| a.value(i)).collect()
}

pub fn str_column(batch: &RecordBatch, idx: usize) -> Vec<String> {
    let a = batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("utf8 column");
    (0..a.len()).map(|i| a.value(i).to_string()).collect()
}
