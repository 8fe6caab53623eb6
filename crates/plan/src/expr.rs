use arrow_schema::{DataType, Schema};
use serde::{Deserialize, Serialize};
use wf_common::{Result, WfError};

/// Key/argument payload of a window descriptor.
///
/// The expression binder lives upstream; the operator only ever sees column
/// references and literal defaults, so that is all this model carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Column resolved by name against the operator input schema.
    Column(String),
    /// Column resolved by position, with the name kept for display.
    ColumnRef {
        /// Display name of the referenced column.
        name: String,
        /// Position in the operator input schema.
        index: usize,
    },
    /// Literal value, e.g. a LEAD/LAG default.
    Literal(LiteralValue),
}

/// Literal values representable in descriptor payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    Null,
}

impl Expr {
    /// Resolve the column index this expression reads, if any.
    pub fn column_index(&self, schema: &Schema) -> Result<Option<usize>> {
        match self {
            Expr::Column(name) => {
                let idx = schema
                    .index_of(name)
                    .map_err(|e| WfError::Plan(format!("column '{name}' not found: {e}")))?;
                Ok(Some(idx))
            }
            Expr::ColumnRef { name, index } => {
                if *index >= schema.fields().len() {
                    return Err(WfError::Plan(format!(
                        "column '{name}' index {index} out of range for {} input columns",
                        schema.fields().len()
                    )));
                }
                Ok(Some(*index))
            }
            Expr::Literal(_) => Ok(None),
        }
    }

    /// Output type of this expression against the given schema.
    pub fn data_type(&self, schema: &Schema) -> Result<DataType> {
        match self {
            Expr::Literal(v) => Ok(v.data_type()),
            _ => {
                let idx = self
                    .column_index(schema)?
                    .ok_or_else(|| WfError::Internal("column expr without index".to_string()))?;
                Ok(schema.field(idx).data_type().clone())
            }
        }
    }

    /// Human-readable form used in EXPLAIN-style output.
    pub fn display_name(&self) -> String {
        match self {
            Expr::Column(name) => name.clone(),
            Expr::ColumnRef { name, .. } => name.clone(),
            Expr::Literal(v) => v.display_name(),
        }
    }
}

impl LiteralValue {
    /// Arrow type this literal materializes as.
    pub fn data_type(&self) -> DataType {
        match self {
            LiteralValue::Int64(_) => DataType::Int64,
            LiteralValue::Float64(_) => DataType::Float64,
            LiteralValue::Utf8(_) => DataType::Utf8,
            LiteralValue::Boolean(_) => DataType::Boolean,
            LiteralValue::Null => DataType::Null,
        }
    }

    fn display_name(&self) -> String {
        match self {
            LiteralValue::Int64(v) => v.to_string(),
            LiteralValue::Float64(v) => v.to_string(),
            LiteralValue::Utf8(v) => format!("'{v}'"),
            LiteralValue::Boolean(v) => v.to_string(),
            LiteralValue::Null => "NULL".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Expr, LiteralValue};
    use arrow_schema::{DataType, Field, Schema};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("g", DataType::Utf8, false),
            Field::new("v", DataType::Int64, false),
        ])
    }

    #[test]
    fn resolves_columns_by_name_and_index() {
        let s = schema();
        assert_eq!(
            Expr::Column("v".to_string()).column_index(&s).unwrap(),
            Some(1)
        );
        let by_ref = Expr::ColumnRef {
            name: "g".to_string(),
            index: 0,
        };
        assert_eq!(by_ref.column_index(&s).unwrap(), Some(0));
        assert_eq!(by_ref.data_type(&s).unwrap(), DataType::Utf8);
    }

    #[test]
    fn unknown_column_is_a_plan_error() {
        let s = schema();
        let err = Expr::Column("missing".to_string())
            .column_index(&s)
            .unwrap_err();
        assert!(err.to_string().contains("plan error"));
    }

    #[test]
    fn literal_types_and_display() {
        let s = schema();
        let lit = Expr::Literal(LiteralValue::Int64(-1));
        assert_eq!(lit.column_index(&s).unwrap(), None);
        assert_eq!(lit.data_type(&s).unwrap(), DataType::Int64);
        assert_eq!(lit.display_name(), "-1");
    }
}
