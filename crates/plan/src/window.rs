use arrow_schema::{DataType, Schema};
use serde::{Deserialize, Serialize};
use wf_common::Result;

use crate::expr::Expr;

/// Aggregate kinds usable as window functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggKind {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

/// The window function kind plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WindowFunc {
    /// Framed aggregate, e.g. `SUM(v) OVER (... ROWS UNBOUNDED PRECEDING)`.
    Aggregate {
        /// Aggregate to evaluate over each frame.
        agg: AggKind,
        /// Argument column.
        arg: Expr,
    },
    RowNumber,
    Rank,
    DenseRank,
    PercentRank,
    CumeDist,
    /// `NTILE(buckets)`. The bucket count is validated at evaluation time so
    /// that `NTILE(0)` surfaces as a user error, not a plan error.
    Ntile {
        buckets: i64,
    },
    Lag {
        expr: Expr,
        offset: usize,
        default: Option<Expr>,
    },
    Lead {
        expr: Expr,
        offset: usize,
        default: Option<Expr>,
    },
    FirstValue(Expr),
    LastValue(Expr),
    /// `NTH_VALUE(expr, n)` with 1-based `n`; `n < 1` surfaces at evaluation.
    NthValue {
        expr: Expr,
        n: i64,
    },
}

/// One ORDER BY key inside an OVER clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowOrderExpr {
    /// Key expression.
    pub expr: Expr,
    /// Ascending when true.
    pub asc: bool,
    /// Nulls sort before non-nulls when true.
    pub nulls_first: bool,
}

/// Frame measurement units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowFrameUnits {
    Rows,
    Range,
    Groups,
}

/// One frame endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowFrameBound {
    UnboundedPreceding,
    Preceding(u64),
    CurrentRow,
    Following(u64),
    UnboundedFollowing,
}

/// Frame exclusion clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowFrameExclusion {
    NoOthers,
    CurrentRow,
    Group,
    Ties,
}

/// Fully resolved frame specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowFrameSpec {
    pub units: WindowFrameUnits,
    pub start_bound: WindowFrameBound,
    pub end_bound: WindowFrameBound,
    pub exclusion: WindowFrameExclusion,
}

/// An immutable window descriptor: one OVER expression bound by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowExpr {
    /// Function kind and arguments.
    pub func: WindowFunc,
    /// PARTITION BY keys.
    pub partition_by: Vec<Expr>,
    /// ORDER BY keys with direction and null ordering.
    pub order_by: Vec<WindowOrderExpr>,
    /// Explicit frame, if the query spelled one.
    pub frame: Option<WindowFrameSpec>,
    /// Output column name.
    pub output_name: String,
}

impl WindowExpr {
    /// Length of this descriptor's sort-key prefix: partition keys followed by
    /// order keys. Descriptors sharing a prefix length share one peer-boundary
    /// mask per hash group.
    pub fn key_prefix_len(&self) -> usize {
        self.partition_by.len() + self.order_by.len()
    }

    /// The frame to evaluate with: the explicit frame if present, otherwise
    /// the SQL default (running RANGE frame with ORDER BY, whole partition
    /// without).
    pub fn effective_frame(&self) -> WindowFrameSpec {
        if let Some(frame) = &self.frame {
            return frame.clone();
        }
        if self.order_by.is_empty() {
            WindowFrameSpec {
                units: WindowFrameUnits::Rows,
                start_bound: WindowFrameBound::UnboundedPreceding,
                end_bound: WindowFrameBound::UnboundedFollowing,
                exclusion: WindowFrameExclusion::NoOthers,
            }
        } else {
            WindowFrameSpec {
                units: WindowFrameUnits::Range,
                start_bound: WindowFrameBound::UnboundedPreceding,
                end_bound: WindowFrameBound::CurrentRow,
                exclusion: WindowFrameExclusion::NoOthers,
            }
        }
    }

    /// Arrow type of the produced output column.
    pub fn output_type(&self, input_schema: &Schema) -> Result<DataType> {
        let dt = match &self.func {
            WindowFunc::RowNumber
            | WindowFunc::Rank
            | WindowFunc::DenseRank
            | WindowFunc::Ntile { .. }
            | WindowFunc::Aggregate {
                agg: AggKind::Count,
                ..
            } => DataType::Int64,
            WindowFunc::PercentRank
            | WindowFunc::CumeDist
            | WindowFunc::Aggregate {
                agg: AggKind::Sum, ..
            }
            | WindowFunc::Aggregate {
                agg: AggKind::Avg, ..
            } => DataType::Float64,
            WindowFunc::Aggregate {
                agg: AggKind::Min,
                arg,
            }
            | WindowFunc::Aggregate {
                agg: AggKind::Max,
                arg,
            } => arg.data_type(input_schema)?,
            WindowFunc::Lag { expr, .. }
            | WindowFunc::Lead { expr, .. }
            | WindowFunc::FirstValue(expr)
            | WindowFunc::LastValue(expr)
            | WindowFunc::NthValue { expr, .. } => expr.data_type(input_schema)?,
        };
        Ok(dt)
    }

    /// Whether the produced output column may contain nulls.
    pub fn output_nullable(&self) -> bool {
        !matches!(
            self.func,
            WindowFunc::RowNumber
                | WindowFunc::Rank
                | WindowFunc::DenseRank
                | WindowFunc::Ntile { .. }
                | WindowFunc::Aggregate {
                    agg: AggKind::Count,
                    ..
                }
        )
    }

    /// Human-readable descriptor form, one per line in operator EXPLAIN output.
    pub fn display_name(&self) -> String {
        let func = match &self.func {
            WindowFunc::Aggregate { agg, arg } => {
                format!("{}({})", agg.display_name(), arg.display_name())
            }
            WindowFunc::RowNumber => "row_number()".to_string(),
            WindowFunc::Rank => "rank()".to_string(),
            WindowFunc::DenseRank => "dense_rank()".to_string(),
            WindowFunc::PercentRank => "percent_rank()".to_string(),
            WindowFunc::CumeDist => "cume_dist()".to_string(),
            WindowFunc::Ntile { buckets } => format!("ntile({buckets})"),
            WindowFunc::Lag {
                expr,
                offset,
                default,
            } => match default {
                Some(d) => format!(
                    "lag({}, {offset}, {})",
                    expr.display_name(),
                    d.display_name()
                ),
                None => format!("lag({}, {offset})", expr.display_name()),
            },
            WindowFunc::Lead {
                expr,
                offset,
                default,
            } => match default {
                Some(d) => format!(
                    "lead({}, {offset}, {})",
                    expr.display_name(),
                    d.display_name()
                ),
                None => format!("lead({}, {offset})", expr.display_name()),
            },
            WindowFunc::FirstValue(expr) => format!("first_value({})", expr.display_name()),
            WindowFunc::LastValue(expr) => format!("last_value({})", expr.display_name()),
            WindowFunc::NthValue { expr, n } => format!("nth_value({}, {n})", expr.display_name()),
        };
        let mut over = Vec::new();
        if !self.partition_by.is_empty() {
            let keys = self
                .partition_by
                .iter()
                .map(Expr::display_name)
                .collect::<Vec<_>>()
                .join(", ");
            over.push(format!("PARTITION BY {keys}"));
        }
        if !self.order_by.is_empty() {
            let keys = self
                .order_by
                .iter()
                .map(|o| {
                    let dir = if o.asc { "ASC" } else { "DESC" };
                    format!("{} {dir}", o.expr.display_name())
                })
                .collect::<Vec<_>>()
                .join(", ");
            over.push(format!("ORDER BY {keys}"));
        }
        format!("{} AS {}: OVER ({})", func, self.output_name, over.join(" "))
    }
}

impl AggKind {
    fn display_name(self) -> &'static str {
        match self {
            AggKind::Count => "count",
            AggKind::Sum => "sum",
            AggKind::Min => "min",
            AggKind::Max => "max",
            AggKind::Avg => "avg",
        }
    }
}
