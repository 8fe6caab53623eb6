//! Window descriptor model for the windflow execution core.
//!
//! Architecture role:
//! - immutable plan-side input to the window operator
//! - key/argument expression payload (columns and literals only)
//! - frame specification and output typing rules
//!
//! Key modules:
//! - [`expr`]
//! - [`window`]

/// Descriptor expression payload.
pub mod expr;
/// Window descriptors and frame specifications.
pub mod window;

pub use expr::{Expr, LiteralValue};
pub use window::{
    AggKind, WindowExpr, WindowFrameBound, WindowFrameExclusion, WindowFrameSpec, WindowFrameUnits,
    WindowFunc, WindowOrderExpr,
};
