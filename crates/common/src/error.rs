use thiserror::Error;

/// Canonical windflow error taxonomy used across crates.
///
/// Classification guidance:
/// - [`WfError::Plan`]: descriptor shape/name/type issues discovered before execution
/// - [`WfError::Execution`]: runtime operator evaluation or data-shape failures,
///   including user errors surfaced from executor internals (e.g. `NTILE(0)`)
/// - [`WfError::InvalidConfig`]: configuration/environment/path contract violations
/// - [`WfError::Unsupported`]: valid request for intentionally unimplemented behavior
/// - [`WfError::Io`]: raw filesystem IO failures from std APIs (spill files)
/// - [`WfError::Internal`]: broken invariants that indicate a bug, never user input
#[derive(Debug, Error)]
pub enum WfError {
    /// Invalid or inconsistent configuration state.
    ///
    /// Examples:
    /// - zero hash bins or zero batch size
    /// - unusable spill directory
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Descriptor validation failures.
    ///
    /// Examples:
    /// - key column not present in the input schema
    /// - an empty descriptor list
    #[error("plan error: {0}")]
    Plan(String),

    /// Runtime execution failures after planning succeeded.
    ///
    /// Examples:
    /// - expression evaluation/type mismatch at runtime
    /// - spill block decode failures
    /// - user errors raised inside a window executor
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a feature/shape not implemented in current version.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Violated internal invariant. Always a bug in this crate, never user input.
    ///
    /// Examples:
    /// - a hash group sinking more rows than it holds
    /// - a task dispatched against the wrong group stage
    #[error("internal error: {0}")]
    Internal(String),
}

/// Standard windflow result alias.
pub type Result<T> = std::result::Result<T, WfError>;
