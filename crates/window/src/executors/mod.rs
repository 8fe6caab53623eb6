//! Concrete executor families behind [`crate::executor::WindowExecutor`].

pub(crate) mod aggregate;
pub(crate) mod rank;
pub(crate) mod value;
