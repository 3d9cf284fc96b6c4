//! Structured logging setup for relgate.

pub mod logger;

pub use logger::{build_filter, init_logger};
