//! Kernel logging subsystem.

pub mod logger;

pub use logger::{init, log_warn, try_get_logger, Logger, Severity};
