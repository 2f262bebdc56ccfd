//! # Propan Common
//!
//! Logging configuration shared by the Propan offline worker, its CLI host and
//! its test harness.

pub mod logging;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};
