//! Core types shared across every mrsm crate: the dtype system, dataframe
//! utilities, error taxonomy, the universal success tuple, config loading
//! and tracing setup.

pub mod config;
pub mod dataframe;
pub mod dtype;
pub mod error;
pub mod success;
pub mod telemetry;

pub use config::Config;
pub use dataframe::{enforce_dtypes, RecordBatch, Row};
pub use dtype::{Dtype, Value};
pub use error::{MrsmError, Result};
pub use success::SuccessTuple;

/// Crate version, exposed for the CLI's `--version` output and for
/// plugins that want to check API compatibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
