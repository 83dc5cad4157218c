//! Convenience re-exports: `use datablock_common::prelude::*;`

// ─── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{DataBlockError, DataBlockResult};

// ─── Configuration / logging ────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel, SharedConfig, init_tracing};

// ─── Constants ───────────────────────────────────────────────────────
pub use crate::consts::{CURRENT_VERSION, DATABLOCK_MAGIC, MIN_SUPPORTED_VERSION};
