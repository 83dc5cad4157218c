//! Convenience re-exports: `use datablock_core::prelude::*;`

// ─── Engines and handles ────────────────────────────────────────────
pub use crate::consumer::Consumer;
pub use crate::handle::{ReadHandle, ReleaseOutcome, WriteHandle};
pub use crate::iterator::{NextResult, SlotIterator};
pub use crate::producer::Producer;

// ─── Configuration ───────────────────────────────────────────────────
pub use crate::config::{ChecksumPolicy, DataBlockConfig, FieldDescriptor, RingPolicy, SchemaDescriptor, UnitSize};

// ─── Observability ────────────────────────────────────────────────────
pub use crate::metrics::MetricsSnapshot;

// ─── Recovery ─────────────────────────────────────────────────────────
pub use crate::recovery::{RecoveryAction, RecoveryHandle, SlotDiagnosis};

// ─── Transactions ─────────────────────────────────────────────────────
pub use crate::transaction::{with_read, with_write};

pub use datablock_common::error::{DataBlockError, DataBlockResult};
