//! Error vocabulary shared by every DataBlock crate.

use thiserror::Error;

/// Errors raised by any part of the DataBlock runtime.
#[derive(Error, Debug)]
pub enum DataBlockError {
    // ─── Identity (attach-time validation, §4.1/§7) ────────────────
    /// Segment magic did not match `DATABLOCK_MAGIC`.
    #[error("segment '{name}': magic mismatch")]
    MagicMismatch {
        /// Channel name.
        name: String,
    },

    /// Segment version was outside `[MIN_SUPPORTED_VERSION, CURRENT_VERSION]`.
    #[error("segment '{name}': version {found} outside supported range [{min}, {max}]")]
    VersionMismatch {
        /// Channel name.
        name: String,
        /// Version found in the header.
        found: u32,
        /// Lowest version this build accepts.
        min: u32,
        /// Highest version this build accepts.
        max: u32,
    },

    /// The attacher's shared secret did not match the producer's.
    #[error("segment '{name}': shared secret mismatch")]
    SecretMismatch {
        /// Channel name.
        name: String,
    },

    /// The attacher's expected schema hash did not match the header's.
    #[error("segment '{name}': schema hash mismatch")]
    SchemaMismatch {
        /// Channel name.
        name: String,
    },

    /// The producer did not finish initialising the segment within the timeout.
    #[error("segment '{name}': producer failed to initialise within {timeout_ms}ms")]
    InitTimeout {
        /// Channel name.
        name: String,
        /// Configured timeout, in milliseconds.
        timeout_ms: u64,
    },

    /// Observed mapped size was smaller than the computed expected size.
    #[error("segment '{name}': observed size {observed} < expected size {expected}")]
    SizeMismatch {
        /// Channel name.
        name: String,
        /// Size actually mapped.
        observed: usize,
        /// Size computed from the header configuration.
        expected: usize,
    },

    // ─── Acquisition (writer/reader paths, §4.2/§4.3/§7) ───────────
    /// A bounded wait (ring-full, drain, or iterator poll) exceeded its timeout.
    #[error("timed out waiting on slot {slot_id:?} for channel '{name}'")]
    Timeout {
        /// Channel name.
        name: String,
        /// Slot id being waited on, if applicable.
        slot_id: Option<u64>,
    },

    /// Slot is not yet committed, or a reader's acquisition raced the writer.
    #[error("slot {slot_id} of channel '{name}' is not ready")]
    NotReady {
        /// Channel name.
        name: String,
        /// Slot id that was not ready.
        slot_id: u64,
    },

    /// The single-producer contract was violated: a second writer attempted
    /// to acquire a write slot while one was already held.
    #[error("channel '{name}': single-producer contract violated")]
    SingleProducerViolated {
        /// Channel name.
        name: String,
    },

    /// The previous writer holding the slot's write lock has died.
    #[error("slot {slot_id} of channel '{name}': previous writer (pid {pid}) is dead")]
    OwnerDead {
        /// Channel name.
        name: String,
        /// Slot id whose writer died.
        slot_id: u64,
        /// Process id of the dead writer.
        pid: u32,
    },

    // ─── Integrity (§4.2/§4.3/§7) ───────────────────────────────────
    /// A slot or flexible-zone checksum failed verification.
    #[error("checksum failure on slot {slot_id:?} of channel '{name}'")]
    ChecksumFailure {
        /// Channel name.
        name: String,
        /// Slot id, if the failure is slot-scoped rather than flexible-zone-scoped.
        slot_id: Option<u64>,
    },

    /// The header failed `validate_integrity()`.
    #[error("segment '{name}': header is corrupt: {reason}")]
    CorruptHeader {
        /// Channel name.
        name: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A generic post-hoc validation failed (used by recovery tooling).
    #[error("segment '{name}': validation failed: {reason}")]
    ValidationFailed {
        /// Channel name.
        name: String,
        /// Human-readable reason.
        reason: String,
    },

    // ─── Recovery (§4.6/§7) ─────────────────────────────────────────
    /// A recovery action was refused because it is not provably safe without `--force`.
    #[error("slot {slot_id} of channel '{name}': action is unsafe without force")]
    Unsafe {
        /// Channel name.
        name: String,
        /// Slot id.
        slot_id: usize,
    },

    /// `diagnose` found the slot is not actually stuck.
    #[error("slot {slot_id} of channel '{name}' is not stuck")]
    NotStuck {
        /// Channel name.
        name: String,
        /// Slot id.
        slot_id: usize,
    },

    /// A slot index outside `[0, N)` was requested.
    #[error("slot index {slot_index} out of range for channel '{name}' (N={capacity})")]
    InvalidSlot {
        /// Channel name.
        name: String,
        /// Requested slot index.
        slot_index: usize,
        /// Ring capacity.
        capacity: u32,
    },

    // ─── Discovery / lifecycle ──────────────────────────────────────
    /// Segment already exists (producer create path).
    #[error("segment already exists: {name}")]
    AlreadyExists {
        /// Channel name.
        name: String,
    },

    /// Segment could not be located (consumer attach path).
    #[error("segment not found: {name}")]
    NotFound {
        /// Channel name.
        name: String,
    },

    /// Requested configuration was invalid (e.g. unit size not one of the
    /// permitted values, flex zone too large, capacity zero).
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Human-readable reason.
        reason: String,
    },

    // ─── Platform (§7) ──────────────────────────────────────────────
    /// Memory mapping could not be created or attached.
    #[error("failed to map segment '{name}': {reason}")]
    MapFailed {
        /// Channel name.
        name: String,
        /// Human-readable reason.
        reason: String,
    },

    /// The robust process-shared mutex was found poisoned and could not be
    /// recovered (the protected fields failed validation after `EOWNERDEAD`).
    #[error("segment '{name}': control mutex poisoned, segment declared corrupt")]
    MutexPoisoned {
        /// Channel name.
        name: String,
    },

    /// A raw OS error occurred outside the categories above.
    #[error("OS error: {source}")]
    OsError {
        /// Underlying IO error.
        #[from]
        source: std::io::Error,
    },

    /// A `nix` system call failed.
    #[error("system call error: {source}")]
    Nix {
        /// Underlying nix error.
        #[from]
        source: nix::Error,
    },

    /// Config/metadata (de)serialization failed.
    #[error("JSON error: {source}")]
    Json {
        /// Underlying serde_json error.
        #[from]
        source: serde_json::Error,
    },
}

/// Result type used throughout the DataBlock workspace.
pub type DataBlockResult<T> = Result<T, DataBlockError>;
