//! System-wide constants for the DataBlock workspace.
//!
//! Single source of truth for wire-format constants and numeric limits.
//! Imported by every other crate — no duplication permitted.

/// Magic constant stored last during segment initialisation (little-endian).
pub const DATABLOCK_MAGIC: u64 = 0x0BAD_F00D_FEED_FACE;

/// Current on-wire segment layout version.
pub const CURRENT_VERSION: u32 = 1;

/// Oldest segment layout version this build can attach to.
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// CPU cache line size in bytes, used for alignment to avoid false sharing.
pub const CACHE_LINE_SIZE: usize = 64;

/// Smallest permitted unit (payload slot) size: 4 KiB.
pub const UNIT_SIZE_SMALL: usize = 4 * 1024;
/// Mid-size permitted unit (payload slot) size: 4 MiB.
pub const UNIT_SIZE_MEDIUM: usize = 4 * 1024 * 1024;
/// Largest permitted unit (payload slot) size: 16 MiB.
pub const UNIT_SIZE_LARGE: usize = 16 * 1024 * 1024;

/// Minimum ring capacity (single-slot policy).
pub const MIN_RING_CAPACITY: u32 = 1;

/// Ring capacity at or above which the "ring" back-pressure policy applies.
pub const RING_POLICY_THRESHOLD: u32 = 3;

/// Fixed upper bound of concurrent heartbeat-registered consumers.
pub const MAX_HEARTBEAT_SLOTS: usize = 8;

/// Number of user-addressable spinlocks in the header.
pub const USER_SPINLOCK_COUNT: usize = 8;

/// Number of user-addressable 64-bit counters in the header.
pub const USER_COUNTER_COUNT: usize = 8;

/// Size in bytes of the in-header metrics block.
pub const METRICS_BLOCK_SIZE: usize = 256;

/// Size in bytes of the schema hash field.
pub const SCHEMA_HASH_SIZE: usize = 32;

/// Size in bytes of one slot checksum record (32-byte digest + 1 validity byte).
pub const SLOT_CHECKSUM_SIZE: usize = 33;

/// Default bounded wait for a consumer's attach spin on `init_state` (§4.1).
pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 5_000;

/// Default heartbeat staleness timeout (§4.5): source suggests 1-5s, spec chooses 5s.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 5_000;

/// Heuristic "stuck" threshold for a slot parked in WRITING/DRAINING (§4.6).
pub const DEFAULT_STUCK_THRESHOLD_MS: u64 = 30_000;

/// Initial writer/reader back-off delay (§4.2/§4.3).
pub const BACKOFF_INITIAL_NS: u64 = 1_000;

/// Maximum writer/reader back-off delay, doubled up to this cap.
pub const BACKOFF_MAX_NS: u64 = 1_000_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_is_nonzero_and_stable() {
        assert_ne!(DATABLOCK_MAGIC, 0);
        assert_eq!(DATABLOCK_MAGIC, 0x0BAD_F00D_FEED_FACE);
    }

    #[test]
    fn version_bounds_are_consistent() {
        assert!(MIN_SUPPORTED_VERSION <= CURRENT_VERSION);
    }

    #[test]
    fn unit_sizes_are_ordered() {
        assert!(UNIT_SIZE_SMALL < UNIT_SIZE_MEDIUM);
        assert!(UNIT_SIZE_MEDIUM < UNIT_SIZE_LARGE);
    }

    #[test]
    fn backoff_bounds_are_consistent() {
        assert!(BACKOFF_INITIAL_NS < BACKOFF_MAX_NS);
    }
}
