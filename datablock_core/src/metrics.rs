//! In-header atomic metrics block (§3 "Metrics").
//!
//! A fixed 256-byte block of `AtomicU64` counters embedded directly in the
//! segment header so any attached process — producer, consumer, or the
//! recovery CLI — can read live counters without an RPC round trip. All
//! increments use relaxed ordering (§4.7): metrics are observational, never
//! part of a synchronisation edge.

use datablock_common::consts::METRICS_BLOCK_SIZE;
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU64, Ordering};

const FIELD_COUNT: usize = METRICS_BLOCK_SIZE / 8;

/// The raw in-header metrics block. Field order matches
/// [`MetricsSnapshot`]; trailing slots are reserved padding.
#[repr(C, align(8))]
pub struct MetricsBlock {
    // ─── Slot-coordination metrics ──────────────────────────────────
    /// Count of `acquire_write` calls that exhausted their timeout.
    pub writer_timeout_count: AtomicU64,
    /// Cumulative nanoseconds writers spent blocked (ring-full + drain).
    pub writer_blocked_ns: AtomicU64,
    /// Count of failed write-lock CAS attempts (contention, not necessarily
    /// a contract violation — a retry after drain can also bump this).
    pub write_lock_contention: AtomicU64,
    /// Count of `write_generation` wraparounds observed by diagnostics.
    pub generation_wraps: AtomicU64,
    /// Count of reader acquisitions that found the slot not committed.
    pub reader_not_ready_count: AtomicU64,
    /// Count of reader acquisitions that lost the TOCTTOU race.
    pub reader_race_detected: AtomicU64,
    /// Count of reader releases that detected a torn generation.
    pub reader_validation_failed: AtomicU64,
    /// High-water mark of concurrent readers on any one slot.
    pub peak_reader_count: AtomicU64,

    // ─── Error counters ──────────────────────────────────────────────
    /// Monotonic nanosecond timestamp of the last recorded error.
    pub last_error_ts_ns: AtomicU64,
    /// Numeric code of the last recorded error (caller-defined mapping).
    pub last_error_code: AtomicU64,
    /// Monotonic sequence number, incremented on every recorded error.
    pub error_sequence: AtomicU64,
    /// Count of failed `acquire_write`/`acquire_consume` calls.
    pub slot_acquire_errors: AtomicU64,
    /// Count of failed `commit` calls.
    pub commit_errors: AtomicU64,
    /// Count of detected checksum mismatches (slot or flexible zone).
    pub checksum_failures: AtomicU64,

    // ─── Heartbeat counters ──────────────────────────────────────────
    /// Count of successful `update_heartbeat` calls.
    pub heartbeats_sent: AtomicU64,
    /// Count of failed `update_heartbeat` calls (e.g. no free slot).
    pub heartbeats_failed: AtomicU64,
    /// Monotonic nanosecond timestamp of the most recent heartbeat write.
    pub last_heartbeat_ts_ns: AtomicU64,

    // ─── Performance counters ────────────────────────────────────────
    /// Total slots successfully committed by the producer.
    pub total_slots_written: AtomicU64,
    /// Total slots successfully read (released without error) by any
    /// consumer.
    pub total_slots_read: AtomicU64,
    /// Total payload bytes committed.
    pub total_bytes_written: AtomicU64,
    /// Segment uptime in seconds, refreshed by whoever last snapshotted.
    pub uptime_seconds: AtomicU64,

    // ─── Recovery ─────────────────────────────────────────────────────
    /// Count of recovery actions applied by `force_reset_slot`,
    /// `release_zombie_writer`, or `release_zombie_readers`.
    pub recovery_actions: AtomicU64,

    _reserved: [AtomicU64; FIELD_COUNT - 19],
}

const_assert_eq!(std::mem::size_of::<MetricsBlock>(), METRICS_BLOCK_SIZE);

impl MetricsBlock {
    /// Construct a zeroed block.
    pub fn new() -> Self {
        // SAFETY: all-zero is a valid bit pattern for every field (all
        // AtomicU64), and the struct has no padding bytes beyond the
        // reserved array, which is itself AtomicU64.
        unsafe { std::mem::zeroed() }
    }

    /// Record a generic failure: bumps the error sequence, stores the
    /// code and timestamp.
    pub fn record_error(&self, code: u64, now_ns: u64) {
        self.last_error_code.store(code, Ordering::Relaxed);
        self.last_error_ts_ns.store(now_ns, Ordering::Relaxed);
        self.error_sequence.fetch_add(1, Ordering::Relaxed);
    }

    /// Take an immutable point-in-time snapshot of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            writer_timeout_count: self.writer_timeout_count.load(Ordering::Relaxed),
            writer_blocked_ns: self.writer_blocked_ns.load(Ordering::Relaxed),
            write_lock_contention: self.write_lock_contention.load(Ordering::Relaxed),
            generation_wraps: self.generation_wraps.load(Ordering::Relaxed),
            reader_not_ready_count: self.reader_not_ready_count.load(Ordering::Relaxed),
            reader_race_detected: self.reader_race_detected.load(Ordering::Relaxed),
            reader_validation_failed: self.reader_validation_failed.load(Ordering::Relaxed),
            peak_reader_count: self.peak_reader_count.load(Ordering::Relaxed),
            last_error_ts_ns: self.last_error_ts_ns.load(Ordering::Relaxed),
            last_error_code: self.last_error_code.load(Ordering::Relaxed),
            error_sequence: self.error_sequence.load(Ordering::Relaxed),
            slot_acquire_errors: self.slot_acquire_errors.load(Ordering::Relaxed),
            commit_errors: self.commit_errors.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_failed: self.heartbeats_failed.load(Ordering::Relaxed),
            last_heartbeat_ts_ns: self.last_heartbeat_ts_ns.load(Ordering::Relaxed),
            total_slots_written: self.total_slots_written.load(Ordering::Relaxed),
            total_slots_read: self.total_slots_read.load(Ordering::Relaxed),
            total_bytes_written: self.total_bytes_written.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds.load(Ordering::Relaxed),
            recovery_actions: self.recovery_actions.load(Ordering::Relaxed),
        }
    }

    /// Bump `peak_reader_count` if `candidate` exceeds the current value.
    /// Best-effort, relaxed, not a CAS loop — losing a race here only
    /// costs a slightly stale high-water mark (§4.3 step 6).
    pub fn observe_reader_count(&self, candidate: u32) {
        let current = self.peak_reader_count.load(Ordering::Relaxed);
        if candidate as u64 > current {
            self.peak_reader_count
                .store(candidate as u64, Ordering::Relaxed);
        }
    }
}

impl Default for MetricsBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// A plain-data, point-in-time copy of [`MetricsBlock`], safe to pass
/// across process boundaries (e.g. serialised to JSON by the CLI).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    /// See [`MetricsBlock::writer_timeout_count`].
    pub writer_timeout_count: u64,
    /// See [`MetricsBlock::writer_blocked_ns`].
    pub writer_blocked_ns: u64,
    /// See [`MetricsBlock::write_lock_contention`].
    pub write_lock_contention: u64,
    /// See [`MetricsBlock::generation_wraps`].
    pub generation_wraps: u64,
    /// See [`MetricsBlock::reader_not_ready_count`].
    pub reader_not_ready_count: u64,
    /// See [`MetricsBlock::reader_race_detected`].
    pub reader_race_detected: u64,
    /// See [`MetricsBlock::reader_validation_failed`].
    pub reader_validation_failed: u64,
    /// See [`MetricsBlock::peak_reader_count`].
    pub peak_reader_count: u64,
    /// See [`MetricsBlock::last_error_ts_ns`].
    pub last_error_ts_ns: u64,
    /// See [`MetricsBlock::last_error_code`].
    pub last_error_code: u64,
    /// See [`MetricsBlock::error_sequence`].
    pub error_sequence: u64,
    /// See [`MetricsBlock::slot_acquire_errors`].
    pub slot_acquire_errors: u64,
    /// See [`MetricsBlock::commit_errors`].
    pub commit_errors: u64,
    /// See [`MetricsBlock::checksum_failures`].
    pub checksum_failures: u64,
    /// See [`MetricsBlock::heartbeats_sent`].
    pub heartbeats_sent: u64,
    /// See [`MetricsBlock::heartbeats_failed`].
    pub heartbeats_failed: u64,
    /// See [`MetricsBlock::last_heartbeat_ts_ns`].
    pub last_heartbeat_ts_ns: u64,
    /// See [`MetricsBlock::total_slots_written`].
    pub total_slots_written: u64,
    /// See [`MetricsBlock::total_slots_read`].
    pub total_slots_read: u64,
    /// See [`MetricsBlock::total_bytes_written`].
    pub total_bytes_written: u64,
    /// See [`MetricsBlock::uptime_seconds`].
    pub uptime_seconds: u64,
    /// See [`MetricsBlock::recovery_actions`].
    pub recovery_actions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_is_exactly_256_bytes() {
        assert_eq!(std::mem::size_of::<MetricsBlock>(), 256);
    }

    #[test]
    fn snapshot_starts_zeroed() {
        let block = MetricsBlock::new();
        assert_eq!(block.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn two_snapshots_with_no_activity_are_identical() {
        let block = MetricsBlock::new();
        block.reader_not_ready_count.fetch_add(3, Ordering::Relaxed);
        let a = block.snapshot();
        let b = block.snapshot();
        assert_eq!(a, b);
    }

    #[test]
    fn record_error_updates_sequence_and_code() {
        let block = MetricsBlock::new();
        block.record_error(42, 1_000);
        let snap = block.snapshot();
        assert_eq!(snap.last_error_code, 42);
        assert_eq!(snap.last_error_ts_ns, 1_000);
        assert_eq!(snap.error_sequence, 1);
    }

    #[test]
    fn peak_reader_count_only_increases() {
        let block = MetricsBlock::new();
        block.observe_reader_count(3);
        block.observe_reader_count(1);
        assert_eq!(block.snapshot().peak_reader_count, 3);
        block.observe_reader_count(5);
        assert_eq!(block.snapshot().peak_reader_count, 5);
    }
}
