//! `WriteHandle` / `ReadHandle`: the non-copyable, move-only values the
//! producer and consumer engines hand to callers (§3 "Handles", §9
//! "Scoped acquisition with guaranteed release").
//!
//! Both handles release on drop if the caller never called `commit`/
//! `release` explicitly — best-effort, logged, never propagating (§3
//! Lifecycle: "dropping an unreleased handle triggers the same release
//! path").

use crate::config::ChecksumPolicy;
use crate::rw_coordinator::{commit_slot, release_read_slot, release_write_lock};
use crate::segment::Segment;
use datablock_common::error::{DataBlockError, DataBlockResult};
use std::sync::Arc;
use tracing::{debug, warn};

/// Exclusively owns the write lock of one slot (§3 "Handles").
///
/// Exposes a mutable payload view and a mutable flexible-zone view.
/// Consumed by [`WriteHandle::commit`] (publish) or
/// [`WriteHandle::abort`] (release without publishing); dropping without
/// either is treated as an abort.
pub struct WriteHandle {
    segment: Arc<Segment>,
    name: Arc<str>,
    slot_id: u64,
    slot_index: usize,
    checksum_policy: ChecksumPolicy,
    finished: bool,
}

impl WriteHandle {
    pub(crate) fn new(
        segment: Arc<Segment>,
        name: Arc<str>,
        slot_id: u64,
        slot_index: usize,
        checksum_policy: ChecksumPolicy,
    ) -> Self {
        Self {
            segment,
            name,
            slot_id,
            slot_index,
            checksum_policy,
            finished: false,
        }
    }

    /// Logical slot id (monotonic, never wraps).
    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    /// Physical slot index (`slot_id mod N`).
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    /// Mutable view of this slot's payload bytes.
    ///
    /// # Safety
    /// Sound because this handle is the sole owner of the slot's write
    /// lock (§3 "Writer exclusion").
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe { self.segment.slot_payload_mut(self.slot_index) }
    }

    /// Mutable view of the shared flexible zone.
    ///
    /// # Safety
    /// The caller is responsible for serialising access via the header's
    /// user spinlock dedicated to the flexible zone (§3 "Flexible zone").
    pub unsafe fn flex_zone_mut(&mut self) -> &mut [u8] {
        unsafe { self.segment.flex_zone_mut() }
    }

    /// Publish the write (§4.2 "Commit"): optionally compute and store
    /// the slot checksum (enforced policy only), bump `write_generation`,
    /// mark `Committed`, and advance `commit_index`.
    pub fn commit(mut self, bytes_written: usize) -> DataBlockResult<()> {
        let header = self.segment.header();
        let slot = self.segment.slot_rw(self.slot_index);

        if self.checksum_policy.is_enforced() {
            if let Some(checksum) = unsafe { self.segment.slot_checksum_mut(self.slot_index) } {
                // Hash the full unit-sized buffer, not just `bytes_written`:
                // a reader's `payload()` always returns the whole slot, and
                // `release` verifies against that same full buffer, so the
                // digest must cover what it will actually be checked against.
                let payload = self.segment.slot_payload(self.slot_index);
                checksum.update(payload);
            } else {
                header.metrics.commit_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Err(DataBlockError::ChecksumFailure {
                    name: self.name.to_string(),
                    slot_id: Some(self.slot_id),
                });
            }
        }

        commit_slot(header, slot, self.slot_id, bytes_written as u64);
        release_write_lock(slot);
        self.finished = true;
        debug!(channel = %self.name, slot_id = self.slot_id, bytes_written, "committed write slot");
        Ok(())
    }

    /// Release the write lock without publishing (§4.2: "Releasing the
    /// handle without commit is legal (aborted write)").
    pub fn abort(mut self) {
        let slot = self.segment.slot_rw(self.slot_index);
        release_write_lock(slot);
        self.finished = true;
        debug!(channel = %self.name, slot_id = self.slot_id, "aborted write slot");
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let slot = self.segment.slot_rw(self.slot_index);
        release_write_lock(slot);
        warn!(
            channel = %self.name,
            slot_id = self.slot_id,
            "write handle dropped without commit/abort; released as aborted write"
        );
    }
}

/// Holds a non-negative contribution to a slot's `reader_count` (§3
/// "Handles"). Exposes a read-only payload view; carries the `slot_id`/
/// `slot_index` and the `write_generation` observed at acquisition so
/// [`ReadHandle::release`] can detect a torn read.
pub struct ReadHandle {
    segment: Arc<Segment>,
    name: Arc<str>,
    slot_id: u64,
    slot_index: usize,
    generation: u64,
    checksum_policy: ChecksumPolicy,
    finished: bool,
}

/// Outcome of releasing a [`ReadHandle`] (§6.1: `release(handle) ->
/// (raced?, checksum_ok?)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// `true` if the slot was overwritten while this handle held it
    /// (the generation observed at acquisition no longer matches).
    pub raced: bool,
    /// `Some(true/false)` if checksum verification ran (enforced
    /// policy); `None` if the policy is disabled or manual.
    pub checksum_ok: Option<bool>,
}

impl ReadHandle {
    pub(crate) fn new(
        segment: Arc<Segment>,
        name: Arc<str>,
        slot_id: u64,
        slot_index: usize,
        generation: u64,
        checksum_policy: ChecksumPolicy,
    ) -> Self {
        Self {
            segment,
            name,
            slot_id,
            slot_index,
            generation,
            checksum_policy,
            finished: false,
        }
    }

    /// Logical slot id.
    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    /// Physical slot index.
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    /// `write_generation` observed at acquisition.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Read-only view of this slot's payload bytes.
    pub fn payload(&self) -> &[u8] {
        self.segment.slot_payload(self.slot_index)
    }

    /// Release the read contribution (§4.3 "Release"). Under enforced
    /// checksum policy, verifies before decrementing `reader_count`; a
    /// mismatch is reported as `checksum_ok: Some(false)` and propagated
    /// as [`DataBlockError::ChecksumFailure`].
    pub fn release(mut self) -> DataBlockResult<ReleaseOutcome> {
        let header = self.segment.header();
        let slot = self.segment.slot_rw(self.slot_index);

        let checksum_ok = if self.checksum_policy.is_enforced() {
            match self.segment.slot_checksum(self.slot_index) {
                Some(checksum) => Some(checksum.verify(self.segment.slot_payload(self.slot_index))),
                None => Some(false),
            }
        } else {
            None
        };

        if checksum_ok == Some(false) {
            header.metrics.checksum_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        let (raced, _) = release_read_slot(header, slot, self.slot_id, self.generation);
        self.finished = true;

        if !raced {
            header.metrics.total_slots_read.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        if checksum_ok == Some(false) {
            return Err(DataBlockError::ChecksumFailure {
                name: self.name.to_string(),
                slot_id: Some(self.slot_id),
            });
        }

        Ok(ReleaseOutcome { raced, checksum_ok })
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let header = self.segment.header();
        let slot = self.segment.slot_rw(self.slot_index);
        let (raced, _) = release_read_slot(header, slot, self.slot_id, self.generation);
        if raced {
            warn!(channel = %self.name, slot_id = self.slot_id, "read handle dropped, generation raced");
        } else {
            debug!(channel = %self.name, slot_id = self.slot_id, "read handle dropped without explicit release");
        }
    }
}
