//! Diagnostic and recovery operations (§4.6): out-of-band inspection and
//! repair of a segment that a consumer or producer would otherwise
//! refuse to touch directly. Grounded on the same attach-by-name path
//! [`crate::consumer::Consumer`] uses, minus identity/schema checks —
//! recovery tooling must be able to inspect a segment even when the
//! shared secret or schema it was created with is unknown to the caller.

use crate::header::InitState;
use crate::platform;
use crate::segment::{Layout, Segment};
use crate::slot::SlotState;
use datablock_common::consts::DEFAULT_STUCK_THRESHOLD_MS;
use datablock_common::error::{DataBlockError, DataBlockResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Per-slot snapshot returned by [`RecoveryHandle::diagnose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SlotDiagnosis {
    /// Physical slot index.
    pub slot_index: usize,
    /// Decoded `slot_state`.
    pub state: u8,
    /// `write_lock` holder, 0 if free.
    pub write_lock_holder: u32,
    /// Whether the holder above is a live process (meaningless if the
    /// slot is unlocked).
    pub writer_alive: bool,
    /// Current `reader_count`.
    pub reader_count: u32,
    /// Current `writer_waiting` flag.
    pub writer_waiting: bool,
    /// Current `write_generation`.
    pub write_generation: u64,
    /// Nanoseconds since the last `slot_state` transition.
    pub ns_in_state: u64,
    /// `true` if the slot has sat in `Writing` or `Draining` longer than
    /// the stuck threshold.
    pub is_stuck: bool,
}

/// One action `auto_recover` did take, or would take under `dry_run`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RecoveryAction {
    /// `force_reset_slot` on a slot with a dead writer.
    ReleasedZombieWriter {
        /// Physical slot index.
        slot_index: usize,
        /// Process id that was found dead.
        pid: u32,
    },
    /// `release_zombie_readers` on a slot stuck in `Draining`.
    ReleasedZombieReaders {
        /// Physical slot index.
        slot_index: usize,
        /// `reader_count` that was cleared.
        stale_count: u32,
    },
    /// `cleanup_dead_consumers` clearing one heartbeat slot.
    ClearedDeadConsumer {
        /// Heartbeat array index.
        heartbeat_index: usize,
        /// Consumer id that was cleared.
        consumer_id: u64,
    },
}

/// Attaches to an existing channel for inspection and repair, bypassing
/// the secret/schema checks [`crate::consumer::Consumer::attach`]
/// enforces — the whole point of recovery tooling is to operate on a
/// segment whose creator may be long gone.
pub struct RecoveryHandle {
    segment: Arc<Segment>,
    name: Arc<str>,
}

impl RecoveryHandle {
    /// Attach to `channel` purely for diagnosis/repair. Still waits for
    /// `init_state == FullyInitialized` — a segment mid-creation is not
    /// yet safe to interpret.
    pub fn attach(channel: &str) -> DataBlockResult<Self> {
        Self::attach_with_timeout(
            channel,
            Duration::from_millis(datablock_common::consts::DEFAULT_INIT_TIMEOUT_MS),
        )
    }

    /// As [`RecoveryHandle::attach`], with an explicit init-spin timeout.
    pub fn attach_with_timeout(channel: &str, init_timeout: Duration) -> DataBlockResult<Self> {
        let (mmap, observed_size) = platform::attach_segment_mmap(channel)?;
        let base = mmap.as_ptr() as *const crate::header::SegmentHeader;
        let header = unsafe { &*base };

        let mut backoff = crate::rw_coordinator::Backoff::new(init_timeout);
        loop {
            if header.init_state(Ordering::Acquire) == InitState::FullyInitialized {
                break;
            }
            if backoff.expired() {
                return Err(DataBlockError::InitTimeout {
                    name: channel.to_string(),
                    timeout_ms: init_timeout.as_millis() as u64,
                });
            }
            backoff.wait();
        }

        let layout = Layout::from_header(header);
        let segment = Arc::new(Segment::new(mmap, layout));
        segment.validate_mapped_size(channel, observed_size)?;

        Ok(Self {
            segment,
            name: Arc::from(channel),
        })
    }

    /// Ring capacity, for callers iterating every slot.
    pub fn capacity(&self) -> u32 {
        self.segment.layout().capacity
    }

    fn check_slot_index(&self, slot_index: usize) -> DataBlockResult<()> {
        if slot_index >= self.capacity() as usize {
            return Err(DataBlockError::InvalidSlot {
                name: self.name.to_string(),
                slot_index,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    /// Snapshot one slot's RW state plus derived fields, including the
    /// stuck heuristic: `Writing` or `Draining` for longer than
    /// [`DEFAULT_STUCK_THRESHOLD_MS`].
    pub fn diagnose(&self, slot_index: usize) -> DataBlockResult<SlotDiagnosis> {
        self.check_slot_index(slot_index)?;
        let slot = self.segment.slot_rw(slot_index);
        let now = platform::monotonic_nanos();
        let state = slot.state(Ordering::Acquire);
        let holder = slot.write_lock.load(Ordering::Acquire) as u32;
        let ns_in_state = slot.ns_since_state_entered(now);
        let threshold_ns = DEFAULT_STUCK_THRESHOLD_MS * 1_000_000;

        let is_stuck = matches!(state, SlotState::Writing | SlotState::Draining)
            && ns_in_state > threshold_ns;

        Ok(SlotDiagnosis {
            slot_index,
            state: state as u8,
            write_lock_holder: holder,
            writer_alive: holder != 0 && platform::is_process_alive(holder),
            reader_count: slot.reader_count.load(Ordering::Acquire),
            writer_waiting: slot.writer_waiting.load(Ordering::Acquire) != 0,
            write_generation: slot.write_generation.load(Ordering::Acquire),
            ns_in_state,
            is_stuck,
        })
    }

    /// [`RecoveryHandle::diagnose`] over every slot in the ring.
    pub fn diagnose_all(&self) -> Vec<SlotDiagnosis> {
        (0..self.capacity() as usize)
            .map(|i| self.diagnose(i).expect("index bounded by capacity"))
            .collect()
    }

    /// Force a slot back to `FREE`: clears `write_lock`, `reader_count`,
    /// and `writer_waiting`, bumps `recovery_actions`. Never touches
    /// `write_generation` — readers rely on its monotonicity across
    /// recovery.
    ///
    /// Refuses with [`DataBlockError::Unsafe`] unless the current
    /// `write_lock` holder is confirmed dead, or `force` is set.
    pub fn force_reset_slot(&self, slot_index: usize, force: bool) -> DataBlockResult<()> {
        self.check_slot_index(slot_index)?;
        let slot = self.segment.slot_rw(slot_index);
        let holder = slot.write_lock.load(Ordering::Acquire) as u32;
        let holder_dead = holder == 0 || !platform::is_process_alive(holder);

        if !holder_dead && !force {
            return Err(DataBlockError::Unsafe {
                name: self.name.to_string(),
                slot_id: slot_index,
            });
        }

        slot.set_state_timed(SlotState::Free, platform::monotonic_nanos(), Ordering::Release);
        slot.write_lock.store(0, Ordering::Release);
        slot.reader_count.store(0, Ordering::Release);
        slot.writer_waiting.store(0, Ordering::Release);

        self.segment
            .header()
            .metrics
            .recovery_actions
            .fetch_add(1, Ordering::Relaxed);
        warn!(channel = %self.name, slot_index, holder, force, "slot force-reset");
        Ok(())
    }

    /// [`RecoveryHandle::force_reset_slot`], but only when the write-lock
    /// holder is confirmed dead — refuses (`Unsafe`) if the holder is
    /// live or the slot is unlocked, regardless of `force`.
    pub fn release_zombie_writer(&self, slot_index: usize) -> DataBlockResult<()> {
        self.check_slot_index(slot_index)?;
        let slot = self.segment.slot_rw(slot_index);
        let holder = slot.write_lock.load(Ordering::Acquire) as u32;
        if holder == 0 || platform::is_process_alive(holder) {
            return Err(DataBlockError::Unsafe {
                name: self.name.to_string(),
                slot_id: slot_index,
            });
        }
        self.force_reset_slot(slot_index, true)
    }

    /// Zero `reader_count` on a slot genuinely stuck draining: requires
    /// `writer_waiting == 1` and the stuck-duration heuristic, unless
    /// `force` is set.
    pub fn release_zombie_readers(&self, slot_index: usize, force: bool) -> DataBlockResult<()> {
        self.check_slot_index(slot_index)?;
        let diagnosis = self.diagnose(slot_index)?;

        if !force && !(diagnosis.writer_waiting && diagnosis.is_stuck) {
            return Err(DataBlockError::NotStuck {
                name: self.name.to_string(),
                slot_id: slot_index,
            });
        }

        let slot = self.segment.slot_rw(slot_index);
        slot.reader_count.store(0, Ordering::Release);
        self.segment
            .header()
            .metrics
            .recovery_actions
            .fetch_add(1, Ordering::Relaxed);
        warn!(channel = %self.name, slot_index, stale_count = diagnosis.reader_count, force, "zombie readers released");
        Ok(())
    }

    /// Clear every heartbeat slot whose last heartbeat is older than
    /// `timeout_ns`, decrementing `active_consumer_count` for each.
    /// Returns the heartbeat indices cleared.
    pub fn cleanup_dead_consumers(&self, timeout_ns: u64) -> Vec<usize> {
        let header = self.segment.header();
        let now = platform::monotonic_nanos();
        let mut cleared = Vec::new();

        for (i, hb) in header.heartbeats.iter().enumerate() {
            if !hb.is_claimed(Ordering::Acquire) {
                continue;
            }
            let last = hb.last_heartbeat_ns.load(Ordering::Acquire);
            if now.saturating_sub(last) > timeout_ns {
                let consumer_id = hb.consumer_id.swap(0, Ordering::AcqRel);
                hb.last_heartbeat_ns.store(0, Ordering::Release);
                header.active_consumer_count.fetch_sub(1, Ordering::AcqRel);
                info!(channel = %self.name, heartbeat_index = i, consumer_id, "dead consumer heartbeat cleared");
                cleared.push(i);
            }
        }
        cleared
    }

    /// Check magic, version, init state, index ordering (`commit_index
    /// <= write_index`), and, if checksums are enabled, the on-demand
    /// checksum of every committed slot.
    pub fn validate_integrity(&self) -> DataBlockResult<()> {
        let header = self.segment.header();

        if header.magic.load(Ordering::Acquire) != datablock_common::consts::DATABLOCK_MAGIC {
            return Err(DataBlockError::CorruptHeader {
                name: self.name.to_string(),
                reason: "magic mismatch".to_string(),
            });
        }
        if header.init_state(Ordering::Acquire) != InitState::FullyInitialized {
            return Err(DataBlockError::CorruptHeader {
                name: self.name.to_string(),
                reason: "init state is not FullyInitialized".to_string(),
            });
        }

        let write_index = header.write_index.load(Ordering::Acquire);
        let commit_index = header.commit_index.load(Ordering::Acquire);
        if commit_index > write_index {
            return Err(DataBlockError::CorruptHeader {
                name: self.name.to_string(),
                reason: format!("commit_index {commit_index} > write_index {write_index}"),
            });
        }

        for i in 0..self.capacity() as usize {
            let slot = self.segment.slot_rw(i);
            if slot.state(Ordering::Acquire) != SlotState::Committed {
                continue;
            }
            if let Some(checksum) = self.segment.slot_checksum(i) {
                if !checksum.verify(self.segment.slot_payload(i)) {
                    return Err(DataBlockError::ChecksumFailure {
                        name: self.name.to_string(),
                        slot_id: Some(i as u64),
                    });
                }
            }
        }

        Ok(())
    }

    /// Sweep every slot plus the heartbeat array and either apply every
    /// safe recovery action found, or, when `dry_run` is set, only
    /// report what would be applied.
    pub fn auto_recover(&self, heartbeat_timeout_ns: u64, dry_run: bool) -> Vec<RecoveryAction> {
        let mut actions = Vec::new();

        for diagnosis in self.diagnose_all() {
            if diagnosis.write_lock_holder != 0 && !diagnosis.writer_alive {
                if !dry_run {
                    let _ = self.release_zombie_writer(diagnosis.slot_index);
                }
                actions.push(RecoveryAction::ReleasedZombieWriter {
                    slot_index: diagnosis.slot_index,
                    pid: diagnosis.write_lock_holder,
                });
                continue;
            }
            if diagnosis.writer_waiting && diagnosis.is_stuck && diagnosis.reader_count > 0 {
                if !dry_run {
                    let _ = self.release_zombie_readers(diagnosis.slot_index, false);
                }
                actions.push(RecoveryAction::ReleasedZombieReaders {
                    slot_index: diagnosis.slot_index,
                    stale_count: diagnosis.reader_count,
                });
            }
        }

        let header = self.segment.header();
        let now = platform::monotonic_nanos();
        for (i, hb) in header.heartbeats.iter().enumerate() {
            if !hb.is_claimed(Ordering::Acquire) {
                continue;
            }
            let last = hb.last_heartbeat_ns.load(Ordering::Acquire);
            if now.saturating_sub(last) <= heartbeat_timeout_ns {
                continue;
            }
            let consumer_id = hb.consumer_id.load(Ordering::Acquire);
            if !dry_run {
                hb.consumer_id.store(0, Ordering::Release);
                hb.last_heartbeat_ns.store(0, Ordering::Release);
                header.active_consumer_count.fetch_sub(1, Ordering::AcqRel);
            }
            actions.push(RecoveryAction::ClearedDeadConsumer {
                heartbeat_index: i,
                consumer_id,
            });
        }

        if !dry_run && !actions.is_empty() {
            info!(channel = %self.name, count = actions.len(), "auto_recover applied actions");
        }
        actions
    }
}
