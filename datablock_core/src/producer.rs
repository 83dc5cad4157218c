//! Producer engine (§2 item 4, §6.1 "Producer operations").
//!
//! Creates and owns a channel's segment for the lifetime of the
//! producer process. The single-producer contract (§3 "Writer
//! exclusion") is enforced by the write-lock CAS in
//! [`crate::rw_coordinator`]; this engine is not itself synchronised for
//! concurrent use by multiple threads — a second writing thread is
//! rejected at the CAS, not serialised here.

use crate::config::DataBlockConfig;
use crate::handle::WriteHandle;
use crate::header::{InitState, SegmentHeader};
use crate::metrics::MetricsSnapshot;
use crate::platform;
use crate::rw_coordinator::{
    drain_readers, try_acquire_write_lock, wait_for_ring_capacity, Backoff, WriteLockOutcome,
};
use crate::segment::{Layout, Segment};
use datablock_common::consts::{CURRENT_VERSION, USER_COUNTER_COUNT, USER_SPINLOCK_COUNT};
use datablock_common::error::{DataBlockError, DataBlockResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Owns a channel's shared-memory segment from creation until the
/// producer process tears it down (§3 "Segment" lifecycle).
pub struct Producer {
    segment: Arc<Segment>,
    name: Arc<str>,
    config: DataBlockConfig,
    pid: u32,
    unlink_on_drop: bool,
}

impl Producer {
    /// Create a new channel (§4.1 "Producer create", steps 1-9).
    pub fn create(channel: &str, config: DataBlockConfig) -> DataBlockResult<Self> {
        config.validate()?;

        let layout = Layout::from_config(&config);
        let mmap = platform::create_segment_mmap(channel, layout.total_size)?;
        let base = mmap.as_ptr() as *mut SegmentHeader;

        // Steps 5-7: zero-fill, construct the mutex in place, transition
        // to MutexReady, and write the rest of the configuration. The
        // header's own `initialize_in_place` handles the zero-fill and
        // config/index/metrics population; the mutex construction and
        // the two init_state transitions bracket it here because they
        // are ordering-sensitive in a way the header helper is not.
        unsafe {
            SegmentHeader::initialize_in_place(base, &config, CURRENT_VERSION);
            let header = &*base;
            platform::ControlMutex::construct_in_place(header.mutex_storage.as_mut_ptr())?;
            header.init_state.store(InitState::MutexReady as u32, Ordering::Release);

            // Step 8: release fence, then step 9: write magic and flip to
            // FullyInitialized, making the segment attachable.
            std::sync::atomic::fence(Ordering::Release);
            header.magic.store(datablock_common::consts::DATABLOCK_MAGIC, Ordering::Relaxed);
            header.init_state.store(InitState::FullyInitialized as u32, Ordering::Release);
        }

        let segment = Arc::new(Segment::new(mmap, layout));
        let pid = platform::current_pid();

        info!(channel, capacity = config.ring_capacity, pid, "channel created");

        Ok(Self {
            segment,
            name: Arc::from(channel),
            config,
            pid,
            unlink_on_drop: true,
        })
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Segment handle, for the recovery/benchmark callers that need raw
    /// access alongside the engine.
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Acquire exclusive write access to the next slot (§4.2 "Writer
    /// Path", steps 1-4).
    pub fn acquire_write(&self, timeout: Duration) -> DataBlockResult<WriteHandle> {
        let header = self.segment.header();
        let policy = self.config.ring_policy();

        wait_for_ring_capacity(
            header,
            &self.name,
            self.config.ring_capacity,
            policy.blocks_on_full(),
            timeout,
        )?;

        let write_index = header.write_index.load(Ordering::Acquire);
        let slot_index = self.segment.slot_index(write_index);
        let slot = self.segment.slot_rw(slot_index);

        drain_readers(header, slot, &self.name, write_index, timeout)?;

        let mut backoff = Backoff::new(timeout);
        loop {
            match try_acquire_write_lock(slot, self.pid, platform::is_process_alive) {
                WriteLockOutcome::Acquired => break,
                WriteLockOutcome::HeldByLiveWriter(holder) => {
                    header.metrics.write_lock_contention.fetch_add(1, Ordering::Relaxed);
                    warn!(channel = %self.name, holder, "single-producer contract violated");
                    return Err(DataBlockError::SingleProducerViolated {
                        name: self.name.to_string(),
                    });
                }
                WriteLockOutcome::HeldByDeadWriter(holder) => {
                    header.metrics.write_lock_contention.fetch_add(1, Ordering::Relaxed);
                    return Err(DataBlockError::OwnerDead {
                        name: self.name.to_string(),
                        slot_id: write_index,
                        pid: holder,
                    });
                }
            }
            if backoff.expired() {
                header.metrics.writer_timeout_count.fetch_add(1, Ordering::Relaxed);
                return Err(DataBlockError::Timeout {
                    name: self.name.to_string(),
                    slot_id: Some(write_index),
                });
            }
            backoff.wait();
        }

        header.write_index.store(write_index + 1, Ordering::Release);

        Ok(WriteHandle::new(
            Arc::clone(&self.segment),
            Arc::clone(&self.name),
            write_index,
            slot_index,
            self.config.checksum_policy,
        ))
    }

    /// Thin wrapper matching §6.1's `commit(handle, bytes)` signature;
    /// Rust callers may equally call [`WriteHandle::commit`] directly.
    pub fn commit(&self, handle: WriteHandle, bytes: usize) -> DataBlockResult<()> {
        handle.commit(bytes)
    }

    /// Thin wrapper matching §6.1's `release(handle)` signature.
    pub fn release(&self, handle: WriteHandle) {
        handle.abort();
    }

    /// Store a value in user counter `i` (§3 "Header": user-addressable
    /// counters for ad-hoc coordination).
    pub fn set_counter(&self, i: usize, value: u64) {
        assert!(i < USER_COUNTER_COUNT, "counter index out of range");
        self.segment.header().counters[i].store(value, Ordering::Release);
    }

    /// Load user counter `i`.
    pub fn get_counter(&self, i: usize) -> u64 {
        assert!(i < USER_COUNTER_COUNT, "counter index out of range");
        self.segment.header().counters[i].load(Ordering::Acquire)
    }

    /// Acquire user spinlock `i`, spinning with back-off until it is
    /// free.
    pub fn acquire_spinlock(&self, i: usize) {
        assert!(i < USER_SPINLOCK_COUNT, "spinlock index out of range");
        self.segment.header().spinlocks[i].acquire();
    }

    /// Release user spinlock `i`.
    pub fn release_spinlock(&self, i: usize) {
        assert!(i < USER_SPINLOCK_COUNT, "spinlock index out of range");
        self.segment.header().spinlocks[i].release();
    }

    /// Recompute and store the checksum for physical slot `i` (manual
    /// policy; enforced policy already does this at commit time).
    pub fn update_checksum_slot(&self, i: usize) -> DataBlockResult<()> {
        let payload = self.segment.slot_payload(i).to_vec();
        match unsafe { self.segment.slot_checksum_mut(i) } {
            Some(checksum) => {
                checksum.update(&payload);
                Ok(())
            }
            None => Err(DataBlockError::InvalidConfig {
                reason: "checksum array is not allocated for this channel".to_string(),
            }),
        }
    }

    /// Recompute and store the flexible zone's checksum, stored by
    /// convention in its own first 32 bytes (§3 "Flexible zone":
    /// checksums there are always manual — this is the update half).
    pub fn update_checksum_flexible_zone(&self) -> DataBlockResult<()> {
        const DIGEST_LEN: usize = datablock_common::consts::SCHEMA_HASH_SIZE;
        let flex = unsafe { self.segment.flex_zone_mut() };
        if flex.len() < DIGEST_LEN {
            return Err(DataBlockError::InvalidConfig {
                reason: "flexible zone is smaller than the checksum digest".to_string(),
            });
        }
        let digest = crate::checksum::flexible_zone_digest(&flex[DIGEST_LEN..]);
        flex[..DIGEST_LEN].copy_from_slice(&digest);
        Ok(())
    }

    /// Point-in-time snapshot of the in-header metrics block.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.segment.header().metrics.snapshot()
    }

    /// Disable the unlink-on-drop behaviour, e.g. for tests that want to
    /// inspect the segment file after the `Producer` goes out of scope.
    pub fn leak_segment_file(&mut self) {
        self.unlink_on_drop = false;
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if self.unlink_on_drop {
            if let Err(e) = platform::unlink_segment(&self.name) {
                warn!(channel = %self.name, error = %e, "failed to unlink segment on producer shutdown");
            } else {
                info!(channel = %self.name, "segment unlinked on producer shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChecksumPolicy, UnitSize};

    fn test_channel_name(tag: &str) -> String {
        format!("test_producer_{}_{}", tag, std::process::id())
    }

    fn small_config() -> DataBlockConfig {
        DataBlockConfig {
            ring_capacity: 4,
            unit_size: UnitSize::Small,
            flex_zone_size: 256,
            ..DataBlockConfig::default()
        }
    }

    #[test]
    fn create_then_acquire_commit_round_trip() {
        let name = test_channel_name("roundtrip");
        let producer = Producer::create(&name, small_config()).unwrap();

        let mut handle = producer.acquire_write(Duration::from_millis(100)).unwrap();
        handle.payload_mut()[0] = 0x42;
        let slot_id = handle.slot_id();
        handle.commit(1).unwrap();

        assert_eq!(
            producer.segment.header().commit_index.load(Ordering::Acquire),
            slot_id
        );
        assert_eq!(producer.metrics_snapshot().total_slots_written, 1);
    }

    #[test]
    fn abort_leaves_slot_free_and_commit_index_unchanged() {
        let name = test_channel_name("abort");
        let producer = Producer::create(&name, small_config()).unwrap();
        let before = producer.segment.header().commit_index.load(Ordering::Acquire);

        let handle = producer.acquire_write(Duration::from_millis(100)).unwrap();
        handle.abort();

        assert_eq!(
            producer.segment.header().commit_index.load(Ordering::Acquire),
            before
        );
    }

    #[test]
    fn ring_capacity_one_always_reuses_slot_zero() {
        let name = test_channel_name("single_slot");
        let mut cfg = small_config();
        cfg.ring_capacity = 1;
        let producer = Producer::create(&name, cfg).unwrap();

        for _ in 0..3 {
            let handle = producer.acquire_write(Duration::from_millis(100)).unwrap();
            assert_eq!(handle.slot_index(), 0);
            handle.commit(0).unwrap();
        }
    }

    #[test]
    fn counters_and_spinlocks_round_trip() {
        let name = test_channel_name("counters");
        let producer = Producer::create(&name, small_config()).unwrap();
        producer.set_counter(0, 42);
        assert_eq!(producer.get_counter(0), 42);

        producer.acquire_spinlock(0);
        producer.release_spinlock(0);
    }

    #[test]
    fn checksum_update_then_verify_via_slot_checksum() {
        let name = test_channel_name("checksum_manual");
        let mut cfg = small_config();
        cfg.checksum_policy = ChecksumPolicy::Manual;
        let producer = Producer::create(&name, cfg).unwrap();

        let mut handle = producer.acquire_write(Duration::from_millis(100)).unwrap();
        handle.payload_mut()[0] = 0x11;
        handle.commit(1).unwrap();

        producer.update_checksum_slot(0).unwrap();
        let checksum = producer.segment.slot_checksum(0).unwrap();
        assert!(checksum.verify(producer.segment.slot_payload(0)));
    }
}
