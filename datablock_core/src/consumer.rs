//! Consumer engine (§2 item 5, §6.1 "Consumer operations").
//!
//! Thread-safe for independent readers: multiple threads in one process
//! may hold distinct [`crate::handle::ReadHandle`]s against the same
//! [`Consumer`], each contributing its own `reader_count` increment (§5
//! "Scheduling"). `&self` methods are all that is needed here because
//! every mutation goes through an atomic.

use crate::config::ChecksumPolicy;
use crate::handle::ReadHandle;
use crate::header::InitState;
use crate::iterator::SlotIterator;
use crate::metrics::MetricsSnapshot;
use crate::platform;
use crate::rw_coordinator::{try_acquire_read_slot, Backoff};
use crate::segment::{Layout, Segment};
use datablock_common::consts::{
    CURRENT_VERSION, MAX_HEARTBEAT_SLOTS, MIN_SUPPORTED_VERSION, USER_COUNTER_COUNT,
    USER_SPINLOCK_COUNT,
};
use datablock_common::error::{DataBlockError, DataBlockResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// Attached view of an existing channel (§4.1 "Consumer attach").
pub struct Consumer {
    segment: Arc<Segment>,
    name: Arc<str>,
    checksum_policy: ChecksumPolicy,
    consumer_id: u64,
    heartbeat_slot: Option<usize>,
}

impl Consumer {
    /// Attach to an existing channel, validating identity and optionally
    /// schema (§3 "Identity" invariant, §4.1 "Consumer attach").
    pub fn attach(
        channel: &str,
        secret: u128,
        expected_schema: Option<[u8; datablock_common::consts::SCHEMA_HASH_SIZE]>,
    ) -> DataBlockResult<Self> {
        Self::attach_with_timeout(
            channel,
            secret,
            expected_schema,
            Duration::from_millis(datablock_common::consts::DEFAULT_INIT_TIMEOUT_MS),
        )
    }

    /// As [`Consumer::attach`], with an explicit init-spin timeout.
    pub fn attach_with_timeout(
        channel: &str,
        secret: u128,
        expected_schema: Option<[u8; datablock_common::consts::SCHEMA_HASH_SIZE]>,
        init_timeout: Duration,
    ) -> DataBlockResult<Self> {
        let (mmap, observed_size) = platform::attach_segment_mmap(channel)?;
        let base = mmap.as_ptr() as *const crate::header::SegmentHeader;
        let header = unsafe { &*base };

        // §3 "Initialisation order": spin-wait on init_state before
        // trusting any other field.
        let mut backoff = Backoff::new(init_timeout);
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

        if header.magic.load(Ordering::Acquire) != datablock_common::consts::DATABLOCK_MAGIC {
            return Err(DataBlockError::MagicMismatch {
                name: channel.to_string(),
            });
        }

        let version = header.version.load(Ordering::Acquire);
        if version < MIN_SUPPORTED_VERSION || version > CURRENT_VERSION {
            return Err(DataBlockError::VersionMismatch {
                name: channel.to_string(),
                found: version,
                min: MIN_SUPPORTED_VERSION,
                max: CURRENT_VERSION,
            });
        }

        if header.shared_secret_value() != secret {
            return Err(DataBlockError::SecretMismatch {
                name: channel.to_string(),
            });
        }

        if let Some(expected) = expected_schema {
            if header.schema_hash != expected {
                return Err(DataBlockError::SchemaMismatch {
                    name: channel.to_string(),
                });
            }
        }

        let layout = Layout::from_header(header);
        let segment = Arc::new(Segment::new(mmap, layout));
        segment.validate_mapped_size(channel, observed_size)?;

        let checksum_policy = segment.header().checksum_policy();
        segment.header().active_consumer_count.fetch_add(1, Ordering::AcqRel);

        let consumer_id =
            ((platform::current_pid() as u64) << 32) | NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed);

        let mut consumer = Self {
            segment,
            name: Arc::from(channel),
            checksum_policy,
            consumer_id,
            heartbeat_slot: None,
        };
        consumer.register_heartbeat_slot();

        info!(channel, consumer_id, "consumer attached");
        Ok(consumer)
    }

    fn register_heartbeat_slot(&mut self) {
        let header = self.segment.header();
        for (i, slot) in header.heartbeats.iter().enumerate() {
            if slot
                .consumer_id
                .compare_exchange(0, self.consumer_id, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.last_heartbeat_ns.store(platform::monotonic_nanos(), Ordering::Release);
                self.heartbeat_slot = Some(i);
                return;
            }
        }
        debug!(channel = %self.name, "no free heartbeat slot out of {}", MAX_HEARTBEAT_SLOTS);
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Segment handle, shared with the iterator and recovery callers.
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// This consumer's identity as registered in the heartbeat array.
    pub fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    /// A fresh slot iterator cursor (§4.4).
    pub fn slot_iterator(&self) -> SlotIterator<'_> {
        SlotIterator::new(self)
    }

    /// Acquire a read contribution on `slot_id`, retrying with back-off
    /// until it is ready or `timeout` expires (§4.3).
    pub fn acquire_consume(&self, slot_id: u64, timeout: Duration) -> DataBlockResult<ReadHandle> {
        let header = self.segment.header();
        let slot_index = self.segment.slot_index(slot_id);
        let slot = self.segment.slot_rw(slot_index);

        let mut backoff = Backoff::new(timeout);
        loop {
            match try_acquire_read_slot(header, slot, &self.name, slot_id) {
                Ok(acq) => {
                    return Ok(ReadHandle::new(
                        Arc::clone(&self.segment),
                        Arc::clone(&self.name),
                        slot_id,
                        slot_index,
                        acq.generation,
                        self.checksum_policy,
                    ));
                }
                Err(DataBlockError::NotReady { .. }) if !backoff.expired() => {
                    backoff.wait();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Thin wrapper matching §6.1's `release(handle)` signature.
    pub fn release(&self, handle: ReadHandle) -> DataBlockResult<crate::handle::ReleaseOutcome> {
        handle.release()
    }

    /// Verify physical slot `i`'s checksum against its current payload
    /// bytes (manual policy; enforced policy verifies automatically at
    /// release).
    pub fn verify_checksum_slot(&self, i: usize) -> DataBlockResult<bool> {
        match self.segment.slot_checksum(i) {
            Some(checksum) => Ok(checksum.verify(self.segment.slot_payload(i))),
            None => Err(DataBlockError::InvalidConfig {
                reason: "checksum array is not allocated for this channel".to_string(),
            }),
        }
    }

    /// Verify the flexible zone's checksum, stored by convention in its
    /// own first 32 bytes.
    pub fn verify_checksum_flexible_zone(&self) -> DataBlockResult<bool> {
        const DIGEST_LEN: usize = datablock_common::consts::SCHEMA_HASH_SIZE;
        let flex = self.segment.flex_zone();
        if flex.len() < DIGEST_LEN {
            return Err(DataBlockError::InvalidConfig {
                reason: "flexible zone is smaller than the checksum digest".to_string(),
            });
        }
        let stored = &flex[..DIGEST_LEN];
        let computed = crate::checksum::flexible_zone_digest(&flex[DIGEST_LEN..]);
        Ok(stored == computed)
    }

    /// Load user counter `i`.
    pub fn get_counter(&self, i: usize) -> u64 {
        assert!(i < USER_COUNTER_COUNT, "counter index out of range");
        self.segment.header().counters[i].load(Ordering::Acquire)
    }

    /// Acquire/release user spinlock `i` for the duration of `f`.
    pub fn with_spinlock<R>(&self, i: usize, f: impl FnOnce() -> R) -> R {
        assert!(i < USER_SPINLOCK_COUNT, "spinlock index out of range");
        let header = self.segment.header();
        header.spinlocks[i].acquire();
        let result = f();
        header.spinlocks[i].release();
        result
    }

    /// Refresh this consumer's heartbeat timestamp (§4.5). Registers a
    /// slot now if none was available at attach time; increments
    /// `heartbeats_failed` if the array is still full.
    pub fn update_heartbeat(&mut self) -> DataBlockResult<()> {
        if self.heartbeat_slot.is_none() {
            self.register_heartbeat_slot();
        }
        let header = self.segment.header();
        match self.heartbeat_slot {
            Some(i) => {
                header.heartbeats[i].last_heartbeat_ns.store(platform::monotonic_nanos(), Ordering::Release);
                header.metrics.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
                header.metrics.last_heartbeat_ts_ns.store(platform::monotonic_nanos(), Ordering::Relaxed);
                Ok(())
            }
            None => {
                header.metrics.heartbeats_failed.fetch_add(1, Ordering::Relaxed);
                Err(DataBlockError::InvalidConfig {
                    reason: format!("no free heartbeat slot out of {}", MAX_HEARTBEAT_SLOTS),
                })
            }
        }
    }

    /// Point-in-time snapshot of the in-header metrics block.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.segment.header().metrics.snapshot()
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let header = self.segment.header();
        header.active_consumer_count.fetch_sub(1, Ordering::AcqRel);
        if let Some(i) = self.heartbeat_slot {
            header.heartbeats[i].consumer_id.store(0, Ordering::Release);
            header.heartbeats[i].last_heartbeat_ns.store(0, Ordering::Release);
        }
        debug!(channel = %self.name, consumer_id = self.consumer_id, "consumer detached");
    }
}
