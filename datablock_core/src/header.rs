//! Segment header layout (§3 "Header", §6.2).
//!
//! Byte-for-byte layout is compatibility-critical: every multi-byte field
//! is little-endian (true for all targets this crate builds on) and
//! naturally aligned, every atomic field is naturally sized, and the
//! struct carries `repr(C, align(64))` so the header itself never shares
//! a cache line with the first slot's RW state.

use crate::metrics::MetricsBlock;
use datablock_common::consts::{MAX_HEARTBEAT_SLOTS, SCHEMA_HASH_SIZE, USER_COUNTER_COUNT, USER_SPINLOCK_COUNT};
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Three-valued initialisation state (§3 Invariants: "Initialisation order").
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Segment has been truncated and zero-filled but nothing else.
    Uninit = 0,
    /// The robust control mutex has been constructed in place.
    MutexReady = 1,
    /// Every header field is valid and `magic` has been written.
    FullyInitialized = 2,
}

impl InitState {
    /// Decode a raw `u32`, defaulting unrecognised values to `Uninit`
    /// (a consumer spin-waiting on this will simply keep waiting, which
    /// is the safe failure mode for a corrupt or torn read).
    pub fn from_u32(raw: u32) -> InitState {
        match raw {
            1 => InitState::MutexReady,
            2 => InitState::FullyInitialized,
            _ => InitState::Uninit,
        }
    }
}

/// One user-addressable spinlock slot, 16 bytes (§6.2: "user spinlock array
/// (8 x 16 B)").
#[repr(C, align(16))]
pub struct UserSpinlock {
    state: AtomicU32,
    _pad: [u8; 12],
}

const_assert_eq!(std::mem::size_of::<UserSpinlock>(), 16);

impl UserSpinlock {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            _pad: [0; 12],
        }
    }

    /// Spin (bounded by the caller's own timeout loop) until the lock is
    /// acquired. Returns once the CAS from 0 -> 1 succeeds.
    pub fn acquire(&self) {
        let mut backoff_ns = datablock_common::consts::BACKOFF_INITIAL_NS;
        while self
            .state
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::sleep(std::time::Duration::from_nanos(backoff_ns));
            backoff_ns = (backoff_ns * 2).min(datablock_common::consts::BACKOFF_MAX_NS);
        }
    }

    /// Release a previously acquired lock.
    pub fn release(&self) {
        self.state.store(0, Ordering::Release);
    }
}

/// Per-channel configuration mirrored into the header so any attacher can
/// read it without an out-of-band config file (§3 "Header").
#[repr(C)]
pub struct ConfigBlock {
    /// Ring capacity `N`.
    pub ring_capacity: u32,
    /// Payload unit size in bytes.
    pub unit_size: u32,
    /// Flexible-zone size in bytes.
    pub flex_zone_size: u64,
    /// `0` = no checksum array allocated, nonzero = allocated.
    pub checksum_enabled: u8,
    /// 0 = disabled, 1 = enforced, 2 = manual. Only meaningful when
    /// `checksum_enabled != 0`.
    pub checksum_policy: u8,
    _pad: [u8; 6],
}

const_assert_eq!(std::mem::size_of::<ConfigBlock>(), 24);

/// Opaque storage for the platform's process-shared robust mutex.
/// Interpreted by the `platform` module; the header treats it as bytes.
#[repr(C, align(8))]
pub struct MutexStorage {
    bytes: [u8; 64],
}

const_assert_eq!(std::mem::size_of::<MutexStorage>(), 64);

impl MutexStorage {
    /// Raw pointer to the storage, for the platform layer to construct or
    /// interpret a `pthread_mutex_t` in place.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.bytes.as_ptr() as *mut u8
    }
}

/// One consumer heartbeat record, cache-padded to 64 bytes (§4.5).
#[repr(C, align(64))]
pub struct HeartbeatSlot {
    /// Nonzero consumer id once claimed, 0 when free.
    pub consumer_id: AtomicU64,
    /// Monotonic nanosecond timestamp of the last heartbeat write.
    pub last_heartbeat_ns: AtomicU64,
    _pad: [u8; 48],
}

const_assert_eq!(std::mem::size_of::<HeartbeatSlot>(), 64);

impl HeartbeatSlot {
    fn new() -> Self {
        Self {
            consumer_id: AtomicU64::new(0),
            last_heartbeat_ns: AtomicU64::new(0),
            _pad: [0; 48],
        }
    }

    /// Whether this slot currently carries a live registration.
    pub fn is_claimed(&self, ordering: Ordering) -> bool {
        self.consumer_id.load(ordering) != 0
    }
}

/// Fixed-size segment header (§6.2).
///
/// An early sizing note called for an approximate header of 768 bytes;
/// that figure predates the schema hash, config mirror, and
/// active-consumer-count fields this layout also carries in-header (so a
/// consumer can validate identity and compatibility from the mapping
/// alone, without a side-channel config file), so the header runs larger
/// than that in practice. The *relative order* and *individual field
/// sizes* of the original fields (magic at 0..7, secret at 8..23,
/// version at 24..27, and so on) are preserved bit for bit.
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Bytes 0..7. Written last during initialisation.
    pub magic: AtomicU64,
    /// Bytes 8..23. 128-bit capability token across two 64-bit words.
    pub shared_secret: [AtomicU64; 2],
    /// Bytes 24..27.
    pub version: AtomicU32,
    /// Bytes 28..31. Equal to `size_of::<SegmentHeader>()`.
    pub header_size: u32,
    /// Bytes 32..35. See [`InitState`].
    pub init_state: AtomicU32,
    _pad0: u32,

    /// Next slot id to be written. Producer-only mutation.
    pub write_index: AtomicU64,
    /// Greatest slot id visible to readers.
    pub commit_index: AtomicU64,
    /// Advisory low-watermark for ring-full detection. Advanced to
    /// `slot_id + 1` by [`crate::rw_coordinator::release_read_slot`] as
    /// readers finish consuming each slot (§4.4 Ring: "reader advances
    /// `read_index` as it consumes").
    pub read_index: AtomicU64,

    /// Schema hash (32 bytes), `[0;32]` disables schema checking.
    pub schema_hash: [u8; SCHEMA_HASH_SIZE],
    /// Schema version, independent of the hash.
    pub schema_version: u32,
    _pad1: u32,

    /// Mirrored channel configuration.
    pub config: ConfigBlock,

    /// Count of consumers currently attached.
    pub active_consumer_count: AtomicU32,
    _pad2: u32,

    /// Robust process-shared control mutex storage.
    pub mutex_storage: MutexStorage,

    /// User-addressable spinlocks for ad-hoc coordination.
    pub spinlocks: [UserSpinlock; USER_SPINLOCK_COUNT],
    /// User-addressable 64-bit counters for ad-hoc coordination.
    pub counters: [AtomicU64; USER_COUNTER_COUNT],

    /// In-header observability block.
    pub metrics: MetricsBlock,

    /// Consumer heartbeat registry.
    pub heartbeats: [HeartbeatSlot; MAX_HEARTBEAT_SLOTS],
}

const_assert_eq!(std::mem::align_of::<SegmentHeader>(), 64);

impl SegmentHeader {
    /// Zero-fill and populate every field except `magic` and `init_state`,
    /// per the create sequence in §4.1 (steps 5-7 happen here; steps 8-9
    /// — the release fence and writing `magic` — are the caller's
    /// responsibility once this returns, because they must happen after
    /// the mutex is constructed in place).
    ///
    /// # Safety
    /// `dst` must point to at least `size_of::<SegmentHeader>()` bytes of
    /// writable, exclusively-owned memory, suitably aligned.
    pub unsafe fn initialize_in_place(
        dst: *mut SegmentHeader,
        config: &crate::config::DataBlockConfig,
        version: u32,
    ) {
        unsafe {
            std::ptr::write_bytes(dst as *mut u8, 0, std::mem::size_of::<SegmentHeader>());

            let header = &*dst;
            header.version.store(version, Ordering::Relaxed);
            std::ptr::write(
                &header.header_size as *const u32 as *mut u32,
                std::mem::size_of::<SegmentHeader>() as u32,
            );
            header.init_state.store(InitState::Uninit as u32, Ordering::Relaxed);

            header.write_index.store(0, Ordering::Relaxed);
            header.commit_index.store(0, Ordering::Relaxed);
            header.read_index.store(0, Ordering::Relaxed);

            std::ptr::write(
                &header.schema_hash as *const [u8; SCHEMA_HASH_SIZE] as *mut [u8; SCHEMA_HASH_SIZE],
                config.schema_hash,
            );
            std::ptr::write(
                &header.schema_version as *const u32 as *mut u32,
                config.schema_version,
            );

            let secret_lo = (config.shared_secret & 0xFFFF_FFFF_FFFF_FFFF) as u64;
            let secret_hi = (config.shared_secret >> 64) as u64;
            header.shared_secret[0].store(secret_lo, Ordering::Relaxed);
            header.shared_secret[1].store(secret_hi, Ordering::Relaxed);

            let cfg_block = ConfigBlock {
                ring_capacity: config.ring_capacity,
                unit_size: config.unit_size.bytes() as u32,
                flex_zone_size: config.flex_zone_size as u64,
                checksum_enabled: config.checksum_policy.is_enabled() as u8,
                checksum_policy: match config.checksum_policy {
                    crate::config::ChecksumPolicy::Disabled => 0,
                    crate::config::ChecksumPolicy::Enforced => 1,
                    crate::config::ChecksumPolicy::Manual => 2,
                },
                _pad: [0; 6],
            };
            std::ptr::write(&header.config as *const ConfigBlock as *mut ConfigBlock, cfg_block);

            header.active_consumer_count.store(0, Ordering::Relaxed);

            for slot in header.spinlocks.iter() {
                std::ptr::write(slot as *const UserSpinlock as *mut UserSpinlock, UserSpinlock::new());
            }
            for slot in header.heartbeats.iter() {
                std::ptr::write(slot as *const HeartbeatSlot as *mut HeartbeatSlot, HeartbeatSlot::new());
            }
            std::ptr::write(
                &header.metrics as *const MetricsBlock as *mut MetricsBlock,
                MetricsBlock::new(),
            );
        }
    }

    /// Reassemble the 128-bit shared secret from its two header words.
    pub fn shared_secret_value(&self) -> u128 {
        let lo = self.shared_secret[0].load(Ordering::Relaxed) as u128;
        let hi = self.shared_secret[1].load(Ordering::Relaxed) as u128;
        (hi << 64) | lo
    }

    /// Load `init_state`.
    pub fn init_state(&self, ordering: Ordering) -> InitState {
        InitState::from_u32(self.init_state.load(ordering))
    }

    /// Checksum policy mirrored in the header config block.
    pub fn checksum_policy(&self) -> crate::config::ChecksumPolicy {
        match self.config.checksum_policy {
            1 => crate::config::ChecksumPolicy::Enforced,
            2 => crate::config::ChecksumPolicy::Manual,
            _ => crate::config::ChecksumPolicy::Disabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataBlockConfig;

    #[test]
    fn component_sizes_match_layout() {
        assert_eq!(std::mem::size_of::<UserSpinlock>(), 16);
        assert_eq!(std::mem::size_of::<ConfigBlock>(), 24);
        assert_eq!(std::mem::size_of::<MutexStorage>(), 64);
        assert_eq!(std::mem::size_of::<HeartbeatSlot>(), 64);
        assert_eq!(std::mem::size_of::<MetricsBlock>(), 256);
    }

    #[test]
    fn header_size_is_cache_line_multiple() {
        assert_eq!(std::mem::size_of::<SegmentHeader>() % 64, 0);
    }

    #[test]
    fn initialize_in_place_populates_indices_and_config() {
        let mut buf = vec![0u8; std::mem::size_of::<SegmentHeader>()];
        let ptr = buf.as_mut_ptr() as *mut SegmentHeader;
        let mut cfg = DataBlockConfig::default();
        cfg.shared_secret = 0x1234_5678_9abc_def0_1122_3344_5566_7788;
        unsafe { SegmentHeader::initialize_in_place(ptr, &cfg, 1) };
        let header = unsafe { &*ptr };

        assert_eq!(header.init_state(Ordering::Acquire), InitState::Uninit);
        assert_eq!(header.write_index.load(Ordering::Acquire), 0);
        assert_eq!(header.commit_index.load(Ordering::Acquire), 0);
        assert_eq!(header.shared_secret_value(), cfg.shared_secret);
        assert_eq!(header.config.ring_capacity, cfg.ring_capacity);
        assert_eq!(header.header_size as usize, std::mem::size_of::<SegmentHeader>());
    }

    #[test]
    fn init_state_from_u32_is_lenient() {
        assert_eq!(InitState::from_u32(0), InitState::Uninit);
        assert_eq!(InitState::from_u32(1), InitState::MutexReady);
        assert_eq!(InitState::from_u32(2), InitState::FullyInitialized);
        assert_eq!(InitState::from_u32(99), InitState::Uninit);
    }
}
