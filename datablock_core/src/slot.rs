//! Per-slot RW coordinator state (§3 "Slot RW state", §4.2, §4.3).

use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Lifecycle state of one ring slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No writer holds the slot, no payload is published.
    Free = 0,
    /// A writer holds the slot and is filling the payload.
    Writing = 1,
    /// The payload is published and visible to readers.
    Committed = 2,
    /// A writer wants to reclaim the slot and is waiting for readers to
    /// finish (`reader_count` draining to zero).
    Draining = 3,
}

impl SlotState {
    /// Decode a raw `u8`. Any value outside the four defined states is
    /// treated as `Free` with a logged anomaly by the caller — the header
    /// layout guarantees only these four values are ever stored, so this
    /// path is only reachable over a corrupt segment.
    pub fn from_u8(raw: u8) -> Option<SlotState> {
        match raw {
            0 => Some(SlotState::Free),
            1 => Some(SlotState::Writing),
            2 => Some(SlotState::Committed),
            3 => Some(SlotState::Draining),
            _ => None,
        }
    }
}

/// One cache-aligned (64-byte) RW coordinator record, one per ring slot,
/// stored in an array immediately after the header (§6.2).
///
/// All fields are atomic and padded to exactly 64 bytes to avoid false
/// sharing between adjacent slots under concurrent access from different
/// processes.
#[repr(C, align(64))]
pub struct SlotRwState {
    /// 0 = free, otherwise the writer's process id.
    pub write_lock: AtomicU64,
    /// Count of readers with a live `ReadHandle` on this slot.
    pub reader_count: AtomicU32,
    /// Current state, see [`SlotState`].
    pub slot_state: AtomicU8,
    /// Set while a writer is waiting for readers to drain before
    /// reclaiming this slot.
    pub writer_waiting: AtomicU8,
    _pad_align: [u8; 2],
    /// Incremented on every completed write (commit). Monotonic even
    /// across forced recovery — recovery never touches this field
    /// (§4.6, §9 Open Questions).
    pub write_generation: AtomicU64,
    /// Monotonic nanosecond timestamp of the most recent `slot_state`
    /// transition. Lets the stuck-slot diagnostic measure how long a
    /// slot has sat in `Writing` or `Draining` instead of guessing from
    /// `write_lock` alone.
    pub state_entered_ns: AtomicU64,
    _pad_tail: [u8; 64 - 8 - 4 - 1 - 1 - 2 - 8 - 8],
}

const_assert_eq!(std::mem::size_of::<SlotRwState>(), 64);

impl SlotRwState {
    /// Construct a zeroed slot in the `Free` state.
    pub fn new() -> Self {
        Self {
            write_lock: AtomicU64::new(0),
            reader_count: AtomicU32::new(0),
            slot_state: AtomicU8::new(SlotState::Free as u8),
            writer_waiting: AtomicU8::new(0),
            _pad_align: [0; 2],
            write_generation: AtomicU64::new(0),
            state_entered_ns: AtomicU64::new(0),
            _pad_tail: [0; 64 - 8 - 4 - 1 - 1 - 2 - 8 - 8],
        }
    }

    /// Load `slot_state`, mapping any unrecognised byte to `Free` (the
    /// segment is corrupt in that case; callers validating integrity
    /// should treat this as a `CorruptHeader` signal).
    pub fn state(&self, ordering: Ordering) -> SlotState {
        SlotState::from_u8(self.slot_state.load(ordering)).unwrap_or(SlotState::Free)
    }

    /// Store `slot_state`.
    pub fn set_state(&self, state: SlotState, ordering: Ordering) {
        self.slot_state.store(state as u8, ordering);
    }

    /// Store `slot_state` and stamp `state_entered_ns`, for transitions
    /// the stuck-slot heuristic needs to measure (§4.6).
    pub fn set_state_timed(&self, state: SlotState, now_ns: u64, ordering: Ordering) {
        self.slot_state.store(state as u8, ordering);
        self.state_entered_ns.store(now_ns, Ordering::Release);
    }

    /// Nanoseconds elapsed since the last `slot_state` transition, given
    /// the current time.
    pub fn ns_since_state_entered(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.state_entered_ns.load(Ordering::Acquire))
    }

    /// `true` if `write_lock != 0`.
    pub fn is_locked(&self, ordering: Ordering) -> bool {
        self.write_lock.load(ordering) != 0
    }
}

impl Default for SlotRwState {
    fn default() -> Self {
        Self::new()
    }
}
