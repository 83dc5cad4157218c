//! Slot iterator abstraction used by consumers to walk the committed
//! ring in order (§4.4 "Iterator abstraction").

use crate::consumer::Consumer;
use crate::handle::ReadHandle;
use datablock_common::error::{DataBlockError, DataBlockResult};
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::rw_coordinator::Backoff;

/// Outcome of [`SlotIterator::try_next`].
pub enum NextResult {
    /// A new committed slot was acquired.
    Success(ReadHandle),
    /// The bounded wait expired with nothing newly available.
    Timeout,
    /// A zero-duration poll found nothing available right now.
    NoData,
}

/// Tracks `last_seen_slot_id` and polls `commit_index` with exponential
/// back-off to surface newly committed slots in order (§4.4).
pub struct SlotIterator<'a> {
    consumer: &'a Consumer,
    last_seen_slot_id: Option<u64>,
}

impl<'a> SlotIterator<'a> {
    pub(crate) fn new(consumer: &'a Consumer) -> Self {
        Self {
            consumer,
            last_seen_slot_id: None,
        }
    }

    fn next_candidate(&self) -> u64 {
        self.last_seen_slot_id.map(|s| s + 1).unwrap_or(0)
    }

    /// Poll for the next committed slot, blocking with exponential
    /// back-off up to `timeout`.
    ///
    /// A `timeout` of [`Duration::ZERO`] makes this a non-blocking check:
    /// it returns [`NextResult::NoData`] immediately if nothing is ready
    /// rather than [`NextResult::Timeout`] (the distinction the two
    /// variants draw — a zero-wait miss is not the same event as an
    /// exhausted bounded wait).
    pub fn try_next(&mut self, timeout: Duration) -> DataBlockResult<NextResult> {
        let header = self.consumer.segment().header();
        let mut backoff = Backoff::new(timeout);

        loop {
            let commit_index = header.commit_index.load(Ordering::Acquire);
            let candidate = self.next_candidate();

            if candidate <= commit_index {
                match self.consumer.acquire_consume(candidate, Duration::ZERO) {
                    Ok(handle) => {
                        self.last_seen_slot_id = Some(candidate);
                        return Ok(NextResult::Success(handle));
                    }
                    Err(DataBlockError::NotReady { .. }) => {
                        // Raced the writer's reclaim; fall through to
                        // back-off and retry rather than surfacing an error.
                    }
                    Err(e) => return Err(e),
                }
            }

            if backoff.expired() {
                return Ok(if timeout.is_zero() {
                    NextResult::NoData
                } else {
                    NextResult::Timeout
                });
            }
            backoff.wait();
        }
    }

    /// Jump the cursor to the current `commit_index`, skipping any
    /// backlog: the next [`SlotIterator::try_next`] waits for a slot
    /// committed after this call rather than replaying history.
    pub fn seek_latest(&mut self) {
        let commit_index = self.consumer.segment().header().commit_index.load(Ordering::Acquire);
        self.last_seen_slot_id = Some(commit_index);
    }

    /// Position the cursor so the next [`SlotIterator::try_next`] reads
    /// `id`.
    pub fn seek_to(&mut self, id: u64) {
        self.last_seen_slot_id = id.checked_sub(1);
    }

    /// The last slot id successfully yielded, if any.
    pub fn last_seen_slot_id(&self) -> Option<u64> {
        self.last_seen_slot_id
    }
}
