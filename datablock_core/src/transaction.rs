//! Scoped transaction wrappers (§6.1 "Transaction wrappers"): acquire a
//! handle, run a caller-supplied closure, and guarantee the handle is
//! released on every exit path. Adds no concurrency over the primitive
//! `acquire_write`/`acquire_consume` operations; the only thing it buys
//! is "you cannot forget to release".

use crate::consumer::Consumer;
use crate::handle::ReleaseOutcome;
use crate::producer::Producer;
use datablock_common::error::DataBlockResult;
use std::time::Duration;

/// Acquire a write slot, run `f` against its mutable payload, and commit
/// with the byte count `f` returns. Any error from `f` aborts the write
/// instead of committing it, and the error propagates to the caller;
/// acquisition failures propagate directly.
pub fn with_write<F>(producer: &Producer, timeout: Duration, f: F) -> DataBlockResult<()>
where
    F: FnOnce(&mut [u8]) -> DataBlockResult<usize>,
{
    let mut handle = producer.acquire_write(timeout)?;
    match f(handle.payload_mut()) {
        Ok(bytes_written) => handle.commit(bytes_written),
        Err(e) => {
            handle.abort();
            Err(e)
        }
    }
}

/// Acquire the next committed slot from `slot_id`, run `f` against its
/// payload, and release. Whatever `f` returns (success or failure) is
/// released identically — a transaction read never leaves `reader_count`
/// incremented past the call.
pub fn with_read<F, R>(
    consumer: &Consumer,
    slot_id: u64,
    timeout: Duration,
    f: F,
) -> DataBlockResult<(R, ReleaseOutcome)>
where
    F: FnOnce(&[u8]) -> R,
{
    let handle = consumer.acquire_consume(slot_id, timeout)?;
    let result = f(handle.payload());
    let outcome = handle.release()?;
    Ok((result, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataBlockConfig, UnitSize};

    fn test_channel_name(tag: &str) -> String {
        format!("test_transaction_{}_{}", tag, std::process::id())
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
    fn with_write_commits_on_success() {
        let name = test_channel_name("write_ok");
        let producer = Producer::create(&name, small_config()).unwrap();
        with_write(&producer, Duration::from_millis(100), |payload| {
            payload[0] = 7;
            Ok(1)
        })
        .unwrap();
        assert_eq!(producer.metrics_snapshot().total_slots_written, 1);
    }

    #[test]
    fn with_write_aborts_on_closure_error() {
        let name = test_channel_name("write_err");
        let producer = Producer::create(&name, small_config()).unwrap();
        let err = with_write(&producer, Duration::from_millis(100), |_payload| {
            Err(datablock_common::error::DataBlockError::InvalidConfig {
                reason: "synthetic failure".to_string(),
            })
        });
        assert!(err.is_err());
        assert_eq!(producer.metrics_snapshot().total_slots_written, 0);
    }

    #[test]
    fn with_read_returns_closure_result_and_release_outcome() {
        let name = test_channel_name("read_ok");
        let producer = Producer::create(&name, small_config()).unwrap();
        let mut handle = producer.acquire_write(Duration::from_millis(100)).unwrap();
        handle.payload_mut()[0] = 0x55;
        handle.commit(1).unwrap();

        let consumer = crate::consumer::Consumer::attach(&name, 0, None).unwrap();
        let (value, outcome) =
            with_read(&consumer, 0, Duration::from_millis(100), |payload| payload[0]).unwrap();
        assert_eq!(value, 0x55);
        assert!(!outcome.raced);
    }
}
