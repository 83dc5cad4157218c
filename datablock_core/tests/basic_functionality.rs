//! Basic functionality tests for the DataBlock runtime

use datablock_core::config::{ChecksumPolicy, DataBlockConfig, UnitSize};
use datablock_core::consumer::Consumer;
use datablock_core::iterator::NextResult;
use datablock_core::producer::Producer;
use datablock_common::error::{DataBlockError, DataBlockResult};
use std::time::Duration;

fn channel_name(tag: &str) -> String {
    format!("it_basic_{}_{}", tag, std::process::id())
}

fn small_config() -> DataBlockConfig {
    DataBlockConfig {
        ring_capacity: 4,
        unit_size: UnitSize::Small,
        flex_zone_size: 1024,
        ..DataBlockConfig::default()
    }
}

#[test]
fn basic_write_read() -> DataBlockResult<()> {
    let name = channel_name("write_read");
    let producer = Producer::create(&name, small_config())?;
    let mut handle = producer.acquire_write(Duration::from_millis(100))?;
    let payload = b"Hello, DataBlock!";
    handle.payload_mut()[..payload.len()].copy_from_slice(payload);
    handle.commit(payload.len())?;

    let consumer = Consumer::attach(&name, 0, None)?;
    let read = consumer.acquire_consume(0, Duration::from_millis(100))?;
    assert_eq!(&read.payload()[..payload.len()], payload);
    read.release()?;
    Ok(())
}

#[test]
fn multiple_writes_read_in_order() -> DataBlockResult<()> {
    let name = channel_name("multi_write");
    let producer = Producer::create(&name, small_config())?;
    let consumer = Consumer::attach(&name, 0, None)?;

    for i in 0..10u8 {
        let mut handle = producer.acquire_write(Duration::from_millis(100))?;
        handle.payload_mut()[0] = i;
        handle.commit(1)?;

        let read = consumer.acquire_consume(i as u64, Duration::from_millis(100))?;
        assert_eq!(read.payload()[0], i);
        read.release()?;
    }
    Ok(())
}

#[test]
fn concurrent_readers_see_same_committed_slot() -> DataBlockResult<()> {
    let name = channel_name("concurrent_readers");
    let producer = Producer::create(&name, small_config())?;
    let mut handle = producer.acquire_write(Duration::from_millis(100))?;
    handle.payload_mut()[0] = 0x42;
    handle.commit(1)?;

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let name = name.clone();
            std::thread::spawn(move || -> DataBlockResult<()> {
                let consumer = Consumer::attach(&name, 0, None)?;
                let read = consumer.acquire_consume(0, Duration::from_millis(100))?;
                assert_eq!(read.payload()[0], 0x42);
                read.release()?;
                Ok(())
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap()?;
    }
    Ok(())
}

#[test]
fn create_rejects_duplicate_channel_name() {
    let name = channel_name("duplicate");
    let _first = Producer::create(&name, small_config()).unwrap();
    let second = Producer::create(&name, small_config());
    assert!(matches!(second, Err(DataBlockError::AlreadyExists { .. })));
}

#[test]
fn attach_rejects_missing_channel() {
    let name = channel_name("missing");
    let result = Consumer::attach(&name, 0, None);
    assert!(matches!(result, Err(DataBlockError::NotFound { .. })));
}

#[test]
fn zero_capacity_config_is_rejected() {
    let name = channel_name("zero_cap");
    let mut cfg = small_config();
    cfg.ring_capacity = 0;
    let result = Producer::create(&name, cfg);
    assert!(matches!(result, Err(DataBlockError::InvalidConfig { .. })));
}

// End-to-end scenario 1: single-slot hot value.
#[test]
fn scenario_single_slot_hot_value() -> DataBlockResult<()> {
    let name = channel_name("hot_value");
    let mut cfg = small_config();
    cfg.ring_capacity = 1;
    cfg.checksum_policy = ChecksumPolicy::Disabled;
    let producer = Producer::create(&name, cfg)?;

    let mut first = vec![0u8; 4096];
    first[0] = 0x01;
    first[1] = 0x02;
    first[2] = 0x03;
    let mut w = producer.acquire_write(Duration::from_millis(100))?;
    w.payload_mut().copy_from_slice(&first);
    w.commit(4096)?;

    let a = Consumer::attach(&name, 0, None)?;
    let b = Consumer::attach(&name, 0, None)?;

    let ra = a.acquire_consume(0, Duration::from_millis(100))?;
    assert_eq!(ra.payload()[..3], first[..3]);
    let outcome_a = ra.release()?;
    assert!(!outcome_a.raced);

    let rb = b.acquire_consume(0, Duration::from_millis(100))?;
    assert_eq!(rb.payload()[..3], first[..3]);
    let outcome_b = rb.release()?;
    assert!(!outcome_b.raced);

    let mut second = vec![0xAAu8; 4096];
    second[1] = 0xBB;
    let mut w2 = producer.acquire_write(Duration::from_millis(100))?;
    w2.payload_mut().copy_from_slice(&second);
    w2.commit(4096)?;

    let mut iter_a = a.slot_iterator();
    iter_a.seek_to(1);
    match iter_a.try_next(Duration::from_millis(100))? {
        NextResult::Success(handle) => {
            assert_eq!(handle.payload()[..2], second[..2]);
            handle.release()?;
        }
        _ => panic!("expected the second commit to be visible"),
    }

    let snapshot = producer.metrics_snapshot();
    assert_eq!(snapshot.total_slots_read, 2);
    assert_eq!(snapshot.reader_race_detected, 0);
    Ok(())
}

// End-to-end scenario 6: schema mismatch on attach.
#[test]
fn scenario_schema_mismatch_on_attach() {
    let name = channel_name("schema_mismatch");
    let h1 = [1u8; 32];
    let h2 = [2u8; 32];
    let mut cfg = small_config();
    cfg.schema_hash = h1;
    let _producer = Producer::create(&name, cfg).unwrap();

    let wrong = Consumer::attach(&name, 0, Some(h2));
    assert!(matches!(wrong, Err(DataBlockError::SchemaMismatch { .. })));

    let right = Consumer::attach(&name, 0, Some(h1));
    assert!(right.is_ok());
}

// End-to-end scenario 8 (§7 list item 8): one-bit secret mismatch.
#[test]
fn secret_mismatch_rejects_attach() {
    let name = channel_name("secret_bitflip");
    let mut cfg = small_config();
    cfg.shared_secret = 0xDEAD_BEEF;
    let _producer = Producer::create(&name, cfg).unwrap();

    let result = Consumer::attach(&name, 0xDEAD_BEEE, None);
    assert!(matches!(result, Err(DataBlockError::SecretMismatch { .. })));
}

// Round-trip/idempotence law: release without commit leaves slot state unchanged.
#[test]
fn abort_leaves_slot_and_commit_index_unchanged() -> DataBlockResult<()> {
    let name = channel_name("abort_idempotent");
    let producer = Producer::create(&name, small_config())?;
    let header = producer.segment().header();
    let before_commit_index = header.commit_index.load(std::sync::atomic::Ordering::Acquire);

    let handle = producer.acquire_write(Duration::from_millis(100))?;
    handle.abort();

    assert_eq!(
        header.commit_index.load(std::sync::atomic::Ordering::Acquire),
        before_commit_index
    );
    Ok(())
}
