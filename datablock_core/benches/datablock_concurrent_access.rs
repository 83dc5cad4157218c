//! Concurrent access performance benchmarks

use criterion::{criterion_group, criterion_main, Criterion};
use datablock_core::config::DataBlockConfig;
use datablock_core::consumer::Consumer;
use datablock_core::producer::Producer;
use std::hint::black_box;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn bench_config() -> DataBlockConfig {
    DataBlockConfig {
        ring_capacity: 8,
        ..DataBlockConfig::default()
    }
}

/// Several readers draining the same committed slot concurrently.
fn bench_concurrent_readers(c: &mut Criterion) {
    let name = format!("bench_concurrent_{}", std::process::id());
    let producer = Producer::create(&name, bench_config()).unwrap();
    let mut handle = producer.acquire_write(Duration::from_millis(100)).unwrap();
    handle.payload_mut()[0] = 0xAA;
    handle.commit(1).unwrap();

    c.bench_function("concurrent_10_readers", |b| {
        b.iter(|| {
            let barrier = Arc::new(Barrier::new(10));
            let mut handles = Vec::new();
            for _ in 0..10 {
                let name = name.clone();
                let barrier = Arc::clone(&barrier);
                handles.push(thread::spawn(move || {
                    let consumer = Consumer::attach(&name, 0, None).unwrap();
                    barrier.wait();
                    for _ in 0..50 {
                        let read = consumer.acquire_consume(0, Duration::from_millis(100)).unwrap();
                        black_box(read.payload()[0]);
                        read.release().unwrap();
                    }
                }));
            }
            for h in handles {
                h.join().unwrap();
            }
        });
    });
}

/// One writer cycling slots while a reader drains behind it.
fn bench_reader_under_write_pressure(c: &mut Criterion) {
    c.bench_function("reader_under_write_pressure", |b| {
        b.iter(|| {
            let name = format!("bench_pressure_{}_{}", std::process::id(), fastrand_seed());
            let barrier_created = Arc::new(Barrier::new(2));
            let barrier_start = Arc::new(Barrier::new(2));

            let bc_writer = Arc::clone(&barrier_created);
            let bs_writer = Arc::clone(&barrier_start);
            let writer_name = name.clone();
            let writer_handle = thread::spawn(move || {
                let producer = Producer::create(&writer_name, bench_config()).unwrap();
                bc_writer.wait();
                bs_writer.wait();
                for i in 0..50u8 {
                    let mut w = producer.acquire_write(Duration::from_millis(200)).unwrap();
                    w.payload_mut()[0] = i;
                    w.commit(1).unwrap();
                    thread::yield_now();
                }
            });

            let bc_reader = Arc::clone(&barrier_created);
            let bs_reader = Arc::clone(&barrier_start);
            let reader_name = name.clone();
            let reader_handle = thread::spawn(move || {
                bc_reader.wait();
                let consumer = loop {
                    match Consumer::attach(&reader_name, 0, None) {
                        Ok(c) => break c,
                        Err(_) => thread::yield_now(),
                    }
                };
                bs_reader.wait();
                let mut iter = consumer.slot_iterator();
                for _ in 0..50 {
                    if let datablock_core::iterator::NextResult::Success(handle) =
                        iter.try_next(Duration::from_millis(200)).unwrap()
                    {
                        black_box(handle.payload()[0]);
                        let _ = handle.release();
                    }
                }
            });

            writer_handle.join().unwrap();
            reader_handle.join().unwrap();
        });
    });
}

fn fastrand_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
}

criterion_group!(benches, bench_concurrent_readers, bench_reader_under_write_pressure);
criterion_main!(benches);
