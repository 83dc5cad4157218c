//! # DataBlock Core
//!
//! Zero-copy, single-host, inter-process shared-memory data exchange:
//! segment layout, the per-slot multi-reader/single-writer coordinator,
//! the producer and consumer engines built on top of it, and diagnostic
//! and recovery tooling for a segment whose producer has crashed.
//!
//! # Usage
//!
//! ```rust,no_run
//! use datablock_core::prelude::*;
//! use std::time::Duration;
//!
//! let producer = Producer::create("ticks", DataBlockConfig::default()).unwrap();
//! let mut handle = producer.acquire_write(Duration::from_millis(100)).unwrap();
//! handle.payload_mut()[0] = 1;
//! handle.commit(1).unwrap();
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod checksum;
pub mod config;
pub mod consumer;
pub mod handle;
pub mod header;
pub mod iterator;
pub mod metrics;
pub mod platform;
pub mod prelude;
pub mod producer;
pub mod recovery;
pub mod rw_coordinator;
pub mod segment;
pub mod slot;
pub mod transaction;
