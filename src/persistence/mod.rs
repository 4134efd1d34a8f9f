//! On-disk logs for writes that cannot reach the live backend
//!
//! Three stores share one record format and layout: the failure log
//! (populated when a shard is unreachable), the backpressure log (populated
//! deliberately while a shard or the whole source is shedding load), and the
//! corrupt-frame log (populated by the frame validator). Each store is a
//! directory per source with one append-only file per shard tag; replay
//! consumes the file and is at-least-once.

pub mod backpressure;
pub mod corrupt;
pub mod disk;
pub mod failure;

pub use backpressure::{BackpressureLog, SOURCE_WIDE_TAG};
pub use corrupt::CorruptFrameLog;
pub use disk::{DiskLog, StoredWrite};
pub use failure::FailureLog;
