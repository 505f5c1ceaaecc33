//! Tails every partition of a sharded, append-only stream (Kinesis or DynamoDB Streams style)
//! as one merged sequence of records.
//!
//! # Overview
//!
//! A [`StreamTailer`] makes sure the stream exists, lists its partitions with a
//! [`PartitionCatalog`] and starts one reader task per partition. Readers fetch batches through
//! an opaque [`Cursor`], pass the records on in order and wait for the poll interval whenever
//! they caught up with their partition. A reader ends on its own once the service reports that
//! its partition was closed (split or merged) and fully read.
//!
//! A supervisor task lists the partitions again every rescan interval and starts readers for
//! partitions it has not seen before, reading them from the earliest record so that nothing
//! written to a new partition between its creation and its discovery is lost.
//!
//! ```text
//!            +-------------+   rescan    +------------------+
//!            | supervisor  |-----------> | PartitionCatalog |
//!            +-------------+             +------------------+
//!              | spawns
//!              v
//!   +--------+ +--------+ +--------+
//!   | reader | | reader | | reader |  one per partition
//!   +--------+ +--------+ +--------+
//!        \          |          /
//!         v         v         v
//!        merged records (Tailer::records)
//! ```
//!
//! # Ordering and delivery
//!
//! Records of one partition are delivered in sequence number order. There is no order across
//! partitions, and no fairness between them. Delivery is at most once per tailer: nothing is
//! checkpointed, a new tailer starts from its configured position again.
//!
//! # Failures
//!
//! The tailer never retries service calls, use a [`RetryingService`] for that. A failed reader
//! stops the whole tailer and its error is the last item of the merged sequence. A failed
//! rescan is only logged.

pub mod catalog;
pub mod config;
pub mod error;
mod handle;
pub mod mock;
mod reader;
pub mod retry;
pub mod service;
mod supervisor;
mod tailer;

pub use catalog::PartitionCatalog;
pub use config::TailerConfig;
pub use error::{Error, Result};
pub use handle::Tailer;
pub use reader::ReaderState;
pub use retry::{BackoffConfig, RetryingService};
pub use service::{
    CreateStreamOptions, Cursor, EnsureOutcome, FetchedBatch, PageToken, Partition, PartitionId,
    PartitionPage, PartitionedStream, PositionSpec, Record, SequenceNumber, ServiceError,
    ServiceErrorKind, StreamAdmin, StreamService,
};
pub use tailer::{StreamTailer, TailerState, start};

