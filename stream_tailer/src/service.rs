//! The capabilities the tailer consumes from a partitioned stream service.
//!
//! Concrete backends (Kinesis, DynamoDB Streams, the in-memory [`mock`]) implement
//! [`StreamAdmin`] and [`PartitionedStream`]; the tailer only ever talks to them through
//! these traits.
//!
//! [`mock`]: crate::mock

use std::{
    fmt::{Debug, Display},
    num::NonZeroU32,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Error kind of a [`ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// The stream does not exist (or was deleted).
    StreamNotFound,

    /// The partition does not exist within the stream.
    PartitionNotFound,

    /// The request was rejected because of rate limiting.
    Throttled,

    /// A transport level failure.
    Io,

    /// The request itself was malformed, e.g. it used an expired cursor.
    InvalidInput,

    /// Anything else.
    Unknown,
}

/// Error returned by a stream service.
///
/// The dynamic boxing makes it easier to deal with errors from different implementations.
#[derive(Debug)]
pub struct ServiceError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: ServiceErrorKind,
}

impl ServiceError {
    pub fn new(
        kind: ServiceErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    pub fn stream_not_found(stream: &str) -> Self {
        Self::new(
            ServiceErrorKind::StreamNotFound,
            format!("stream '{stream}' not found"),
        )
    }

    pub fn partition_not_found(stream: &str, partition: &PartitionId) -> Self {
        Self::new(
            ServiceErrorKind::PartitionNotFound,
            format!("partition {partition} not found in stream '{stream}'"),
        )
    }

    pub fn throttled(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ServiceErrorKind::Throttled, e)
    }

    pub fn invalid_input(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ServiceErrorKind::InvalidInput, e)
    }

    pub fn unknown(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ServiceErrorKind::Unknown, e)
    }

    /// Returns the kind of error this was
    pub fn kind(&self) -> ServiceErrorKind {
        self.kind
    }

    /// Returns the inner error
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }

    /// Whether repeating the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ServiceErrorKind::Throttled | ServiceErrorKind::Io
        )
    }
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServiceError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(e: std::io::Error) -> Self {
        Self {
            inner: Box::new(e),
            kind: ServiceErrorKind::Io,
        }
    }
}

impl From<String> for ServiceError {
    fn from(e: String) -> Self {
        Self::unknown(e)
    }
}

impl From<&'static str> for ServiceError {
    fn from(e: &'static str) -> Self {
        Self::unknown(e)
    }
}

/// Opaque identifier of a partition (a.k.a. shard), unique within a stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(Arc<str>);

impl PartitionId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PartitionId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Position of a record within its partition.
///
/// Only comparable between records of the same partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(v: u64) -> Self {
        Self(v)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A partition as reported by [`PartitionedStream::list_partitions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    id: PartitionId,

    /// Partitions this one was split or merged from. At most two.
    parent_ids: Vec<PartitionId>,
}

impl Partition {
    pub fn new(id: impl Into<PartitionId>) -> Self {
        Self {
            id: id.into(),
            parent_ids: vec![],
        }
    }

    /// Create a partition with split/merge lineage.
    ///
    /// # Panics
    /// When more than two parents are given.
    pub fn with_parents(id: impl Into<PartitionId>, parent_ids: Vec<PartitionId>) -> Self {
        assert!(
            parent_ids.len() <= 2,
            "a partition has at most two parents, got {}",
            parent_ids.len()
        );
        Self {
            id: id.into(),
            parent_ids,
        }
    }

    pub fn id(&self) -> &PartitionId {
        &self.id
    }

    pub fn parent_ids(&self) -> &[PartitionId] {
        &self.parent_ids
    }
}

/// Where a new [`Cursor`] should start reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSpec {
    /// The oldest record still retained by the service.
    Earliest,

    /// Just after the most recent record, i.e. only records written from now on.
    Latest,

    /// The record with exactly this sequence number (or the next one after it).
    AtSequenceNumber(SequenceNumber),

    /// The first record after this sequence number.
    AfterSequenceNumber(SequenceNumber),

    /// The first record that arrived at or after this point in time.
    AtTimestamp(DateTime<Utc>),
}

impl Display for PositionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Earliest => write!(f, "earliest"),
            Self::Latest => write!(f, "latest"),
            Self::AtSequenceNumber(seq) => write!(f, "at:{seq}"),
            Self::AfterSequenceNumber(seq) => write!(f, "after:{seq}"),
            Self::AtTimestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

impl FromStr for PositionSpec {
    type Err = String;

    /// Parses `earliest`, `latest`, `at:<seq>`, `after:<seq>` or an RFC 3339 timestamp.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_seq = |v: &str| {
            v.parse::<u64>()
                .map(SequenceNumber::new)
                .map_err(|e| format!("invalid sequence number '{v}': {e}"))
        };

        match s.trim() {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            other => {
                if let Some(v) = other.strip_prefix("at:") {
                    Ok(Self::AtSequenceNumber(parse_seq(v)?))
                } else if let Some(v) = other.strip_prefix("after:") {
                    Ok(Self::AfterSequenceNumber(parse_seq(v)?))
                } else {
                    DateTime::parse_from_rfc3339(other)
                        .map(|ts| Self::AtTimestamp(ts.with_timezone(&Utc)))
                        .map_err(|_| {
                            format!(
                                "invalid position '{other}', expected one of: earliest, \
                                latest, at:<seq>, after:<seq>, <RFC 3339 timestamp>"
                            )
                        })
                }
            }
        }
    }
}

/// Opaque, service-issued read position inside one partition.
///
/// The tailer never inspects a cursor, it only threads it from one fetch to the next.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Continuation token for [`PartitionedStream::list_partitions`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageToken(String);

impl PageToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single record read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    partition_id: PartitionId,
    sequence_number: SequenceNumber,
    data: Bytes,
    arrival_lag: Option<Duration>,
}

impl Record {
    pub fn new(
        partition_id: PartitionId,
        sequence_number: SequenceNumber,
        data: impl Into<Bytes>,
        arrival_lag: Option<Duration>,
    ) -> Self {
        Self {
            partition_id,
            sequence_number,
            data: data.into(),
            arrival_lag,
        }
    }

    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// How far behind the live head of the partition this record was when it was fetched,
    /// if the service reports it.
    pub fn arrival_lag(&self) -> Option<Duration> {
        self.arrival_lag
    }
}

/// One page of [`PartitionedStream::list_partitions`].
#[derive(Debug, Clone, Default)]
pub struct PartitionPage {
    pub partitions: Vec<Partition>,

    /// `None` when this was the last page.
    pub next_page_token: Option<PageToken>,
}

/// Response of [`PartitionedStream::fetch_batch`].
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    pub records: Vec<Record>,

    /// Cursor for the next fetch.
    ///
    /// `None` signals that the partition was closed (split or merged) and all of its records
    /// have been returned.
    pub next_cursor: Option<Cursor>,

    /// How far the next cursor is behind the head of the partition, if the service reports it.
    pub lag: Option<Duration>,
}

impl FetchedBatch {
    /// Whether the reader reached the head of the partition and should wait before polling
    /// again.
    pub fn is_caught_up(&self) -> bool {
        self.records.is_empty() || self.lag.is_some_and(|lag| lag.is_zero())
    }
}

/// Parameters used when [`StreamAdmin::ensure_stream_exists`] has to create the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateStreamOptions {
    pub partition_count: NonZeroU32,
}

impl Default for CreateStreamOptions {
    fn default() -> Self {
        Self {
            partition_count: NonZeroU32::MIN,
        }
    }
}

/// Outcome of [`StreamAdmin::ensure_stream_exists`]. Both are success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    AlreadyExists,
}

/// Stream provisioning.
#[async_trait]
pub trait StreamAdmin: Sync + Send + Debug + 'static {
    /// Create the stream if it does not exist yet, and wait until it is usable.
    async fn ensure_stream_exists(
        &self,
        stream: &str,
        options: &CreateStreamOptions,
    ) -> Result<EnsureOutcome, ServiceError>;

    /// Delete the stream and all of its partitions.
    async fn delete_stream(&self, stream: &str) -> Result<(), ServiceError>;
}

/// Partition discovery and reading.
#[async_trait]
pub trait PartitionedStream: Sync + Send + Debug + 'static {
    /// List one page of the stream's partitions, starting after `page_token` (or at the first
    /// page).
    async fn list_partitions(
        &self,
        stream: &str,
        page_token: Option<&PageToken>,
        limit: usize,
    ) -> Result<PartitionPage, ServiceError>;

    /// Open a cursor on a partition.
    ///
    /// Fails with [`ServiceErrorKind::PartitionNotFound`] if the partition does not exist.
    async fn open_cursor(
        &self,
        stream: &str,
        partition: &PartitionId,
        position: PositionSpec,
    ) -> Result<Cursor, ServiceError>;

    /// Fetch up to `limit` records starting at `cursor`.
    async fn fetch_batch(&self, cursor: &Cursor, limit: usize)
    -> Result<FetchedBatch, ServiceError>;
}

/// Everything the tailer needs from a backend.
pub trait StreamService: StreamAdmin + PartitionedStream {}

impl<T> StreamService for T where T: StreamAdmin + PartitionedStream {}
