//! In-memory [`StreamService`](crate::StreamService) for tests and demos.
//!
//! The backend behaves like a Kinesis style service: every stream has a set of partitions,
//! closed partitions stay listed (with their records) until the stream is deleted, sequence
//! numbers increase across the whole stream, and a cursor on a closed partition reports
//! exhaustion once all of its records were returned.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::{sync::Semaphore, time::Instant};

use crate::service::{
    CreateStreamOptions, Cursor, EnsureOutcome, FetchedBatch, PageToken, Partition, PartitionId,
    PartitionPage, PartitionedStream, PositionSpec, Record, SequenceNumber, ServiceError,
    StreamAdmin,
};

#[derive(Debug)]
struct MockRecord {
    sequence_number: SequenceNumber,
    data: Bytes,
    arrival: DateTime<Utc>,
}

#[derive(Debug)]
struct MockPartition {
    partition: Partition,
    records: Vec<MockRecord>,

    /// Closed partitions accept no more writes; cursors on them end once drained.
    closed: bool,

    /// Errors returned by the next fetches on this partition, in order.
    fetch_errors: VecDeque<ServiceError>,
}

#[derive(Debug, Default)]
struct MockStream {
    /// Partitions in creation order.
    partitions: Vec<MockPartition>,

    /// Source of partition names.
    next_partition_number: u64,

    /// Source of sequence numbers, shared by all partitions of the stream.
    next_sequence_number: u64,
}

impl MockStream {
    fn partition(&self, id: &PartitionId) -> Option<&MockPartition> {
        self.partitions.iter().find(|p| p.partition.id() == id)
    }

    fn partition_mut(&mut self, id: &PartitionId) -> Option<&mut MockPartition> {
        self.partitions.iter_mut().find(|p| p.partition.id() == id)
    }

    fn add_partition(&mut self, parent_ids: Vec<PartitionId>) -> PartitionId {
        let id = PartitionId::new(format!("shardId-{:012}", self.next_partition_number));
        self.next_partition_number += 1;

        self.partitions.push(MockPartition {
            partition: Partition::with_parents(id.clone(), parent_ids),
            records: vec![],
            closed: false,
            fetch_errors: VecDeque::new(),
        });

        id
    }

    fn close(&mut self, id: &PartitionId) {
        let partition = self.partition_mut(id).expect("invalid partition ID");
        assert!(!partition.closed, "partition {id} is already closed");
        partition.closed = true;
    }
}

/// Read position behind a cursor token.
#[derive(Debug, Clone)]
struct CursorPosition {
    stream: String,
    partition: PartitionId,

    /// Index of the next record to return.
    index: usize,
}

/// A recorded [`PartitionedStream::fetch_batch`] call.
#[derive(Debug, Clone)]
pub struct FetchCall {
    pub partition: PartitionId,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct MockState {
    streams: BTreeMap<String, MockStream>,
    cursors: HashMap<String, CursorPosition>,
    next_cursor_id: u64,

    /// When set, `ensure_stream_exists` does not create missing streams.
    creation_disabled: bool,

    list_errors: VecDeque<ServiceError>,
    list_calls: usize,

    fetch_calls: Vec<FetchCall>,
    fetch_latency: Duration,

    /// Fetches wait for this semaphore to be closed before they read.
    fetch_gate: Option<Arc<Semaphore>>,
}

impl MockState {
    fn stream(&self, stream: &str) -> Result<&MockStream, ServiceError> {
        self.streams
            .get(stream)
            .ok_or_else(|| ServiceError::stream_not_found(stream))
    }

    fn new_cursor(&mut self, position: CursorPosition) -> Cursor {
        let token = format!("cursor-{}", self.next_cursor_id);
        self.next_cursor_id += 1;
        self.cursors.insert(token.clone(), position);
        Cursor::new(token)
    }
}

/// In-memory stream service.
///
/// Clones share the same state, so a test can keep one clone to drive the data while the
/// tailer reads through another.
///
/// The helpers that modify data panic on unknown streams or partitions, they are meant for
/// tests.
#[derive(Debug, Clone, Default)]
pub struct MockStreamService {
    state: Arc<Mutex<MockState>>,
}

impl MockStreamService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ensure_stream_exists` fail with "stream not found" instead of creating streams.
    pub fn disable_creation(&self) {
        self.state.lock().creation_disabled = true;
    }

    /// Append a record to an open partition and return its sequence number.
    ///
    /// # Panics
    /// - when the stream or partition does not exist
    /// - when the partition is closed
    pub fn push_record(
        &self,
        stream: &str,
        partition: &PartitionId,
        data: impl Into<Bytes>,
    ) -> SequenceNumber {
        let mut guard = self.state.lock();
        let stream_state = guard.streams.get_mut(stream).expect("invalid stream");

        stream_state.next_sequence_number += 1;
        let sequence_number = SequenceNumber::new(stream_state.next_sequence_number);

        let partition_state = stream_state
            .partition_mut(partition)
            .expect("invalid partition ID");
        assert!(
            !partition_state.closed,
            "cannot write to closed partition {partition}"
        );

        partition_state.records.push(MockRecord {
            sequence_number,
            data: data.into(),
            arrival: Utc::now(),
        });

        sequence_number
    }

    /// Add a new, empty partition without lineage (e.g. a stream that was scaled up).
    ///
    /// # Panics
    /// When the stream does not exist.
    pub fn add_partition(&self, stream: &str) -> PartitionId {
        let mut guard = self.state.lock();
        guard
            .streams
            .get_mut(stream)
            .expect("invalid stream")
            .add_partition(vec![])
    }

    /// Split a partition into two children and close it.
    ///
    /// # Panics
    /// When the stream or partition does not exist or the partition is already closed.
    pub fn split_partition(
        &self,
        stream: &str,
        partition: &PartitionId,
    ) -> (PartitionId, PartitionId) {
        let mut guard = self.state.lock();
        let stream_state = guard.streams.get_mut(stream).expect("invalid stream");

        stream_state.close(partition);
        let left = stream_state.add_partition(vec![partition.clone()]);
        let right = stream_state.add_partition(vec![partition.clone()]);
        (left, right)
    }

    /// Merge two partitions into a new child and close both.
    ///
    /// # Panics
    /// When the stream or a partition does not exist or a partition is already closed.
    pub fn merge_partitions(
        &self,
        stream: &str,
        a: &PartitionId,
        b: &PartitionId,
    ) -> PartitionId {
        let mut guard = self.state.lock();
        let stream_state = guard.streams.get_mut(stream).expect("invalid stream");

        stream_state.close(a);
        stream_state.close(b);
        stream_state.add_partition(vec![a.clone(), b.clone()])
    }

    /// Close a partition without creating children.
    ///
    /// # Panics
    /// When the stream or partition does not exist or the partition is already closed.
    pub fn close_partition(&self, stream: &str, partition: &PartitionId) {
        let mut guard = self.state.lock();
        guard
            .streams
            .get_mut(stream)
            .expect("invalid stream")
            .close(partition);
    }

    /// Forget a partition entirely (e.g. it aged out of the retention period).
    ///
    /// # Panics
    /// When the stream or partition does not exist.
    pub fn remove_partition(&self, stream: &str, partition: &PartitionId) {
        let mut guard = self.state.lock();
        let stream_state = guard.streams.get_mut(stream).expect("invalid stream");
        let len_before = stream_state.partitions.len();
        stream_state
            .partitions
            .retain(|p| p.partition.id() != partition);
        assert_ne!(len_before, stream_state.partitions.len(), "invalid partition ID");
    }

    /// IDs of all partitions of a stream, in creation order.
    ///
    /// # Panics
    /// When the stream does not exist.
    pub fn partition_ids(&self, stream: &str) -> Vec<PartitionId> {
        let guard = self.state.lock();
        guard
            .streams
            .get(stream)
            .expect("invalid stream")
            .partitions
            .iter()
            .map(|p| p.partition.id().clone())
            .collect()
    }

    /// Fail the next `list_partitions` call with `error`.
    ///
    /// Multiple injected errors are returned by consecutive calls.
    pub fn inject_list_error(&self, error: ServiceError) {
        self.state.lock().list_errors.push_back(error);
    }

    /// Fail the next fetch on `partition` with `error`.
    ///
    /// # Panics
    /// When the stream or partition does not exist.
    pub fn inject_fetch_error(&self, stream: &str, partition: &PartitionId, error: ServiceError) {
        let mut guard = self.state.lock();
        guard
            .streams
            .get_mut(stream)
            .expect("invalid stream")
            .partition_mut(partition)
            .expect("invalid partition ID")
            .fetch_errors
            .push_back(error);
    }

    /// Number of `list_partitions` calls so far, including failed ones.
    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    /// Points in time at which fetches on `partition` were issued.
    pub fn fetch_calls(&self, partition: &PartitionId) -> Vec<Instant> {
        self.state
            .lock()
            .fetch_calls
            .iter()
            .filter(|call| &call.partition == partition)
            .map(|call| call.at)
            .collect()
    }

    /// All fetch calls so far.
    pub fn all_fetch_calls(&self) -> Vec<FetchCall> {
        self.state.lock().fetch_calls.clone()
    }

    /// Simulated round trip time of every fetch.
    pub fn set_fetch_latency(&self, latency: Duration) {
        self.state.lock().fetch_latency = latency;
    }

    /// Hold all fetches issued from now on until [`release_fetches`](Self::release_fetches) is
    /// called. Held fetches are already recorded by [`fetch_calls`](Self::fetch_calls).
    pub fn hold_fetches(&self) {
        let mut guard = self.state.lock();
        if guard.fetch_gate.is_none() {
            guard.fetch_gate = Some(Arc::new(Semaphore::new(0)));
        }
    }

    /// Let held and future fetches proceed.
    pub fn release_fetches(&self) {
        if let Some(gate) = self.state.lock().fetch_gate.take() {
            gate.close();
        }
    }
}

#[async_trait]
impl StreamAdmin for MockStreamService {
    async fn ensure_stream_exists(
        &self,
        stream: &str,
        options: &CreateStreamOptions,
    ) -> Result<EnsureOutcome, ServiceError> {
        let mut guard = self.state.lock();

        if guard.streams.contains_key(stream) {
            return Ok(EnsureOutcome::AlreadyExists);
        }
        if guard.creation_disabled {
            return Err(ServiceError::stream_not_found(stream));
        }

        let mut stream_state = MockStream::default();
        for _ in 0..options.partition_count.get() {
            stream_state.add_partition(vec![]);
        }
        guard.streams.insert(stream.to_string(), stream_state);

        Ok(EnsureOutcome::Created)
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), ServiceError> {
        // cursors stay registered so that later fetches report the missing stream
        self.state
            .lock()
            .streams
            .remove(stream)
            .map(|_| ())
            .ok_or_else(|| ServiceError::stream_not_found(stream))
    }
}

#[async_trait]
impl PartitionedStream for MockStreamService {
    async fn list_partitions(
        &self,
        stream: &str,
        page_token: Option<&PageToken>,
        limit: usize,
    ) -> Result<PartitionPage, ServiceError> {
        let mut guard = self.state.lock();
        guard.list_calls += 1;

        if let Some(e) = guard.list_errors.pop_front() {
            return Err(e);
        }

        let start = match page_token {
            Some(token) => token.as_str().parse::<usize>().map_err(|_| {
                ServiceError::invalid_input(format!("invalid page token: {}", token.as_str()))
            })?,
            None => 0,
        };

        let partitions = &guard.stream(stream)?.partitions;
        let end = (start + limit.max(1)).min(partitions.len());
        let page = partitions
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|p| p.partition.clone())
            .collect();
        let next_page_token = (end < partitions.len()).then(|| PageToken::new(end.to_string()));

        Ok(PartitionPage {
            partitions: page,
            next_page_token,
        })
    }

    async fn open_cursor(
        &self,
        stream: &str,
        partition: &PartitionId,
        position: PositionSpec,
    ) -> Result<Cursor, ServiceError> {
        let mut guard = self.state.lock();

        let records = &guard
            .stream(stream)?
            .partition(partition)
            .ok_or_else(|| ServiceError::partition_not_found(stream, partition))?
            .records;

        let index = match position {
            PositionSpec::Earliest => 0,
            PositionSpec::Latest => records.len(),
            PositionSpec::AtSequenceNumber(seq) => {
                records.partition_point(|r| r.sequence_number < seq)
            }
            PositionSpec::AfterSequenceNumber(seq) => {
                records.partition_point(|r| r.sequence_number <= seq)
            }
            PositionSpec::AtTimestamp(ts) => records.partition_point(|r| r.arrival < ts),
        };

        Ok(guard.new_cursor(CursorPosition {
            stream: stream.to_string(),
            partition: partition.clone(),
            index,
        }))
    }

    async fn fetch_batch(
        &self,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<FetchedBatch, ServiceError> {
        let (gate, latency) = {
            let mut guard = self.state.lock();
            let partition = guard
                .cursors
                .get(cursor.as_str())
                .map(|position| position.partition.clone())
                .ok_or_else(|| {
                    ServiceError::invalid_input(format!(
                        "unknown or expired cursor: {}",
                        cursor.as_str()
                    ))
                })?;
            guard.fetch_calls.push(FetchCall {
                partition,
                at: Instant::now(),
            });
            (guard.fetch_gate.clone(), guard.fetch_latency)
        };

        if let Some(gate) = gate {
            // only returns once the gate is closed
            let _ = gate.acquire().await;
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut guard = self.state.lock();
        let guard = &mut *guard;

        // a concurrent fetch may have consumed the cursor while this one was held
        let position = guard.cursors.remove(cursor.as_str()).ok_or_else(|| {
            ServiceError::invalid_input(format!("unknown or expired cursor: {}", cursor.as_str()))
        })?;

        let stream_state = guard
            .streams
            .get_mut(&position.stream)
            .ok_or_else(|| ServiceError::stream_not_found(&position.stream))?;
        let partition_state = stream_state
            .partition_mut(&position.partition)
            .ok_or_else(|| {
                ServiceError::partition_not_found(&position.stream, &position.partition)
            })?;

        if let Some(e) = partition_state.fetch_errors.pop_front() {
            // the cursor stays valid after a failed fetch
            guard.cursors.insert(cursor.as_str().to_string(), position);
            return Err(e);
        }

        let now = Utc::now();
        let lag_of = |r: &MockRecord| {
            (now - r.arrival)
                .to_std()
                .unwrap_or_default()
                .max(Duration::from_millis(1))
        };

        let end = (position.index + limit.max(1)).min(partition_state.records.len());
        let records = partition_state.records[position.index..end]
            .iter()
            .map(|r| {
                Record::new(
                    position.partition.clone(),
                    r.sequence_number,
                    r.data.clone(),
                    Some(lag_of(r)),
                )
            })
            .collect();

        let at_head = end == partition_state.records.len();
        let lag = if at_head {
            Duration::ZERO
        } else {
            lag_of(&partition_state.records[end])
        };
        let exhausted = at_head && partition_state.closed;

        let next_cursor = (!exhausted).then(|| {
            guard.new_cursor(CursorPosition {
                index: end,
                ..position
            })
        });

        Ok(FetchedBatch {
            records,
            next_cursor,
            lag: Some(lag),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use crate::service::ServiceErrorKind;

    use super::*;

    async fn new_stream(n_partitions: u32) -> (MockStreamService, Vec<PartitionId>) {
        let mock = MockStreamService::new();
        let outcome = mock
            .ensure_stream_exists(
                "s",
                &CreateStreamOptions {
                    partition_count: NonZeroU32::new(n_partitions).unwrap(),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Created);
        let ids = mock.partition_ids("s");
        (mock, ids)
    }

    fn payloads(batch: &FetchedBatch) -> Vec<&[u8]> {
        batch.records.iter().map(|r| r.data().as_ref()).collect()
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (mock, ids) = new_stream(3).await;
        assert_eq!(ids.len(), 3);

        let outcome = mock
            .ensure_stream_exists("s", &CreateStreamOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::AlreadyExists);
        assert_eq!(mock.partition_ids("s"), ids);
    }

    #[tokio::test]
    async fn test_creation_disabled() {
        let mock = MockStreamService::new();
        mock.disable_creation();

        let err = mock
            .ensure_stream_exists("s", &CreateStreamOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ServiceErrorKind::StreamNotFound);
    }

    #[tokio::test]
    async fn test_positions() {
        let (mock, ids) = new_stream(1).await;
        let p = &ids[0];

        let s1 = mock.push_record("s", p, "a");
        let s2 = mock.push_record("s", p, "b");
        mock.push_record("s", p, "c");

        let read_all = |position| {
            let mock = mock.clone();
            let p = p.clone();
            async move {
                let cursor = mock.open_cursor("s", &p, position).await.unwrap();
                mock.fetch_batch(&cursor, 10).await.unwrap()
            }
        };

        let batch = read_all(PositionSpec::Earliest).await;
        assert_eq!(payloads(&batch), vec![b"a", b"b", b"c"]);

        let batch = read_all(PositionSpec::Latest).await;
        assert!(batch.records.is_empty());
        assert_eq!(batch.lag, Some(Duration::ZERO));

        let batch = read_all(PositionSpec::AtSequenceNumber(s2)).await;
        assert_eq!(payloads(&batch), vec![b"b", b"c"]);

        let batch = read_all(PositionSpec::AfterSequenceNumber(s1)).await;
        assert_eq!(payloads(&batch), vec![b"b", b"c"]);

        let batch = read_all(PositionSpec::AtTimestamp(Utc::now() + chrono::Duration::hours(1))).await;
        assert!(batch.records.is_empty());

        let batch = read_all(PositionSpec::AtTimestamp(DateTime::<Utc>::MIN_UTC)).await;
        assert_eq!(batch.records.len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_follows_cursor_and_reports_lag() {
        let (mock, ids) = new_stream(1).await;
        let p = &ids[0];
        for data in ["a", "b", "c"] {
            mock.push_record("s", p, data);
        }

        let cursor = mock
            .open_cursor("s", p, PositionSpec::Earliest)
            .await
            .unwrap();
        let batch = mock.fetch_batch(&cursor, 2).await.unwrap();
        assert_eq!(payloads(&batch), vec![b"a", b"b"]);
        assert!(batch.lag.unwrap() > Duration::ZERO);
        assert!(!batch.is_caught_up());

        // consumed cursors expire
        let err = mock.fetch_batch(&cursor, 2).await.unwrap_err();
        assert_eq!(err.kind(), ServiceErrorKind::InvalidInput);

        let batch = mock
            .fetch_batch(batch.next_cursor.as_ref().unwrap(), 2)
            .await
            .unwrap();
        assert_eq!(payloads(&batch), vec![b"c"]);
        assert_eq!(batch.lag, Some(Duration::ZERO));
        assert!(batch.is_caught_up());
        assert!(batch.next_cursor.is_some());
    }

    #[tokio::test]
    async fn test_split_exhausts_parent() {
        let (mock, ids) = new_stream(1).await;
        let parent = &ids[0];
        mock.push_record("s", parent, "before split");

        let cursor = mock
            .open_cursor("s", parent, PositionSpec::Earliest)
            .await
            .unwrap();

        let (left, right) = mock.split_partition("s", parent);
        assert_eq!(mock.partition_ids("s"), vec![parent.clone(), left.clone(), right.clone()]);

        let batch = mock.fetch_batch(&cursor, 10).await.unwrap();
        assert_eq!(payloads(&batch), vec![b"before split"]);
        assert!(batch.next_cursor.is_none());

        // children are open
        mock.push_record("s", &left, "left");
        mock.push_record("s", &right, "right");
    }

    #[tokio::test]
    async fn test_merge() {
        let (mock, ids) = new_stream(2).await;
        let child = mock.merge_partitions("s", &ids[0], &ids[1]);

        let page = mock.list_partitions("s", None, 10).await.unwrap();
        let child_partition = page.partitions.last().unwrap();
        assert_eq!(child_partition.id(), &child);
        assert_eq!(child_partition.parent_ids(), &ids[..]);
    }

    #[tokio::test]
    #[should_panic(expected = "cannot write to closed partition")]
    async fn test_push_to_closed_partition_panics() {
        let (mock, ids) = new_stream(1).await;
        mock.close_partition("s", &ids[0]);
        mock.push_record("s", &ids[0], "x");
    }

    #[test]
    #[should_panic(expected = "invalid stream")]
    fn test_push_to_unknown_stream_panics() {
        let mock = MockStreamService::new();
        mock.push_record("s", &PartitionId::from("p"), "x");
    }

    #[tokio::test]
    async fn test_open_cursor_unknown_partition() {
        let (mock, _ids) = new_stream(1).await;
        let err = mock
            .open_cursor("s", &PartitionId::from("nope"), PositionSpec::Earliest)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ServiceErrorKind::PartitionNotFound);
    }

    #[tokio::test]
    async fn test_injected_fetch_error_keeps_cursor() {
        let (mock, ids) = new_stream(1).await;
        let p = &ids[0];
        mock.push_record("s", p, "a");
        mock.inject_fetch_error("s", p, ServiceError::throttled("slow down"));

        let cursor = mock
            .open_cursor("s", p, PositionSpec::Earliest)
            .await
            .unwrap();
        let err = mock.fetch_batch(&cursor, 10).await.unwrap_err();
        assert_eq!(err.kind(), ServiceErrorKind::Throttled);

        let batch = mock.fetch_batch(&cursor, 10).await.unwrap();
        assert_eq!(payloads(&batch), vec![b"a"]);
        assert_eq!(mock.fetch_calls(p).len(), 2);
    }

    #[tokio::test]
    async fn test_delete_stream() {
        let (mock, ids) = new_stream(1).await;
        let cursor = mock
            .open_cursor("s", &ids[0], PositionSpec::Earliest)
            .await
            .unwrap();

        mock.delete_stream("s").await.unwrap();

        let err = mock.list_partitions("s", None, 10).await.unwrap_err();
        assert_eq!(err.kind(), ServiceErrorKind::StreamNotFound);
        let err = mock.fetch_batch(&cursor, 10).await.unwrap_err();
        assert_eq!(err.kind(), ServiceErrorKind::StreamNotFound);

        let err = mock.delete_stream("s").await.unwrap_err();
        assert_eq!(err.kind(), ServiceErrorKind::StreamNotFound);
    }

    #[tokio::test]
    async fn test_hold_fetches() {
        let (mock, ids) = new_stream(1).await;
        let p = ids[0].clone();
        mock.push_record("s", &p, "a");
        let cursor = mock
            .open_cursor("s", &p, PositionSpec::Earliest)
            .await
            .unwrap();

        mock.hold_fetches();
        let mock_captured = mock.clone();
        let fetch = tokio::spawn(async move { mock_captured.fetch_batch(&cursor, 10).await });

        while mock.fetch_calls(&p).is_empty() {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!fetch.is_finished());

        mock.release_fetches();
        let batch = fetch.await.unwrap().unwrap();
        assert_eq!(payloads(&batch), vec![b"a"]);
    }
}
