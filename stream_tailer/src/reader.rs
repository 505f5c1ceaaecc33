//! Reading a single partition.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::Error,
    service::{Cursor, FetchedBatch, PartitionId, PositionSpec, Record, StreamService},
};

/// Lifecycle of a partition reader.
///
/// ```text
/// Opening -> Polling <-> Backoff
///               |           |
///               +-> Exhausted | Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Resolving the start position into a cursor.
    Opening,

    /// Fetching batches.
    Polling,

    /// Caught up with the partition, waiting for the poll interval to pass.
    Backoff,

    /// The partition was closed upstream and every record was emitted. Terminal.
    Exhausted,

    /// Stopped by the tailer, either on close or after a failure. Terminal.
    Closed,
}

impl ReaderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Closed)
    }
}

/// Where the records of all readers of one tailer end up.
pub(crate) type RecordSender = mpsc::Sender<Result<Record, Error>>;

/// Pulls the records of one partition through a cursor until it is exhausted or closed.
#[derive(Debug)]
pub(crate) struct PartitionReader {
    service: Arc<dyn StreamService>,
    stream: Arc<str>,
    partition: PartitionId,
    position: PositionSpec,
    poll_interval: Duration,
    batch_limit: NonZeroUsize,

    state: watch::Sender<ReaderState>,
    shutdown: CancellationToken,
    output: RecordSender,
}

impl PartitionReader {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        service: Arc<dyn StreamService>,
        stream: Arc<str>,
        partition: PartitionId,
        position: PositionSpec,
        poll_interval: Duration,
        batch_limit: NonZeroUsize,
        shutdown: CancellationToken,
        output: RecordSender,
    ) -> (Self, watch::Receiver<ReaderState>) {
        let (state, state_rx) = watch::channel(ReaderState::Opening);
        let reader = Self {
            service,
            stream,
            partition,
            position,
            poll_interval,
            batch_limit,
            state,
            shutdown,
            output,
        };
        (reader, state_rx)
    }

    /// Read until the partition is exhausted or the reader is shut down.
    ///
    /// Only fails on errors of the service, which are never retried here. The terminal state
    /// is published before returning.
    pub(crate) async fn run(self) -> Result<ReaderState, Error> {
        let res = self.read().await;

        let end_state = *res.as_ref().unwrap_or(&ReaderState::Closed);
        self.set_state(end_state);

        res
    }

    async fn read(&self) -> Result<ReaderState, Error> {
        if self.shutdown.is_cancelled() {
            return Ok(ReaderState::Closed);
        }

        let res = self
            .service
            .open_cursor(&self.stream, &self.partition, self.position)
            .await;
        if self.shutdown.is_cancelled() {
            return Ok(ReaderState::Closed);
        }
        let mut cursor = res.map_err(|source| Error::OpenCursor {
            partition: self.partition.clone(),
            source,
        })?;

        debug!(
            stream=%self.stream,
            partition=%self.partition,
            position=%self.position,
            "opened cursor"
        );
        self.set_state(ReaderState::Polling);

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(ReaderState::Closed);
            }

            let res = self
                .service
                .fetch_batch(&cursor, self.batch_limit.get())
                .await;

            // an in-flight fetch is allowed to finish, but nothing it returned is emitted
            if self.shutdown.is_cancelled() {
                debug!(partition=%self.partition, "discarding fetch result of closed reader");
                return Ok(ReaderState::Closed);
            }

            let batch = res.map_err(|source| Error::FetchBatch {
                partition: self.partition.clone(),
                source,
            })?;

            match self.emit(batch).await {
                Emitted::Continue { next_cursor, caught_up } => {
                    cursor = next_cursor;
                    if caught_up && !self.backoff().await {
                        return Ok(ReaderState::Closed);
                    }
                }
                Emitted::Exhausted => {
                    info!(
                        stream=%self.stream,
                        partition=%self.partition,
                        "partition exhausted"
                    );
                    return Ok(ReaderState::Exhausted);
                }
                Emitted::Closed => return Ok(ReaderState::Closed),
            }
        }
    }

    /// Pass the records of a batch on, in order.
    async fn emit(&self, batch: FetchedBatch) -> Emitted {
        let caught_up = batch.is_caught_up();
        let FetchedBatch {
            records,
            next_cursor,
            lag,
        } = batch;

        debug!(
            partition=%self.partition,
            n_records=records.len(),
            ?lag,
            "fetched batch"
        );

        for record in records {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => return Emitted::Closed,
                res = self.output.send(Ok(record)) => {
                    if res.is_err() {
                        // nobody is listening anymore
                        return Emitted::Closed;
                    }
                }
            }
        }

        match next_cursor {
            Some(next_cursor) => Emitted::Continue {
                next_cursor,
                caught_up,
            },
            None => Emitted::Exhausted,
        }
    }

    /// Wait for the poll interval. Returns `false` if the reader was shut down meanwhile.
    async fn backoff(&self) -> bool {
        self.set_state(ReaderState::Backoff);

        tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => return false,
            _ = tokio::time::sleep(self.poll_interval) => {},
        }

        self.set_state(ReaderState::Polling);
        true
    }

    fn set_state(&self, state: ReaderState) {
        let old = self.state.send_replace(state);
        if old != state {
            debug!(
                partition=%self.partition,
                from=?old,
                to=?state,
                "reader state changed"
            );
        }
    }
}

enum Emitted {
    Continue { next_cursor: Cursor, caught_up: bool },
    Exhausted,
    Closed,
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use assert_matches::assert_matches;
    use tokio::time::Instant;

    use crate::{
        mock::MockStreamService,
        service::{CreateStreamOptions, ServiceError, ServiceErrorKind, StreamAdmin},
    };

    use super::*;

    const POLL_INTERVAL: Duration = Duration::from_secs(1);

    struct TestReader {
        mock: MockStreamService,
        partition: PartitionId,
        shutdown: CancellationToken,
        state: watch::Receiver<ReaderState>,
        rx: mpsc::Receiver<Result<Record, Error>>,
        reader: Option<PartitionReader>,
    }

    async fn test_reader(position: PositionSpec, batch_limit: usize) -> TestReader {
        let mock = MockStreamService::new();
        mock.ensure_stream_exists(
            "s",
            &CreateStreamOptions {
                partition_count: NonZeroU32::MIN,
            },
        )
        .await
        .unwrap();
        let partition = mock.partition_ids("s").remove(0);

        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(100);
        let (reader, state) = PartitionReader::new(
            Arc::new(mock.clone()),
            Arc::from("s"),
            partition.clone(),
            position,
            POLL_INTERVAL,
            NonZeroUsize::new(batch_limit).unwrap(),
            shutdown.clone(),
            tx,
        );

        TestReader {
            mock,
            partition,
            shutdown,
            state,
            rx,
            reader: Some(reader),
        }
    }

    async fn next_payload(rx: &mut mpsc::Receiver<Result<Record, Error>>) -> Vec<u8> {
        rx.recv().await.unwrap().unwrap().into_data().to_vec()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_in_order_until_exhausted() {
        let mut t = test_reader(PositionSpec::Earliest, 2).await;
        for data in ["s1", "s2", "s3"] {
            t.mock.push_record("s", &t.partition, data);
        }
        t.mock.close_partition("s", &t.partition);

        let state = t.reader.take().unwrap().run().await.unwrap();
        assert_eq!(state, ReaderState::Exhausted);
        assert_eq!(*t.state.borrow(), ReaderState::Exhausted);

        let mut seqs = vec![];
        for expected in ["s1", "s2", "s3"] {
            let record = t.rx.recv().await.unwrap().unwrap();
            assert_eq!(record.data().as_ref(), expected.as_bytes());
            seqs.push(record.sequence_number());
        }
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert!(t.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_skips_existing_records() {
        let mut t = test_reader(PositionSpec::Latest, 10).await;
        t.mock.push_record("s", &t.partition, "old");

        let reader = t.reader.take().unwrap();
        let task = tokio::spawn(reader.run());

        // wait until the cursor was opened
        t.state
            .wait_for(|s| *s != ReaderState::Opening)
            .await
            .unwrap();
        t.mock.push_record("s", &t.partition, "new");

        assert_eq!(next_payload(&mut t.rx).await, b"new");

        t.shutdown.cancel();
        assert_eq!(task.await.unwrap().unwrap(), ReaderState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batches_respect_poll_interval() {
        let mut t = test_reader(PositionSpec::Earliest, 10).await;
        let task = tokio::spawn(t.reader.take().unwrap().run());

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        t.shutdown.cancel();
        task.await.unwrap().unwrap();

        let calls = t.mock.fetch_calls(&t.partition);
        assert_eq!(calls.len(), 6, "{calls:?}");
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= POLL_INTERVAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_delay_while_behind() {
        let mut t = test_reader(PositionSpec::Earliest, 1).await;
        for data in ["a", "b", "c"] {
            t.mock.push_record("s", &t.partition, data);
        }

        let start = Instant::now();
        let task = tokio::spawn(t.reader.take().unwrap().run());
        for expected in ["a", "b", "c"] {
            assert_eq!(next_payload(&mut t.rx).await, expected.as_bytes());
        }
        t.shutdown.cancel();
        task.await.unwrap().unwrap();

        // "a" and "b" were fetched while the partition was behind, only the fetch returning
        // "c" reached the head
        let calls = t.mock.fetch_calls(&t.partition);
        assert!(calls.len() >= 3);
        assert!(calls[..3].iter().all(|at| *at == start));
    }

    #[tokio::test]
    async fn test_unknown_partition_is_fatal() {
        let mut t = test_reader(PositionSpec::Earliest, 10).await;
        t.mock.remove_partition("s", &t.partition);

        let err = t.reader.take().unwrap().run().await.unwrap_err();
        assert_matches!(&err, Error::OpenCursor { partition, source } => {
            assert_eq!(partition, &t.partition);
            assert_eq!(source.kind(), ServiceErrorKind::PartitionNotFound);
        });
        assert_eq!(*t.state.borrow(), ReaderState::Closed);
    }

    #[tokio::test]
    async fn test_fetch_error_is_not_retried() {
        let mut t = test_reader(PositionSpec::Earliest, 10).await;
        t.mock
            .inject_fetch_error("s", &t.partition, ServiceError::throttled("slow down"));

        let err = t.reader.take().unwrap().run().await.unwrap_err();
        assert_matches!(err, Error::FetchBatch { source, .. } => {
            assert_eq!(source.kind(), ServiceErrorKind::Throttled);
        });
        assert_eq!(t.mock.fetch_calls(&t.partition).len(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_fetch_is_discarded_after_close() {
        let mut t = test_reader(PositionSpec::Earliest, 10).await;
        t.mock.push_record("s", &t.partition, "late");
        t.mock.hold_fetches();

        let task = tokio::spawn(t.reader.take().unwrap().run());
        while t.mock.fetch_calls(&t.partition).is_empty() {
            tokio::task::yield_now().await;
        }

        t.shutdown.cancel();
        t.mock.release_fetches();

        assert_eq!(task.await.unwrap().unwrap(), ReaderState::Closed);
        assert!(t.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_before_start() {
        let mut t = test_reader(PositionSpec::Earliest, 10).await;
        t.shutdown.cancel();

        let state = t.reader.take().unwrap().run().await.unwrap();
        assert_eq!(state, ReaderState::Closed);
        assert!(t.mock.fetch_calls(&t.partition).is_empty());
    }
}
