//! The handle of a running tailer.

use std::{collections::BTreeMap, sync::Arc, task::Poll};

use futures::{
    FutureExt, StreamExt,
    future::{BoxFuture, Shared},
    stream::{self, BoxStream},
};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    task::JoinError,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::Error,
    reader::ReaderState,
    service::{EnsureOutcome, PartitionId, Record},
    supervisor::ReaderStates,
    tailer::{TailerState, TailerStateSender},
};

/// A [`JoinHandle`](tokio::task::JoinHandle) that can be cloned
pub(crate) type SharedJoinHandle = Shared<BoxFuture<'static, Result<(), Arc<JoinError>>>>;

/// A running tailer of one stream.
///
/// Dropping the handle without calling [`close`](Self::close) stops the background tasks
/// but does not wait for them.
#[derive(Debug)]
pub struct Tailer {
    stream: Arc<str>,
    ensure_outcome: EnsureOutcome,

    shutdown: CancellationToken,
    rx: Arc<Mutex<mpsc::Receiver<Result<Record, Error>>>>,
    state: TailerStateSender,
    reader_states: ReaderStates,

    /// Resolves when the supervisor task exits.
    join_handle: SharedJoinHandle,
}

impl Tailer {
    pub(crate) fn new(
        stream: Arc<str>,
        ensure_outcome: EnsureOutcome,
        shutdown: CancellationToken,
        rx: Arc<Mutex<mpsc::Receiver<Result<Record, Error>>>>,
        state: TailerStateSender,
        reader_states: ReaderStates,
        join_handle: SharedJoinHandle,
    ) -> Self {
        Self {
            stream,
            ensure_outcome,
            shutdown,
            rx,
            state,
            reader_states,
            join_handle,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Whether starting the tailer created the stream.
    pub fn ensure_outcome(&self) -> EnsureOutcome {
        self.ensure_outcome
    }

    pub fn state(&self) -> TailerState {
        *self.state.borrow()
    }

    /// Snapshot of the reader state of every partition that was given a reader, including
    /// readers that already stopped.
    pub fn partitions(&self) -> BTreeMap<PartitionId, ReaderState> {
        self.reader_states
            .read()
            .iter()
            .map(|(id, state)| (id.clone(), *state.borrow()))
            .collect()
    }

    /// The merged records of all partitions.
    ///
    /// Records of one partition come in order, there is no order across partitions. The
    /// sequence ends after [`close`](Self::close) was called, or after yielding the error
    /// of a failed reader.
    ///
    /// Every call returns a view of the same sequence: a record is yielded by exactly one of
    /// them. Polling more than one of them at a time is not supported.
    pub fn records(&self) -> BoxStream<'static, Result<Record, Error>> {
        let shutdown = self.shutdown.clone();
        let mut cancelled = Box::pin(self.shutdown.clone().cancelled_owned());
        let rx = Arc::clone(&self.rx);
        let mut failed = false;

        stream::poll_fn(move |cx| {
            // a pending read ends right away on close, not only once the readers stopped
            if failed || shutdown.is_cancelled() || cancelled.poll_unpin(cx).is_ready() {
                return Poll::Ready(None);
            }

            let next = rx.lock().poll_recv(cx);
            if matches!(next, Poll::Ready(Some(Err(_)))) {
                failed = true;
            }
            next
        })
        .boxed()
    }

    /// Stop all readers and wait until they stopped.
    ///
    /// Pending and future reads of [`records`](Self::records) return the end of the sequence.
    /// Can be called more than once.
    pub async fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!(stream=%self.stream, "closing tailer");
            self.state.send_if_modified(|state| {
                let running = *state == TailerState::Running;
                if running {
                    *state = TailerState::Closing;
                }
                running
            });
            self.shutdown.cancel();
        }
        self.join().await;
    }

    /// Wait until the tailer stopped, either because of [`close`](Self::close) or because a
    /// reader failed.
    pub async fn join(&self) {
        if let Err(e) = self.join_handle.clone().await {
            warn!(stream=%self.stream, error=%e, "tailer supervisor task failed");
        }
    }
}

impl Drop for Tailer {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            if self.state() != TailerState::Closed {
                warn!(stream=%self.stream, "Tailer dropped without calling close()");
            }
            self.shutdown.cancel();
        }

        if self.join_handle.clone().now_or_never().is_none() {
            warn!(
                stream=%self.stream,
                "Tailer dropped without waiting for the readers to stop"
            );
        }
    }
}
