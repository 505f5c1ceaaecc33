//! The task that owns the readers of one tailer.

use std::{collections::BTreeMap, collections::HashMap, sync::Arc, time::Duration};

use parking_lot::RwLock;
use tokio::{
    sync::watch,
    task::{Id, JoinError, JoinSet},
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    catalog::PartitionCatalog,
    config::TailerConfig,
    error::Error,
    reader::{PartitionReader, ReaderState, RecordSender},
    service::{Partition, PartitionId, PositionSpec, StreamService},
    tailer::{TailerState, TailerStateSender},
};

/// Readers of every partition that was ever given one, by partition.
///
/// Only the supervisor writes to this map.
pub(crate) type ReaderStates = Arc<RwLock<BTreeMap<PartitionId, watch::Receiver<ReaderState>>>>;

/// Spawns one reader per partition, absorbs partitions that show up later and stops all
/// readers on close or on the first reader failure.
///
/// Records flow from the readers into the output channel directly, the supervisor only adds
/// the failure (at most one) to it.
#[derive(Debug)]
pub(crate) struct Supervisor {
    service: Arc<dyn StreamService>,
    catalog: PartitionCatalog,
    config: TailerConfig,

    readers: JoinSet<Result<ReaderState, Error>>,
    reader_tasks: HashMap<Id, PartitionId>,
    reader_states: ReaderStates,

    output: RecordSender,

    /// Cancelled by the user on close.
    shutdown: CancellationToken,

    /// Cancelled by the supervisor to stop the readers, a child of `shutdown`.
    readers_shutdown: CancellationToken,

    state: TailerStateSender,
}

impl Supervisor {
    pub(crate) fn new(
        service: Arc<dyn StreamService>,
        catalog: PartitionCatalog,
        config: TailerConfig,
        output: RecordSender,
        shutdown: CancellationToken,
        state: TailerStateSender,
    ) -> Self {
        let readers_shutdown = shutdown.child_token();
        Self {
            service,
            catalog,
            config,
            readers: JoinSet::new(),
            reader_tasks: HashMap::new(),
            reader_states: Default::default(),
            output,
            shutdown,
            readers_shutdown,
            state,
        }
    }

    pub(crate) fn reader_states(&self) -> ReaderStates {
        Arc::clone(&self.reader_states)
    }

    /// Start a reader for every partition that has none yet.
    ///
    /// Partitions are never given a second reader, even after their first one ended.
    pub(crate) fn absorb(&mut self, partitions: Vec<Partition>, position: PositionSpec) -> usize {
        let mut n_new = 0;

        for partition in partitions {
            if self.reader_states.read().contains_key(partition.id()) {
                continue;
            }

            info!(
                stream=%self.catalog.stream(),
                partition=%partition.id(),
                parents=?partition.parent_ids(),
                %position,
                "starting partition reader"
            );

            let (reader, state) = PartitionReader::new(
                Arc::clone(&self.service),
                Arc::from(self.catalog.stream()),
                partition.id().clone(),
                position,
                self.config.poll_interval,
                self.config.batch_limit,
                self.readers_shutdown.clone(),
                self.output.clone(),
            );

            let handle = self.readers.spawn(reader.run());
            self.reader_tasks.insert(handle.id(), partition.id().clone());
            self.reader_states
                .write()
                .insert(partition.id().clone(), state);
            n_new += 1;
        }

        n_new
    }

    /// Run until closed or until a reader failed.
    pub(crate) async fn run(mut self) {
        let period = self.config.rescan_interval.max(Duration::from_millis(1));
        let mut rescan = time::interval_at(time::Instant::now() + period, period);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let failure = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(stream=%self.catalog.stream(), "close requested, stopping readers");
                    break None;
                }
                Some(res) = self.readers.join_next_with_id() => {
                    if let Some(e) = self.reader_finished(res) {
                        break Some(e);
                    }
                }
                _ = rescan.tick() => {
                    self.rescan().await;
                }
            }
        };

        self.set_state(TailerState::Closing);
        self.readers_shutdown.cancel();

        if let Some(e) = &failure {
            error!(
                stream=%self.catalog.stream(),
                error=%e,
                "partition reader failed, closing tailer"
            );
        }

        // a cancelled reader may still be in the middle of sending a record
        while let Some(res) = self.readers.join_next_with_id().await {
            if let Some(e) = self.reader_finished(res) {
                debug!(error=%e, "reader failed during shutdown");
            }
        }

        // every reader is gone, so the error is the last item
        if let Some(e) = failure {
            // the consumer may stop reading, so close must not wait for it
            tokio::select! {
                _ = self.shutdown.cancelled() => {},
                _ = self.output.send(Err(e)) => {},
            }
        }

        drop(self.output);

        info!(stream=%self.catalog.stream(), "tailer closed");
        self.state.send_replace(TailerState::Closed);
    }

    /// Returns the error of a failed reader.
    fn reader_finished(
        &mut self,
        res: Result<(Id, Result<ReaderState, Error>), JoinError>,
    ) -> Option<Error> {
        let id = match &res {
            Ok((id, _)) => *id,
            Err(e) => e.id(),
        };
        let partition = self
            .reader_tasks
            .remove(&id)
            .unwrap_or_else(|| PartitionId::from("<unknown>"));

        match res {
            Ok((_, Ok(state))) => {
                debug!(%partition, ?state, "partition reader stopped");
                None
            }
            Ok((_, Err(e))) => Some(e),
            Err(e) if e.is_panic() => Some(Error::ReaderPanicked { partition }),
            Err(e) => {
                // readers are never aborted
                warn!(%partition, error=%e, "partition reader task cancelled");
                None
            }
        }
    }

    async fn rescan(&mut self) {
        let partitions = tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => return,
            res = self.catalog.list() => res,
        };

        match partitions {
            Ok(partitions) => {
                let n_new = self.absorb(partitions, PositionSpec::Earliest);
                debug!(stream=%self.catalog.stream(), n_new, "rescanned partitions");
            }
            Err(e) => {
                warn!(
                    stream=%self.catalog.stream(),
                    error=%e,
                    "failed to rescan partitions, retrying on next tick"
                );
            }
        }
    }

    fn set_state(&self, state: TailerState) {
        self.state.send_replace(state);
        debug!(stream=%self.catalog.stream(), ?state, "tailer state changed");
    }
}
