//! Starting a tailer.

use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    catalog::PartitionCatalog,
    config::TailerConfig,
    error::Error,
    handle::Tailer,
    service::{CreateStreamOptions, EnsureOutcome, StreamService},
    supervisor::Supervisor,
};

/// Lifecycle of a [`Tailer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    /// Making sure the stream exists and listing its partitions.
    ///
    /// Never seen through a [`Tailer`], which is only returned once start succeeded.
    Initializing,

    /// Readers are running.
    Running,

    /// Readers are being stopped.
    Closing,

    /// All readers stopped, the record sequence ended. Terminal.
    Closed,
}

/// Shared by the supervisor and the [`Tailer`] handle.
pub(crate) type TailerStateSender = Arc<watch::Sender<TailerState>>;

/// Builds [`Tailer`]s of one stream service.
#[derive(Debug, Clone)]
pub struct StreamTailer {
    service: Arc<dyn StreamService>,
    config: TailerConfig,
    create_options: CreateStreamOptions,
}

impl StreamTailer {
    pub fn new(service: Arc<dyn StreamService>, config: TailerConfig) -> Self {
        Self {
            service,
            config,
            create_options: CreateStreamOptions::default(),
        }
    }

    /// Parameters used when the stream does not exist yet and has to be created.
    pub fn with_create_options(self, create_options: CreateStreamOptions) -> Self {
        Self {
            create_options,
            ..self
        }
    }

    pub fn config(&self) -> &TailerConfig {
        &self.config
    }

    /// Start tailing `stream`.
    ///
    /// The stream is created if it does not exist. Every partition listed now is read from the
    /// configured default position, partitions found by later rescans from the earliest record.
    ///
    /// Fails if the stream cannot be ensured or its partitions cannot be listed. Nothing is
    /// left running in that case.
    pub async fn start(&self, stream: &str) -> Result<Tailer, Error> {
        let (state, _) = watch::channel(TailerState::Initializing);
        let state = Arc::new(state);

        let ensure_outcome = self
            .service
            .ensure_stream_exists(stream, &self.create_options)
            .await
            .map_err(|source| Error::EnsureStream {
                stream: stream.to_string(),
                source,
            })?;
        match ensure_outcome {
            EnsureOutcome::Created => info!(stream, "created stream"),
            EnsureOutcome::AlreadyExists => info!(stream, "stream exists"),
        }

        let catalog = PartitionCatalog::new(
            Arc::clone(&self.service),
            stream,
            self.config.list_page_size,
        );
        let partitions = catalog.list().await.map_err(|source| Error::ListPartitions {
            stream: stream.to_string(),
            source,
        })?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.get());
        let shutdown = CancellationToken::new();
        state.send_replace(TailerState::Running);

        let mut supervisor = Supervisor::new(
            Arc::clone(&self.service),
            catalog,
            self.config,
            tx,
            shutdown.clone(),
            Arc::clone(&state),
        );
        let n_partitions = supervisor.absorb(partitions, self.config.default_position);
        let reader_states = supervisor.reader_states();
        let join_handle = tokio::spawn(supervisor.run());

        info!(
            stream,
            n_partitions,
            default_position=%self.config.default_position,
            rescan_interval=?self.config.rescan_interval,
            "tailer started"
        );

        Ok(Tailer::new(
            Arc::from(stream),
            ensure_outcome,
            shutdown,
            Arc::new(Mutex::new(rx)),
            state,
            reader_states,
            join_handle.map(|res| res.map_err(Arc::new)).boxed().shared(),
        ))
    }
}

/// Start tailing `stream` with a [`StreamTailer`] using the default creation parameters.
pub async fn start(
    service: Arc<dyn StreamService>,
    stream: &str,
    config: TailerConfig,
) -> Result<Tailer, Error> {
    StreamTailer::new(service, config).start(stream).await
}
