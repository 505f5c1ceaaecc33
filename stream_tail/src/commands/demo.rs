//! Tail an in-memory stream that is fed by a built-in producer.

use std::{io::Write, num::NonZeroU32, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::StreamExt;
use stream_tailer::{
    CreateStreamOptions, PartitionId, ReaderState, StreamTailer, Tailer, TailerConfig,
    mock::MockStreamService,
};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::logging::LoggingConfig;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("tailer error: {0}")]
    Tailer(#[from] stream_tailer::Error),

    #[error("failed to write record: {0}")]
    Output(#[source] std::io::Error),

    #[error("failed to listen for ctrl-c: {0}")]
    Signal(#[source] std::io::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// Name of the in-memory stream.
    #[clap(long = "stream", default_value = "demo", action)]
    pub(crate) stream: String,

    /// Number of partitions the stream is created with.
    #[clap(long = "partitions", default_value = "2", action)]
    pub(crate) partitions: NonZeroU32,

    /// Number of producer rounds. Every round appends one record to each open partition.
    #[clap(long = "records-per-partition", default_value = "10", action)]
    pub(crate) records_per_partition: usize,

    /// Split the first partition once this many records were written to it.
    #[clap(long = "split-after", action)]
    pub(crate) split_after: Option<usize>,

    /// Delay between two producer rounds.
    #[clap(
        long = "produce-interval",
        default_value = "200ms",
        value_parser = humantime::parse_duration
    )]
    pub(crate) produce_interval: Duration,

    /// Stop after this many records. Runs until ctrl-c if not set.
    #[clap(long = "limit", action)]
    pub(crate) limit: Option<usize>,

    #[clap(flatten)]
    pub(crate) tailer_config: TailerConfig,

    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let n = tail(config, std::io::stdout()).await?;
    info!(n_records = n, "demo finished");
    Ok(())
}

/// Run the demo and write one `partition sequence_number payload` line per record to `out`.
///
/// Returns the number of records written.
pub(crate) async fn tail<W>(config: Config, mut out: W) -> Result<usize>
where
    W: Write + Send,
{
    let mock = MockStreamService::new();
    let tailer = StreamTailer::new(Arc::new(mock.clone()), config.tailer_config)
        .with_create_options(CreateStreamOptions {
            partition_count: config.partitions,
        })
        .start(&config.stream)
        .await?;

    // readers starting at `latest` would skip whatever is written before their cursor exists
    wait_for_readers(&tailer).await;

    let producer = spawn_producer(mock, &config);
    let res = consume(&tailer, config.limit, &mut out).await;

    tailer.close().await;
    producer.abort();

    res
}

async fn consume<W>(tailer: &Tailer, limit: Option<usize>, out: &mut W) -> Result<usize>
where
    W: Write + Send,
{
    let mut records = tailer.records();
    let mut n = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while limit.is_none_or(|limit| n < limit) {
        let record = tokio::select! {
            res = &mut ctrl_c => {
                res.map_err(Error::Signal)?;
                info!("ctrl-c received, closing tailer");
                break;
            }
            record = records.next() => record,
        };

        let Some(record) = record else {
            break;
        };
        let record = record?;

        writeln!(
            out,
            "{} {} {}",
            record.partition_id(),
            record.sequence_number(),
            String::from_utf8_lossy(record.data())
        )
        .map_err(Error::Output)?;
        n += 1;
    }

    Ok(n)
}

async fn wait_for_readers(tailer: &Tailer) {
    while tailer
        .partitions()
        .values()
        .any(|state| *state == ReaderState::Opening)
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn spawn_producer(mock: MockStreamService, config: &Config) -> JoinHandle<()> {
    let stream = config.stream.clone();
    let rounds = config.records_per_partition;
    let split_after = config.split_after;
    let interval = config.produce_interval;

    tokio::spawn(async move {
        let mut open: Vec<PartitionId> = mock.partition_ids(&stream);
        let split_target = open.first().cloned();
        let mut written_to_target = 0;
        let mut n = 0;

        for _ in 0..rounds {
            for partition in &open {
                n += 1;
                let sequence_number =
                    mock.push_record(&stream, partition, Bytes::from(format!("record-{n}")));
                debug!(%partition, %sequence_number, "produced record");
                if Some(partition) == split_target.as_ref() {
                    written_to_target += 1;
                }
            }

            if let Some(target) = split_target.as_ref() {
                if split_after == Some(written_to_target) && open.contains(target) {
                    let (left, right) = mock.split_partition(&stream, target);
                    info!(partition=%target, %left, %right, "split partition");
                    open.retain(|p| p != target);
                    open.extend([left, right]);
                }
            }

            tokio::time::sleep(interval).await;
        }

        info!(n_records = n, "producer finished");
    })
}
