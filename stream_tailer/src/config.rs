//! CLI config for the stream tailer.
//!
//! Can be re-used by binaries using `#[clap(flatten)]`.

use std::{num::NonZeroUsize, time::Duration};

use crate::service::PositionSpec;

/// Default delay between two fetches once a reader caught up with its partition.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default period of the partition rescan.
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(10);

/// Default maximum number of records per fetch.
pub const DEFAULT_BATCH_LIMIT: NonZeroUsize = NonZeroUsize::new(100).unwrap();

/// Default page size hint when listing partitions.
pub const DEFAULT_LIST_PAGE_SIZE: NonZeroUsize = NonZeroUsize::new(100).unwrap();

/// Default number of records buffered between the readers and the consumer.
pub const DEFAULT_CHANNEL_CAPACITY: NonZeroUsize = NonZeroUsize::new(1000).unwrap();

/// CLI config for the stream tailer
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::Parser)]
pub struct TailerConfig {
    /// Where readers of the partitions found at startup begin.
    ///
    /// One of `earliest`, `latest` or an RFC 3339 timestamp. Partitions discovered later are
    /// always read from `earliest`.
    #[clap(
        long = "default-position",
        env = "TAILER_DEFAULT_POSITION",
        default_value = "latest",
        value_parser = parse_default_position,
        action
    )]
    pub default_position: PositionSpec,

    /// How long a reader waits before fetching again once it caught up with its partition.
    #[clap(
        long = "poll-interval",
        env = "TAILER_POLL_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub poll_interval: Duration,

    /// How often the stream's partitions are listed again to discover new ones.
    #[clap(
        long = "rescan-interval",
        env = "TAILER_RESCAN_INTERVAL",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub rescan_interval: Duration,

    /// Maximum number of records requested per fetch.
    #[clap(
        long = "batch-limit",
        env = "TAILER_BATCH_LIMIT",
        default_value = "100",
        action
    )]
    pub batch_limit: NonZeroUsize,

    /// Page size hint when listing partitions.
    #[clap(
        long = "list-page-size",
        env = "TAILER_LIST_PAGE_SIZE",
        default_value = "100",
        action
    )]
    pub list_page_size: NonZeroUsize,

    /// Number of records buffered between the partition readers and the consumer.
    #[clap(
        long = "channel-capacity",
        env = "TAILER_CHANNEL_CAPACITY",
        default_value = "1000",
        action
    )]
    pub channel_capacity: NonZeroUsize,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            default_position: PositionSpec::Latest,
            poll_interval: DEFAULT_POLL_INTERVAL,
            rescan_interval: DEFAULT_RESCAN_INTERVAL,
            batch_limit: DEFAULT_BATCH_LIMIT,
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Only positions that make sense for every partition of a stream are accepted as default.
fn parse_default_position(s: &str) -> Result<PositionSpec, String> {
    match s.parse()? {
        p @ (PositionSpec::Earliest | PositionSpec::Latest | PositionSpec::AtTimestamp(_)) => Ok(p),
        p @ (PositionSpec::AtSequenceNumber(_) | PositionSpec::AfterSequenceNumber(_)) => Err(
            format!("'{p}' is specific to one partition and cannot be used as default position"),
        ),
    }
}
