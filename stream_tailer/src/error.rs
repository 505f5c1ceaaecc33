use thiserror::Error;

use crate::service::{PartitionId, ServiceError};

/// Errors surfaced by [`StreamTailer::start`](crate::StreamTailer::start) and on the merged
/// record sequence of a [`Tailer`](crate::Tailer).
///
/// Service failures are passed through unchanged as the error source.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to ensure stream '{stream}' exists: {source}")]
    EnsureStream {
        stream: String,
        source: ServiceError,
    },

    #[error("failed to list partitions of stream '{stream}': {source}")]
    ListPartitions {
        stream: String,
        source: ServiceError,
    },

    #[error("failed to open cursor on partition {partition}: {source}")]
    OpenCursor {
        partition: PartitionId,
        source: ServiceError,
    },

    #[error("failed to fetch records from partition {partition}: {source}")]
    FetchBatch {
        partition: PartitionId,
        source: ServiceError,
    },

    #[error("reader for partition {partition} panicked")]
    ReaderPanicked { partition: PartitionId },
}

impl Error {
    /// The underlying service error, if this error was caused by one.
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::EnsureStream { source, .. }
            | Self::ListPartitions { source, .. }
            | Self::OpenCursor { source, .. }
            | Self::FetchBatch { source, .. } => Some(source),
            Self::ReaderPanicked { .. } => None,
        }
    }

    /// The partition this error is about, if any.
    pub fn partition(&self) -> Option<&PartitionId> {
        match self {
            Self::OpenCursor { partition, .. }
            | Self::FetchBatch { partition, .. }
            | Self::ReaderPanicked { partition } => Some(partition),
            Self::EnsureStream { .. } | Self::ListPartitions { .. } => None,
        }
    }
}

/// A specialized `Result` for tailer errors
pub type Result<T, E = Error> = std::result::Result<T, E>;
