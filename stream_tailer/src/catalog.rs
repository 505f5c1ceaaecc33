//! Discovery of a stream's current partitions.

use std::{num::NonZeroUsize, sync::Arc};

use tracing::debug;

use crate::service::{Partition, ServiceError, StreamService};

/// Lists all partitions of one stream, following the service's pagination.
#[derive(Debug)]
pub struct PartitionCatalog {
    service: Arc<dyn StreamService>,
    stream: Arc<str>,
    page_size: NonZeroUsize,
}

impl PartitionCatalog {
    pub fn new(
        service: Arc<dyn StreamService>,
        stream: impl Into<Arc<str>>,
        page_size: NonZeroUsize,
    ) -> Self {
        Self {
            service,
            stream: stream.into(),
            page_size,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Return the complete, current list of partitions in the order the service reports them.
    ///
    /// Every call starts at the first page, so two calls may observe different partition sets.
    /// Service failures are returned as they are, without retrying.
    pub async fn list(&self) -> Result<Vec<Partition>, ServiceError> {
        let mut partitions = vec![];
        let mut page_token = None;
        let mut n_pages = 0usize;

        loop {
            let page = self
                .service
                .list_partitions(&self.stream, page_token.as_ref(), self.page_size.get())
                .await?;
            n_pages += 1;

            partitions.extend(page.partitions);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(
            stream=%self.stream,
            n_partitions=partitions.len(),
            n_pages,
            "listed partitions"
        );

        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use crate::{
        mock::MockStreamService,
        service::{CreateStreamOptions, PartitionId, ServiceErrorKind, StreamAdmin},
    };

    use super::*;

    async fn mock_with_partitions(n: u32) -> MockStreamService {
        let mock = MockStreamService::new();
        mock.ensure_stream_exists(
            "events",
            &CreateStreamOptions {
                partition_count: NonZeroU32::new(n).unwrap(),
            },
        )
        .await
        .unwrap();
        mock
    }

    #[test_log::test(tokio::test)]
    async fn test_list_follows_pages() {
        let mock = mock_with_partitions(5).await;
        let catalog = PartitionCatalog::new(
            Arc::new(mock.clone()),
            "events",
            NonZeroUsize::new(2).unwrap(),
        );

        let partitions = catalog.list().await.unwrap();
        let ids: Vec<_> = partitions.iter().map(|p| p.id().clone()).collect();
        assert_eq!(ids, mock.partition_ids("events"));
        assert_eq!(ids.len(), 5);

        // 2 + 2 + 1
        assert_eq!(mock.list_calls(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_list_restarts_from_first_page() {
        let mock = mock_with_partitions(1).await;
        let catalog = PartitionCatalog::new(
            Arc::new(mock.clone()),
            "events",
            NonZeroUsize::new(10).unwrap(),
        );

        assert_eq!(catalog.list().await.unwrap().len(), 1);

        let parent = mock.partition_ids("events").remove(0);
        let (left, right) = mock.split_partition("events", &parent);

        let partitions = catalog.list().await.unwrap();
        let ids: Vec<_> = partitions.iter().map(|p| p.id().clone()).collect();
        assert_eq!(ids, vec![parent.clone(), left.clone(), right]);
        assert_eq!(partitions[1].parent_ids(), &[parent]);
    }

    #[test_log::test(tokio::test)]
    async fn test_list_error_is_returned_verbatim() {
        let mock = mock_with_partitions(3).await;
        let catalog = PartitionCatalog::new(
            Arc::new(mock.clone()),
            "events",
            NonZeroUsize::new(1).unwrap(),
        );

        mock.inject_list_error(ServiceError::throttled("rate exceeded"));
        let err = catalog.list().await.unwrap_err();
        assert_eq!(err.kind(), ServiceErrorKind::Throttled);
        assert_eq!(err.to_string(), "ServiceError(Throttled): rate exceeded");

        // no internal retry: the failed request was the only one
        assert_eq!(mock.list_calls(), 1);

        // the next call succeeds again
        assert_eq!(catalog.list().await.unwrap().len(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_list_unknown_stream() {
        let mock = MockStreamService::new();
        let catalog =
            PartitionCatalog::new(Arc::new(mock), "nope", NonZeroUsize::new(1).unwrap());

        let err = catalog.list().await.unwrap_err();
        assert_eq!(err.kind(), ServiceErrorKind::StreamNotFound);
    }

    #[test_log::test(tokio::test)]
    async fn test_ids_are_stable() {
        let mock = mock_with_partitions(2).await;
        let catalog = PartitionCatalog::new(
            Arc::new(mock.clone()),
            "events",
            NonZeroUsize::new(1).unwrap(),
        );

        let a: Vec<PartitionId> = catalog
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id().clone())
            .collect();
        let b: Vec<PartitionId> = catalog
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id().clone())
            .collect();
        assert_eq!(a, b);
    }
}
