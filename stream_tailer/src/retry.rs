//! Retrying stream service calls.
//!
//! The tailer itself never retries. Wrap a service into a [`RetryingService`] to retry
//! throttling and transport failures before they reach the tailer.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use tracing::info;

use crate::service::{
    CreateStreamOptions, Cursor, EnsureOutcome, FetchedBatch, PageToken, PartitionId,
    PartitionPage, PartitionedStream, PositionSpec, ServiceError, StreamAdmin,
};

/// Exponential backoff with jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,

    /// Give up after this many retries. `None` retries forever.
    pub max_retries: Option<usize>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            base: 3.,
            max_retries: Some(10),
        }
    }
}

/// One sequence of backoff delays.
///
/// Uses decorrelated jitter: every delay is drawn from `[init_backoff, previous * base)` and
/// capped at `max_backoff`.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    retries_left: Option<usize>,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            retries_left: config.max_retries,
        }
    }

    /// Next delay, or `None` if no retries are left.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(retries_left) = self.retries_left.as_mut() {
            *retries_left = retries_left.checked_sub(1)?;
        }

        let range = self.init_backoff..(self.next_backoff_secs * self.base);
        let rand_backoff = if range.is_empty() {
            range.start
        } else {
            rand::thread_rng().gen_range(range)
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        Some(Duration::from_secs_f64(std::mem::replace(
            &mut self.next_backoff_secs,
            next_backoff,
        )))
    }

    /// Run `do_stuff` until it succeeds, fails with an error that is not retryable, or no
    /// retries are left.
    pub async fn retry_with_backoff<F, Fut, T>(
        &mut self,
        task_name: &str,
        mut do_stuff: F,
    ) -> Result<T, ServiceError>
    where
        F: (FnMut() -> Fut) + Send,
        Fut: Future<Output = Result<T, ServiceError>> + Send,
        T: Send,
    {
        loop {
            let e = match do_stuff().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            let Some(backoff) = self.next_backoff() else {
                return Err(e);
            };

            info!(
                e=%e,
                task_name,
                backoff_secs = backoff.as_secs_f64(),
                "request encountered retryable error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

/// A stream service that retries retryable failures of the wrapped one.
#[derive(Debug)]
pub struct RetryingService<S> {
    inner: S,
    config: BackoffConfig,
}

impl<S> RetryingService<S> {
    pub fn new(inner: S, config: BackoffConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S> StreamAdmin for RetryingService<S>
where
    S: StreamAdmin,
{
    async fn ensure_stream_exists(
        &self,
        stream: &str,
        options: &CreateStreamOptions,
    ) -> Result<EnsureOutcome, ServiceError> {
        Backoff::new(&self.config)
            .retry_with_backoff("ensure stream exists", move || {
                self.inner.ensure_stream_exists(stream, options)
            })
            .await
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), ServiceError> {
        Backoff::new(&self.config)
            .retry_with_backoff("delete stream", move || self.inner.delete_stream(stream))
            .await
    }
}

#[async_trait]
impl<S> PartitionedStream for RetryingService<S>
where
    S: PartitionedStream,
{
    async fn list_partitions(
        &self,
        stream: &str,
        page_token: Option<&PageToken>,
        limit: usize,
    ) -> Result<PartitionPage, ServiceError> {
        Backoff::new(&self.config)
            .retry_with_backoff("list partitions", move || {
                self.inner.list_partitions(stream, page_token, limit)
            })
            .await
    }

    async fn open_cursor(
        &self,
        stream: &str,
        partition: &PartitionId,
        position: PositionSpec,
    ) -> Result<Cursor, ServiceError> {
        Backoff::new(&self.config)
            .retry_with_backoff("open cursor", move || {
                self.inner.open_cursor(stream, partition, position)
            })
            .await
    }

    async fn fetch_batch(
        &self,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<FetchedBatch, ServiceError> {
        Backoff::new(&self.config)
            .retry_with_backoff("fetch batch", move || self.inner.fetch_batch(cursor, limit))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroU32, sync::Arc};

    use crate::{mock::MockStreamService, service::ServiceErrorKind};

    use super::*;

    #[test]
    fn test_backoff_stays_within_bounds() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(80),
            base: 2.,
            max_retries: None,
        };
        let mut backoff = Backoff::new(&config);

        assert_eq!(backoff.next_backoff(), Some(config.init_backoff));
        for _ in 0..100 {
            let next = backoff.next_backoff().unwrap();
            assert!(next >= config.init_backoff, "{next:?}");
            assert!(next <= config.max_backoff, "{next:?}");
        }
    }

    #[test]
    fn test_backoff_max_retries() {
        let mut backoff = Backoff::new(&BackoffConfig {
            max_retries: Some(2),
            ..Default::default()
        });
        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_none());
        assert!(backoff.next_backoff().is_none());
    }

    async fn retrying_mock(
        config: BackoffConfig,
    ) -> (MockStreamService, RetryingService<MockStreamService>) {
        let mock = MockStreamService::new();
        mock.ensure_stream_exists(
            "s",
            &CreateStreamOptions {
                partition_count: NonZeroU32::MIN,
            },
        )
        .await
        .unwrap();
        let service = RetryingService::new(mock.clone(), config);
        (mock, service)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_retryable_errors() {
        let (mock, service) = retrying_mock(BackoffConfig::default()).await;
        mock.inject_list_error(ServiceError::throttled("slow down"));
        mock.inject_list_error(std::io::Error::other("reset").into());

        let page = service.list_partitions("s", None, 10).await.unwrap();
        assert_eq!(page.partitions.len(), 1);
        assert_eq!(service.inner().list_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_does_not_retry_permanent_errors() {
        let (mock, service) = retrying_mock(BackoffConfig::default()).await;

        let err = service
            .open_cursor("s", &PartitionId::from("nope"), PositionSpec::Earliest)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ServiceErrorKind::PartitionNotFound);

        mock.inject_list_error(ServiceError::invalid_input("bad"));
        mock.inject_list_error(ServiceError::throttled("never reached"));
        let err = service.list_partitions("s", None, 10).await.unwrap_err();
        assert_eq!(err.kind(), ServiceErrorKind::InvalidInput);
        assert_eq!(mock.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let (mock, service) = retrying_mock(BackoffConfig {
            max_retries: Some(1),
            ..Default::default()
        })
        .await;
        for _ in 0..3 {
            mock.inject_list_error(ServiceError::throttled("slow down"));
        }

        let err = service.list_partitions("s", None, 10).await.unwrap_err();
        assert_eq!(err.kind(), ServiceErrorKind::Throttled);
        assert_eq!(mock.list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_usable_as_tailer_service() {
        let (mock, service) = retrying_mock(BackoffConfig::default()).await;
        let partition = mock.partition_ids("s").remove(0);
        mock.push_record("s", &partition, "a");

        let service: Arc<dyn crate::service::StreamService> = Arc::new(service);
        let cursor = service
            .open_cursor("s", &partition, PositionSpec::Earliest)
            .await
            .unwrap();
        mock.inject_fetch_error("s", &partition, ServiceError::throttled("slow down"));

        let batch = service.fetch_batch(&cursor, 10).await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(mock.fetch_calls(&partition).len(), 2);
    }
}
