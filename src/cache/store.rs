//! Object-store backed artifact cache.
//!
//! [`ObjectStore`] is the backend port: key/prefix addressing, paginated listing
//! and batch deletes. [`CacheStore`] layers the cache contract on top: absence is
//! `None`, listing is a lazy stream, and prefix deletes page through the backend
//! until it reports no further page.

use std::{sync::Arc, time::Duration};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tracing::{info, warn};

use crate::{domain::card::CachedArtifact, util::retry::{RetryPolicy, with_backoff}};

use super::keys::CacheKey;

/// Batch size accepted by S3-compatible `DeleteObjects` calls.
pub const DEFAULT_DELETE_BATCH: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object key `{key}`")]
    InvalidKey { key: String },
    #[error("object store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store backend error: {message}")]
    Backend { message: String },
    #[error("object store did not answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl StoreError {
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey { key: key.into() }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Token for the next page; `None` when the listing is complete.
    pub next: Option<String>,
}

/// Backend contract for artifact storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Fetch an object; a missing key is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<CachedArtifact>, StoreError>;

    /// Write an object. Readers never observe a partially written object.
    async fn put(&self, key: &str, artifact: &CachedArtifact) -> Result<(), StoreError>;

    /// List keys under `prefix`, resuming from `token` when given.
    async fn list(&self, prefix: &str, token: Option<&str>) -> Result<ListPage, StoreError>;

    /// Delete a batch of keys, returning how many were removed. Missing keys
    /// count as removed.
    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError>;

    /// Largest batch accepted by [`ObjectStore::delete`].
    fn delete_batch_limit(&self) -> usize {
        DEFAULT_DELETE_BATCH
    }
}

/// Outcome of a completed prefix delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub deleted: usize,
    /// Keys in batches that kept failing after retries.
    pub failed: usize,
    pub pages: usize,
}

/// A prefix delete stopped early because the listing itself failed.
#[derive(Debug, Error)]
#[error("purge of `{prefix}` stopped after deleting {deleted} objects")]
pub struct PurgeError {
    pub prefix: String,
    pub deleted: usize,
    pub failed: usize,
    #[source]
    pub source: StoreError,
}

/// Artifact cache over an [`ObjectStore`].
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn ObjectStore>,
    batch_retry: RetryPolicy,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn ObjectStore>) -> Self {
        Self {
            backend,
            batch_retry: RetryPolicy::default(),
        }
    }

    /// Retry policy applied to each delete batch during [`CacheStore::delete_prefix`].
    pub fn with_batch_retry(mut self, policy: RetryPolicy) -> Self {
        self.batch_retry = policy;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Option<CachedArtifact>, StoreError> {
        self.backend.get(key.as_str()).await
    }

    pub async fn put(&self, key: &CacheKey, artifact: &CachedArtifact) -> Result<(), StoreError> {
        self.backend.put(key.as_str(), artifact).await
    }

    /// Lazily stream every key under `prefix`, fetching pages on demand.
    pub fn list_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Stream<Item = Result<String, StoreError>> + Send + 'a {
        try_stream! {
            let mut token: Option<String> = None;
            loop {
                let page = self.list_page(prefix, token.as_deref()).await?;
                for key in page.keys {
                    yield key;
                }
                match page.next {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
        }
    }

    /// Delete every object under `prefix`.
    ///
    /// Pages through the backend listing and deletes in backend-sized batches.
    /// Each batch is retried; a batch that still fails is counted in
    /// [`DeleteSummary::failed`] and paging continues. A listing failure ends the
    /// run with [`PurgeError`] carrying the count deleted so far.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<DeleteSummary, PurgeError> {
        let batch_limit = self.backend.delete_batch_limit().max(1);
        let mut summary = DeleteSummary::default();
        let mut token: Option<String> = None;

        loop {
            let page = match self.list_page(prefix, token.as_deref()).await {
                Ok(page) => page,
                Err(source) => {
                    return Err(PurgeError {
                        prefix: prefix.to_string(),
                        deleted: summary.deleted,
                        failed: summary.failed,
                        source,
                    });
                }
            };
            summary.pages += 1;

            for batch in page.keys.chunks(batch_limit) {
                let result = with_backoff(&self.batch_retry, "cache::delete_batch", || {
                    self.backend.delete(batch)
                })
                .await;

                match result {
                    Ok(deleted) => {
                        summary.deleted += deleted;
                        summary.failed += batch.len().saturating_sub(deleted);
                    }
                    Err(err) => {
                        warn!(
                            target = "cache::store",
                            op = "delete_prefix",
                            result = "batch_failed",
                            backend = self.backend.name(),
                            prefix,
                            batch_len = batch.len(),
                            error = %err,
                            "Delete batch failed after retries; continuing with next page"
                        );
                        summary.failed += batch.len();
                    }
                }
            }

            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        info!(
            target = "cache::store",
            op = "delete_prefix",
            result = "completed",
            backend = self.backend.name(),
            prefix,
            deleted = summary.deleted,
            failed = summary.failed,
            pages = summary.pages,
            "Prefix delete finished"
        );

        Ok(summary)
    }

    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage, StoreError> {
        let page = self.backend.list(prefix, token).await?;
        if page.next.is_some() && page.next.as_deref() == token {
            return Err(StoreError::backend(format!(
                "listing of `{prefix}` did not advance past token"
            )));
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use futures::TryStreamExt;

    use super::*;
    use crate::cache::memory::MemoryObjectStore;

    fn artifact() -> CachedArtifact {
        CachedArtifact::png(Bytes::from_static(b"\x89PNG"))
    }

    async fn seeded(count: usize, page_size: usize) -> (Arc<MemoryObjectStore>, CacheStore) {
        let backend = Arc::new(MemoryObjectStore::with_page_size(page_size));
        for index in 0..count {
            backend
                .put(&format!("card/{index:05}.png"), &artifact())
                .await
                .expect("seed");
        }
        backend.put("other/keep.png", &artifact()).await.expect("seed");
        let store = CacheStore::new(backend.clone())
            .with_batch_retry(RetryPolicy::new(2, Duration::from_millis(1)));
        (backend, store)
    }

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let (_, store) = seeded(0, 10).await;
        let found = store
            .get(&CacheKey::from_raw("card/missing.png"))
            .await
            .expect("get");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn put_then_get_returns_same_bytes() {
        let (_, store) = seeded(0, 10).await;
        let key = CacheKey::from_raw("card/Hello.png");
        store.put(&key, &artifact()).await.expect("put");
        assert_eq!(store.get(&key).await.expect("get"), Some(artifact()));
    }

    #[tokio::test]
    async fn list_prefix_streams_across_pages() {
        let (_, store) = seeded(25, 10).await;
        let keys: Vec<String> = store.list_prefix("card/").try_collect().await.expect("list");
        assert_eq!(keys.len(), 25);
        assert!(keys.iter().all(|key| key.starts_with("card/")));
    }

    #[tokio::test]
    async fn delete_prefix_on_empty_prefix_is_noop() {
        let (backend, store) = seeded(0, 1000).await;
        let summary = store.delete_prefix("card/").await.expect("purge");
        assert_eq!(summary.deleted, 0);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn delete_prefix_removes_single_entry() {
        let (backend, store) = seeded(1, 1000).await;
        let summary = store.delete_prefix("card/").await.expect("purge");
        assert_eq!(summary.deleted, 1);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn delete_prefix_pages_past_backend_limit_and_is_idempotent() {
        let (backend, store) = seeded(1500, 1000).await;

        let first = store.delete_prefix("card/").await.expect("purge");
        assert_eq!(first.deleted, 1500);
        assert_eq!(first.failed, 0);
        assert_eq!(first.pages, 2);
        assert_eq!(backend.len(), 1, "keys outside the prefix survive");

        let second = store.delete_prefix("card/").await.expect("second purge");
        assert_eq!(second.deleted, 0);
    }

    struct FlakyDeletes {
        inner: MemoryObjectStore,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for FlakyDeletes {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn get(&self, key: &str) -> Result<Option<CachedArtifact>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, artifact: &CachedArtifact) -> Result<(), StoreError> {
            self.inner.put(key, artifact).await
        }

        async fn list(&self, prefix: &str, token: Option<&str>) -> Result<ListPage, StoreError> {
            self.inner.list(prefix, token).await
        }

        async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::backend("throttled"));
            }
            self.inner.delete(keys).await
        }

        fn delete_batch_limit(&self) -> usize {
            10
        }
    }

    #[tokio::test]
    async fn transient_batch_failure_is_retried() {
        let backend = Arc::new(FlakyDeletes {
            inner: MemoryObjectStore::with_page_size(100),
            failures_left: AtomicUsize::new(1),
        });
        for index in 0..15 {
            backend
                .put(&format!("card/{index}.png"), &artifact())
                .await
                .expect("seed");
        }
        let store = CacheStore::new(backend.clone())
            .with_batch_retry(RetryPolicy::new(2, Duration::from_millis(1)));

        let summary = store.delete_prefix("card/").await.expect("purge");
        assert_eq!(summary.deleted, 15);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn persistent_batch_failure_is_counted_and_paging_continues() {
        let backend = Arc::new(FlakyDeletes {
            inner: MemoryObjectStore::with_page_size(100),
            failures_left: AtomicUsize::new(2),
        });
        for index in 0..15 {
            backend
                .put(&format!("card/{index:02}.png"), &artifact())
                .await
                .expect("seed");
        }
        let store = CacheStore::new(backend.clone())
            .with_batch_retry(RetryPolicy::new(2, Duration::from_millis(1)));

        let summary = store.delete_prefix("card/").await.expect("purge");
        assert_eq!(summary.failed, 10);
        assert_eq!(summary.deleted, 5);
    }
}
