//! Cache purge followed by distribution invalidation.
//!
//! Deletion runs to completion (every page of the listing) before the
//! distribution layer is asked to invalidate. The two steps report separate
//! statuses; a failed invalidation never undoes the deletion.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::{cache::CacheStore, util::retry::{RetryPolicy, with_backoff}};

const METRIC_PURGE_DELETED: &str = "social_cards_purge_deleted_total";
const METRIC_INVALIDATION_FAILURE: &str = "social_cards_invalidation_failure_total";

/// What the distribution layer should drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "prefix", rename_all = "snake_case")]
pub enum InvalidationScope {
    All,
    /// Public path prefix, without the leading `/`.
    Prefix(String),
}

impl InvalidationScope {
    /// Scope covering the public URLs of every card under a storage key prefix.
    ///
    /// Keys and public paths only share the template segment, so anything
    /// narrower than a template widens to that template. A prefix that stops
    /// inside the template segment can match several templates and widens to
    /// everything.
    pub fn for_key_prefix(prefix: &str) -> Self {
        match prefix.split_once('/') {
            Some((template, _)) if !template.is_empty() => Self::Prefix(template.to_string()),
            _ => Self::All,
        }
    }

    /// Wildcard paths in the form distribution APIs accept.
    pub fn paths(&self) -> Vec<String> {
        match self {
            Self::All => vec!["/*".to_string()],
            Self::Prefix(prefix) => vec![format!("/{prefix}/*")],
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PrefixError {
    #[error("purge path contains control characters")]
    ControlCharacter,
    #[error("purge path `{0}` must end with `/`")]
    MissingSeparator(String),
}

/// Normalise an operator-supplied path into a storage key prefix.
///
/// Leading slashes and surrounding whitespace are dropped. A non-empty prefix
/// must end with `/` so it names whole key segments.
pub fn purge_prefix(path: &str) -> Result<String, PrefixError> {
    if path.chars().any(char::is_control) {
        return Err(PrefixError::ControlCharacter);
    }
    let prefix = path.trim().trim_start_matches('/');
    if !prefix.is_empty() && !prefix.ends_with('/') {
        return Err(PrefixError::MissingSeparator(prefix.to_string()));
    }
    Ok(prefix.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationRequest {
    pub scope: InvalidationScope,
    /// Idempotency token; retries of one request reuse it.
    pub caller_reference: Uuid,
}

impl InvalidationRequest {
    pub fn new(scope: InvalidationScope) -> Self {
        Self {
            scope,
            caller_reference: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidationError {
    #[error("invalidation request could not be sent: {0}")]
    Transport(String),
    #[error("distribution rejected invalidation with status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Downstream caching layer that can be told to drop cached responses.
#[async_trait]
pub trait Distribution: Send + Sync {
    fn name(&self) -> &'static str;

    async fn invalidate(&self, request: &InvalidationRequest) -> Result<(), InvalidationError>;
}

/// Used when no distribution endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDistribution;

#[async_trait]
impl Distribution for NoopDistribution {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn invalidate(&self, request: &InvalidationRequest) -> Result<(), InvalidationError> {
        info!(
            target = "application::purge",
            op = "distribution::invalidate",
            result = "skipped",
            paths = ?request.scope.paths(),
            "No distribution configured; nothing to invalidate"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PurgeStatus {
    Completed,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvalidationStatus {
    Completed { paths: Vec<String> },
    Failed { error: String },
    /// Not attempted because deletion did not complete.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub prefix: String,
    pub deleted: usize,
    pub failed: usize,
    pub purge: PurgeStatus,
    pub invalidation: InvalidationStatus,
}

impl PurgeReport {
    pub fn deletion_failed(&self) -> bool {
        matches!(self.purge, PurgeStatus::Failed { .. })
    }
}

/// Deletes a cache sub-tree and invalidates the distribution layer.
#[derive(Clone)]
pub struct CachePurger {
    store: CacheStore,
    distribution: Arc<dyn Distribution>,
    invalidation_retry: RetryPolicy,
}

impl CachePurger {
    pub fn new(store: CacheStore, distribution: Arc<dyn Distribution>, invalidation_retry: RetryPolicy) -> Self {
        Self {
            store,
            distribution,
            invalidation_retry,
        }
    }

    pub async fn purge(&self, prefix: &str) -> PurgeReport {
        let started_at = Instant::now();

        let (deleted, failed, purge) = match self.store.delete_prefix(prefix).await {
            Ok(summary) => (summary.deleted, summary.failed, PurgeStatus::Completed),
            Err(err) => {
                error!(
                    target = "application::purge",
                    op = "purge::delete",
                    result = "error",
                    prefix,
                    deleted = err.deleted,
                    error = %err.source,
                    "Cache purge stopped early"
                );
                (
                    err.deleted,
                    err.failed,
                    PurgeStatus::Failed {
                        error: err.source.to_string(),
                    },
                )
            }
        };
        counter!(METRIC_PURGE_DELETED).increment(deleted as u64);

        let invalidation = if matches!(purge, PurgeStatus::Completed) {
            self.invalidate(InvalidationScope::for_key_prefix(prefix)).await
        } else {
            InvalidationStatus::Skipped
        };

        info!(
            target = "application::purge",
            op = "purge",
            result = if matches!(purge, PurgeStatus::Completed) { "ok" } else { "error" },
            prefix,
            deleted,
            failed,
            invalidation = ?invalidation,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Cache purge finished"
        );

        PurgeReport {
            prefix: prefix.to_string(),
            deleted,
            failed,
            purge,
            invalidation,
        }
    }

    async fn invalidate(&self, scope: InvalidationScope) -> InvalidationStatus {
        let request = InvalidationRequest::new(scope);
        let result = with_backoff(&self.invalidation_retry, "purge::invalidate", || {
            self.distribution.invalidate(&request)
        })
        .await;

        match result {
            Ok(()) => InvalidationStatus::Completed {
                paths: request.scope.paths(),
            },
            Err(err) => {
                counter!(METRIC_INVALIDATION_FAILURE).increment(1);
                error!(
                    target = "application::purge",
                    op = "purge::invalidate",
                    result = "error",
                    distribution = self.distribution.name(),
                    caller_reference = %request.caller_reference,
                    error = %err,
                    "Distribution invalidation failed after retries"
                );
                InvalidationStatus::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use bytes::Bytes;

    use super::*;
    use crate::{
        cache::{ListPage, MemoryObjectStore, ObjectStore, StoreError},
        domain::card::CachedArtifact,
    };

    #[derive(Default)]
    struct RecordingDistribution {
        failures_left: AtomicUsize,
        requests: Mutex<Vec<InvalidationRequest>>,
        /// Number of objects left in the store when invalidation was called.
        remaining_at_call: Mutex<Vec<usize>>,
        backend: Option<Arc<MemoryObjectStore>>,
    }

    #[async_trait]
    impl Distribution for RecordingDistribution {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn invalidate(&self, request: &InvalidationRequest) -> Result<(), InvalidationError> {
            self.requests.lock().expect("lock").push(request.clone());
            if let Some(backend) = &self.backend {
                self.remaining_at_call.lock().expect("lock").push(backend.len());
            }
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(InvalidationError::Status {
                    status: 503,
                    body: "busy".into(),
                });
            }
            Ok(())
        }
    }

    struct UnlistableStore;

    #[async_trait]
    impl ObjectStore for UnlistableStore {
        fn name(&self) -> &'static str {
            "unlistable"
        }

        async fn get(&self, _key: &str) -> Result<Option<CachedArtifact>, StoreError> {
            Ok(None)
        }

        async fn put(&self, _key: &str, _artifact: &CachedArtifact) -> Result<(), StoreError> {
            Ok(())
        }

        async fn list(&self, _prefix: &str, _token: Option<&str>) -> Result<ListPage, StoreError> {
            Err(StoreError::backend("access denied"))
        }

        async fn delete(&self, _keys: &[String]) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    async fn seeded_backend(count: usize) -> Arc<MemoryObjectStore> {
        let backend = Arc::new(MemoryObjectStore::with_page_size(1000));
        for index in 0..count {
            backend
                .put(
                    &format!("card/{index:05}.png"),
                    &CachedArtifact::png(Bytes::from_static(b"png")),
                )
                .await
                .expect("seed");
        }
        backend
    }

    #[tokio::test]
    async fn deletion_finishes_before_invalidation() {
        let backend = seeded_backend(1500).await;
        let distribution = Arc::new(RecordingDistribution {
            backend: Some(backend.clone()),
            ..RecordingDistribution::default()
        });
        let purger = CachePurger::new(CacheStore::new(backend.clone()), distribution.clone(), retry());

        let report = purger.purge("").await;

        assert_eq!(report.deleted, 1500);
        assert_eq!(report.purge, PurgeStatus::Completed);
        assert_eq!(
            report.invalidation,
            InvalidationStatus::Completed {
                paths: vec!["/*".to_string()]
            }
        );
        assert_eq!(*distribution.remaining_at_call.lock().expect("lock"), vec![0]);
    }

    #[tokio::test]
    async fn invalidation_is_retried_with_same_reference() {
        let backend = seeded_backend(1).await;
        let distribution = Arc::new(RecordingDistribution {
            failures_left: AtomicUsize::new(2),
            ..RecordingDistribution::default()
        });
        let purger = CachePurger::new(CacheStore::new(backend), distribution.clone(), retry());

        let report = purger.purge("card/").await;

        assert!(matches!(report.invalidation, InvalidationStatus::Completed { .. }));
        let requests = distribution.requests.lock().expect("lock");
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.caller_reference == requests[0].caller_reference));
        assert_eq!(requests[0].scope, InvalidationScope::Prefix("card".into()));
    }

    #[tokio::test]
    async fn failed_invalidation_keeps_deletion() {
        let backend = seeded_backend(3).await;
        let distribution = Arc::new(RecordingDistribution {
            failures_left: AtomicUsize::new(10),
            ..RecordingDistribution::default()
        });
        let purger = CachePurger::new(CacheStore::new(backend.clone()), distribution, retry());

        let report = purger.purge("card/").await;

        assert_eq!(report.deleted, 3);
        assert_eq!(report.purge, PurgeStatus::Completed);
        assert!(matches!(report.invalidation, InvalidationStatus::Failed { .. }));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn listing_failure_skips_invalidation() {
        let distribution = Arc::new(RecordingDistribution::default());
        let purger = CachePurger::new(
            CacheStore::new(Arc::new(UnlistableStore)),
            distribution.clone(),
            retry(),
        );

        let report = purger.purge("card/").await;

        assert!(report.deletion_failed());
        assert_eq!(report.invalidation, InvalidationStatus::Skipped);
        assert!(distribution.requests.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn second_purge_reports_zero() {
        let backend = seeded_backend(2).await;
        let purger = CachePurger::new(
            CacheStore::new(backend),
            Arc::new(NoopDistribution),
            retry(),
        );

        assert_eq!(purger.purge("card/").await.deleted, 2);
        assert_eq!(purger.purge("card/").await.deleted, 0);
    }

    #[test]
    fn scope_follows_template_segment() {
        assert_eq!(InvalidationScope::for_key_prefix(""), InvalidationScope::All);
        assert_eq!(
            InvalidationScope::for_key_prefix("card/font%3Dserif/"),
            InvalidationScope::Prefix("card".into())
        );
        assert_eq!(InvalidationScope::for_key_prefix("car"), InvalidationScope::All);
        assert_eq!(InvalidationScope::All.paths(), vec!["/*"]);
        assert_eq!(InvalidationScope::Prefix("card".into()).paths(), vec!["/card/*"]);
    }

    #[test]
    fn purge_prefix_requires_whole_segments() {
        assert_eq!(purge_prefix("/card/").expect("valid"), "card/");
        assert_eq!(purge_prefix(" card/font%3Dserif/ ").expect("valid"), "card/font%3Dserif/");
        assert_eq!(purge_prefix("").expect("valid"), "");
        assert_eq!(purge_prefix("//").expect("valid"), "");
        assert_eq!(
            purge_prefix("car"),
            Err(PrefixError::MissingSeparator("car".into()))
        );
        assert_eq!(purge_prefix("card/\n"), Err(PrefixError::ControlCharacter));
    }

    #[tokio::test]
    async fn partial_template_prefix_invalidates_everything() {
        let backend = Arc::new(MemoryObjectStore::new());
        for key in ["card/a.png", "cards/b.png"] {
            backend
                .put(key, &CachedArtifact::png(Bytes::from_static(b"png")))
                .await
                .expect("seed");
        }
        let purger = CachePurger::new(CacheStore::new(backend.clone()), Arc::new(NoopDistribution), retry());

        let report = purger.purge("car").await;

        assert_eq!(report.deleted, 2);
        assert_eq!(
            report.invalidation,
            InvalidationStatus::Completed {
                paths: vec!["/*".to_string()]
            }
        );
    }
}
