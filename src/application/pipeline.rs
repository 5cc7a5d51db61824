//! Render-or-serve request pipeline.
//!
//! A request moves through parsing, cache lookup and, on a miss, rendering and
//! upload:
//!
//! ```text
//! Parsing -> CacheLookup -> HitServed
//!                        -> Rendering -> Uploading -> MissServed
//! Parsing -> Rejected            Rendering -> Failed
//! ```
//!
//! Served outcomes are [`ServedCard`]s tagged with [`CacheStatus`]; rejections
//! and failures are the two arms of [`PipelineError`]. Concurrent misses for the
//! same key share one render and one upload, which run on their own task so a
//! disconnecting client never strands a browser session. Store reads, renders
//! and store writes are each bounded by the request deadline.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    application::render::{RenderEngine, RenderError, RenderJob},
    cache::{
        CacheKey, CacheStore, FlightRole, SingleFlight, StoreError,
        keys::{cache_key, decode_file_segment},
    },
    domain::{
        card::{CachedArtifact, RenderRequest, Viewport},
        error::RequestError,
        options::OptionSet,
    },
};

const METRIC_CACHE_HIT: &str = "social_cards_cache_hit_total";
const METRIC_CACHE_MISS: &str = "social_cards_cache_miss_total";
const METRIC_CACHE_READ_ERROR: &str = "social_cards_cache_read_error_total";
const METRIC_CACHE_WRITE_ERROR: &str = "social_cards_cache_write_error_total";
const METRIC_RENDER_MS: &str = "social_cards_render_ms";
const METRIC_RENDER_FAILURE: &str = "social_cards_render_failure_total";
const METRIC_SINGLEFLIGHT_JOINED: &str = "social_cards_singleflight_joined_total";

/// Runtime knobs for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Skip the cache read and always render (local/offline runs).
    pub lookup_enabled: bool,
    /// Deadline for the render, and separately for each store read and write.
    pub render_timeout: Duration,
    pub viewport: Viewport,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            lookup_enabled: true,
            render_timeout: Duration::from_secs(15),
            viewport: Viewport::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

/// A card ready to be returned to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedCard {
    pub key: CacheKey,
    pub artifact: CachedArtifact,
    pub status: CacheStatus,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The request itself is invalid; nothing was rendered.
    #[error("request rejected: {0}")]
    Rejected(#[from] RejectReason),
    /// The request was valid but the render failed.
    #[error("render failed: {0}")]
    Failed(RenderError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RejectReason {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Template(RenderError),
}

impl From<RenderError> for PipelineError {
    fn from(err: RenderError) -> Self {
        if err.is_rejection() {
            Self::Rejected(RejectReason::Template(err))
        } else {
            Self::Failed(err)
        }
    }
}

impl From<RequestError> for PipelineError {
    fn from(err: RequestError) -> Self {
        Self::Rejected(RejectReason::Request(err))
    }
}

type FlightOutcome = Result<CachedArtifact, RenderError>;

/// Orchestrates key derivation, cache lookup, rendering and upload.
#[derive(Clone)]
pub struct RenderPipeline {
    store: CacheStore,
    engine: Arc<dyn RenderEngine>,
    flights: Arc<SingleFlight<FlightOutcome>>,
    settings: PipelineSettings,
}

impl RenderPipeline {
    pub fn new(
        store: CacheStore,
        engine: Arc<dyn RenderEngine>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            engine,
            flights: Arc::new(SingleFlight::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Parse the raw route parts into a [`RenderRequest`].
    pub fn parse(
        template: &str,
        file: &str,
        options: Option<&str>,
    ) -> Result<RenderRequest, RequestError> {
        if template.is_empty() {
            return Err(RequestError::unrecognized_path("template segment is empty"));
        }
        let title = decode_file_segment(file)?;
        let options = OptionSet::parse(options.unwrap_or_default())?;
        Ok(RenderRequest::new(template, title, options))
    }

    /// Handle a request addressed by its route parts.
    pub async fn handle(
        &self,
        template: &str,
        file: &str,
        options: Option<&str>,
    ) -> Result<ServedCard, PipelineError> {
        let request = Self::parse(template, file, options)?;
        self.serve(&request).await
    }

    /// Serve a parsed request from cache, rendering it on a miss.
    pub async fn serve(&self, request: &RenderRequest) -> Result<ServedCard, PipelineError> {
        let key = cache_key(request)?;

        if self.settings.lookup_enabled
            && let Some(artifact) = self.lookup(&key).await
        {
            counter!(METRIC_CACHE_HIT).increment(1);
            debug!(
                target = "application::pipeline",
                op = "pipeline::serve",
                result = "hit",
                cache_key = %key,
                bytes = artifact.len(),
                "Served card from cache"
            );
            return Ok(ServedCard {
                key,
                artifact,
                status: CacheStatus::Hit,
            });
        }
        counter!(METRIC_CACHE_MISS).increment(1);

        let job = RenderJob::from_request(request, self.settings.viewport);
        let engine = Arc::clone(&self.engine);
        let store = self.store.clone();
        let timeout = self.settings.render_timeout;
        let flight_key = key.clone();

        let (outcome, role) = self
            .flights
            .run(key.as_str(), move || {
                render_and_upload(engine, store, job, flight_key, timeout)
            })
            .await;

        let outcome = outcome.unwrap_or_else(|aborted| {
            warn!(
                target = "application::pipeline",
                op = "pipeline::serve",
                result = "aborted",
                cache_key = %key,
                error = %aborted,
                "Render task ended without a result"
            );
            Err(RenderError::unavailable(aborted))
        });

        if role == FlightRole::Follower {
            counter!(METRIC_SINGLEFLIGHT_JOINED).increment(1);
            debug!(
                target = "application::pipeline",
                op = "pipeline::serve",
                result = "joined",
                cache_key = %key,
                "Joined in-flight render"
            );
        }

        let artifact = outcome?;
        Ok(ServedCard {
            key,
            artifact,
            status: CacheStatus::Miss,
        })
    }

    /// Read failures, including a read that outlives the deadline, are treated
    /// as a miss.
    async fn lookup(&self, key: &CacheKey) -> Option<CachedArtifact> {
        let timeout = self.settings.render_timeout;
        let read = tokio::time::timeout(timeout, self.store.get(key))
            .await
            .unwrap_or_else(|_| Err(StoreError::timeout(timeout)));
        match read {
            Ok(found) => found,
            Err(err) => {
                counter!(METRIC_CACHE_READ_ERROR).increment(1);
                warn!(
                    target = "application::pipeline",
                    op = "pipeline::lookup",
                    result = "read_error",
                    backend = self.store.backend_name(),
                    cache_key = %key,
                    error = %err,
                    "Cache read failed; rendering instead"
                );
                None
            }
        }
    }
}

async fn render_and_upload(
    engine: Arc<dyn RenderEngine>,
    store: CacheStore,
    job: RenderJob,
    key: CacheKey,
    timeout: Duration,
) -> FlightOutcome {
    let started_at = Instant::now();
    let rendered = match tokio::time::timeout(timeout, engine.render(&job)).await {
        Ok(result) => result,
        Err(_) => Err(RenderError::RenderTimeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    };
    let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;

    let body = match rendered {
        Ok(body) => body,
        Err(err) => {
            counter!(METRIC_RENDER_FAILURE, "reason" => err.code()).increment(1);
            warn!(
                target = "application::pipeline",
                op = "pipeline::render",
                result = "error",
                engine = engine.name(),
                cache_key = %key,
                elapsed_ms = elapsed_ms as u64,
                error_code = err.code(),
                error = %err,
                "Render failed"
            );
            return Err(err);
        }
    };
    histogram!(METRIC_RENDER_MS).record(elapsed_ms);

    let artifact = CachedArtifact::png(body);
    let write = tokio::time::timeout(timeout, store.put(&key, &artifact))
        .await
        .unwrap_or_else(|_| Err(StoreError::timeout(timeout)));
    match write {
        Ok(()) => info!(
            target = "application::pipeline",
            op = "pipeline::render",
            result = "stored",
            engine = engine.name(),
            cache_key = %key,
            elapsed_ms = elapsed_ms as u64,
            bytes = artifact.len(),
            "Rendered and cached card"
        ),
        Err(err) => {
            counter!(METRIC_CACHE_WRITE_ERROR).increment(1);
            warn!(
                target = "application::pipeline",
                op = "pipeline::upload",
                result = "write_error",
                backend = store.backend_name(),
                cache_key = %key,
                error = %err,
                "Cache write failed; serving rendered card anyway"
            );
        }
    }

    Ok(artifact)
}
