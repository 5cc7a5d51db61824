#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response},
};
use bytes::Bytes;
use http_body_util::BodyExt;
use social_cards::{
    application::{
        pipeline::{PipelineSettings, RenderPipeline},
        render::{RenderEngine, RenderError, RenderJob},
    },
    cache::{CacheStore, MemoryObjectStore},
    infra::http::{HttpState, build_router},
};
use tower::ServiceExt;

pub const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake-card";

/// Engine that records calls and answers with fixed bytes or a fixed error.
#[derive(Default)]
pub struct FakeEngine {
    pub calls: AtomicUsize,
    pub failure: Option<RenderError>,
    pub delay: Duration,
}

impl FakeEngine {
    pub fn failing(error: RenderError) -> Self {
        Self {
            failure: Some(error),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn render(&self, _job: &RenderJob) -> Result<Bytes, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(Bytes::from_static(FAKE_PNG)),
        }
    }
}

pub struct Harness {
    pub router: Router,
    pub engine: Arc<FakeEngine>,
    pub objects: Arc<MemoryObjectStore>,
}

pub fn harness(engine: FakeEngine) -> Harness {
    let engine = Arc::new(engine);
    let objects = Arc::new(MemoryObjectStore::new());
    let pipeline = RenderPipeline::new(
        CacheStore::new(objects.clone()),
        engine.clone(),
        PipelineSettings::default(),
    );
    let router = build_router(HttpState {
        pipeline: Arc::new(pipeline),
    });
    Harness {
        router,
        engine,
        objects,
    }
}

pub async fn get(router: &Router, uri: &str) -> Response<Body> {
    router
        .clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("router is infallible")
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
}
