use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::domain::{
    card::{RenderRequest, Viewport},
    options::OptionSet,
};

/// Everything an engine needs to rasterize one card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderJob {
    pub template: String,
    pub title: String,
    pub options: OptionSet,
    pub viewport: Viewport,
}

impl RenderJob {
    pub fn from_request(request: &RenderRequest, viewport: Viewport) -> Self {
        Self {
            template: request.template.clone(),
            title: request.title.clone(),
            options: request.options.clone(),
            viewport,
        }
    }
}

/// Failures while producing an image.
///
/// Cloneable so a single in-flight render can hand the same outcome to every
/// caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("template `{template}` not found")]
    TemplateNotFound { template: String },
    #[error("render engine unavailable: {reason}")]
    EngineUnavailable { reason: String },
    #[error("render exceeded deadline of {timeout_ms}ms")]
    RenderTimeout { timeout_ms: u64 },
    #[error("template page failed to load: {reason}")]
    PageLoadFailure { reason: String },
    #[error("screenshot capture failed: {reason}")]
    CaptureFailure { reason: String },
}

impl RenderError {
    /// Whether the failure is caused by the request rather than the engine.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::TemplateNotFound { .. })
    }

    /// Stable label for logs and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TemplateNotFound { .. } => "template_not_found",
            Self::EngineUnavailable { .. } => "engine_unavailable",
            Self::RenderTimeout { .. } => "render_timeout",
            Self::PageLoadFailure { .. } => "page_load_failure",
            Self::CaptureFailure { .. } => "capture_failure",
        }
    }

    pub(crate) fn template_not_found(template: impl Into<String>) -> Self {
        Self::TemplateNotFound {
            template: template.into(),
        }
    }

    pub(crate) fn unavailable(reason: impl ToString) -> Self {
        Self::EngineUnavailable {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn page_load(reason: impl ToString) -> Self {
        Self::PageLoadFailure {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn capture(reason: impl ToString) -> Self {
        Self::CaptureFailure {
            reason: reason.to_string(),
        }
    }
}

/// Turns a template plus parameters into PNG bytes.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn render(&self, job: &RenderJob) -> Result<Bytes, RenderError>;
}
