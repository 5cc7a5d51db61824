use bytes::Bytes;

use super::options::OptionSet;

/// Content type of every artifact produced by the renderer.
pub const PNG_CONTENT_TYPE: &str = "image/png";
/// File extension expected on the request path and appended to cache keys.
pub const PNG_EXTENSION: &str = ".png";

pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1200;
pub const DEFAULT_VIEWPORT_HEIGHT: u32 = 630;

/// A parsed card request: which template to render, with which title and options.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderRequest {
    pub template: String,
    pub title: String,
    pub options: OptionSet,
}

impl RenderRequest {
    pub fn new(template: impl Into<String>, title: impl Into<String>, options: OptionSet) -> Self {
        Self {
            template: template.into(),
            title: title.into(),
            options,
        }
    }
}

/// Raster size of a rendered card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: DEFAULT_VIEWPORT_WIDTH,
            height: DEFAULT_VIEWPORT_HEIGHT,
        }
    }
}

/// Rendered image bytes stored under a cache key. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub body: Bytes,
    pub content_type: String,
}

impl CachedArtifact {
    pub fn new(body: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            body,
            content_type: content_type.into(),
        }
    }

    pub fn png(body: Bytes) -> Self {
        Self::new(body, PNG_CONTENT_TYPE)
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
