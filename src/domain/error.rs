use thiserror::Error;

/// Client-input failures detected while parsing a card request.
///
/// All of these are raised before any storage or browser work happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("unrecognized card path: {reason}")]
    UnrecognizedPath { reason: String },
    #[error("malformed title: {reason}")]
    MalformedTitle { reason: String },
    #[error("malformed options segment `{segment}`")]
    MalformedOptions { segment: String },
    #[error("cache key is {length} bytes, limit is {limit}")]
    KeyTooLong { length: usize, limit: usize },
}

impl RequestError {
    pub fn unrecognized_path(reason: impl Into<String>) -> Self {
        Self::UnrecognizedPath {
            reason: reason.into(),
        }
    }

    pub fn malformed_title(reason: impl Into<String>) -> Self {
        Self::MalformedTitle {
            reason: reason.into(),
        }
    }

    pub fn malformed_options(segment: impl Into<String>) -> Self {
        Self::MalformedOptions {
            segment: segment.into(),
        }
    }
}
