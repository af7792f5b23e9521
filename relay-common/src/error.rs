//! Error types for the Dify relay.

use thiserror::Error;

use crate::util::truncate_with_ellipsis;

/// Result type alias using the relay error type.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Maximum number of body characters kept in a `RemoteRequest` error.
pub const BODY_EXCERPT_CHARS: usize = 300;

/// Unified error type for one relay turn.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The remote API answered with a non-success status.
    #[error("remote request failed: status_code={status} response={body}")]
    RemoteRequest { status: u16, body: String },

    /// The event stream carried an error event or could not be reduced.
    #[error("remote stream error: {0}")]
    RemoteStream(String),

    /// A media download kept failing after all retries.
    #[error("download of {url} failed after {attempts} attempts")]
    TransientDownload { url: String, attempts: u32 },

    /// The relay is configured in a way it cannot serve.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transport level failure, including timeouts.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Build a `RemoteRequest` error, keeping only an excerpt of the body.
    pub fn remote_request(status: u16, body: &str) -> Self {
        Self::RemoteRequest {
            status,
            body: truncate_with_ellipsis(body, BODY_EXCERPT_CHARS),
        }
    }

    /// Short label used as the `stage`-independent error kind in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RemoteRequest { .. } => "remote_request",
            Self::RemoteStream(_) => "remote_stream",
            Self::TransientDownload { .. } => "transient_download",
            Self::Configuration(_) => "configuration",
            Self::Http(_) => "http",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Check if this error came from a timed out request.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http(e) if e.is_timeout())
    }
}
