//! Error types for fab-serve.
//!
//! Startup errors ([`FabError::MalformedBundle`], [`FabError::ArchiveRead`],
//! [`FabError::RendererLoad`], [`FabError::InvalidConfig`]) abort the process
//! before a listener is bound. Everything else is scoped to a single request
//! and becomes an HTTP status with an empty body.

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use thiserror::Error;

/// Everything that can go wrong while loading or serving a bundle.
#[derive(Error, Debug)]
pub enum FabError {
    /// The bundle has no `/server.js` entry.
    #[error("Malformed FAB: missing {entry}")]
    MalformedBundle {
        /// The entry that was expected.
        entry: String,
    },

    /// The archive could not be opened or one of its entries could not be read.
    #[error("Failed to read bundle archive: {reason}")]
    ArchiveRead {
        /// Description of the failure.
        reason: String,
    },

    /// The entry program threw, did not export a renderer, or the isolate
    /// could not be started.
    #[error("Failed to load renderer: {reason}")]
    RendererLoad {
        /// Description of the failure.
        reason: String,
    },

    /// `render` threw, rejected, or returned something that cannot be
    /// turned into an HTTP response.
    #[error("Render failed: {reason}")]
    Render {
        /// Description of the failure.
        reason: String,
    },

    /// `render` did not settle within the configured timeout.
    #[error("Render timed out after {duration_ms}ms")]
    RenderTimeout {
        /// The timeout in milliseconds.
        duration_ms: u64,
    },

    /// A `/_assets` path with no matching bundle entry.
    #[error("Asset not found: {path}")]
    AssetNotFound {
        /// The requested path.
        path: String,
    },

    /// The request body exceeded the configured limit.
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge {
        /// The limit in bytes.
        limit: usize,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

impl FabError {
    /// Create a new `ArchiveRead` error.
    pub fn archive_read(reason: impl Into<String>) -> Self {
        Self::ArchiveRead {
            reason: reason.into(),
        }
    }

    /// Create a new `RendererLoad` error.
    pub fn renderer_load(reason: impl Into<String>) -> Self {
        Self::RendererLoad {
            reason: reason.into(),
        }
    }

    /// Create a new `Render` error.
    pub fn render(reason: impl Into<String>) -> Self {
        Self::Render {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedBundle { .. }
                | Self::ArchiveRead { .. }
                | Self::RendererLoad { .. }
                | Self::InvalidConfig { .. }
        )
    }

    /// HTTP status used when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AssetNotFound { .. } => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RenderTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FabError {
    fn into_response(self) -> Response<Body> {
        (self.status_code(), Body::empty()).into_response()
    }
}
