use std::{io, path::PathBuf};

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// Bad form input. Nothing has been sent to the extractor.
    #[error("{0}")]
    InvalidInput(String),

    #[error("Failed to fetch video information: {0}")]
    MetadataFetch(String),

    #[error("{stage} timed out after {seconds} seconds")]
    Timeout { stage: &'static str, seconds: u64 },

    /// The extractor failed before the first byte of the response was sent.
    #[error("Failed to start download: {0}")]
    ExtractionStart(String),

    /// The extractor or the temporary file failed after the response was
    /// committed. Only ever logged and turned into a body error.
    #[error("Download interrupted: {0}")]
    MidStream(String),

    #[error("Could not remove temporary download {path:?}: {source}")]
    Cleanup { path: PathBuf, source: io::Error },

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        source: io::Error,
    },

    #[error("Failed to compile page template: {0}")]
    Template(#[from] upon::Error),
}

impl DownloadError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Io { context, source }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::MetadataFetch(_) | Self::ExtractionStart(_) | Self::MidStream(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Cleanup { .. } | Self::Io { .. } | Self::Template(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
