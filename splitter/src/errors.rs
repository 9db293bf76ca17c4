use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Fixed message returned to callers when the source audio cannot be fetched.
pub const DOWNLOAD_FAILED_MESSAGE: &str = "Failed to download file";

/// Fixed message returned when the spleeter subprocess exits unsuccessfully.
pub const SPLEETER_FAILED_MESSAGE: &str = "Spleeter processing failed";

#[derive(ThisError, Debug)]
pub enum Error {
    /// The source URL could not be fetched or answered with a non-success status
    #[error("Failed to download file from {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    /// The separation engine failed (subprocess exit, model error, undecodable input)
    #[error("{message}")]
    Separation { message: String },

    /// The object store rejected an upload or could not be reached
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Local filesystem failure while staging files
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// JSON body used for every error response.
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorBody {
    pub detail: String,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::DownloadFailed { .. } => StatusCode::BAD_REQUEST,
            Error::Separation { .. } | Error::Storage { .. } | Error::Io(_) | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message exposed to the caller.
    ///
    /// Download failures collapse to a fixed message; everything else carries the error text
    /// (including the context chain for `anyhow` errors).
    pub fn user_message(&self) -> String {
        match self {
            Error::DownloadFailed { .. } => DOWNLOAD_FAILED_MESSAGE.to_string(),
            Error::Other(e) => format!("{e:#}"),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::DownloadFailed { .. } => {
                tracing::info!("Client error: {}", self);
            }
            Error::Separation { .. } => {
                tracing::error!("Separation error: {}", self);
            }
            Error::Storage { .. } => {
                tracing::error!("Storage error: {}", self);
            }
            Error::Io(_) | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
        }

        let status = self.status_code();
        let body = ErrorBody {
            detail: self.user_message(),
        };

        (status, Json(body)).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_failure_is_bad_request_with_fixed_message() {
        let err = Error::DownloadFailed {
            url: "http://example.com/a.mp3".to_string(),
            reason: "HTTP 404".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.user_message(), "Failed to download file");
    }

    #[test]
    fn test_other_failures_are_server_errors_with_error_text() {
        let err = Error::Storage {
            message: "bucket not found".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.user_message(), "Storage error: bucket not found");

        let err = Error::Other(anyhow::anyhow!("inner").context("outer"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.user_message(), "outer: inner");
    }

    #[test]
    fn test_spleeter_failure_message() {
        let err = Error::Separation {
            message: SPLEETER_FAILED_MESSAGE.to_string(),
        };
        assert_eq!(err.user_message(), "Spleeter processing failed");
    }
}
