//! Error types for the widget front.

use axum::http::StatusCode;
use livecell_base::error::{ErrorKind, LiveError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrontError {
    /// Error returned by the coordinator; classified by the `LiveError` inside
    #[error("{0}")]
    Coordinator(#[from] anyhow::Error),

    /// Request body or query that could not be decoded
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Coordinator call exceeded the request deadline
    #[error("Timeout after {timeout_sec} seconds")]
    Timeout { timeout_sec: u32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FrontError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FrontError::Coordinator(e) => LiveError::classify(e),
            FrontError::InvalidInput(_) => ErrorKind::InvalidParameter,
            FrontError::Timeout { .. } => ErrorKind::RemoteUnavailable,
            FrontError::Serialization(_) => ErrorKind::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::ValidationError | ErrorKind::InvalidParameter => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::LockConflict | ErrorKind::StaleWrite => StatusCode::CONFLICT,
            ErrorKind::RemoteUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        self.kind().as_str()
    }
}

pub type Result<T> = std::result::Result<T, FrontError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(e: LiveError) -> FrontError {
        FrontError::Coordinator(e.into())
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (coordinator(LiveError::ValidationError("x".into())), StatusCode::BAD_REQUEST),
            (coordinator(LiveError::NotFound("w".into())), StatusCode::NOT_FOUND),
            (
                coordinator(LiveError::LockConflict {
                    widget_id: "w".into(),
                    holder_id: "a".into(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                coordinator(LiveError::StaleWrite {
                    widget_id: "w".into(),
                    expected: 1,
                    current: 2,
                }),
                StatusCode::CONFLICT,
            ),
            (
                coordinator(LiveError::RemoteUnavailable("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (FrontError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (FrontError::Timeout { timeout_sec: 1 }, StatusCode::SERVICE_UNAVAILABLE),
            (
                FrontError::Coordinator(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{}", err);
        }
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            coordinator(LiveError::StaleWrite {
                widget_id: "w".into(),
                expected: 1,
                current: 2
            })
            .error_code(),
            "STALE_WRITE"
        );
        assert_eq!(
            FrontError::Coordinator(anyhow::anyhow!("boom")).error_code(),
            "INTERNAL_ERROR"
        );
    }
}
