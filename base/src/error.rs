use redis::RedisError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("ValidationError({0})")]
    ValidationError(String),
    #[error("LockConflict(widget_id={widget_id}, holder_id={holder_id})")]
    LockConflict {
        widget_id: String,
        holder_id: String,
    },
    #[error("RemoteUnavailable({0})")]
    RemoteUnavailable(String),
    #[error("StaleWrite(widget_id={widget_id}, expected={expected}, current={current})")]
    StaleWrite {
        widget_id: String,
        expected: u64,
        current: u64,
    },
    #[error("NotFound({0})")]
    NotFound(String),
    #[error("InvalidParameter({0})")]
    InvalidParameter(String),
    #[error("CodecError({0})")]
    CodecError(String),
    #[error("serde_json error({0:?})")]
    SerdeJsonError(serde_json::error::Error),
    #[error("RedisError({0:?})")]
    RedisError(RedisError),
    #[error("DBError({0:?})")]
    DBError(sqlx::Error),
    #[error("ReqwestError({0:?})")]
    ReqwestError(reqwest::Error),
    #[error("RuntimeError({0})")]
    RuntimeError(String),
    /// error reported by a remote coordinator, already classified
    #[error("{kind}: {message}")]
    WireError { kind: ErrorKind, message: String },
}

/// Wire-level error classification shared by the coordinator, the HTTP front
/// and the client widget status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    LockConflict,
    RemoteUnavailable,
    StaleWrite,
    NotFound,
    InvalidParameter,
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::LockConflict => "LOCK_CONFLICT",
            ErrorKind::RemoteUnavailable => "REMOTE_UNAVAILABLE",
            ErrorKind::StaleWrite => "STALE_WRITE",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InvalidParameter => "INVALID_PARAMETER",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Validation and lock rejections are resolved by the caller and never
    /// reported as failures in logs.
    pub fn is_user_resolvable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ValidationError
                | ErrorKind::LockConflict
                | ErrorKind::StaleWrite
                | ErrorKind::NotFound
                | ErrorKind::InvalidParameter
        )
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "VALIDATION_ERROR" => ErrorKind::ValidationError,
            "LOCK_CONFLICT" => ErrorKind::LockConflict,
            "REMOTE_UNAVAILABLE" => ErrorKind::RemoteUnavailable,
            "STALE_WRITE" => ErrorKind::StaleWrite,
            "NOT_FOUND" => ErrorKind::NotFound,
            "INVALID_PARAMETER" => ErrorKind::InvalidParameter,
            _ => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LiveError::ValidationError(_) => ErrorKind::ValidationError,
            LiveError::LockConflict { .. } => ErrorKind::LockConflict,
            LiveError::RemoteUnavailable(_) => ErrorKind::RemoteUnavailable,
            LiveError::StaleWrite { .. } => ErrorKind::StaleWrite,
            LiveError::NotFound(_) => ErrorKind::NotFound,
            LiveError::InvalidParameter(_) | LiveError::CodecError(_) => {
                ErrorKind::InvalidParameter
            }
            LiveError::RedisError(_) | LiveError::DBError(_) | LiveError::ReqwestError(_) => {
                ErrorKind::RemoteUnavailable
            }
            LiveError::SerdeJsonError(_) | LiveError::RuntimeError(_) => ErrorKind::Internal,
            LiveError::WireError { kind, .. } => *kind,
        }
    }

    /// Classify an error chain by the first `LiveError` found in it.
    pub fn classify(err: &anyhow::Error) -> ErrorKind {
        err.chain()
            .find_map(|e| e.downcast_ref::<LiveError>())
            .map(LiveError::kind)
            .unwrap_or(ErrorKind::Internal)
    }
}

impl From<serde_json::Error> for LiveError {
    fn from(e: serde_json::Error) -> Self {
        LiveError::SerdeJsonError(e)
    }
}
impl From<RedisError> for LiveError {
    fn from(e: RedisError) -> Self {
        LiveError::RedisError(e)
    }
}
impl From<sqlx::Error> for LiveError {
    fn from(e: sqlx::Error) -> Self {
        LiveError::DBError(e)
    }
}
impl From<reqwest::Error> for LiveError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            LiveError::RemoteUnavailable(e.to_string())
        } else {
            LiveError::ReqwestError(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            LiveError::ValidationError("x".to_string()).kind(),
            ErrorKind::ValidationError
        );
        assert_eq!(
            LiveError::LockConflict {
                widget_id: "w1".to_string(),
                holder_id: "a".to_string()
            }
            .kind(),
            ErrorKind::LockConflict
        );
        assert_eq!(
            LiveError::CodecError("bad".to_string()).kind(),
            ErrorKind::InvalidParameter
        );
    }

    #[test]
    fn test_classify_through_context() {
        let err: anyhow::Error = LiveError::StaleWrite {
            widget_id: "w1".to_string(),
            expected: 1,
            current: 3,
        }
        .into();
        let err = err.context("in update_value");
        assert_eq!(LiveError::classify(&err), ErrorKind::StaleWrite);

        let other = anyhow::anyhow!("something else");
        assert_eq!(LiveError::classify(&other), ErrorKind::Internal);
    }

    #[test]
    fn test_error_code_roundtrip() {
        for kind in [
            ErrorKind::ValidationError,
            ErrorKind::LockConflict,
            ErrorKind::RemoteUnavailable,
            ErrorKind::StaleWrite,
            ErrorKind::NotFound,
            ErrorKind::InvalidParameter,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_code(kind.as_str()), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_user_resolvable() {
        assert!(ErrorKind::LockConflict.is_user_resolvable());
        assert!(!ErrorKind::RemoteUnavailable.is_user_resolvable());
        assert!(!ErrorKind::Internal.is_user_resolvable());
    }
}
