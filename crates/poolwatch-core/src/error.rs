use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for core operations.
pub type PoolwatchResult<T> = Result<T, PoolwatchError>;

#[derive(Error, Debug)]
pub enum PoolwatchError {
    #[error("[PW1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[PW1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[PW1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[PW1003] json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[PW1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[PW1200] not found: {0}")]
    NotFound(String),

    #[error("[PW1201] property `{key}` holds {found}, requested {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("[PW1202] malformed {record} record: expected {expected} bytes, got {actual}")]
    MalformedRecord {
        record: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("[PW1300] version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("[PW2000] {action} failed: {cause}")]
    OperationFailed { action: String, cause: String },

    #[error("[PW3000] authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("[PW4000] helper connection error: {0}")]
    Transport(String),

    #[error("[PW4001] protocol error: {0}")]
    Protocol(String),
}

impl PoolwatchError {
    pub fn code(&self) -> &'static str {
        match self {
            PoolwatchError::Io(_) => "PW1000",
            PoolwatchError::Toml(_) => "PW1001",
            PoolwatchError::Yaml(_) => "PW1002",
            PoolwatchError::Json(_) => "PW1003",
            PoolwatchError::InvalidConfig(_) => "PW1100",
            PoolwatchError::NotFound(_) => "PW1200",
            PoolwatchError::TypeMismatch { .. } => "PW1201",
            PoolwatchError::MalformedRecord { .. } => "PW1202",
            PoolwatchError::VersionMismatch { .. } => "PW1300",
            PoolwatchError::OperationFailed { .. } => "PW2000",
            PoolwatchError::AuthorizationDenied(_) => "PW3000",
            PoolwatchError::Transport(_) => "PW4000",
            PoolwatchError::Protocol(_) => "PW4001",
        }
    }

    /// Shorthand for the most common failure shape: a native call that refused.
    pub fn failed(action: impl Into<String>, cause: impl Into<String>) -> Self {
        PoolwatchError::OperationFailed {
            action: action.into(),
            cause: cause.into(),
        }
    }
}

/// Coarse error category used when an error crosses the helper socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    NotFound,
    TypeMismatch,
    MalformedRecord,
    VersionMismatch,
    OperationFailed,
    AuthorizationDenied,
    InvalidConfig,
    Protocol,
    Internal,
}

/// Serialisable form of [`PoolwatchError`] sent back by the privileged helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    #[serde(default)]
    pub action: Option<String>,
    pub message: String,
}

impl From<&PoolwatchError> for RemoteError {
    fn from(err: &PoolwatchError) -> Self {
        let (kind, action, message) = match err {
            PoolwatchError::NotFound(what) => (RemoteErrorKind::NotFound, None, what.clone()),
            PoolwatchError::TypeMismatch { .. } => {
                (RemoteErrorKind::TypeMismatch, None, err.to_string())
            }
            PoolwatchError::MalformedRecord { .. } => {
                (RemoteErrorKind::MalformedRecord, None, err.to_string())
            }
            PoolwatchError::VersionMismatch { expected, found } => (
                RemoteErrorKind::VersionMismatch,
                Some(expected.clone()),
                found.clone(),
            ),
            PoolwatchError::OperationFailed { action, cause } => (
                RemoteErrorKind::OperationFailed,
                Some(action.clone()),
                cause.clone(),
            ),
            PoolwatchError::AuthorizationDenied(reason) => {
                (RemoteErrorKind::AuthorizationDenied, None, reason.clone())
            }
            PoolwatchError::InvalidConfig(reason) => {
                (RemoteErrorKind::InvalidConfig, None, reason.clone())
            }
            PoolwatchError::Protocol(reason) => (RemoteErrorKind::Protocol, None, reason.clone()),
            other => (RemoteErrorKind::Internal, None, other.to_string()),
        };
        RemoteError {
            kind,
            action,
            message,
        }
    }
}

impl From<RemoteError> for PoolwatchError {
    fn from(remote: RemoteError) -> Self {
        match remote.kind {
            RemoteErrorKind::NotFound => PoolwatchError::NotFound(remote.message),
            RemoteErrorKind::VersionMismatch => PoolwatchError::VersionMismatch {
                expected: remote.action.unwrap_or_default(),
                found: remote.message,
            },
            RemoteErrorKind::OperationFailed => PoolwatchError::OperationFailed {
                action: remote.action.unwrap_or_else(|| "helper operation".to_string()),
                cause: remote.message,
            },
            RemoteErrorKind::AuthorizationDenied => {
                PoolwatchError::AuthorizationDenied(remote.message)
            }
            RemoteErrorKind::InvalidConfig => PoolwatchError::InvalidConfig(remote.message),
            // The typed payload of these does not survive the trip; keep the text.
            RemoteErrorKind::TypeMismatch
            | RemoteErrorKind::MalformedRecord
            | RemoteErrorKind::Internal => PoolwatchError::failed("helper", remote.message),
            RemoteErrorKind::Protocol => PoolwatchError::Protocol(remote.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_failed_survives_the_wire() {
        let err = PoolwatchError::failed("destroy tank/a", "dataset is busy");
        let remote = RemoteError::from(&err);
        let json = serde_json::to_string(&remote).unwrap();
        let back: RemoteError = serde_json::from_str(&json).unwrap();
        match PoolwatchError::from(back) {
            PoolwatchError::OperationFailed { action, cause } => {
                assert_eq!(action, "destroy tank/a");
                assert_eq!(cause, "dataset is busy");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn authorization_denied_keeps_its_kind() {
        let err = PoolwatchError::AuthorizationDenied("right not granted".into());
        let back = PoolwatchError::from(RemoteError::from(&err));
        assert!(matches!(back, PoolwatchError::AuthorizationDenied(_)));
        assert_eq!(back.code(), "PW3000");
    }

    #[test]
    fn remote_error_rejects_unknown_fields() {
        let json = r#"{"kind":"not_found","message":"tank","extra":1}"#;
        assert!(serde_json::from_str::<RemoteError>(json).is_err());
    }
}
