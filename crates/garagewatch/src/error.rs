//! Failure taxonomy shared by both transports and the controller.
//!
//! Transports convert their native errors into `SyncError` at their boundary,
//! so the controller only ever reasons about these five cases.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Relay peer or remote endpoint is not available.
    #[error("{0} is not reachable")]
    TransportUnreachable(String),

    #[error("request timed out after {}s", .0.as_secs_f32())]
    RequestTimeout(Duration),

    /// The service answered, but refused the request.
    #[error("remote rejected request: {0}")]
    RemoteRejected(String),

    /// The reply is missing fields or carries values we cannot interpret.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// The id is outside the fixed entity vocabulary.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
}

impl SyncError {
    /// Whether this error should reach the ErrorRecord. Unknown entities are
    /// only logged.
    pub fn is_surfaced(&self) -> bool {
        !matches!(self, SyncError::UnknownEntity(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::MalformedReply(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        insta::assert_snapshot!(
            SyncError::TransportUnreachable("companion device".to_string()),
            @"companion device is not reachable"
        );
        insta::assert_snapshot!(
            SyncError::RequestTimeout(Duration::from_millis(2500)),
            @"request timed out after 2.5s"
        );
    }

    #[test]
    fn test_unknown_entity_is_not_surfaced() {
        assert!(!SyncError::UnknownEntity("light.kitchen".into()).is_surfaced());
        assert!(SyncError::RemoteRejected("500".into()).is_surfaced());
        assert!(SyncError::MalformedReply("x".into()).is_surfaced());
    }

    #[test]
    fn test_json_errors_are_malformed_replies() {
        let err: SyncError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, SyncError::MalformedReply(_)));
    }
}
