//! Broker error types.
//!
//! Every operation surfaces a specific error kind; the `kind()` string is
//! the stable taxonomy shared by all protocol bindings.

use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("server not configured: {0}")]
    ConfigNotFound(String),

    #[error("server disabled: {0}")]
    ConfigDisabled(String),

    #[error("failed to launch server '{server}': {message}")]
    LaunchFailed { server: String, message: String },

    #[error("handshake with server '{server}' failed: {message}")]
    HandshakeFailed { server: String, message: String },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("server transport unavailable: {0}")]
    ServerUnavailable(String),

    #[error("catalog store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("server not connected: {0}")]
    NotConnected(String),

    #[error("action not found: {server}:{action}")]
    ActionNotFound { server: String, action: String },

    #[error("set not found: {0}")]
    SetNotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Stable wire identifier for this error, identical across bindings.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::ConfigNotFound(_) => "config_not_found",
            BrokerError::ConfigDisabled(_) => "config_disabled",
            BrokerError::LaunchFailed { .. } => "launch_failed",
            BrokerError::HandshakeFailed { .. } => "handshake_failed",
            BrokerError::Timeout(_) => "timeout",
            BrokerError::ServerUnavailable(_) => "server_unavailable",
            BrokerError::StoreUnavailable(_) => "store_unavailable",
            BrokerError::NotConnected(_) => "not_connected",
            BrokerError::ActionNotFound { .. } => "action_not_found",
            BrokerError::SetNotFound(_) => "set_not_found",
            BrokerError::InvalidArguments(_) => "invalid_arguments",
            BrokerError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(BrokerError::ConfigNotFound("x".into()).kind(), "config_not_found");
        assert_eq!(BrokerError::ConfigDisabled("x".into()).kind(), "config_disabled");
        assert_eq!(
            BrokerError::LaunchFailed {
                server: "x".into(),
                message: "boom".into()
            }
            .kind(),
            "launch_failed"
        );
        assert_eq!(BrokerError::Timeout("slow".into()).kind(), "timeout");
        assert_eq!(BrokerError::StoreUnavailable("disk".into()).kind(), "store_unavailable");
    }

    #[test]
    fn test_display_includes_server() {
        let err = BrokerError::HandshakeFailed {
            server: "notes".into(),
            message: "no response".into(),
        };
        let text = err.to_string();
        assert!(text.contains("notes"));
        assert!(text.contains("no response"));
    }
}
