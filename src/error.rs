use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Main error type for the ringleader cluster service
#[derive(Debug)]
pub enum ClusterError {
    /// Configuration or CLI argument errors
    Config(String),

    /// Election protocol errors
    Election(String),

    /// System I/O errors
    Io(std::io::Error),

    /// Transport layer errors
    Transport(String),

    /// Serialization/deserialization errors
    Serialization(SerializationError),

    /// Coordinator channel or task errors
    Concurrency(String),
}

/// Serialization related errors
#[derive(Debug)]
pub enum SerializationError {
    /// JSON serialization/deserialization errors
    Json(serde_json::Error),

    /// A message whose payload does not match its opcode
    Payload(String),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ClusterError::Election(msg) => write!(f, "Election error: {}", msg),
            ClusterError::Io(err) => write!(f, "I/O error: {}", err),
            ClusterError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ClusterError::Serialization(err) => write!(f, "Serialization error: {}", err),
            ClusterError::Concurrency(msg) => write!(f, "Concurrency error: {}", msg),
        }
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::Json(err) => write!(f, "JSON: {}", err),
            SerializationError::Payload(msg) => write!(f, "Payload: {}", msg),
        }
    }
}

impl std::error::Error for ClusterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClusterError::Io(err) => Some(err),
            ClusterError::Serialization(SerializationError::Json(err)) => Some(err),
            _ => None,
        }
    }
}

impl std::error::Error for SerializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializationError::Json(err) => Some(err),
            SerializationError::Payload(_) => None,
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, ClusterError>;

// Axum IntoResponse implementation for HTTP error responses
impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

impl ClusterError {
    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClusterError::Config(_) => StatusCode::BAD_REQUEST,
            ClusterError::Election(_) => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ClusterError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ClusterError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ClusterError::Concurrency(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            ClusterError::Config(_) => "configuration_error",
            ClusterError::Election(_) => "election_error",
            ClusterError::Io(_) => "io_error",
            ClusterError::Transport(_) => "transport_error",
            ClusterError::Serialization(_) => "serialization_error",
            ClusterError::Concurrency(_) => "concurrency_error",
        }
    }
}

// Conversions from common error types
impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Io(err)
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(SerializationError::Json(err))
    }
}

impl From<SerializationError> for ClusterError {
    fn from(err: SerializationError) -> Self {
        ClusterError::Serialization(err)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ClusterError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ClusterError::Concurrency(format!("Coordinator channel closed: {}", err))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ClusterError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        ClusterError::Concurrency(format!("Coordinator dropped the reply: {}", err))
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::ClusterError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ClusterError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! election_error {
    ($msg:expr) => {
        $crate::error::ClusterError::Election($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ClusterError::Election(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::ClusterError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ClusterError::Transport(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let config_err = ClusterError::Config("Invalid port".to_string());
        assert_eq!(config_err.to_string(), "Configuration error: Invalid port");

        let io_err = ClusterError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "Address in use",
        ));
        assert!(io_err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let cluster_err: ClusterError = io_err.into();

        assert!(matches!(cluster_err, ClusterError::Io(_)));
        assert_eq!(cluster_err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_json_conversion_keeps_source() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let cluster_err: ClusterError = json_err.into();

        assert_eq!(cluster_err.error_type(), "serialization_error");
        assert!(std::error::Error::source(&cluster_err).is_some());
    }

    #[test]
    fn test_macros() {
        let err = config_error!("timeout {}ms is shorter than twice the delay", 100);
        assert_eq!(
            err.to_string(),
            "Configuration error: timeout 100ms is shorter than twice the delay"
        );

        let err = election_error!("phase exhausted");
        assert_eq!(err.to_string(), "Election error: phase exhausted");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
