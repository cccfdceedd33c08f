/// Centralized error types for the TWS client
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TwsError {
    // Connection Errors
    #[error("Connect timed out after {0:?} waiting for acknowledgment")]
    ConnectTimeout(Duration),

    #[error("Connect already in progress")]
    AlreadyConnecting,

    #[error("Connected but next valid id not received yet")]
    NotReady,

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // Request Errors
    #[error("Request {request_id} timed out after {timeout:?}")]
    RequestTimeout { request_id: i64, timeout: Duration },

    #[error("Protocol error {code}: {message}")]
    Protocol { code: i32, message: String },

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("{failed} of {total} historical sub-fetches failed: {source}")]
    PartialFetch {
        failed: usize,
        total: usize,
        #[source]
        source: Box<TwsError>,
    },

    // Data Errors
    #[error("Invalid bar data: {0}")]
    InvalidBarData(String),

    #[error("Cache I/O error: {0}")]
    CacheIo(String),

    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    // Generic Errors
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TwsError>;

impl TwsError {
    /// Check if retrying the same call later can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            TwsError::ConnectTimeout(_)
            | TwsError::AlreadyConnecting
            | TwsError::NotReady
            | TwsError::RequestTimeout { .. }
            | TwsError::SessionClosed(_)
            | TwsError::CacheIo(_) => true,
            // Pacing violations and "no data" style answers clear up on their own
            TwsError::Protocol { code, .. } => matches!(code, 162 | 165 | 366),
            TwsError::PartialFetch { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Check if the error came from the broker rather than from this client
    pub fn is_protocol(&self) -> bool {
        match self {
            TwsError::Protocol { .. } => true,
            TwsError::PartialFetch { source, .. } => source.is_protocol(),
            _ => false,
        }
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            TwsError::ConnectTimeout(_) => "CONN_001",
            TwsError::AlreadyConnecting => "CONN_002",
            TwsError::NotReady => "CONN_003",
            TwsError::NotConnected(_) => "CONN_004",
            TwsError::ConnectionFailed(_) => "CONN_005",
            TwsError::RequestTimeout { .. } => "REQ_001",
            TwsError::Protocol { .. } => "REQ_002",
            TwsError::SessionClosed(_) => "REQ_003",
            TwsError::PartialFetch { .. } => "REQ_004",
            TwsError::InvalidBarData(_) => "DATA_001",
            TwsError::CacheIo(_) => "DATA_002",
            TwsError::DeserializationError(_) => "DATA_003",
            TwsError::ConfigError(_) => "CFG_001",
            TwsError::InvalidParameter(_) => "CFG_002",
            TwsError::FileError(_) => "FILE_001",
            TwsError::Internal(_) => "INT_001",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_fetch_delegates_to_source() {
        let err = TwsError::PartialFetch {
            failed: 1,
            total: 2,
            source: Box::new(TwsError::Protocol {
                code: 162,
                message: "HMDS query returned no data".to_string(),
            }),
        };

        assert!(err.is_protocol());
        assert!(err.is_recoverable());
        assert_eq!(err.error_code(), "REQ_004");
        assert!(err.to_string().contains("1 of 2"));
    }

    #[test]
    fn test_fatal_errors_not_recoverable() {
        assert!(!TwsError::ConnectionFailed("1300".to_string()).is_recoverable());
        assert!(!TwsError::Protocol { code: 200, message: "No security definition".to_string() }
            .is_recoverable());
    }
}
