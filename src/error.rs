//! Error types for the messaging plane.
//!
//! One error enum covers transport, protocol and routing failures so that
//! futures shared between concurrent requesters can carry a cloned error.

use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for sockets, the connection cache and the gateway.
#[derive(Error, Debug)]
pub enum BusError {
    /// Network connectivity errors
    #[error("network error: {message}")]
    Network {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection management errors
    #[error("connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Wire format and serialization errors
    #[error("protocol error: {message}")]
    Protocol {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Operation exceeded its deadline
    #[error("timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The socket cache has entered its terminal state
    #[error("TransportSocketCache is closed.")]
    CacheClosed,

    /// Every candidate endpoint of a dial campaign failed
    #[error("could not connect to service #{service_id}: no endpoint replied.")]
    NoEndpointReplied { service_id: u32 },

    /// Generic I/O errors
    #[error("i/o error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for messaging operations
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: None,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a protocol error with source
    pub fn protocol_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Protocol {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Check if this error may go away on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Network { .. }
                | BusError::Connection { .. }
                | BusError::Timeout { .. }
                | BusError::Io { .. }
        )
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            BusError::Network { .. } => "network",
            BusError::Connection { .. } => "connection",
            BusError::Protocol { .. } => "protocol",
            BusError::Configuration { .. } => "configuration",
            BusError::Timeout { .. } => "timeout",
            BusError::CacheClosed => "cache_closed",
            BusError::NoEndpointReplied { .. } => "no_endpoint_replied",
            BusError::Io { .. } => "io",
        }
    }
}

// Custom Clone implementation since Box<dyn Error> doesn't implement Clone.
// Errors are cloned when a shared promise fans one failure out to several
// waiting futures; the source chain is dropped in the copies.
impl Clone for BusError {
    fn clone(&self) -> Self {
        match self {
            BusError::Network { message, .. } => BusError::Network {
                message: message.clone(),
                source: None,
            },
            BusError::Connection {
                message,
                remote_addr,
                ..
            } => BusError::Connection {
                message: message.clone(),
                remote_addr: *remote_addr,
                source: None,
            },
            BusError::Protocol { message, .. } => BusError::Protocol {
                message: message.clone(),
                source: None,
            },
            BusError::Configuration { message, field } => BusError::Configuration {
                message: message.clone(),
                field: field.clone(),
            },
            BusError::Timeout {
                operation,
                timeout_ms,
            } => BusError::Timeout {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            BusError::CacheClosed => BusError::CacheClosed,
            BusError::NoEndpointReplied { service_id } => BusError::NoEndpointReplied {
                service_id: *service_id,
            },
            BusError::Io { message, source } => BusError::Io {
                message: message.clone(),
                source: std::io::Error::new(source.kind(), message.as_str()),
            },
        }
    }
}

/// Convert standard I/O errors to bus errors
impl From<std::io::Error> for BusError {
    fn from(error: std::io::Error) -> Self {
        BusError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

/// Convert YAML configuration errors to bus errors
impl From<serde_yaml::Error> for BusError {
    fn from(error: serde_yaml::Error) -> Self {
        BusError::configuration(format!("YAML configuration error: {}", error), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let err = BusError::network("connection refused");
        assert_eq!(err.category(), "network");
        assert!(err.is_transient());
    }

    #[test]
    fn test_well_known_messages() {
        assert_eq!(
            BusError::CacheClosed.to_string(),
            "TransportSocketCache is closed."
        );
        assert_eq!(
            BusError::NoEndpointReplied { service_id: 42 }.to_string(),
            "could not connect to service #42: no endpoint replied."
        );
    }

    #[test]
    fn test_clone_drops_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = BusError::network_with_source("peer went away", io_err);
        let cloned = err.clone();
        match cloned {
            BusError::Network { message, source } => {
                assert_eq!(message, "peer went away");
                assert!(source.is_none());
            }
            _ => panic!("expected Network error"),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = BusError::from(io_err);
        assert_eq!(err.category(), "io");
        assert!(err.is_transient());
    }

    #[test]
    fn test_non_transient() {
        assert!(!BusError::protocol("bad frame").is_transient());
        assert!(!BusError::configuration("missing url", Some("listen")).is_transient());
        assert!(!BusError::CacheClosed.is_transient());
    }
}
