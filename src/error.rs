//! Error types for the load balancer engine
//!
//! This module defines the error hierarchy for the query life-cycle engine,
//! covering message validation, network I/O, downstream communication,
//! caching and configuration loading.
//!
//! # Error Categories
//!
//! - **Parse/Serialize errors**: DNS message encoding/decoding failures
//! - **Network errors**: socket I/O and binding issues
//! - **Downstream errors**: backend server communication failures
//! - **Config errors**: invalid configuration, fatal before the engine starts
//! - **Policy errors**: no server selectable for a query
//!
//! # Example
//!
//! ```
//! use dnslb::error::Error;
//!
//! let err = Error::timeout("probe of 192.0.2.1:53", std::time::Duration::from_secs(1));
//! assert!(err.is_recoverable());
//! assert!(err.to_string().contains("timed out"));
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for load balancer operations
///
/// Errors are classified as either recoverable or non-recoverable:
/// - **Recoverable**: transient issues that may succeed on retry
///   (timeouts, network errors, downstream failures)
/// - **Non-recoverable**: permanent failures requiring configuration
///   changes or operator intervention
#[derive(Debug, Error)]
pub enum Error {
    /// A DNS message could not be decoded.
    #[error("failed to parse DNS message: {reason}")]
    Parse {
        /// Description of what went wrong during parsing
        reason: String,
    },

    /// A DNS message could not be encoded for transmission.
    #[error("failed to serialize DNS message: {reason}")]
    Serialize {
        /// Description of what went wrong during serialization
        reason: String,
    },

    /// Low-level socket failure (bind, connect, send, receive).
    #[error("network error: {reason}")]
    Network {
        /// Description of the network failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// An operation did not complete within its deadline.
    #[error("operation timed out after {timeout:?}: {context}")]
    Timeout {
        /// Description of what timed out
        context: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// A backend server failed to answer or answered unusably.
    #[error("downstream server error ({server}): {reason}")]
    Downstream {
        /// Name or address of the backend
        server: String,
        /// Description of the failure
        reason: String,
    },

    /// No backend could be selected for a query.
    #[error("no server available: {reason}")]
    NoServer {
        /// Why selection failed
        reason: String,
    },

    /// Invalid configuration, detected during load.
    ///
    /// Configuration errors are fatal before the engine starts and are
    /// never produced on the query path.
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of the configuration error
        reason: String,
        /// The configuration field at fault, if known
        field: Option<String>,
    },

    /// An invariant was violated inside the engine.
    #[error("internal error: {reason}")]
    Internal {
        /// Description of the internal error
        reason: String,
    },
}

impl Error {
    /// Create a parse error.
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::Serialize {
            reason: reason.into(),
        }
    }

    /// Create a network error without an underlying I/O error.
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error wrapping an I/O error.
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error.
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            context: context.into(),
            timeout,
        }
    }

    /// Create a downstream error.
    pub fn downstream(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Downstream {
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// Create a no-server error.
    pub fn no_server(reason: impl Into<String>) -> Self {
        Self::NoServer {
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field.
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Whether a retry may reasonably succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::Timeout { .. }
                | Self::Downstream { .. }
                | Self::NoServer { .. }
        )
    }

    /// Whether this is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this is a configuration error.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_and_display() {
        let err = Error::parse("qdcount is zero");
        assert!(err.to_string().contains("qdcount is zero"));

        let err = Error::downstream("backend-1", "connection refused");
        assert!(err.to_string().contains("backend-1"));
        assert!(err.is_recoverable());

        let err = Error::config_field("burst must be >= 1", "backends[0].qps_burst");
        assert!(err.is_config());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_timeout_classification() {
        let err = Error::timeout("udp probe", Duration::from_millis(500));
        assert!(err.is_timeout());
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("udp probe"));
    }

    #[test]
    fn test_network_io_source_preserved() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::network_io("sending to backend", io_err);
        assert!(std::error::Error::source(&err).is_some());
    }
}
