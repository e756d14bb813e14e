//! Error types for endpoints, protocols and managers.

use pb_wire::WireError;
use thiserror::Error;

/// Errors raised by an [`Endpoint`](crate::Endpoint)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// The endpoint is closing or closed and can no longer send
    #[error("endpoint {0} unavailable")]
    Unavailable(String),

    /// A protocol with the same name is already registered
    #[error("protocol {0} already running")]
    ProtocolAlreadyRunning(String),

    /// The message could not be framed
    #[error("encoding failed: {0}")]
    Encode(#[from] WireError),
}

/// Errors returned by protocol callbacks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message is not valid for the protocol's current state
    #[error("protocol {protocol} violated: {reason}")]
    Violation {
        /// Name of the violated protocol
        protocol: &'static str,
        /// What was wrong
        reason: String,
    },

    /// Sending through the endpoint failed
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

impl ProtocolError {
    /// Build a violation for `protocol`
    pub fn violation(protocol: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::Violation {
            protocol,
            reason: reason.into(),
        }
    }
}

/// Errors raised by managers
#[derive(Error, Debug)]
pub enum ManagerError {
    /// Socket level failure (bind, connect, resolve)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Host name did not resolve to any address
    #[error("could not resolve {0}")]
    Resolve(String),

    /// The manager was started twice
    #[error("manager already started")]
    AlreadyStarted,
}
