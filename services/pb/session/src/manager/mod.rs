//! Lifecycle owners for endpoints.
//!
//! A [`Manager`] receives the fixed set of callbacks an endpoint raises and
//! decides what happens next: start protocols, close, retry, or shut down.
//! Three implementations are provided. [`ClientManager`] owns one outbound
//! connection with bounded reconnection. [`ServerManager`] accepts
//! connections and tracks the live set. [`PeerManager`] combines one server
//! with any number of outbound clients.
//!
//! Every manager re-publishes its lifecycle through named events (see
//! [`events`]) so layers above can subscribe with `on(name, listener)`.

mod client;
mod peer;
mod server;

pub use client::ClientManager;
pub use peer::PeerManager;
pub use server::ServerManager;

use crate::endpoint::{Endpoint, EndpointSettings};
use crate::protocol::{Protocol, ProtocolSettings};
use crate::retry::RetryPolicy;
use pb_wire::DEFAULT_MAX_FRAME_SIZE;
use std::net::SocketAddr;
use std::time::Duration;

/// Callbacks an endpoint raises on its manager.
///
/// All callbacks for one endpoint run on that endpoint's connection task, in
/// order. They must not block.
pub trait Manager: Send + Sync {
    /// The connection task started
    fn endpoint_ready(&self, endpoint: &Endpoint);

    /// The endpoint finished closing; raised exactly once
    fn endpoint_closed(&self, endpoint: &Endpoint);

    /// The socket failed or hit end of stream without a local close
    fn endpoint_disconnected_abruptly(&self, endpoint: &Endpoint);

    /// A frame could not be decoded or named an unknown protocol
    fn endpoint_sent_invalid_message(&self, endpoint: &Endpoint);

    /// A liveness deadline passed
    fn endpoint_timed_out(&self, endpoint: &Endpoint, protocol: &str);

    /// A message was invalid for its protocol's state
    fn protocol_violation(&self, endpoint: &Endpoint, protocol: &str);

    /// The session protocol completed its handshake
    fn session_started(&self, endpoint: &Endpoint);

    /// The session protocol stopped
    fn session_stopped(&self, endpoint: &Endpoint);

    /// The remote side asked to run `protocol`; return false to refuse
    fn protocol_requested(&self, endpoint: &Endpoint, protocol: &dyn Protocol) -> bool;
}

/// Lifecycle event names
pub mod events {
    /// Endpoint connection task started
    pub const ENDPOINT_READY: &str = "endpointReady";
    /// Endpoint closed
    pub const ENDPOINT_CLOSED: &str = "endpointClosed";
    /// Endpoint lost its connection
    pub const ENDPOINT_DISCONNECTED_ABRUPTLY: &str = "endpointDisconnectedAbruptly";
    /// Endpoint received an undecodable message
    pub const ENDPOINT_SENT_INVALID_MESSAGE: &str = "endpointSentInvalidMessage";
    /// Endpoint missed a liveness deadline
    pub const ENDPOINT_TIMED_OUT: &str = "endpointTimedOut";
    /// Protocol violation on an endpoint
    pub const PROTOCOL_VIOLATION: &str = "protocolViolation";
    /// Session established
    pub const SESSION_STARTED: &str = "sessionStarted";
    /// Session ended
    pub const SESSION_STOPPED: &str = "sessionStopped";
    /// Session ended by a failure
    pub const SESSION_ERROR: &str = "sessionError";
    /// Server socket is listening
    pub const IO_THREAD: &str = "ioThread";
    /// Peer session established
    pub const PEER_STARTED: &str = "peerStarted";
    /// Peer session ended
    pub const PEER_STOPPED: &str = "peerStopped";
    /// Peer session ended by a failure
    pub const PEER_ERROR: &str = "peerError";
    /// A peer's server manager is up
    pub const PEER_SERVER_MANAGER: &str = "peerServerManager";
}

/// Payload of a lifecycle event
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Event about one endpoint
    Endpoint(Endpoint),
    /// Event about one protocol on an endpoint
    Protocol {
        /// Endpoint concerned
        endpoint: Endpoint,
        /// Protocol concerned
        protocol: String,
    },
    /// A client ran out of retries without ever reaching its target
    Unreachable {
        /// Host the client was dialing
        host: String,
        /// Port the client was dialing
        port: u16,
    },
    /// A server socket was bound
    Listening(SocketAddr),
    /// A peer's server manager
    Server(ServerManager),
}

impl LifecycleEvent {
    /// The endpoint the event concerns, if any
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            LifecycleEvent::Endpoint(endpoint) | LifecycleEvent::Protocol { endpoint, .. } => Some(endpoint),
            LifecycleEvent::Unreachable { .. } | LifecycleEvent::Listening(_) | LifecycleEvent::Server(_) => None,
        }
    }
}

/// Options shared by every manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Host to connect to or bind on
    pub host: String,
    /// Port to connect to or bind on; 0 binds an ephemeral port
    pub port: u16,
    /// Shared secret for administrative shutdown
    pub password: Option<String>,
    /// Reconnections allowed after abrupt disconnects
    pub retry_bound: u32,
    /// Fixed wait before each reconnection
    pub retry_delay: Duration,
    /// Keepalive heartbeat interval
    pub keepalive_interval: Duration,
    /// How long a stopping session waits for acknowledgement
    pub stop_timeout: Duration,
    /// Largest frame accepted or sent
    pub max_frame_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let protocols = ProtocolSettings::default();
        Self {
            host: "localhost".to_string(),
            port: 3100,
            password: None,
            retry_bound: 10,
            retry_delay: Duration::from_millis(5_000),
            keepalive_interval: protocols.keepalive_interval,
            stop_timeout: protocols.stop_timeout,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ManagerConfig {
    /// Settings for endpoints this manager opens
    pub fn endpoint_settings(&self) -> EndpointSettings {
        EndpointSettings {
            protocols: ProtocolSettings {
                keepalive_interval: self.keepalive_interval,
                stop_timeout: self.stop_timeout,
            },
            max_frame_size: self.max_frame_size,
        }
    }

    /// Reconnection policy for a client campaign
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_bound, self.retry_delay)
    }

    /// Same options aimed at another host
    pub fn with_target(&self, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..self.clone()
        }
    }
}
