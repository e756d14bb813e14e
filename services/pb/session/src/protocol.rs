//! The contract every request/reply protocol implements.
//!
//! A protocol is a state machine bound to one endpoint. It never touches the
//! socket or the manager directly; everything goes through the
//! [`ProtocolLink`] handed to each callback. On a live endpoint the link is
//! backed by the endpoint's connection task, which owns the protocol and its
//! timers, so every callback for one endpoint runs on one task in delivery
//! order.

use crate::error::ProtocolError;
use crate::keepalive::KeepAliveProtocol;
use crate::session::SessionProtocol;
use pb_wire::Message;
use std::any::Any;
use std::fmt;
use std::time::Duration;

/// Which side of the conversation a protocol instance plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiating side
    Client,
    /// Responding side
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Handle for a timer armed through a [`ProtocolLink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Settings protocols are built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSettings {
    /// Heartbeat interval and liveness deadline
    pub keepalive_interval: Duration,
    /// How long a stopping session waits for the peer's acknowledgement
    pub stop_timeout: Duration,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_millis(20_000),
            stop_timeout: Duration::from_millis(5_000),
        }
    }
}

/// A protocol's view of its endpoint and manager
pub trait ProtocolLink {
    /// Identifier of the endpoint the protocol runs on
    fn endpoint_id(&self) -> &str;

    /// Send a message to the remote endpoint
    fn send(&mut self, message: Message) -> Result<(), crate::EndpointError>;

    /// Arm a one-shot timer; expiry is delivered to [`Protocol::timer_fired`]
    fn arm_timer(&mut self, delay: Duration) -> TimerId;

    /// Cancel a timer; a cancelled timer never fires
    fn cancel_timer(&mut self, timer: TimerId);

    /// Tell the manager the session is established
    fn session_started(&mut self);

    /// Tell the manager the session has ended
    fn session_stopped(&mut self);

    /// Tell the manager the peer stopped responding
    fn timed_out(&mut self);
}

/// A request/reply state machine layered on an endpoint
pub trait Protocol: Any + Send {
    /// Name used to route messages to this protocol
    fn protocol_name(&self) -> &'static str;

    /// Role this instance was constructed for
    fn role(&self) -> Role;

    /// Begin the protocol as the initiating side
    fn start_as_client(&mut self, link: &mut dyn ProtocolLink) -> Result<(), ProtocolError>;

    /// Begin the protocol as the responding side
    fn start_as_server(&mut self, link: &mut dyn ProtocolLink) -> Result<(), ProtocolError>;

    /// Send a request message
    fn send_request(&mut self, link: &mut dyn ProtocolLink, msg: Message) -> Result<(), ProtocolError>;

    /// Handle a request from the remote endpoint
    fn receive_request(&mut self, link: &mut dyn ProtocolLink, msg: &Message) -> Result<(), ProtocolError>;

    /// Send a reply message
    fn send_reply(&mut self, link: &mut dyn ProtocolLink, msg: Message) -> Result<(), ProtocolError>;

    /// Handle a reply from the remote endpoint
    fn receive_reply(&mut self, link: &mut dyn ProtocolLink, msg: &Message) -> Result<(), ProtocolError>;

    /// A timer armed by this protocol expired
    fn timer_fired(&mut self, _link: &mut dyn ProtocolLink, _timer: TimerId) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Release timers and state. Called by the endpoint when it closes.
    fn stop_protocol(&mut self, link: &mut dyn ProtocolLink);

    /// Downcast support for manager-driven operations such as stopping a session
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Start in the role given at construction
    fn start(&mut self, link: &mut dyn ProtocolLink) -> Result<(), ProtocolError> {
        match self.role() {
            Role::Client => self.start_as_client(link),
            Role::Server => self.start_as_server(link),
        }
    }
}

/// Build the responding side of a protocol the remote endpoint asked for.
///
/// Returns `None` for names this crate does not implement.
pub fn instantiate(name: &str, role: Role, settings: &ProtocolSettings) -> Option<Box<dyn Protocol>> {
    match name {
        SessionProtocol::NAME => Some(Box::new(SessionProtocol::new(role, settings.stop_timeout))),
        KeepAliveProtocol::NAME => {
            Some(Box::new(KeepAliveProtocol::new(role, settings.keepalive_interval)))
        }
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A link that records everything a protocol does.

    use super::*;
    use crate::EndpointError;

    #[derive(Debug, Default)]
    pub struct RecordingLink {
        pub sent: Vec<Message>,
        pub armed: Vec<(TimerId, Duration)>,
        pub cancelled: Vec<TimerId>,
        pub started: usize,
        pub stopped: usize,
        pub timeouts: usize,
        pub closed: bool,
        next_timer: u64,
    }

    impl RecordingLink {
        /// A link whose endpoint refuses every send
        pub fn closed() -> Self {
            Self {
                closed: true,
                ..Self::default()
            }
        }

        /// The most recently armed timer that has not been cancelled
        pub fn live_timer(&self) -> Option<TimerId> {
            self.armed
                .iter()
                .rev()
                .map(|(id, _)| *id)
                .find(|id| !self.cancelled.contains(id))
        }

        pub fn sent_named(&self, name: &str) -> usize {
            self.sent.iter().filter(|m| m.name() == name).count()
        }
    }

    impl ProtocolLink for RecordingLink {
        fn endpoint_id(&self) -> &str {
            "127.0.0.1:4000"
        }

        fn send(&mut self, message: Message) -> Result<(), EndpointError> {
            if self.closed {
                return Err(EndpointError::Unavailable(self.endpoint_id().to_string()));
            }
            self.sent.push(message);
            Ok(())
        }

        fn arm_timer(&mut self, delay: Duration) -> TimerId {
            self.next_timer += 1;
            let id = TimerId(self.next_timer);
            self.armed.push((id, delay));
            id
        }

        fn cancel_timer(&mut self, timer: TimerId) {
            self.cancelled.push(timer);
        }

        fn session_started(&mut self) {
            self.started += 1;
        }

        fn session_stopped(&mut self) {
            self.stopped += 1;
        }

        fn timed_out(&mut self) {
            self.timeouts += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instantiate_known_protocols() {
        let settings = ProtocolSettings::default();

        let session = instantiate("SessionProtocol", Role::Server, &settings).unwrap();
        assert_eq!(session.protocol_name(), SessionProtocol::NAME);
        assert_eq!(session.role(), Role::Server);

        let keepalive = instantiate("KeepAliveProtocol", Role::Server, &settings).unwrap();
        assert_eq!(keepalive.protocol_name(), KeepAliveProtocol::NAME);

        assert!(instantiate("WhiteboardProtocol", Role::Server, &settings).is_none());
    }
}
