//! Session protocol: establishment and teardown of a logical conversation.
//!
//! ```text
//!  client                          server
//!  NOT_STARTED --StartRequest-->   NOT_STARTED -> STARTED
//!  STARTED     <--StartReply----
//!  STARTED     --StopRequest-->    STARTED -> STOPPED
//!  STOPPING    <--StopReply-----
//!  STOPPED
//! ```
//!
//! Either side may initiate the stop. Any message outside the transitions
//! above is a protocol violation.

use crate::error::ProtocolError;
use crate::protocol::{Protocol, ProtocolLink, Role, TimerId};
use pb_wire::Message;
use std::any::Any;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake completed yet
    NotStarted,
    /// Handshake completed
    Started,
    /// Stop requested, waiting for the peer's acknowledgement
    Stopping,
    /// Terminal
    Stopped,
}

/// Session protocol state machine
#[derive(Debug)]
pub struct SessionProtocol {
    role: Role,
    state: SessionState,
    stop_timeout: Duration,
    teardown: Option<TimerId>,
}

impl SessionProtocol {
    /// Protocol name on the wire
    pub const NAME: &'static str = "SessionProtocol";
    /// Client asks to start a session
    pub const START_REQUEST: &'static str = "SessionStartRequest";
    /// Server acknowledges the start
    pub const START_REPLY: &'static str = "SessionStartReply";
    /// Either side asks to stop the session
    pub const STOP_REQUEST: &'static str = "SessionStopRequest";
    /// The other side acknowledges the stop
    pub const STOP_REPLY: &'static str = "SessionStopReply";

    /// Create a session protocol for `role`
    pub fn new(role: Role, stop_timeout: Duration) -> Self {
        Self {
            role,
            state: SessionState::NotStarted,
            stop_timeout,
            teardown: None,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Ask the peer to end the session.
    ///
    /// Returns `Ok(false)` when there is no started session to stop.
    pub fn stop_session(&mut self, link: &mut dyn ProtocolLink) -> Result<bool, ProtocolError> {
        if self.state != SessionState::Started {
            debug!(
                "Ignoring stop on {}: session is {:?}",
                link.endpoint_id(),
                self.state
            );
            return Ok(false);
        }

        self.send_request(link, Message::request(Self::NAME, Self::STOP_REQUEST))?;
        self.state = SessionState::Stopping;
        self.teardown = Some(link.arm_timer(self.stop_timeout));
        info!("Stopping session with {}", link.endpoint_id());
        Ok(true)
    }

    fn finish(&mut self, link: &mut dyn ProtocolLink) {
        if let Some(timer) = self.teardown.take() {
            link.cancel_timer(timer);
        }
        self.state = SessionState::Stopped;
        info!("Session with {} stopped", link.endpoint_id());
        link.session_stopped();
    }

    fn unexpected(&self, msg: &Message) -> ProtocolError {
        ProtocolError::violation(
            Self::NAME,
            format!("{} not valid for {} in state {:?}", msg, self.role, self.state),
        )
    }
}

impl Protocol for SessionProtocol {
    fn protocol_name(&self) -> &'static str {
        Self::NAME
    }

    fn role(&self) -> Role {
        self.role
    }

    fn start_as_client(&mut self, link: &mut dyn ProtocolLink) -> Result<(), ProtocolError> {
        if self.state != SessionState::NotStarted {
            return Err(ProtocolError::violation(Self::NAME, "session already underway"));
        }
        debug!("Requesting session start with {}", link.endpoint_id());
        // Stays NOT_STARTED until the server acknowledges
        self.send_request(link, Message::request(Self::NAME, Self::START_REQUEST))
    }

    fn start_as_server(&mut self, link: &mut dyn ProtocolLink) -> Result<(), ProtocolError> {
        debug!("Waiting for session start from {}", link.endpoint_id());
        Ok(())
    }

    fn send_request(&mut self, link: &mut dyn ProtocolLink, msg: Message) -> Result<(), ProtocolError> {
        link.send(msg)?;
        Ok(())
    }

    fn receive_request(&mut self, link: &mut dyn ProtocolLink, msg: &Message) -> Result<(), ProtocolError> {
        match (msg.name(), self.role, self.state) {
            (Self::START_REQUEST, Role::Server, SessionState::NotStarted) => {
                self.state = SessionState::Started;
                self.send_reply(link, Message::reply(Self::NAME, Self::START_REPLY))?;
                info!("Session started with {}", link.endpoint_id());
                link.session_started();
                Ok(())
            }
            (Self::STOP_REQUEST, _, SessionState::Started | SessionState::Stopping) => {
                if let Err(e) = self.send_reply(link, Message::reply(Self::NAME, Self::STOP_REPLY)) {
                    debug!("Could not acknowledge stop from {}: {}", link.endpoint_id(), e);
                }
                self.finish(link);
                Ok(())
            }
            _ => Err(self.unexpected(msg)),
        }
    }

    fn send_reply(&mut self, link: &mut dyn ProtocolLink, msg: Message) -> Result<(), ProtocolError> {
        link.send(msg)?;
        Ok(())
    }

    fn receive_reply(&mut self, link: &mut dyn ProtocolLink, msg: &Message) -> Result<(), ProtocolError> {
        match (msg.name(), self.role, self.state) {
            (Self::START_REPLY, Role::Client, SessionState::NotStarted) => {
                self.state = SessionState::Started;
                info!("Session started with {}", link.endpoint_id());
                link.session_started();
                Ok(())
            }
            (Self::STOP_REPLY, _, SessionState::Stopping) => {
                self.finish(link);
                Ok(())
            }
            _ => Err(self.unexpected(msg)),
        }
    }

    fn timer_fired(&mut self, link: &mut dyn ProtocolLink, timer: TimerId) -> Result<(), ProtocolError> {
        if self.teardown == Some(timer) && self.state == SessionState::Stopping {
            self.teardown = None;
            warn!(
                "No stop acknowledgement from {} within {:?}; ending session",
                link.endpoint_id(),
                self.stop_timeout
            );
            self.finish(link);
        }
        Ok(())
    }

    fn stop_protocol(&mut self, link: &mut dyn ProtocolLink) {
        if let Some(timer) = self.teardown.take() {
            link.cancel_timer(timer);
        }
        if matches!(self.state, SessionState::Started | SessionState::Stopping) {
            warn!("Session with {} stopped while still underway", link.endpoint_id());
        }
        self.state = SessionState::Stopped;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
