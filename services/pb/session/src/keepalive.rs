//! Keepalive protocol: heartbeat based liveness detection.
//!
//! The client sends a `KeepAliveRequest` as soon as it starts and expects a
//! `KeepAliveReply` within one interval. An answered heartbeat schedules the
//! next one an interval later. The server answers every request and expects
//! the next one within one interval of the previous.
//!
//! A missed deadline is reported once and is terminal for the instance:
//! nothing received afterwards revives it. A reconnecting manager builds a
//! fresh instance.

use crate::error::ProtocolError;
use crate::protocol::{Protocol, ProtocolLink, Role, TimerId};
use pb_wire::Message;
use std::any::Any;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Keepalive state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveState {
    /// Not started yet
    Idle,
    /// Client: heartbeat sent, deadline armed
    AwaitingReply,
    /// Client: heartbeat answered, next heartbeat scheduled
    Resting,
    /// Server: deadline armed for the next request
    Watching,
    /// Deadline missed (terminal)
    TimedOut,
    /// Stopped by the endpoint (terminal)
    Stopped,
}

/// Keepalive protocol state machine
#[derive(Debug)]
pub struct KeepAliveProtocol {
    role: Role,
    interval: Duration,
    state: KeepAliveState,
    /// The single live timer: a deadline, or the client's next heartbeat
    timer: Option<TimerId>,
    /// Heartbeats sent (client) or answered (server)
    beats: u64,
}

impl KeepAliveProtocol {
    /// Protocol name on the wire
    pub const NAME: &'static str = "KeepAliveProtocol";
    /// Heartbeat
    pub const REQUEST: &'static str = "KeepAliveRequest";
    /// Heartbeat acknowledgement
    pub const REPLY: &'static str = "KeepAliveReply";

    /// Create a keepalive protocol for `role` with heartbeat interval `interval`
    pub fn new(role: Role, interval: Duration) -> Self {
        Self {
            role,
            interval,
            state: KeepAliveState::Idle,
            timer: None,
            beats: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> KeepAliveState {
        self.state
    }

    /// Heartbeats sent (client) or answered (server)
    pub fn beats(&self) -> u64 {
        self.beats
    }

    fn rearm(&mut self, link: &mut dyn ProtocolLink) {
        if let Some(timer) = self.timer.take() {
            link.cancel_timer(timer);
        }
        self.timer = Some(link.arm_timer(self.interval));
    }

    fn expire(&mut self, link: &mut dyn ProtocolLink) {
        self.state = KeepAliveState::TimedOut;
        self.timer = None;
        warn!(
            "{} {} silent for {:?}; timing out",
            match self.role {
                Role::Client => "Server",
                Role::Server => "Client",
            },
            link.endpoint_id(),
            self.interval
        );
        link.timed_out();
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, KeepAliveState::TimedOut | KeepAliveState::Stopped)
    }

    fn heartbeat(&mut self, link: &mut dyn ProtocolLink) -> Result<(), ProtocolError> {
        self.send_request(link, Message::request(Self::NAME, Self::REQUEST))
    }
}

impl Protocol for KeepAliveProtocol {
    fn protocol_name(&self) -> &'static str {
        Self::NAME
    }

    fn role(&self) -> Role {
        self.role
    }

    fn start_as_client(&mut self, link: &mut dyn ProtocolLink) -> Result<(), ProtocolError> {
        debug!("Starting keepalive with {} every {:?}", link.endpoint_id(), self.interval);
        self.heartbeat(link)
    }

    fn start_as_server(&mut self, link: &mut dyn ProtocolLink) -> Result<(), ProtocolError> {
        debug!("Watching keepalive from {} every {:?}", link.endpoint_id(), self.interval);
        self.state = KeepAliveState::Watching;
        self.rearm(link);
        Ok(())
    }

    fn send_request(&mut self, link: &mut dyn ProtocolLink, msg: Message) -> Result<(), ProtocolError> {
        link.send(msg)?;
        self.beats += 1;
        self.state = KeepAliveState::AwaitingReply;
        self.rearm(link);
        trace!("Sent heartbeat {} to {}", self.beats, link.endpoint_id());
        Ok(())
    }

    fn receive_request(&mut self, link: &mut dyn ProtocolLink, msg: &Message) -> Result<(), ProtocolError> {
        if self.role != Role::Server || !msg.is_request(Self::REQUEST) {
            return Err(ProtocolError::violation(
                Self::NAME,
                format!("{} not valid for {}", msg, self.role),
            ));
        }
        if self.is_terminal() {
            debug!("Ignoring heartbeat from {} after {:?}", link.endpoint_id(), self.state);
            return Ok(());
        }

        self.rearm(link);
        self.send_reply(link, Message::reply(Self::NAME, Self::REPLY))
    }

    fn send_reply(&mut self, link: &mut dyn ProtocolLink, msg: Message) -> Result<(), ProtocolError> {
        link.send(msg)?;
        self.beats += 1;
        Ok(())
    }

    fn receive_reply(&mut self, link: &mut dyn ProtocolLink, msg: &Message) -> Result<(), ProtocolError> {
        if self.role != Role::Client || !msg.is_reply(Self::REPLY) {
            return Err(ProtocolError::violation(
                Self::NAME,
                format!("{} not valid for {}", msg, self.role),
            ));
        }

        match self.state {
            KeepAliveState::AwaitingReply => {
                // Deadline met: the same slot now holds the next heartbeat
                self.state = KeepAliveState::Resting;
                self.rearm(link);
                Ok(())
            }
            KeepAliveState::TimedOut | KeepAliveState::Stopped => {
                debug!("Ignoring late heartbeat reply from {}", link.endpoint_id());
                Ok(())
            }
            state => Err(ProtocolError::violation(
                Self::NAME,
                format!("unsolicited reply in state {:?}", state),
            )),
        }
    }

    fn timer_fired(&mut self, link: &mut dyn ProtocolLink, timer: TimerId) -> Result<(), ProtocolError> {
        if self.timer != Some(timer) {
            trace!("Discarding stale keepalive timer {:?}", timer);
            return Ok(());
        }
        self.timer = None;

        match self.state {
            KeepAliveState::AwaitingReply | KeepAliveState::Watching => {
                self.expire(link);
                Ok(())
            }
            KeepAliveState::Resting => self.heartbeat(link),
            _ => Ok(()),
        }
    }

    fn stop_protocol(&mut self, link: &mut dyn ProtocolLink) {
        if let Some(timer) = self.timer.take() {
            link.cancel_timer(timer);
        }
        if self.state != KeepAliveState::TimedOut {
            self.state = KeepAliveState::Stopped;
        }
        debug!("Keepalive with {} stopped after {} beats", link.endpoint_id(), self.beats);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::RecordingLink;

    const T: Duration = Duration::from_millis(20_000);

    fn request() -> Message {
        Message::request(KeepAliveProtocol::NAME, KeepAliveProtocol::REQUEST)
    }

    fn reply() -> Message {
        Message::reply(KeepAliveProtocol::NAME, KeepAliveProtocol::REPLY)
    }

    #[test]
    fn test_client_sends_immediately_and_arms_deadline() {
        let mut client = KeepAliveProtocol::new(Role::Client, T);
        let mut link = RecordingLink::default();

        client.start(&mut link).unwrap();
        assert_eq!(link.sent_named(KeepAliveProtocol::REQUEST), 1);
        assert_eq!(link.armed, vec![(TimerId(1), T)]);
        assert_eq!(client.state(), KeepAliveState::AwaitingReply);
    }

    #[test]
    fn test_client_reply_schedules_next_heartbeat() {
        let mut client = KeepAliveProtocol::new(Role::Client, T);
        let mut link = RecordingLink::default();
        client.start(&mut link).unwrap();

        for round in 1..=3u64 {
            client.receive_reply(&mut link, &reply()).unwrap();
            assert_eq!(client.state(), KeepAliveState::Resting);
            let heartbeat = link.live_timer().unwrap();
            client.timer_fired(&mut link, heartbeat).unwrap();
            assert_eq!(link.sent_named(KeepAliveProtocol::REQUEST) as u64, round + 1);
        }
        assert_eq!(link.timeouts, 0);
    }

    #[test]
    fn test_client_times_out_once_and_goes_quiet() {
        let mut client = KeepAliveProtocol::new(Role::Client, T);
        let mut link = RecordingLink::default();
        client.start(&mut link).unwrap();

        let deadline = link.live_timer().unwrap();
        client.timer_fired(&mut link, deadline).unwrap();
        assert_eq!(link.timeouts, 1);
        assert_eq!(client.state(), KeepAliveState::TimedOut);

        // Neither a repeated expiry nor a late reply revives it
        client.timer_fired(&mut link, deadline).unwrap();
        client.receive_reply(&mut link, &reply()).unwrap();
        assert_eq!(link.timeouts, 1);
        assert_eq!(link.sent_named(KeepAliveProtocol::REQUEST), 1);
        assert_eq!(client.state(), KeepAliveState::TimedOut);
        assert_eq!(link.armed.len(), 1);
    }

    #[test]
    fn test_client_rejects_unsolicited_reply_and_requests() {
        let mut client = KeepAliveProtocol::new(Role::Client, T);
        let mut link = RecordingLink::default();
        client.start(&mut link).unwrap();
        client.receive_reply(&mut link, &reply()).unwrap();

        assert!(client.receive_reply(&mut link, &reply()).is_err());
        assert!(client.receive_request(&mut link, &request()).is_err());
    }

    #[test]
    fn test_server_answers_every_request_and_resets_deadline() {
        let mut server = KeepAliveProtocol::new(Role::Server, T);
        let mut link = RecordingLink::default();
        server.start(&mut link).unwrap();
        assert!(link.sent.is_empty());
        assert_eq!(link.armed.len(), 1);

        for n in 1..=4 {
            let before = link.live_timer().unwrap();
            server.receive_request(&mut link, &request()).unwrap();
            assert_eq!(link.sent_named(KeepAliveProtocol::REPLY), n);
            assert!(link.cancelled.contains(&before));
            assert_ne!(link.live_timer(), Some(before));
        }

        // The old deadline is stale and must not fire
        server.timer_fired(&mut link, TimerId(1)).unwrap();
        assert_eq!(link.timeouts, 0);
    }

    #[test]
    fn test_server_times_out_without_requests() {
        let mut server = KeepAliveProtocol::new(Role::Server, T);
        let mut link = RecordingLink::default();
        server.start(&mut link).unwrap();

        let deadline = link.live_timer().unwrap();
        server.timer_fired(&mut link, deadline).unwrap();
        assert_eq!(link.timeouts, 1);

        // Requests after the timeout get no reply
        server.receive_request(&mut link, &request()).unwrap();
        assert!(link.sent.is_empty());
        assert_eq!(link.timeouts, 1);
    }

    #[test]
    fn test_server_rejects_replies() {
        let mut server = KeepAliveProtocol::new(Role::Server, T);
        let mut link = RecordingLink::default();
        server.start(&mut link).unwrap();

        assert!(matches!(
            server.receive_reply(&mut link, &reply()),
            Err(ProtocolError::Violation { .. })
        ));
    }

    #[test]
    fn test_stop_cancels_timer() {
        let mut client = KeepAliveProtocol::new(Role::Client, T);
        let mut link = RecordingLink::default();
        client.start(&mut link).unwrap();
        let deadline = link.live_timer().unwrap();

        client.stop_protocol(&mut link);
        assert!(link.cancelled.contains(&deadline));
        assert_eq!(client.state(), KeepAliveState::Stopped);

        client.timer_fired(&mut link, deadline).unwrap();
        assert_eq!(link.timeouts, 0);
    }

    #[test]
    fn test_unavailable_endpoint_abandons_heartbeat() {
        let mut client = KeepAliveProtocol::new(Role::Client, T);
        let mut link = RecordingLink::closed();

        assert!(matches!(
            client.start(&mut link),
            Err(ProtocolError::Endpoint(_))
        ));
        assert!(link.armed.is_empty());
    }
}
