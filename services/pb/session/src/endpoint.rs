//! One physical connection and the protocols running on it.
//!
//! An [`Endpoint`] is a cheap handle; the work happens on a per-connection
//! task started by [`EndpointIo::spawn`]. That task owns every protocol
//! instance registered on the endpoint together with its timers. It selects
//! between socket reads and a command channel, so incoming messages, timer
//! expiries and manager requests are handled one at a time and in order.
//!
//! Outbound frames are queued to a writer task. Nothing on the read path ever
//! waits for the socket to drain.

use crate::dispatch::Emitter;
use crate::error::{EndpointError, ProtocolError};
use crate::manager::Manager;
use crate::protocol::{self, Protocol, ProtocolLink, ProtocolSettings, Role, TimerId};
use crate::session::SessionProtocol;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use pb_wire::{encode, Message, MessageDecoder, MessageKind, DEFAULT_MAX_FRAME_SIZE};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Per-endpoint settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSettings {
    /// Settings for protocols instantiated on this endpoint
    pub protocols: ProtocolSettings,
    /// Largest frame accepted or sent
    pub max_frame_size: usize,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            protocols: ProtocolSettings::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading and sending
    Open,
    /// `close()` called, teardown in progress
    Closing,
    /// Socket closed, protocols stopped, `endpoint_closed` delivered
    Closed,
}

enum Command {
    Handle(Box<dyn Protocol>),
    Stop(String),
    StopSession,
    Timer { protocol: &'static str, timer: TimerId },
    Close,
}

struct Shared {
    id: String,
    remote_addr: SocketAddr,
    settings: EndpointSettings,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    /// Names registered on the connection task or queued for it
    registered: Mutex<HashSet<&'static str>>,
    listeners: Emitter<Bytes>,
}

/// Handle to one connection
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
}

/// The not-yet-started I/O half of an endpoint
pub struct EndpointIo {
    endpoint: Endpoint,
    stream: TcpStream,
    commands: mpsc::UnboundedReceiver<Command>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl Endpoint {
    /// Wrap a connected socket.
    ///
    /// Nothing is read until the returned [`EndpointIo`] is spawned, so the
    /// caller can record the endpoint before any manager callback fires.
    pub fn open(stream: TcpStream, settings: EndpointSettings) -> io::Result<(Endpoint, EndpointIo)> {
        let remote_addr = stream.peer_addr()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Open);

        let endpoint = Endpoint {
            shared: Arc::new(Shared {
                id: remote_addr.to_string(),
                remote_addr,
                settings,
                state,
                commands: commands_tx,
                outbound: Mutex::new(Some(outbound_tx)),
                registered: Mutex::new(HashSet::new()),
                listeners: Emitter::new(),
            }),
        };

        let io = EndpointIo {
            endpoint: endpoint.clone(),
            stream,
            commands: commands_rx,
            outbound: outbound_rx,
        };
        Ok((endpoint, io))
    }

    /// Identifier derived from the remote address and port
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Remote socket address
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    /// Settings this endpoint was opened with
    pub fn settings(&self) -> &EndpointSettings {
        &self.shared.settings
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Whether the endpoint still accepts sends
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Frame and queue a message for the remote endpoint
    pub fn send(&self, message: &Message) -> Result<(), EndpointError> {
        if !self.is_open() {
            return Err(self.unavailable());
        }

        let frame = encode(message, self.shared.settings.max_frame_size)?;
        let outbound = self.shared.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| self.unavailable()),
            None => Err(self.unavailable()),
        }
    }

    /// Send a named event with an opaque payload
    pub fn emit(&self, name: &str, payload: impl Into<Bytes>) -> Result<(), EndpointError> {
        self.send(&Message::event(name, payload))
    }

    /// Register a listener for events named `name` arriving on this endpoint
    pub fn on<F>(&self, name: &str, listener: F) -> &Self
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.shared.listeners.on(name, listener);
        self
    }

    /// Remove every listener for `name`
    pub fn off(&self, name: &str) -> usize {
        self.shared.listeners.off(name)
    }

    /// Register a protocol and start it in its role
    pub fn handle_protocol(&self, protocol: Box<dyn Protocol>) -> Result<(), EndpointError> {
        if !self.is_open() {
            return Err(self.unavailable());
        }

        let name = protocol.protocol_name();
        if !self.shared.registered.lock().insert(name) {
            return Err(EndpointError::ProtocolAlreadyRunning(name.to_string()));
        }
        self.command(Command::Handle(protocol))
    }

    /// Stop and unregister the protocol called `name`
    pub fn stop_protocol(&self, name: &str) {
        if self.command(Command::Stop(name.to_string())).is_err() {
            debug!("Endpoint {} gone; nothing to stop", self.id());
        }
    }

    /// Ask the registered session protocol to end the session
    pub fn stop_session(&self) {
        if self.command(Command::StopSession).is_err() {
            debug!("Endpoint {} gone; no session to stop", self.id());
        }
    }

    /// Whether a protocol called `name` is registered or about to be
    pub fn is_running(&self, name: &str) -> bool {
        self.shared.registered.lock().contains(name)
    }

    /// Close the endpoint. Only the first call has an effect.
    pub fn close(&self) {
        let initiated = self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });

        if initiated {
            debug!("Closing endpoint {}", self.id());
            let _ = self.shared.commands.send(Command::Close);
        }
    }

    /// Wait until the endpoint is closed
    pub async fn join(&self) {
        let mut state = self.shared.state.subscribe();
        while *state.borrow_and_update() != ConnectionState::Closed {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    fn command(&self, command: Command) -> Result<(), EndpointError> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> EndpointError {
        EndpointError::Unavailable(self.shared.id.clone())
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Endpoint {}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shared.id)
    }
}

impl EndpointIo {
    /// The endpoint this I/O half belongs to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Start the connection task, reporting lifecycle signals to `manager`
    pub fn spawn(self, manager: Arc<dyn Manager>) -> JoinHandle<()> {
        tokio::spawn(self.run(manager))
    }

    async fn run(self, manager: Arc<dyn Manager>) {
        let EndpointIo {
            endpoint,
            stream,
            mut commands,
            outbound,
        } = self;

        let (mut reader, writer) = stream.into_split();
        let writer = tokio::spawn(write_loop(endpoint.id().to_string(), writer, outbound));

        let mut decoder = MessageDecoder::with_max_frame_size(endpoint.shared.settings.max_frame_size);
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut conn = Connection {
            timers: Timers::new(endpoint.shared.commands.clone()),
            endpoint,
            manager,
            protocols: HashMap::new(),
            signals: Vec::new(),
            reading: true,
        };

        info!("Endpoint {} ready", conn.endpoint.id());
        conn.manager.endpoint_ready(&conn.endpoint);

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => conn.handle_command(command),
                },

                read = reader.read_buf(&mut buffer), if conn.reading => match read {
                    Ok(0) => conn.read_ended(None),
                    Ok(n) => {
                        trace!("Read {} bytes from {}", n, conn.endpoint.id());
                        conn.drain(&mut decoder, &mut buffer);
                    }
                    Err(e) => conn.read_ended(Some(e)),
                },
            }
        }

        drop(reader);
        conn.shutdown(writer).await;
    }
}

async fn write_loop(id: String, mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("Write to {} failed: {}", id, e);
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        trace!("Shutdown of {} failed: {}", id, e);
    }
}

enum Signal {
    SessionStarted,
    SessionStopped,
    TimedOut(&'static str),
}

struct Timers {
    next: u64,
    live: HashMap<TimerId, JoinHandle<()>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Timers {
    fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            next: 0,
            live: HashMap::new(),
            commands,
        }
    }

    fn arm(&mut self, protocol: &'static str, delay: Duration) -> TimerId {
        self.next += 1;
        let timer = TimerId(self.next);
        let commands = self.commands.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::Timer { protocol, timer });
        });
        self.live.insert(timer, handle);
        timer
    }

    fn cancel(&mut self, timer: TimerId) {
        if let Some(handle) = self.live.remove(&timer) {
            handle.abort();
        }
    }

    /// Claim an expiry; false if the timer was cancelled meanwhile
    fn expire(&mut self, timer: TimerId) -> bool {
        self.live.remove(&timer).is_some()
    }

    fn cancel_all(&mut self) {
        for (_, handle) in self.live.drain() {
            handle.abort();
        }
    }
}

struct HostLink<'a> {
    endpoint: &'a Endpoint,
    protocol: &'static str,
    timers: &'a mut Timers,
    signals: &'a mut Vec<Signal>,
}

impl ProtocolLink for HostLink<'_> {
    fn endpoint_id(&self) -> &str {
        self.endpoint.id()
    }

    fn send(&mut self, message: Message) -> Result<(), EndpointError> {
        self.endpoint.send(&message)
    }

    fn arm_timer(&mut self, delay: Duration) -> TimerId {
        self.timers.arm(self.protocol, delay)
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        self.timers.cancel(timer);
    }

    fn session_started(&mut self) {
        self.signals.push(Signal::SessionStarted);
    }

    fn session_stopped(&mut self) {
        self.signals.push(Signal::SessionStopped);
    }

    fn timed_out(&mut self) {
        self.signals.push(Signal::TimedOut(self.protocol));
    }
}

/// State owned by the connection task
struct Connection {
    endpoint: Endpoint,
    manager: Arc<dyn Manager>,
    protocols: HashMap<&'static str, Box<dyn Protocol>>,
    timers: Timers,
    signals: Vec<Signal>,
    reading: bool,
}

impl Connection {
    fn drain(&mut self, decoder: &mut MessageDecoder, buffer: &mut BytesMut) {
        while self.reading && self.endpoint.is_open() {
            match decoder.decode(buffer) {
                Ok(Some(message)) => self.dispatch(message),
                Ok(None) => break,
                Err(e) => self.reject(e),
            }
        }
    }

    fn dispatch(&mut self, message: Message) {
        trace!("Received {} from {}", message, self.endpoint.id());

        match message.kind() {
            MessageKind::Event => {
                if self.endpoint.shared.listeners.emit(message.name(), message.payload()) == 0 {
                    debug!("No listener for {} on {}", message.name(), self.endpoint.id());
                }
            }
            MessageKind::Request => {
                if !self.protocols.contains_key(message.protocol()) && !self.admit(message.protocol()) {
                    return;
                }
                self.call(message.protocol(), |p, link| p.receive_request(link, &message));
            }
            MessageKind::Reply => {
                if !self.call(message.protocol(), |p, link| p.receive_reply(link, &message)) {
                    warn!(
                        "Endpoint {} replied on unregistered protocol {}",
                        self.endpoint.id(),
                        message.protocol()
                    );
                    self.manager.protocol_violation(&self.endpoint, message.protocol());
                }
            }
        }
    }

    /// Instantiate a protocol the remote side asked for, if the manager agrees
    fn admit(&mut self, name: &str) -> bool {
        let settings = self.endpoint.shared.settings.protocols;
        let Some(protocol) = protocol::instantiate(name, Role::Server, &settings) else {
            self.reject(format!("request for unknown protocol {:?}", name));
            return false;
        };

        if !self.manager.protocol_requested(&self.endpoint, protocol.as_ref()) {
            warn!("Refused {} requested by {}", name, self.endpoint.id());
            return false;
        }

        self.endpoint.shared.registered.lock().insert(protocol.protocol_name());
        self.register(protocol);
        true
    }

    fn register(&mut self, protocol: Box<dyn Protocol>) {
        let name = protocol.protocol_name();
        debug!("Running {} as {} on {}", name, protocol.role(), self.endpoint.id());
        self.protocols.insert(name, protocol);
        self.call(name, |p, link| p.start(link));
    }

    fn stop(&mut self, name: &str) {
        let Some(mut protocol) = self.protocols.remove(name) else {
            debug!("No {} to stop on {}", name, self.endpoint.id());
            return;
        };
        self.endpoint.shared.registered.lock().remove(name);

        let mut link = HostLink {
            endpoint: &self.endpoint,
            protocol: protocol.protocol_name(),
            timers: &mut self.timers,
            signals: &mut self.signals,
        };
        protocol.stop_protocol(&mut link);
        self.settle(Ok(()));
    }

    /// Run `f` against the protocol called `name`; false if none is registered
    fn call<F>(&mut self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut dyn Protocol, &mut dyn ProtocolLink) -> Result<(), ProtocolError>,
    {
        let Some(protocol) = self.protocols.get_mut(name) else {
            return false;
        };

        let mut link = HostLink {
            endpoint: &self.endpoint,
            protocol: protocol.protocol_name(),
            timers: &mut self.timers,
            signals: &mut self.signals,
        };
        let result = f(protocol.as_mut(), &mut link);
        self.settle(result);
        true
    }

    /// Deliver signals raised during a callback, then its outcome
    fn settle(&mut self, result: Result<(), ProtocolError>) {
        for signal in std::mem::take(&mut self.signals) {
            match signal {
                Signal::SessionStarted => self.manager.session_started(&self.endpoint),
                Signal::SessionStopped => self.manager.session_stopped(&self.endpoint),
                Signal::TimedOut(protocol) => self.manager.endpoint_timed_out(&self.endpoint, protocol),
            }
        }

        match result {
            Ok(()) => {}
            Err(ProtocolError::Violation { protocol, reason }) => {
                warn!("{} violated {}: {}", self.endpoint.id(), protocol, reason);
                self.manager.protocol_violation(&self.endpoint, protocol);
            }
            Err(ProtocolError::Endpoint(e)) => {
                debug!("Abandoned send on {}: {}", self.endpoint.id(), e);
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Handle(protocol) => {
                if self.protocols.contains_key(protocol.protocol_name()) {
                    warn!(
                        "{} already running on {}; discarding",
                        protocol.protocol_name(),
                        self.endpoint.id()
                    );
                    return;
                }
                self.register(protocol);
            }
            Command::Stop(name) => self.stop(&name),
            Command::StopSession => {
                let found = self.call(SessionProtocol::NAME, |p, link| {
                    match p.as_any_mut().downcast_mut::<SessionProtocol>() {
                        Some(session) => session.stop_session(link).map(|_| ()),
                        None => Ok(()),
                    }
                });
                if !found {
                    debug!("No session running on {}", self.endpoint.id());
                }
            }
            Command::Timer { protocol, timer } => {
                if !self.reading || !self.timers.expire(timer) {
                    trace!("Discarding timer {:?} on {}", timer, self.endpoint.id());
                    return;
                }
                self.call(protocol, |p, link| p.timer_fired(link, timer));
            }
            Command::Close => {}
        }
    }

    fn stop_reading(&mut self) {
        self.reading = false;
        self.timers.cancel_all();
    }

    fn reject(&mut self, reason: impl fmt::Display) {
        warn!("Endpoint {} sent an invalid message: {}", self.endpoint.id(), reason);
        self.stop_reading();
        self.manager.endpoint_sent_invalid_message(&self.endpoint);
    }

    fn read_ended(&mut self, error: Option<io::Error>) {
        self.stop_reading();
        if !self.endpoint.is_open() {
            trace!("Read side of {} ended during close", self.endpoint.id());
            return;
        }

        match error {
            Some(e) => warn!("Read from {} failed: {}", self.endpoint.id(), e),
            None => info!("Endpoint {} disconnected", self.endpoint.id()),
        }
        self.manager.endpoint_disconnected_abruptly(&self.endpoint);
    }

    async fn shutdown(mut self, mut writer: JoinHandle<()>) {
        self.endpoint.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        self.reading = false;

        let names: Vec<&'static str> = self.protocols.keys().copied().collect();
        for name in names {
            self.stop(name);
        }
        self.timers.cancel_all();

        // Dropping the sender lets the writer flush what is queued and exit
        drop(self.endpoint.shared.outbound.lock().take());
        let linger = self.endpoint.shared.settings.protocols.stop_timeout;
        if tokio::time::timeout(linger, &mut writer).await.is_err() {
            warn!("Endpoint {} did not flush within {:?}", self.endpoint.id(), linger);
            writer.abort();
        }

        self.manager.endpoint_closed(&self.endpoint);
        self.endpoint.shared.state.send_replace(ConnectionState::Closed);
        self.endpoint.shared.listeners.clear();
        info!("Endpoint {} closed", self.endpoint.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Forwards every callback to a channel
    struct Recorder {
        calls: mpsc::UnboundedSender<String>,
        approve: bool,
    }

    impl Recorder {
        fn new(approve: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (calls, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { calls, approve }), rx)
        }

        fn record(&self, call: impl Into<String>) {
            let _ = self.calls.send(call.into());
        }
    }

    impl Manager for Recorder {
        fn endpoint_ready(&self, _: &Endpoint) {
            self.record("ready");
        }
        fn endpoint_closed(&self, _: &Endpoint) {
            self.record("closed");
        }
        fn endpoint_disconnected_abruptly(&self, _: &Endpoint) {
            self.record("disconnected");
        }
        fn endpoint_sent_invalid_message(&self, _: &Endpoint) {
            self.record("invalid");
        }
        fn endpoint_timed_out(&self, _: &Endpoint, protocol: &str) {
            self.record(format!("timed_out:{}", protocol));
        }
        fn protocol_violation(&self, _: &Endpoint, protocol: &str) {
            self.record(format!("violation:{}", protocol));
        }
        fn session_started(&self, _: &Endpoint) {
            self.record("session_started");
        }
        fn session_stopped(&self, _: &Endpoint) {
            self.record("session_stopped");
        }
        fn protocol_requested(&self, _: &Endpoint, protocol: &dyn Protocol) -> bool {
            self.record(format!("requested:{}", protocol.protocol_name()));
            self.approve
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (stream, _peer) = socket_pair().await;
        let (endpoint, io) = Endpoint::open(stream, EndpointSettings::default()).unwrap();
        let (recorder, mut calls) = Recorder::new(true);
        io.spawn(recorder);

        assert_eq!(next(&mut calls).await, "ready");
        endpoint.close();
        endpoint.close();
        timeout(WAIT, endpoint.join()).await.unwrap();
        endpoint.close();

        assert_eq!(endpoint.state(), ConnectionState::Closed);
        assert_eq!(next(&mut calls).await, "closed");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(calls.try_recv().is_err());

        assert!(matches!(
            endpoint.emit("late", "payload"),
            Err(EndpointError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unnamed_event_is_refused_locally() {
        let (left_stream, right_stream) = socket_pair().await;
        let (left, left_io) = Endpoint::open(left_stream, EndpointSettings::default()).unwrap();
        let (right, right_io) = Endpoint::open(right_stream, EndpointSettings::default()).unwrap();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        right.on("after", move |_| {
            let _ = seen_tx.send(());
        });

        let (left_manager, mut left_calls) = Recorder::new(true);
        let (right_manager, mut right_calls) = Recorder::new(true);
        left_io.spawn(left_manager);
        right_io.spawn(right_manager);
        assert_eq!(next(&mut left_calls).await, "ready");
        assert_eq!(next(&mut right_calls).await, "ready");

        assert!(matches!(left.emit("", "payload"), Err(EndpointError::Encode(_))));

        // Nothing went out, so the far side neither closed nor complained
        left.emit("after", "").unwrap();
        timeout(WAIT, seen.recv()).await.unwrap().unwrap();
        assert!(right_calls.try_recv().is_err());
        assert_eq!(right.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_peer_hangup_is_abrupt_disconnect() {
        let (stream, peer) = socket_pair().await;
        let (endpoint, io) = Endpoint::open(stream, EndpointSettings::default()).unwrap();
        let (recorder, mut calls) = Recorder::new(true);
        io.spawn(recorder);
        assert_eq!(next(&mut calls).await, "ready");

        drop(peer);
        assert_eq!(next(&mut calls).await, "disconnected");
        // The endpoint waits for its manager to close it
        assert_eq!(endpoint.state(), ConnectionState::Open);

        endpoint.close();
        assert_eq!(next(&mut calls).await, "closed");
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (left_stream, right_stream) = socket_pair().await;
        let (left, left_io) = Endpoint::open(left_stream, EndpointSettings::default()).unwrap();
        let (right, right_io) = Endpoint::open(right_stream, EndpointSettings::default()).unwrap();

        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        for name in ["A", "B"] {
            let seen_tx = seen_tx.clone();
            right.on(name, move |payload| {
                let _ = seen_tx.send((name, payload.clone()));
            });
        }

        let (left_manager, _left_calls) = Recorder::new(true);
        let (right_manager, _right_calls) = Recorder::new(true);
        left_io.spawn(left_manager);
        right_io.spawn(right_manager);

        left.emit("A", "first").unwrap();
        left.emit("B", "second").unwrap();

        let first = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
        let second = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
        assert_eq!(first, ("A", Bytes::from("first")));
        assert_eq!(second, ("B", Bytes::from("second")));
    }

    #[tokio::test]
    async fn test_session_over_endpoints() {
        let (left_stream, right_stream) = socket_pair().await;
        let (left, left_io) = Endpoint::open(left_stream, EndpointSettings::default()).unwrap();
        let (_right, right_io) = Endpoint::open(right_stream, EndpointSettings::default()).unwrap();
        let (left_manager, mut left_calls) = Recorder::new(true);
        let (right_manager, mut right_calls) = Recorder::new(true);
        left_io.spawn(left_manager);
        right_io.spawn(right_manager);

        let session = SessionProtocol::new(Role::Client, Duration::from_secs(1));
        left.handle_protocol(Box::new(session)).unwrap();
        assert!(matches!(
            left.handle_protocol(Box::new(SessionProtocol::new(Role::Client, Duration::from_secs(1)))),
            Err(EndpointError::ProtocolAlreadyRunning(_))
        ));

        assert_eq!(next(&mut right_calls).await, "ready");
        assert_eq!(next(&mut right_calls).await, "requested:SessionProtocol");
        assert_eq!(next(&mut right_calls).await, "session_started");
        assert_eq!(next(&mut left_calls).await, "ready");
        assert_eq!(next(&mut left_calls).await, "session_started");

        left.stop_session();
        assert_eq!(next(&mut right_calls).await, "session_stopped");
        assert_eq!(next(&mut left_calls).await, "session_stopped");
    }

    #[tokio::test]
    async fn test_garbage_is_invalid_message() {
        let (stream, mut peer) = socket_pair().await;
        let (_endpoint, io) = Endpoint::open(stream, EndpointSettings::default()).unwrap();
        let (recorder, mut calls) = Recorder::new(true);
        io.spawn(recorder);
        assert_eq!(next(&mut calls).await, "ready");

        // Frame of six bytes claiming wire version 9
        peer.write_all(&[0, 0, 0, 6, 9, 0, 0, 0, 0, 0]).await.unwrap();
        assert_eq!(next(&mut calls).await, "invalid");

        // Reading has stopped, so the hangup goes unnoticed
        drop(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_protocol_is_invalid_message() {
        let (stream, mut peer) = socket_pair().await;
        let (_endpoint, io) = Endpoint::open(stream, EndpointSettings::default()).unwrap();
        let (recorder, mut calls) = Recorder::new(true);
        io.spawn(recorder);
        assert_eq!(next(&mut calls).await, "ready");

        let frame = encode(&Message::request("WhiteboardProtocol", "Draw"), DEFAULT_MAX_FRAME_SIZE).unwrap();
        peer.write_all(&frame).await.unwrap();
        assert_eq!(next(&mut calls).await, "invalid");
    }

    #[tokio::test]
    async fn test_refused_protocol_keeps_connection() {
        let (stream, mut peer) = socket_pair().await;
        let (endpoint, io) = Endpoint::open(stream, EndpointSettings::default()).unwrap();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        endpoint.on("ping", move |_| {
            let _ = seen_tx.send(());
        });
        let (recorder, mut calls) = Recorder::new(false);
        io.spawn(recorder);
        assert_eq!(next(&mut calls).await, "ready");

        let start = Message::request(SessionProtocol::NAME, SessionProtocol::START_REQUEST);
        peer.write_all(&encode(&start, DEFAULT_MAX_FRAME_SIZE).unwrap()).await.unwrap();
        peer.write_all(&encode(&Message::event("ping", ""), DEFAULT_MAX_FRAME_SIZE).unwrap())
            .await
            .unwrap();

        timeout(WAIT, seen.recv()).await.unwrap().unwrap();
        assert_eq!(next(&mut calls).await, "requested:SessionProtocol");
        assert!(calls.try_recv().is_err());
        assert!(!endpoint.is_running(SessionProtocol::NAME));
    }

    #[tokio::test]
    async fn test_reply_for_unregistered_protocol_is_violation() {
        let (stream, mut peer) = socket_pair().await;
        let (_endpoint, io) = Endpoint::open(stream, EndpointSettings::default()).unwrap();
        let (recorder, mut calls) = Recorder::new(true);
        io.spawn(recorder);
        assert_eq!(next(&mut calls).await, "ready");

        let reply = Message::reply(SessionProtocol::NAME, SessionProtocol::START_REPLY);
        peer.write_all(&encode(&reply, DEFAULT_MAX_FRAME_SIZE).unwrap()).await.unwrap();
        assert_eq!(next(&mut calls).await, "violation:SessionProtocol");
    }
}
