//! Outbound connection with bounded reconnection.

use super::events::*;
use super::{LifecycleEvent, Manager, ManagerConfig};
use crate::dispatch::Emitter;
use crate::endpoint::Endpoint;
use crate::error::ManagerError;
use crate::keepalive::KeepAliveProtocol;
use crate::protocol::{Protocol, Role};
use crate::retry::RetryPolicy;
use crate::session::SessionProtocol;
use crate::transport;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// How one connection ended, as far as reconnection is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Transport failure; may be retried
    Disconnected,
    /// Invalid message, violation or timeout; never retried
    Fatal,
    /// Session ended normally
    Stopped,
}

/// Manager for a single outbound connection.
///
/// On each connection the client runs `SessionProtocol` then
/// `KeepAliveProtocol`. An abrupt disconnect (or a failed connect) is
/// retried up to the configured bound with a fixed delay; every other ending
/// is final. The retry count resets whenever a session is established, and
/// every reconnection performs a fresh handshake.
#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<ClientInner>,
}

#[derive(Clone)]
pub(crate) struct WeakClientManager(Weak<ClientInner>);

impl WeakClientManager {
    pub(crate) fn upgrade(&self) -> Option<ClientManager> {
        self.0.upgrade().map(|inner| ClientManager { inner })
    }
}

struct ClientInner {
    config: ManagerConfig,
    retry: RetryPolicy,
    events: Emitter<LifecycleEvent>,
    endpoint: Mutex<Option<Endpoint>>,
    /// First failure reported for the current connection
    outcome: Mutex<Option<Outcome>>,
    session_live: AtomicBool,
    started: AtomicBool,
    shutting_down: AtomicBool,
    /// Cuts a retry delay short on shutdown
    wake: Notify,
    done: watch::Sender<bool>,
}

impl ClientManager {
    /// Create a client for `config.host:config.port`; nothing happens until [`start`](Self::start)
    pub fn new(config: ManagerConfig) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                retry: config.retry_policy(),
                config,
                events: Emitter::new(),
                endpoint: Mutex::new(None),
                outcome: Mutex::new(None),
                session_live: AtomicBool::new(false),
                started: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                wake: Notify::new(),
                done,
            }),
        }
    }

    /// Options this client was built with
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Subscribe to a lifecycle event
    pub fn on<F>(&self, name: &str, listener: F) -> &Self
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(name, listener);
        self
    }

    /// Begin connecting in the background
    pub fn start(&self) -> Result<(), ManagerError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }
        tokio::spawn(self.inner.clone().campaign());
        Ok(())
    }

    /// End the session gracefully and stop reconnecting
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.wake.notify_one();

        let Some(endpoint) = inner.current() else {
            return;
        };
        if inner.session_live.load(Ordering::SeqCst) {
            info!("Stopping session with {}", endpoint);
            endpoint.stop_session();
        } else {
            endpoint.close();
        }
    }

    /// Close the connection at once and stop reconnecting
    pub fn abort(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        if let Some(endpoint) = self.inner.current() {
            endpoint.close();
        }
    }

    /// Wait until the client has given up or finished
    pub async fn join(&self) {
        let mut done = self.inner.done.subscribe();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether the client has given up or finished
    pub fn is_finished(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Reconnections made since the last established session
    pub fn retry_count(&self) -> u32 {
        self.inner.retry.attempts()
    }

    /// The current (or last) endpoint
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.current()
    }

    pub(crate) fn events(&self) -> &Emitter<LifecycleEvent> {
        &self.inner.events
    }

    pub(crate) fn downgrade(&self) -> WeakClientManager {
        WeakClientManager(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientManager")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("retries", &self.inner.retry.attempts())
            .field("endpoint", &self.inner.current())
            .finish()
    }
}

impl ClientInner {
    fn current(&self) -> Option<Endpoint> {
        self.endpoint.lock().clone()
    }

    fn emit(&self, name: &str, event: LifecycleEvent) {
        self.events.emit(name, &event);
    }

    /// Keep the first outcome reported for a connection
    fn settle(&self, outcome: Outcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }

    fn fail(&self, endpoint: &Endpoint, outcome: Outcome, name: &str, event: LifecycleEvent) {
        self.settle(outcome);
        self.session_live.store(false, Ordering::SeqCst);
        self.emit(name, event.clone());
        if outcome == Outcome::Fatal {
            self.emit(SESSION_ERROR, event);
        }
        endpoint.close();
    }

    async fn campaign(self: Arc<Self>) {
        let target = format!("{}:{}", self.config.host, self.config.port);

        loop {
            let outcome = match self.connect_once().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Failed to connect to {}: {}", target, e);
                    Outcome::Disconnected
                }
            };
            debug!("Connection to {} ended: {:?}", target, outcome);

            if outcome != Outcome::Disconnected || self.shutting_down.load(Ordering::SeqCst) {
                break;
            }

            let Some(delay) = self.retry.next_attempt() else {
                error!("Giving up on {} after {} retries", target, self.retry.bound());
                let event = match self.current() {
                    Some(endpoint) => LifecycleEvent::Endpoint(endpoint),
                    None => LifecycleEvent::Unreachable {
                        host: self.config.host.clone(),
                        port: self.config.port,
                    },
                };
                self.emit(SESSION_ERROR, event);
                break;
            };

            info!(
                "Reconnecting to {} in {:?} (attempt {}/{})",
                target,
                delay,
                self.retry.attempts(),
                self.retry.bound()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {}
            }
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
        }

        info!("Client for {} finished", target);
        self.done.send_replace(true);
    }

    async fn connect_once(self: &Arc<Self>) -> Result<Outcome, ManagerError> {
        let stream = transport::connect_tcp(&self.config.host, self.config.port).await?;
        let (endpoint, io) = Endpoint::open(stream, self.config.endpoint_settings())?;
        info!("Connected to {}", endpoint);

        *self.outcome.lock() = None;
        *self.endpoint.lock() = Some(endpoint.clone());
        io.spawn(self.clone());
        if self.shutting_down.load(Ordering::SeqCst) {
            endpoint.close();
        }

        endpoint.join().await;
        let outcome = self.outcome.lock().take();
        Ok(outcome.unwrap_or(Outcome::Stopped))
    }
}

impl Manager for ClientInner {
    fn endpoint_ready(&self, endpoint: &Endpoint) {
        self.emit(ENDPOINT_READY, LifecycleEvent::Endpoint(endpoint.clone()));

        let settings = endpoint.settings().protocols;
        let protocols: [Box<dyn Protocol>; 2] = [
            Box::new(SessionProtocol::new(Role::Client, settings.stop_timeout)),
            Box::new(KeepAliveProtocol::new(Role::Client, settings.keepalive_interval)),
        ];
        for protocol in protocols {
            let name = protocol.protocol_name();
            if let Err(e) = endpoint.handle_protocol(protocol) {
                warn!("Could not start {} on {}: {}", name, endpoint, e);
            }
        }
    }

    fn endpoint_closed(&self, endpoint: &Endpoint) {
        self.session_live.store(false, Ordering::SeqCst);
        self.emit(ENDPOINT_CLOSED, LifecycleEvent::Endpoint(endpoint.clone()));
    }

    fn endpoint_disconnected_abruptly(&self, endpoint: &Endpoint) {
        self.fail(
            endpoint,
            Outcome::Disconnected,
            ENDPOINT_DISCONNECTED_ABRUPTLY,
            LifecycleEvent::Endpoint(endpoint.clone()),
        );
    }

    fn endpoint_sent_invalid_message(&self, endpoint: &Endpoint) {
        error!("Server {} sent an invalid message; closing without retry", endpoint);
        self.fail(
            endpoint,
            Outcome::Fatal,
            ENDPOINT_SENT_INVALID_MESSAGE,
            LifecycleEvent::Endpoint(endpoint.clone()),
        );
    }

    fn endpoint_timed_out(&self, endpoint: &Endpoint, protocol: &str) {
        error!("Server {} timed out; closing without retry", endpoint);
        self.fail(
            endpoint,
            Outcome::Fatal,
            ENDPOINT_TIMED_OUT,
            LifecycleEvent::Protocol {
                endpoint: endpoint.clone(),
                protocol: protocol.to_string(),
            },
        );
    }

    fn protocol_violation(&self, endpoint: &Endpoint, protocol: &str) {
        error!("Server {} violated {}; closing", endpoint, protocol);
        self.fail(
            endpoint,
            Outcome::Fatal,
            PROTOCOL_VIOLATION,
            LifecycleEvent::Protocol {
                endpoint: endpoint.clone(),
                protocol: protocol.to_string(),
            },
        );
    }

    fn session_started(&self, endpoint: &Endpoint) {
        self.session_live.store(true, Ordering::SeqCst);
        self.retry.reset();
        self.emit(SESSION_STARTED, LifecycleEvent::Endpoint(endpoint.clone()));

        if self.shutting_down.load(Ordering::SeqCst) {
            endpoint.stop_session();
        }
    }

    fn session_stopped(&self, endpoint: &Endpoint) {
        self.session_live.store(false, Ordering::SeqCst);
        self.settle(Outcome::Stopped);
        self.emit(SESSION_STOPPED, LifecycleEvent::Endpoint(endpoint.clone()));
        endpoint.close();
    }

    fn protocol_requested(&self, endpoint: &Endpoint, protocol: &dyn Protocol) -> bool {
        warn!("Server {} tried to start {}; refusing", endpoint, protocol.protocol_name());
        false
    }
}
