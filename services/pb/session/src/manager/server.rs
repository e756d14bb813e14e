//! Accepting side: one endpoint per inbound connection.

use super::events::*;
use super::{LifecycleEvent, Manager, ManagerConfig};
use crate::admin::{self, ShutdownKind};
use crate::dispatch::Emitter;
use crate::endpoint::Endpoint;
use crate::error::ManagerError;
use crate::protocol::Protocol;
use crate::transport;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Manager for a listening socket and the endpoints it accepts.
///
/// Client-initiated `SessionProtocol` and `KeepAliveProtocol` are approved
/// and run as server. Any failure on an endpoint closes it.
#[derive(Clone)]
pub struct ServerManager {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    me: Weak<ServerInner>,
    config: ManagerConfig,
    events: Emitter<LifecycleEvent>,
    endpoints: DashMap<String, Endpoint>,
    live: watch::Sender<usize>,
    local_addr: Mutex<Option<SocketAddr>>,
    started: AtomicBool,
    requested: watch::Sender<Option<ShutdownKind>>,
    stop_accepting: Notify,
}

impl ServerManager {
    /// Create a server for `config.host:config.port`
    pub fn new(config: ManagerConfig) -> Self {
        let (live, _) = watch::channel(0);
        let (requested, _) = watch::channel(None);
        Self {
            inner: Arc::new_cyclic(|me| ServerInner {
                me: me.clone(),
                config,
                events: Emitter::new(),
                endpoints: DashMap::new(),
                live,
                local_addr: Mutex::new(None),
                started: AtomicBool::new(false),
                requested,
                stop_accepting: Notify::new(),
            }),
        }
    }

    /// Options this server was built with
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

    /// Bind and start accepting; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr, ManagerError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }

        let listener = match transport::listen_tcp(&inner.config.host, inner.config.port).await {
            Ok(listener) => listener,
            Err(e) => {
                inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let addr = listener.local_addr()?;
        *inner.local_addr.lock() = Some(addr);

        info!("Server listening on {}", addr);
        inner.events.emit(IO_THREAD, &LifecycleEvent::Listening(addr));
        tokio::spawn(inner.clone().accept_loop(listener));
        Ok(addr)
    }

    /// Address the server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Begin shutting down. A harsher request upgrades a milder one.
    pub fn shutdown(&self, kind: ShutdownKind) {
        self.inner.shutdown(kind);
    }

    /// Severity requested so far, if any
    pub fn shutdown_requested(&self) -> Option<ShutdownKind> {
        *self.inner.requested.borrow()
    }

    /// Wait for shutdown to complete.
    ///
    /// Graceful and forced shutdowns complete when no endpoint is left; an
    /// immediate one completes as soon as it is requested.
    pub async fn join(&self) -> ShutdownKind {
        let mut requested = self.inner.requested.subscribe();
        let mut live = self.inner.live.subscribe();

        loop {
            let kind = *requested.borrow_and_update();
            let count = *live.borrow_and_update();
            match kind {
                Some(ShutdownKind::Immediate) => return ShutdownKind::Immediate,
                Some(kind) if count == 0 => return kind,
                Some(kind) => debug!("Shutdown ({}) waiting on {} endpoint(s)", kind, count),
                None => {}
            }

            tokio::select! {
                _ = requested.changed() => {}
                _ = live.changed() => {}
            }
        }
    }

    /// Live endpoints
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.snapshot()
    }

    /// Number of live endpoints
    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.len()
    }

    pub(crate) fn events(&self) -> &Emitter<LifecycleEvent> {
        &self.inner.events
    }
}

impl fmt::Debug for ServerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerManager")
            .field("local_addr", &self.local_addr())
            .field("endpoints", &self.endpoint_count())
            .field("shutdown", &self.shutdown_requested())
            .finish()
    }
}

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.stop_accepting.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(stream, addr),
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        info!("Stopped accepting connections");
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if self.requested.borrow().is_some() {
            debug!("Dropping connection from {} during shutdown", addr);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        match Endpoint::open(stream, self.config.endpoint_settings()) {
            Ok((endpoint, io)) => {
                info!("Accepted connection from {}", addr);
                self.endpoints.insert(endpoint.id().to_string(), endpoint);
                self.publish_count();
                io.spawn(self.clone());
            }
            Err(e) => warn!("Could not open endpoint for {}: {}", addr, e),
        }
    }

    fn publish_count(&self) {
        self.live.send_replace(self.endpoints.len());
    }

    fn snapshot(&self) -> Vec<Endpoint> {
        self.endpoints.iter().map(|entry| entry.value().clone()).collect()
    }

    fn shutdown(&self, kind: ShutdownKind) {
        let escalated = self.requested.send_if_modified(|requested| match *requested {
            Some(current) if current >= kind => false,
            _ => {
                *requested = Some(kind);
                true
            }
        });
        if !escalated {
            debug!("Shutdown already underway; ignoring {} request", kind);
            return;
        }

        info!("Shutting down server ({})", kind);
        self.stop_accepting.notify_one();
        if kind >= ShutdownKind::Forced {
            for endpoint in self.snapshot() {
                endpoint.close();
            }
        }
    }

    /// Honour administrative shutdown requests arriving on `endpoint`
    fn watch_admin(&self, endpoint: &Endpoint) {
        for kind in ShutdownKind::ALL {
            let server = self.me.clone();
            let from = endpoint.id().to_string();
            endpoint.on(kind.event_name(), move |secret| {
                let Some(server) = server.upgrade() else {
                    return;
                };
                if admin::authorize(server.config.password.as_deref(), secret) {
                    warn!("{} shutdown requested by {}", kind, from);
                    server.shutdown(kind);
                } else {
                    warn!("Rejected {} shutdown request from {}", kind, from);
                }
            });
        }
    }

    fn fail(&self, endpoint: &Endpoint, name: &str, event: LifecycleEvent) {
        self.events.emit(name, &event);
        self.events.emit(SESSION_ERROR, &event);
        endpoint.close();
    }
}

impl Manager for ServerInner {
    fn endpoint_ready(&self, endpoint: &Endpoint) {
        self.events.emit(ENDPOINT_READY, &LifecycleEvent::Endpoint(endpoint.clone()));
    }

    fn endpoint_closed(&self, endpoint: &Endpoint) {
        self.endpoints.remove(endpoint.id());
        self.publish_count();
        debug!("{} endpoint(s) remain", self.endpoints.len());
        self.events.emit(ENDPOINT_CLOSED, &LifecycleEvent::Endpoint(endpoint.clone()));
    }

    fn endpoint_disconnected_abruptly(&self, endpoint: &Endpoint) {
        warn!("Client {} disconnected without stopping its session", endpoint);
        self.fail(
            endpoint,
            ENDPOINT_DISCONNECTED_ABRUPTLY,
            LifecycleEvent::Endpoint(endpoint.clone()),
        );
    }

    fn endpoint_sent_invalid_message(&self, endpoint: &Endpoint) {
        error!("Client {} sent an invalid message; closing", endpoint);
        self.fail(
            endpoint,
            ENDPOINT_SENT_INVALID_MESSAGE,
            LifecycleEvent::Endpoint(endpoint.clone()),
        );
    }

    fn endpoint_timed_out(&self, endpoint: &Endpoint, protocol: &str) {
        error!("Client {} timed out; closing", endpoint);
        self.fail(
            endpoint,
            ENDPOINT_TIMED_OUT,
            LifecycleEvent::Protocol {
                endpoint: endpoint.clone(),
                protocol: protocol.to_string(),
            },
        );
    }

    fn protocol_violation(&self, endpoint: &Endpoint, protocol: &str) {
        error!("Client {} violated {}; closing", endpoint, protocol);
        self.fail(
            endpoint,
            PROTOCOL_VIOLATION,
            LifecycleEvent::Protocol {
                endpoint: endpoint.clone(),
                protocol: protocol.to_string(),
            },
        );
    }

    fn session_started(&self, endpoint: &Endpoint) {
        self.watch_admin(endpoint);
        self.events.emit(SESSION_STARTED, &LifecycleEvent::Endpoint(endpoint.clone()));
    }

    fn session_stopped(&self, endpoint: &Endpoint) {
        self.events.emit(SESSION_STOPPED, &LifecycleEvent::Endpoint(endpoint.clone()));
        endpoint.close();
    }

    fn protocol_requested(&self, endpoint: &Endpoint, protocol: &dyn Protocol) -> bool {
        debug!("Approving {} for {}", protocol.protocol_name(), endpoint);
        true
    }
}
