//! A node that both accepts peer connections and opens its own.

use super::events::*;
use super::{ClientManager, LifecycleEvent, ManagerConfig, ServerManager};
use crate::admin::ShutdownKind;
use crate::dispatch::Emitter;
use crate::error::ManagerError;
use futures::future::join_all;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Events re-published from the server and every outbound client
const RELAYED: [&str; 10] = [
    ENDPOINT_READY,
    ENDPOINT_CLOSED,
    ENDPOINT_DISCONNECTED_ABRUPTLY,
    ENDPOINT_SENT_INVALID_MESSAGE,
    ENDPOINT_TIMED_OUT,
    PROTOCOL_VIOLATION,
    SESSION_STARTED,
    SESSION_STOPPED,
    SESSION_ERROR,
    IO_THREAD,
];

/// Peer-level name for a session event
fn peer_alias(name: &str) -> Option<&'static str> {
    match name {
        SESSION_STARTED => Some(PEER_STARTED),
        SESSION_STOPPED => Some(PEER_STOPPED),
        SESSION_ERROR => Some(PEER_ERROR),
        _ => None,
    }
}

/// Manager combining one [`ServerManager`] with outbound [`ClientManager`]s.
///
/// Each outbound connection keeps its own client lifecycle and retry policy.
/// Lifecycle events from all of them are re-published on the peer, with
/// session events additionally published as `peerStarted`, `peerStopped`
/// and `peerError`.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    me: Weak<PeerInner>,
    config: ManagerConfig,
    server: ServerManager,
    clients: Mutex<Vec<ClientManager>>,
    events: Emitter<LifecycleEvent>,
}

impl PeerManager {
    /// Create a peer listening on `config.host:config.port`
    pub fn new(config: ManagerConfig) -> Self {
        let server = ServerManager::new(config.clone());
        let inner = Arc::new_cyclic(|me: &Weak<PeerInner>| {
            relay(me, server.events());
            PeerInner {
                me: me.clone(),
                config,
                server,
                clients: Mutex::new(Vec::new()),
                events: Emitter::new(),
            }
        });
        Self { inner }
    }

    /// Subscribe to a lifecycle event from any of this peer's connections
    pub fn on<F>(&self, name: &str, listener: F) -> &Self
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(name, listener);
        self
    }

    /// The accepting side of this peer
    pub fn server(&self) -> &ServerManager {
        &self.inner.server
    }

    /// Start accepting peer connections; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr, ManagerError> {
        let addr = self.inner.server.start().await?;
        info!("Peer accepting connections on {}", addr);
        self.inner
            .events
            .emit(PEER_SERVER_MANAGER, &LifecycleEvent::Server(self.inner.server.clone()));
        Ok(addr)
    }

    /// Open an outbound connection to another peer
    pub fn connect(&self, host: &str, port: u16) -> Result<ClientManager, ManagerError> {
        let client = ClientManager::new(self.inner.config.with_target(host, port));
        relay(&self.inner.me, client.events());

        // Outbound clients publish the peer-level names themselves too
        for name in [SESSION_STARTED, SESSION_STOPPED, SESSION_ERROR] {
            let weak = client.downgrade();
            client.on(name, move |event| {
                if let (Some(client), Some(alias)) = (weak.upgrade(), peer_alias(name)) {
                    client.events().emit(alias, event);
                }
            });
        }

        client.start()?;
        debug!("Peer connecting to {}:{}", host, port);
        self.inner.clients.lock().push(client.clone());
        Ok(client)
    }

    /// Outbound clients created so far
    pub fn clients(&self) -> Vec<ClientManager> {
        self.inner.clients.lock().clone()
    }

    /// Shut down every outbound connection and the server.
    ///
    /// Outbound sessions are stopped gracefully unless `kind` is immediate.
    pub fn shutdown(&self, kind: ShutdownKind) {
        info!("Shutting down peer ({})", kind);
        for client in self.clients() {
            match kind {
                ShutdownKind::Immediate => client.abort(),
                ShutdownKind::Graceful | ShutdownKind::Forced => client.shutdown(),
            }
        }
        self.inner.server.shutdown(kind);
    }

    /// Wait for every outbound connection and the server to finish
    pub async fn join(&self) -> ShutdownKind {
        let mut joined = 0;
        self.join_clients(&mut joined).await;
        let kind = self.inner.server.join().await;
        // Connections opened while the server drained
        self.join_clients(&mut joined).await;
        kind
    }

    async fn join_clients(&self, joined: &mut usize) {
        loop {
            let pending: Vec<ClientManager> = self.inner.clients.lock()[*joined..].to_vec();
            if pending.is_empty() {
                return;
            }
            *joined += pending.len();
            join_all(pending.iter().map(|client| client.join())).await;
        }
    }
}

impl fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerManager")
            .field("server", &self.inner.server)
            .field("clients", &self.inner.clients.lock().len())
            .finish()
    }
}

/// Re-publish `source`'s lifecycle events on the peer
fn relay(peer: &Weak<PeerInner>, source: &Emitter<LifecycleEvent>) {
    for name in RELAYED {
        let peer = peer.clone();
        source.on(name, move |event| {
            let Some(peer) = peer.upgrade() else {
                return;
            };
            peer.events.emit(name, event);
            if let Some(alias) = peer_alias(name) {
                peer.events.emit(alias, event);
            }
        });
    }
}
