//! Endpoints, request/reply protocols and connection managers for pb.
//!
//! This crate is the connection layer every pb application is built on: a
//! per-connection [`Endpoint`], the [`Protocol`] contract with its two
//! built-in state machines ([`SessionProtocol`] and [`KeepAliveProtocol`]),
//! named event dispatch, and the [`Manager`] implementations that own
//! endpoint lifetimes.
//!
//! ## Features
//!
//! - **Endpoint**: one task per connection owning its protocols and timers
//! - **Session**: start/stop handshake with a teardown deadline
//! - **Keepalive**: heartbeat requests from the client, deadline on both sides
//! - **Managers**: client with bounded reconnection, server, and peer
//! - **Admin shutdown**: graceful, forced and immediate, guarded by a shared secret
//!
//! ## Example
//!
//! ```rust,no_run
//! use pb_session::{events, ClientManager, LifecycleEvent, ManagerConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ManagerConfig {
//!     host: "127.0.0.1".to_string(),
//!     port: 3100,
//!     ..ManagerConfig::default()
//! };
//!
//! let client = ClientManager::new(config);
//! client.on(events::SESSION_STARTED, |event: &LifecycleEvent| {
//!     if let Some(endpoint) = event.endpoint() {
//!         endpoint.on("chat", |payload| {
//!             println!("chat: {}", String::from_utf8_lossy(payload));
//!         });
//!         let _ = endpoint.emit("chat", "hello");
//!     }
//! });
//!
//! client.start()?;
//! client.join().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admin;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod keepalive;
pub mod manager;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod transport;

// Re-export main types
pub use admin::{request_shutdown, ShutdownKind};
pub use dispatch::{Emitter, Listener};
pub use endpoint::{ConnectionState, Endpoint, EndpointIo, EndpointSettings};
pub use error::{EndpointError, ManagerError, ProtocolError};
pub use keepalive::{KeepAliveProtocol, KeepAliveState};
pub use manager::{
    events, ClientManager, LifecycleEvent, Manager, ManagerConfig, PeerManager, ServerManager,
};
pub use protocol::{instantiate, Protocol, ProtocolLink, ProtocolSettings, Role, TimerId};
pub use retry::RetryPolicy;
pub use session::{SessionProtocol, SessionState};
pub use transport::{connect_tcp, listen_tcp};
