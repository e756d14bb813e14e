//! TCP transport for pb endpoints.

use crate::error::ManagerError;
use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::debug;

/// Resolve `host:port` to the first socket address it names
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ManagerError> {
    let target = format!("{}:{}", host, port);
    let first = lookup_host(target.as_str()).await?.next();
    first.ok_or(ManagerError::Resolve(target))
}

/// Create a TCP listener bound to the given host and port
pub async fn listen_tcp(host: &str, port: u16) -> Result<TcpListener, ManagerError> {
    let addr = resolve(host, port).await?;
    let listener = TcpListener::bind(addr).await?;
    debug!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Connect to a TCP host and port
pub async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, ManagerError> {
    let addr = resolve(host, port).await?;
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
