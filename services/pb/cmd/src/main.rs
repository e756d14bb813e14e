//! pb node binary.
//!
//! Runs one of the connection managers from the command line: a server that
//! accepts sessions, a client that holds one open, a peer that does both, or
//! an admin client that asks a server to shut down.

use clap::{Parser, Subcommand};
use pb_session::{
    events, request_shutdown, ClientManager, LifecycleEvent, ManagerConfig, PeerManager,
    ServerManager, ShutdownKind,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;

use config::NodeConfig;
use logging::PbLogFormatter;

/// pb connection node
#[derive(Parser, Debug)]
#[command(name = "pb", version, about = "Session, keepalive and peer connections over TCP")]
struct Args {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Host to bind on or connect to
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to bind on or connect to
    #[arg(long, short, global = true)]
    port: Option<u16>,

    /// Shared secret for administrative shutdown
    #[arg(long, global = true)]
    password: Option<String>,

    /// Reconnections allowed after an abrupt disconnect
    #[arg(long, global = true)]
    retry_bound: Option<u32>,

    /// Wait before each reconnection, e.g. 5s
    #[arg(long, global = true)]
    retry_delay: Option<humantime::Duration>,

    /// Keepalive heartbeat interval, e.g. 20s
    #[arg(long, global = true)]
    keepalive_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept sessions until shut down
    Server,
    /// Hold a session with a server open until interrupted
    Client {
        /// Event to emit once the session starts, as NAME=PAYLOAD (repeatable)
        #[arg(long = "emit", value_parser = parse_emit)]
        emit: Vec<(String, String)>,
    },
    /// Accept peer connections and connect out to other peers
    Peer {
        /// Peer to connect to, as HOST:PORT (repeatable)
        #[arg(long = "connect", value_parser = parse_target)]
        connect: Vec<(String, u16)>,
    },
    /// Ask a server to shut down
    Admin {
        /// graceful, forced or immediate
        #[arg(default_value = "graceful")]
        kind: ShutdownKind,
    },
}

fn parse_emit(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, payload)) if !name.is_empty() => Ok((name.to_string(), payload.to_string())),
        _ => Err(format!("expected NAME=PAYLOAD, got {:?}", value)),
    }
}

fn parse_target(value: &str) -> Result<(String, u16), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected HOST:PORT, got {:?}", value))?;
    let port = port
        .parse()
        .map_err(|e| format!("invalid port in {:?}: {}", value, e))?;
    Ok((host.to_string(), port))
}

impl Args {
    /// Command line flags win over file and environment values
    fn apply_to(&self, config: &mut NodeConfig) {
        let manager = &mut config.manager;
        if let Some(host) = &self.host {
            manager.host = host.clone();
        }
        if let Some(port) = self.port {
            manager.port = port;
        }
        if let Some(password) = &self.password {
            manager.password = Some(password.clone());
        }
        if let Some(bound) = self.retry_bound {
            manager.retry_bound = bound;
        }
        if let Some(delay) = self.retry_delay {
            manager.retry_delay = delay.into();
        }
        if let Some(interval) = self.keepalive_interval {
            manager.keepalive_interval = interval.into();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut node_config = match &args.config {
        Some(path) => NodeConfig::load_from_file(path)?,
        None => NodeConfig::from_environment()?,
    };
    args.apply_to(&mut node_config);

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("warn")
            .add_directive(format!("pb={}", node_config.log_level).parse()?)
            .add_directive(format!("pb_session={}", node_config.log_level).parse()?)
            .add_directive(format!("pb_wire={}", node_config.log_level).parse()?),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(PbLogFormatter::new("pb"))
        .init();

    info!("Starting pb v{}", env!("CARGO_PKG_VERSION"));
    for note in node_config.notes.drain(..) {
        note.log();
    }
    debug!(
        "Configuration: {}:{}, retry bound {}, keepalive {:?}",
        node_config.manager.host,
        node_config.manager.port,
        node_config.manager.retry_bound,
        node_config.manager.keepalive_interval
    );

    let config = node_config.manager;
    match args.command {
        Command::Server => run_server(config).await,
        Command::Client { emit } => run_client(config, emit).await,
        Command::Peer { connect } => run_peer(config, connect).await,
        Command::Admin { kind } => run_admin(config, kind).await,
    }
}

/// Anything lifecycle listeners can be attached to
trait Observable {
    fn observe<F>(&self, name: &str, listener: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static;
}

impl Observable for ClientManager {
    fn observe<F>(&self, name: &str, listener: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.on(name, listener);
    }
}

impl Observable for ServerManager {
    fn observe<F>(&self, name: &str, listener: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.on(name, listener);
    }
}

impl Observable for PeerManager {
    fn observe<F>(&self, name: &str, listener: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.on(name, listener);
    }
}

/// Log the lifecycle events an operator cares about
fn log_lifecycle(source: &impl Observable, component: &'static str) {
    source.observe(events::SESSION_STARTED, move |event| {
        if let Some(endpoint) = event.endpoint() {
            component_info!(component, "Session started with {}", endpoint.remote_addr());
        }
    });
    source.observe(events::SESSION_STOPPED, move |event| {
        if let Some(endpoint) = event.endpoint() {
            component_info!(component, "Session stopped with {}", endpoint.remote_addr());
        }
    });
    source.observe(events::SESSION_ERROR, move |event| match event {
        LifecycleEvent::Unreachable { host, port } => {
            component_warn!(component, "Could not reach {}:{}", host, port)
        }
        _ => match event.endpoint() {
            Some(endpoint) => component_warn!(component, "Session error on {}", endpoint),
            None => component_warn!(component, "Session error"),
        },
    });
    source.observe(events::ENDPOINT_TIMED_OUT, move |event| {
        if let LifecycleEvent::Protocol { endpoint, protocol } = event {
            component_warn!(component, "{} timed out in {}", endpoint, protocol);
        }
    });
    source.observe(events::IO_THREAD, move |event| {
        if let LifecycleEvent::Listening(addr) = event {
            component_info!(component, "Accepting connections on {}", addr);
        }
    });
}

/// Interrupt signals, first to last
struct Interrupts {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
}

impl Interrupts {
    fn install() -> anyhow::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                sigterm: signal(SignalKind::terminate())
                    .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?,
                sigint: signal(SignalKind::interrupt())
                    .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.sigterm.recv() => {}
                _ = self.sigint.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// Wait for `done`, escalating the shutdown with each interrupt received
async fn until_done<D>(
    done: D,
    component: &'static str,
    shutdown: impl Fn(ShutdownKind),
) -> anyhow::Result<ShutdownKind>
where
    D: Future<Output = ShutdownKind>,
{
    let mut interrupts = Interrupts::install()?;
    let mut escalation = ShutdownKind::ALL.into_iter();
    tokio::pin!(done);

    loop {
        tokio::select! {
            kind = &mut done => return Ok(kind),
            _ = interrupts.recv() => match escalation.next() {
                Some(kind) => {
                    component_info!(component, "Interrupted, shutting down ({})", kind);
                    shutdown(kind);
                }
                None => return Ok(ShutdownKind::Immediate),
            },
        }
    }
}

async fn run_server(config: ManagerConfig) -> anyhow::Result<()> {
    if config.password.is_none() {
        component_warn!("server", "No admin password configured; admin shutdown requests will be refused");
    }

    let server = ServerManager::new(config);
    log_lifecycle(&server, "server");
    server.start().await?;

    let kind = until_done(server.join(), "server", |kind| server.shutdown(kind)).await?;
    component_info!("server", "Server stopped ({}), {} connections left", kind, server.endpoint_count());
    Ok(())
}

async fn run_client(config: ManagerConfig, emit: Vec<(String, String)>) -> anyhow::Result<()> {
    let client = ClientManager::new(config);
    log_lifecycle(&client, "client");

    client.on(events::SESSION_STARTED, move |event| {
        let Some(endpoint) = event.endpoint() else {
            return;
        };
        for (name, payload) in &emit {
            if let Err(e) = endpoint.emit(name, payload.clone()) {
                component_error!("client", "Failed to emit {}: {}", name, e);
            }
        }
    });

    client.start()?;
    let joined = async {
        client.join().await;
        ShutdownKind::Graceful
    };
    until_done(joined, "client", |kind| match kind {
        ShutdownKind::Graceful => client.shutdown(),
        ShutdownKind::Forced | ShutdownKind::Immediate => client.abort(),
    })
    .await?;

    component_info!("client", "Client stopped after {} reconnections", client.retry_count());
    Ok(())
}

async fn run_peer(config: ManagerConfig, connect: Vec<(String, u16)>) -> anyhow::Result<()> {
    let peer = PeerManager::new(config);
    log_lifecycle(&peer, "peer");
    peer.start().await?;

    for (host, port) in &connect {
        peer.connect(host, *port)?;
    }

    let kind = until_done(peer.join(), "peer", |kind| peer.shutdown(kind)).await?;
    component_info!("peer", "Peer stopped ({})", kind);
    Ok(())
}

async fn run_admin(config: ManagerConfig, kind: ShutdownKind) -> anyhow::Result<()> {
    let password = config
        .password
        .clone()
        .ok_or_else(|| anyhow::anyhow!("admin requests need a password (--password or PB_PASSWORD)"))?;

    let client = ClientManager::new(ManagerConfig {
        retry_bound: 0,
        ..config
    });

    client.on(events::SESSION_STARTED, move |event| {
        let Some(endpoint) = event.endpoint() else {
            return;
        };
        match request_shutdown(endpoint, kind, &password) {
            Ok(()) => component_info!("admin", "Requested {} shutdown of {}", kind, endpoint.remote_addr()),
            Err(e) => component_error!("admin", "Failed to request shutdown: {}", e),
        }
        endpoint.stop_session();
    });
    let failed = Arc::new(AtomicBool::new(false));
    let failure = failed.clone();
    client.on(events::SESSION_ERROR, move |event| {
        failure.store(true, Ordering::SeqCst);
        match event {
            LifecycleEvent::Unreachable { host, port } => {
                component_error!("admin", "Could not reach {}:{}", host, port)
            }
            _ => component_error!("admin", "Could not complete the admin session"),
        }
    });

    client.start()?;
    client.join().await;

    if failed.load(Ordering::SeqCst) {
        anyhow::bail!("{} shutdown request was not delivered", kind);
    }
    Ok(())
}
