//! Purpose: Run the inventory server's single-threaded readiness loop.
//! Exports: `ServeConfig`, `run`, `serve`.
//! Role: Binary module owning the runtime, the sockets, and shutdown policy.
//! Invariants: Requests are handled one at a time, in readiness observation order.
//! Invariants: The store flushes every mutation before its reply leaves the loop.
//! Notes: Stream peers get the shutdown notice; datagram peers cannot.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixDatagram, UnixListener, UnixStream};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use atomstock::core::error::{Error, ErrorKind};
use atomstock::core::protocol::{self, DirectiveOutcome};
use atomstock::core::store::{CEILING, FileStore, Inventory, InventoryStore};

use crate::endpoint::{ConnEvent, ConnId, Registry};

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub stream_path: Option<PathBuf>,
    pub datagram_path: Option<PathBuf>,
    pub save_file: PathBuf,
    pub initial: Inventory,
    pub idle_timeout: Option<Duration>,
}

/// Builds the single-threaded runtime and drives `serve` to completion.
pub fn run(config: ServeConfig) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    let result = runtime.block_on(serve(config));
    // The console reader holds an uncancelable blocking stdin read; dropping
    // the runtime would wait on it forever while stdin stays open.
    runtime.shutdown_background();
    result
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let store = FileStore::open(&config.save_file, config.initial)?;
    let endpoints = bind_endpoints(&config).await?;
    announce_startup(&config, &store)?;

    let mut registry = Registry::new();
    let mut console = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    let mut udp_buf = vec![0u8; 2048];
    let mut uds_buf = vec![0u8; 2048];

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let reason = loop {
        // Recomputed per iteration, so any readiness event rearms the timer.
        let deadline = config.idle_timeout.map(|idle| Instant::now() + idle);

        tokio::select! {
            accepted = accept_tcp(&endpoints.tcp) => match accepted {
                Ok((stream, peer)) => {
                    let peer = peer.to_string();
                    let id = registry.insert_tcp(stream, peer.clone());
                    info!(conn = %id, peer = %peer, clients = registry.len(), "tcp client connected");
                    send_welcome(&mut registry, id, &store).await;
                }
                Err(err) => warn!(error = %err, "tcp accept failed"),
            },
            accepted = accept_uds(&endpoints.uds_stream) => match accepted {
                Ok((stream, _)) => {
                    let id = registry.insert_unix(stream, String::from("uds-stream"));
                    info!(conn = %id, clients = registry.len(), "uds client connected");
                    send_welcome(&mut registry, id, &store).await;
                }
                Err(err) => warn!(error = %err, "uds accept failed"),
            },
            received = recv_udp(&endpoints.udp, &mut udp_buf) => match received {
                Ok((len, peer)) => {
                    let line = decode_datagram(&udp_buf[..len]);
                    let reply = protocol::handle_request(&store, &line);
                    if let Some(socket) = &endpoints.udp {
                        if let Err(err) = socket.send_to(reply.as_bytes(), peer).await {
                            warn!(peer = %peer, error = %err, "udp reply failed");
                        }
                    }
                }
                Err(err) => warn!(error = %err, "udp receive failed"),
            },
            received = recv_uds(&endpoints.uds_datagram, &mut uds_buf) => match received {
                Ok((len, peer)) => {
                    let line = decode_datagram(&uds_buf[..len]);
                    let reply = protocol::handle_request(&store, &line);
                    match peer.as_pathname() {
                        Some(path) => {
                            if let Some(socket) = &endpoints.uds_datagram {
                                if let Err(err) = socket.send_to(reply.as_bytes(), path).await {
                                    warn!(peer = %path.display(), error = %err, "uds datagram reply failed");
                                }
                            }
                        }
                        // The request was still applied; only the answer is lost.
                        None => warn!("uds datagram peer is unnamed; reply dropped"),
                    }
                }
                Err(err) => warn!(error = %err, "uds datagram receive failed"),
            },
            Some((id, event)) = registry.next_event() => match event {
                ConnEvent::Line(line) => {
                    debug!(conn = %id, line = %line, "request");
                    let reply = protocol::handle_request(&store, &line);
                    if let Err(err) = registry.send(id, &reply).await {
                        registry.remove(id);
                        warn!(conn = %id, error = %err, "write failed; connection closed");
                    }
                }
                ConnEvent::Eof => {
                    if let Some(peer) = registry.remove(id) {
                        info!(conn = %id, peer = %peer, clients = registry.len(), "client disconnected");
                    }
                }
                ConnEvent::Failed(err) => {
                    registry.remove(id);
                    warn!(conn = %id, error = %err, "read failed; connection closed");
                }
            },
            line = console.next_line(), if console_open => match line {
                Ok(Some(line)) => match protocol::handle_directive(&store, &line) {
                    DirectiveOutcome::Reply(reply) => {
                        print!("{reply}");
                        let _ = io::stdout().flush();
                    }
                    DirectiveOutcome::Shutdown => break ExitReason::Directive,
                },
                Ok(None) => {
                    // A backgrounded server keeps serving with its console closed.
                    console_open = false;
                    info!("console closed; still serving");
                }
                Err(err) => {
                    console_open = false;
                    warn!(error = %err, "console read failed");
                }
            },
            _ = &mut shutdown => break ExitReason::Signal,
            _ = idle_wait(deadline) => break ExitReason::Idle,
        }
    };

    match reason {
        ExitReason::Directive => {
            println!("Shutdown command received. Notifying clients...");
            info!("shutdown command received");
        }
        ExitReason::Signal => info!("interrupt received, shutting down"),
        ExitReason::Idle => {
            println!("Timeout occurred. Server shutting down.");
            info!("idle timeout reached, shutting down");
        }
    }

    if !registry.is_empty() {
        registry.broadcast(protocol::SHUTDOWN_NOTICE).await;
    }
    drop(registry);
    drop(endpoints);
    cleanup_socket_files(&config);
    info!("server stopped");
    Ok(())
}

enum ExitReason {
    Directive,
    Signal,
    Idle,
}

struct Endpoints {
    tcp: Option<TcpListener>,
    udp: Option<UdpSocket>,
    uds_stream: Option<UnixListener>,
    uds_datagram: Option<UnixDatagram>,
}

async fn bind_endpoints(config: &ServeConfig) -> Result<Endpoints, Error> {
    let tcp = match config.tcp_port {
        Some(port) => Some(TcpListener::bind(("0.0.0.0", port)).await.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to bind TCP port {port}"))
                .with_source(err)
        })?),
        None => None,
    };

    let udp = match config.udp_port {
        Some(port) => Some(UdpSocket::bind(("0.0.0.0", port)).await.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to bind UDP port {port}"))
                .with_source(err)
        })?),
        None => None,
    };

    // Unix socket paths are unlinked first; a stale file from a previous run
    // would otherwise fail the bind with AddrInUse.
    let uds_stream = match &config.stream_path {
        Some(path) => {
            let _ = std::fs::remove_file(path);
            Some(UnixListener::bind(path).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to bind UDS stream socket")
                    .with_path(path)
                    .with_source(err)
            })?)
        }
        None => None,
    };

    let uds_datagram = match &config.datagram_path {
        Some(path) => {
            let _ = std::fs::remove_file(path);
            Some(UnixDatagram::bind(path).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to bind UDS datagram socket")
                    .with_path(path)
                    .with_source(err)
            })?)
        }
        None => None,
    };

    Ok(Endpoints {
        tcp,
        udp,
        uds_stream,
        uds_datagram,
    })
}

fn announce_startup(config: &ServeConfig, store: &FileStore) -> Result<(), Error> {
    if let Some(port) = config.tcp_port {
        info!(port, "tcp endpoint ready");
    }
    if let Some(port) = config.udp_port {
        info!(port, "udp endpoint ready");
    }
    if let Some(path) = &config.stream_path {
        info!(path = %path.display(), "uds stream endpoint ready");
    }
    if let Some(path) = &config.datagram_path {
        info!(path = %path.display(), "uds datagram endpoint ready");
    }
    if let Some(idle) = config.idle_timeout {
        info!(seconds = idle.as_secs(), "idle timeout armed");
    }

    let counters = store.snapshot()?;
    info!(
        save_file = %config.save_file.display(),
        carbon = counters.carbon,
        oxygen = counters.oxygen,
        hydrogen = counters.hydrogen,
        "inventory loaded"
    );

    println!("Server ready. Type 'shutdown' to stop.");
    println!("Available drink commands: GEN SOFT DRINK, GEN VODKA, GEN CHAMPAGNE");
    let _ = io::stdout().flush();
    Ok(())
}

async fn send_welcome(registry: &mut Registry, id: ConnId, store: &dyn InventoryStore) {
    let welcome = match store.snapshot() {
        Ok(counters) => protocol::welcome_line(counters),
        Err(err) => {
            warn!(error = %err, "snapshot for welcome failed");
            return;
        }
    };
    if let Err(err) = registry.send(id, &welcome).await {
        debug!(conn = %id, error = %err, "welcome write failed");
    }
}

async fn accept_tcp(listener: &Option<TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn accept_uds(
    listener: &Option<UnixListener>,
) -> io::Result<(UnixStream, tokio::net::unix::SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn recv_udp(socket: &Option<UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn recv_uds(
    socket: &Option<UnixDatagram>,
    buf: &mut [u8],
) -> io::Result<(usize, tokio::net::unix::SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn idle_wait(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn decode_datagram(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|c| c == '\r' || c == '\n')
        .to_string()
}

fn cleanup_socket_files(config: &ServeConfig) {
    for path in [&config.stream_path, &config.datagram_path]
        .into_iter()
        .flatten()
    {
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %err, "socket file cleanup failed");
            }
        }
    }
}

pub fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if config.tcp_port.is_none()
        && config.udp_port.is_none()
        && config.stream_path.is_none()
        && config.datagram_path.is_none()
    {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("no endpoints configured")
            .with_hint(
                "Pass at least one of --tcp-port, --udp-port, --stream-path, --datagram-path.",
            ));
    }

    if let (Some(tcp), Some(udp)) = (config.tcp_port, config.udp_port) {
        if tcp == udp {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("TCP and UDP ports must be different")
                .with_hint("Use two distinct ports."));
        }
    }

    if !config.initial.within_ceiling() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("initial atom counts exceed the storage limit")
            .with_hint(format!("Use values up to {CEILING}.")));
    }

    if let Some(idle) = config.idle_timeout {
        if idle.is_zero() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("--timeout must be greater than zero")
                .with_hint("Use a positive number of seconds."));
        }
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        signal.recv().await;
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}
