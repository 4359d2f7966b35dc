//! Peerline CLI — chat with one other peer from the terminal.
//!
//! Without `-d` the process listens and prints the address a second
//! process should dial. With `-d <MULTIADDR>` it dials that address. Either
//! way, once a stream is open, lines typed on stdin go to the peer and lines
//! from the peer are printed. The process runs until Ctrl+C.

mod cli;
mod config;
mod console;

use crate::cli::{Cli, NOTE};
use crate::console::ConsoleSink;
use peerline_wire::{
    open_stream, register_handler, resolve_peer, run_pump, Host, HostConfig, Identity,
    PumpHandle, Session, WireError, WireResult, CHAT_PROTOCOL,
};
use rand::rngs::{OsRng, StdRng};
use rand::SeedableRng;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Trace to stderr so chat output on stdout stays readable.
fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    if cli.note {
        println!("{NOTE}");
        std::process::exit(0);
    }

    // The config decides the log level, so load it under a temporary subscriber.
    let config = {
        let bootstrap = tracing_subscriber::fmt()
            .with_env_filter(env_filter("info"))
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::with_default(bootstrap, || {
            config::load_config(cli.config.as_deref())
        })
    };
    init_tracing_stderr(&config.log_level);

    let mut network = config.network;
    if let Some(port) = cli.source_port {
        network.listen_port = port;
    }
    let deterministic = cli.debug || config.identity.deterministic;

    let host = match start_host(network, deterministic).await {
        Ok(host) => host,
        Err(e) => {
            error!(error = %e, "Startup failed");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let started = match cli.dest.as_deref() {
        None => listen(&host, shutdown_rx),
        Some(dest) => dial(&host, dest, shutdown_rx).await,
    };
    if let Err(e) = started {
        error!(error = %e, "Startup failed");
        host.close().await;
        std::process::exit(1);
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupted, shutting down"),
        Err(e) => warn!(error = %e, "Failed to wait for Ctrl+C, shutting down"),
    }
    let _ = shutdown_tx.send(true);
    host.close().await;
}

async fn start_host(config: HostConfig, deterministic: bool) -> WireResult<Host> {
    let identity = if deterministic {
        debug!(seed = config.listen_port, "Using deterministic identity");
        Identity::generate(&mut StdRng::seed_from_u64(u64::from(config.listen_port)))?
    } else {
        Identity::generate(&mut OsRng)?
    };
    Host::start(config, identity).await
}

/// Accept chat streams and print the address to dial.
fn listen(host: &Host, shutdown: watch::Receiver<bool>) -> WireResult<()> {
    register_handler(host, CHAT_PROTOCOL, move |session: Session| {
        start_chat(session, shutdown.clone());
    })?;

    let port = host
        .listen_port()
        .ok_or_else(|| WireError::NetworkBind("was not able to find actual local port".to_string()))?;

    info!(
        "Run 'peerline -d /ip4/127.0.0.1/tcp/{port}/p2p/{}' on another console.",
        host.peer_id()
    );
    info!("Waiting for incoming connection");
    Ok(())
}

/// Open a chat stream to `dest`.
async fn dial(host: &Host, dest: &str, shutdown: watch::Receiver<bool>) -> WireResult<()> {
    info!("This node's multiaddresses:");
    for addr in host.listen_addrs() {
        info!(" - {addr}");
    }

    let target = resolve_peer(host, dest)?;
    let session = open_stream(host, &target, CHAT_PROTOCOL).await?;
    start_chat(session, shutdown);
    Ok(())
}

fn start_chat(session: Session, shutdown: watch::Receiver<bool>) {
    let peer = session.peer();
    let pump = run_pump(
        session.into_channel(),
        console::stdin_lines(),
        ConsoleSink::stdout(),
        shutdown,
    );
    tokio::spawn(supervise(peer.to_string(), pump));
}

async fn supervise(peer: String, pump: PumpHandle) {
    match pump.join().await {
        Ok(report) => info!(
            peer = %peer,
            receive = ?report.receive,
            send = ?report.send,
            "Chat session ended"
        ),
        Err(e) => warn!(peer = %peer, error = %e, "Chat session failed"),
    }
}
