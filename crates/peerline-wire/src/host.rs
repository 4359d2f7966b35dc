//! Host — the local libp2p endpoint.
//!
//! A [`Host`] owns an [`Identity`], a TCP listener (Noise + Yamux on top) and
//! an [`AddressBook`]. The swarm itself lives in a spawned driver task; the
//! `Host` talks to it over a command channel and hands out
//! [`libp2p_stream::Control`] clones for opening and accepting streams.
//!
//! There is no global state: callers own the `Host` and thread it through
//! every session call. Dropping or [`close`](Host::close)-ing it stops the
//! driver and releases the listen socket.

use crate::address_book::AddressBook;
use crate::config::HostConfig;
use crate::error::{DialError, WireError, WireResult};
use crate::identity::Identity;

use futures::StreamExt;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, NetworkBehaviour, SwarmEvent};
use libp2p::{noise, ping, tcp, yamux, Multiaddr, PeerId, Swarm};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait for the transport to report its first listen address.
const BIND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(NetworkBehaviour)]
struct Behaviour {
    stream: libp2p_stream::Behaviour,
    ping: ping::Behaviour,
}

/// Requests from the [`Host`] handle into the swarm task.
enum Command {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), DialError>>,
    },
    Ping {
        peer: PeerId,
        reply: oneshot::Sender<Result<Duration, DialError>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
}

/// The local network endpoint.
pub struct Host {
    identity: Identity,
    config: HostConfig,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    address_book: AddressBook,
    control: libp2p_stream::Control,
    commands: mpsc::Sender<Command>,
    shutdown_tx: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

/// Build a host listening on all interfaces at `listen_port`.
pub async fn create_host(listen_port: u16, identity: Identity) -> WireResult<Host> {
    Host::start(HostConfig::with_port(listen_port), identity).await
}

impl Host {
    /// Build the swarm, bind the listener and spawn the driver task.
    ///
    /// Returns once the transport has reported at least one listen address,
    /// so [`listen_addrs`](Self::listen_addrs) is never empty on success.
    pub async fn start(config: HostConfig, identity: Identity) -> WireResult<Self> {
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(identity.keypair().clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| WireError::NetworkBind(e.to_string()))?
            .with_behaviour(|_| Behaviour {
                stream: libp2p_stream::Behaviour::new(),
                ping: ping::Behaviour::new(ping::Config::new().with_interval(config.ping_interval())),
            })
            .map_err(|e| WireError::NetworkBind(e.to_string()))?
            .with_swarm_config(|c| {
                c.with_idle_connection_timeout(config.idle_connection_timeout())
            })
            .build();

        let requested = config.listen_multiaddr();
        swarm
            .listen_on(requested.clone())
            .map_err(|e| WireError::NetworkBind(format!("{requested}: {e}")))?;

        let first_addr = tokio::time::timeout(BIND_TIMEOUT, first_listen_addr(&mut swarm))
            .await
            .map_err(|_| {
                WireError::NetworkBind(format!("{requested}: no listen address after {BIND_TIMEOUT:?}"))
            })??;

        info!(
            addr = %first_addr,
            peer = %identity.peer_id(),
            "Host listening"
        );

        let control = swarm.behaviour().stream.new_control();
        let listen_addrs = Arc::new(RwLock::new(vec![first_addr]));
        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = SwarmDriver {
            swarm,
            commands: commands_rx,
            shutdown: shutdown_rx,
            listen_addrs: Arc::clone(&listen_addrs),
            pending_dials: HashMap::new(),
            pending_pings: HashMap::new(),
            last_rtt: HashMap::new(),
        };
        let driver = tokio::spawn(driver.run());

        Ok(Self {
            identity,
            config,
            listen_addrs,
            address_book: AddressBook::new(),
            control,
            commands: commands_tx,
            shutdown_tx,
            driver,
        })
    }

    /// This host's peer ID.
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Addresses the listener is currently bound to.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        let addrs = self.listen_addrs.read().unwrap_or_else(|e| e.into_inner());
        addrs.clone()
    }

    /// Listen addresses with this host's `/p2p/<peer-id>` appended, ready
    /// to hand to a remote operator.
    pub fn p2p_addrs(&self) -> Vec<Multiaddr> {
        let peer_id = self.peer_id();
        self.listen_addrs()
            .into_iter()
            .map(|addr| addr.with(Protocol::P2p(peer_id)))
            .collect()
    }

    /// The TCP port actually bound, useful when listening on port 0.
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_addrs().iter().find_map(|addr| {
            addr.iter().find_map(|p| match p {
                Protocol::Tcp(port) => Some(port),
                _ => None,
            })
        })
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.address_book
    }

    pub(crate) fn control(&self) -> libp2p_stream::Control {
        self.control.clone()
    }

    /// Ensure a connection to `peer`, dialing the addresses in the address
    /// book if none is open. A failed dial is reported once, never retried.
    pub async fn connect(&self, peer: PeerId) -> Result<(), DialError> {
        let addrs = self.address_book.addrs(&peer);
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Dial { peer, addrs, reply })
            .await
            .map_err(|_| DialError::HostClosed)?;
        self.await_reply(peer, rx).await?
    }

    /// Round-trip time to `peer` as measured by the ping protocol.
    pub async fn ping(&self, peer: PeerId) -> Result<Duration, DialError> {
        self.connect(peer).await?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Ping { peer, reply })
            .await
            .map_err(|_| DialError::HostClosed)?;
        self.await_reply(peer, rx).await?
    }

    /// Peers with at least one open connection.
    pub async fn connected_peers(&self) -> WireResult<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ConnectedPeers { reply })
            .await
            .map_err(|_| WireError::HostClosed)?;
        rx.await.map_err(|_| WireError::HostClosed)
    }

    /// Stop the driver task and release the listen socket.
    pub async fn close(self) {
        info!(peer = %self.peer_id(), "Host closing");
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.driver.await {
            warn!(error = %e, "Host driver task ended abnormally");
        }
    }

    async fn await_reply<T>(
        &self,
        peer: PeerId,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, DialError> {
        let timeout = self.config.dial_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(DialError::HostClosed),
            Err(_) => Err(DialError::Timeout {
                peer: peer.to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }
}

/// Poll a fresh swarm until its listener reports an address or fails.
async fn first_listen_addr(swarm: &mut Swarm<Behaviour>) -> WireResult<Multiaddr> {
    loop {
        match swarm.select_next_some().await {
            SwarmEvent::NewListenAddr { address, .. } => return Ok(address),
            SwarmEvent::ListenerError { error, .. } => {
                return Err(WireError::NetworkBind(error.to_string()));
            }
            SwarmEvent::ListenerClosed { reason, .. } => {
                let reason = match reason {
                    Ok(()) => "listener closed".to_string(),
                    Err(e) => e.to_string(),
                };
                return Err(WireError::NetworkBind(reason));
            }
            _ => {}
        }
    }
}

/// Owns the swarm and serves [`Command`]s until shut down.
struct SwarmDriver {
    swarm: Swarm<Behaviour>,
    commands: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    pending_dials: HashMap<ConnectionId, oneshot::Sender<Result<(), DialError>>>,
    pending_pings: HashMap<PeerId, Vec<oneshot::Sender<Result<Duration, DialError>>>>,
    last_rtt: HashMap<PeerId, Duration>,
}

impl SwarmDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.on_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(peer = %self.swarm.local_peer_id(), "Swarm driver stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Dial { peer, addrs, reply } => {
                if self.swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                if addrs.is_empty() {
                    let _ = reply.send(Err(DialError::Unreachable {
                        peer: peer.to_string(),
                        reason: "no known addresses".to_string(),
                    }));
                    return;
                }

                debug!(peer = %peer, addrs = ?addrs, "Dialing");
                let opts = DialOpts::peer_id(peer)
                    .condition(PeerCondition::Disconnected)
                    .addresses(addrs)
                    .build();
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.pending_dials.insert(connection_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(DialError::Unreachable {
                            peer: peer.to_string(),
                            reason: e.to_string(),
                        }));
                    }
                }
            }
            Command::Ping { peer, reply } => {
                if let Some(rtt) = self.last_rtt.get(&peer) {
                    let _ = reply.send(Ok(*rtt));
                } else if !self.swarm.is_connected(&peer) {
                    let _ = reply.send(Err(DialError::Unreachable {
                        peer: peer.to_string(),
                        reason: "not connected".to_string(),
                    }));
                } else {
                    self.pending_pings.entry(peer).or_default().push(reply);
                }
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }
        }
    }

    fn on_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "New listen address");
                let mut addrs = self.listen_addrs.write().unwrap_or_else(|e| e.into_inner());
                if !addrs.contains(&address) {
                    addrs.push(address);
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!(addr = %address, "Listen address expired");
                let mut addrs = self.listen_addrs.write().unwrap_or_else(|e| e.into_inner());
                addrs.retain(|a| a != &address);
            }
            SwarmEvent::ListenerClosed {
                addresses, reason, ..
            } => {
                warn!(addrs = ?addresses, reason = ?reason, "Listener closed");
                let mut addrs = self.listen_addrs.write().unwrap_or_else(|e| e.into_inner());
                addrs.retain(|a| !addresses.contains(a));
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!(error = %error, "Listener error");
            }
            SwarmEvent::IncomingConnection { send_back_addr, .. } => {
                debug!(addr = %send_back_addr, "Incoming connection");
            }
            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                debug!(addr = %send_back_addr, error = %error, "Incoming connection failed");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                info!(
                    peer = %peer_id,
                    addr = %endpoint.get_remote_address(),
                    "Connection established"
                );
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(()));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                let peer = peer_id.map(|p| p.to_string()).unwrap_or_default();
                warn!(peer = %peer, error = %error, "Dial failed");
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(DialError::Unreachable {
                        peer,
                        reason: error.to_string(),
                    }));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                debug!(peer = %peer_id, cause = ?cause, "Connection closed");
                if num_established == 0 {
                    self.last_rtt.remove(&peer_id);
                    for waiter in self.pending_pings.remove(&peer_id).unwrap_or_default() {
                        let _ = waiter.send(Err(DialError::Unreachable {
                            peer: peer_id.to_string(),
                            reason: "connection closed".to_string(),
                        }));
                    }
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Ping(ping::Event { peer, result, .. })) => {
                self.on_ping(peer, result);
            }
            _ => {}
        }
    }

    fn on_ping(&mut self, peer: PeerId, result: Result<Duration, ping::Failure>) {
        let waiters = self.pending_pings.remove(&peer).unwrap_or_default();
        match result {
            Ok(rtt) => {
                debug!(peer = %peer, rtt_ms = rtt.as_millis() as u64, "Ping");
                self.last_rtt.insert(peer, rtt);
                for waiter in waiters {
                    let _ = waiter.send(Ok(rtt));
                }
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Ping failed");
                let reason = e.to_string();
                for waiter in waiters {
                    let _ = waiter.send(Err(DialError::Stream {
                        peer: peer.to_string(),
                        reason: reason.clone(),
                    }));
                }
            }
        }
    }
}
