//! Stream negotiation — protocol-tagged streams between two hosts.
//!
//! The listening side installs a [`StreamHandler`] for a protocol with
//! [`register_handler`]; each inbound stream negotiated against that protocol
//! is handed to it as a [`Session`]. The dialing side calls [`open_stream`],
//! which connects (if needed) and negotiates a new outbound stream.
//!
//! Dialing side: `Idle → Dialing → {Open, Failed}`.
//! Listening side: `Listening → Accepted → Open`.
//! There is no closing state; a session ends when its I/O fails.

use crate::address_book::Retention;
use crate::error::{DialError, WireError, WireResult};
use crate::host::Host;
use crate::pump::DuplexChannel;
use crate::resolver::PeerAddressInfo;

use futures::StreamExt;
use libp2p::{PeerId, Stream, StreamProtocol};
use libp2p_stream::OpenStreamError;
use std::fmt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Protocol tag of the line chat stream.
pub const CHAT_PROTOCOL: StreamProtocol = StreamProtocol::new("/chat/1.0.0");

/// Which side opened a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Lifecycle of a stream as seen from one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Dialing,
    Listening,
    Accepted,
    Open,
    Failed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Dialing => write!(f, "dialing"),
            Self::Listening => write!(f, "listening"),
            Self::Accepted => write!(f, "accepted"),
            Self::Open => write!(f, "open"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// An open stream to a remote peer, tagged with the protocol it was
/// negotiated against.
#[derive(Debug)]
pub struct Session {
    peer: PeerId,
    protocol: StreamProtocol,
    direction: Direction,
    stream: Stream,
}

impl Session {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn protocol(&self) -> &StreamProtocol {
        &self.protocol
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Always [`StreamState::Open`]: a `Session` only exists for open streams.
    pub fn state(&self) -> StreamState {
        StreamState::Open
    }

    pub fn into_stream(self) -> Stream {
        self.stream
    }

    /// Wrap the stream for line-oriented use by the duplex pump.
    pub fn into_channel(self) -> DuplexChannel<Stream> {
        DuplexChannel::new(self.stream)
    }
}

/// Callback invoked once per inbound stream on a registered protocol.
pub trait StreamHandler: Send + Sync + 'static {
    fn handle(&self, session: Session);
}

impl<F> StreamHandler for F
where
    F: Fn(Session) + Send + Sync + 'static,
{
    fn handle(&self, session: Session) {
        self(session)
    }
}

/// A live handler registration. Dropping it leaves the handler running.
#[derive(Debug)]
pub struct HandlerRegistration {
    protocol: StreamProtocol,
    task: JoinHandle<()>,
}

impl HandlerRegistration {
    pub fn protocol(&self) -> &StreamProtocol {
        &self.protocol
    }

    /// Stop accepting streams for this protocol.
    pub fn abort(self) {
        self.task.abort();
    }
}

/// Install `handler` for inbound streams on `protocol`.
///
/// At most one handler per protocol per host; a second registration fails
/// with [`WireError::HandlerAlreadyRegistered`].
pub fn register_handler<H: StreamHandler>(
    host: &Host,
    protocol: StreamProtocol,
    handler: H,
) -> WireResult<HandlerRegistration> {
    let mut incoming = host
        .control()
        .accept(protocol.clone())
        .map_err(|_| WireError::HandlerAlreadyRegistered(protocol.to_string()))?;

    info!(
        protocol = %protocol,
        state = %StreamState::Listening,
        "Stream handler registered"
    );

    let task_protocol = protocol.clone();
    let task = tokio::spawn(async move {
        while let Some((peer, stream)) = incoming.next().await {
            info!(
                peer = %peer,
                protocol = %task_protocol,
                state = %StreamState::Accepted,
                "A new stream!"
            );
            handler.handle(Session {
                peer,
                protocol: task_protocol.clone(),
                direction: Direction::Inbound,
                stream,
            });
        }
        debug!(protocol = %task_protocol, "Stream handler stopped");
    });

    Ok(HandlerRegistration { protocol, task })
}

/// Dial `target` and negotiate a new stream on `protocol`.
///
/// The target's addresses are recorded in the host's address book first.
/// A single failure is returned immediately; there is no retry.
pub async fn open_stream(
    host: &Host,
    target: &PeerAddressInfo,
    protocol: StreamProtocol,
) -> Result<Session, DialError> {
    let peer = target.peer_id;
    host.address_book()
        .add_addrs(peer, &target.addrs, Retention::Permanent);

    debug!(peer = %peer, protocol = %protocol, state = %StreamState::Dialing, "Opening stream");
    match negotiate(host, peer, protocol.clone()).await {
        Ok(stream) => {
            info!(peer = %peer, protocol = %protocol, state = %StreamState::Open, "Connection to destination");
            Ok(Session {
                peer,
                protocol,
                direction: Direction::Outbound,
                stream,
            })
        }
        Err(e) => {
            warn!(peer = %peer, state = %StreamState::Failed, error = %e, "Opening stream failed");
            Err(e)
        }
    }
}

async fn negotiate(host: &Host, peer: PeerId, protocol: StreamProtocol) -> Result<Stream, DialError> {
    host.connect(peer).await?;

    let timeout = host.config().dial_timeout();
    let mut control = host.control();
    match tokio::time::timeout(timeout, control.open_stream(peer, protocol.clone())).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(OpenStreamError::UnsupportedProtocol(_))) => Err(DialError::ProtocolRefused {
            peer: peer.to_string(),
            protocol: protocol.to_string(),
        }),
        Ok(Err(e)) => Err(DialError::Stream {
            peer: peer.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(DialError::Timeout {
            peer: peer.to_string(),
            secs: timeout.as_secs(),
        }),
    }
}
