//! Peerline session layer — line chat between two peers over libp2p.
//!
//! Each process owns an RSA [`Identity`] and a TCP [`Host`] with Noise
//! encryption and Yamux multiplexing. One side registers a handler for
//! [`CHAT_PROTOCOL`] and waits; the other resolves a full
//! `/ip4/<ip>/tcp/<port>/p2p/<peer-id>` address and opens a stream to it.
//! Both sides then run a duplex pump that moves newline-delimited text
//! between the stream and the local console.
//!
//! ## Architecture
//!
//! - **Identity**: RSA-2048 keypair and the peer ID derived from it
//! - **Host**: listener, swarm driver task and [`AddressBook`]
//! - **Resolver**: parses p2p addresses into [`PeerAddressInfo`]
//! - **Negotiator**: protocol-tagged stream handlers and outbound streams
//! - **Pump**: concurrent receive/send loops over a [`DuplexChannel`]

pub mod address_book;
pub mod config;
pub mod error;
pub mod host;
pub mod identity;
pub mod negotiator;
pub mod pump;
pub mod resolver;

pub use address_book::{AddressBook, AddressRecord, Retention};
pub use config::HostConfig;
pub use error::{AddressParseError, DialError, WireError, WireResult};
pub use host::{create_host, Host};
pub use identity::{Identity, RSA_KEY_BITS};
pub use negotiator::{
    open_stream, register_handler, Direction, HandlerRegistration, Session, StreamHandler,
    StreamState, CHAT_PROTOCOL,
};
pub use pump::{
    run_pump, DuplexChannel, LineSink, LoopExit, PumpHandle, PumpReport, MAX_LINE_BYTES,
};
pub use resolver::{resolve_peer, PeerAddressInfo};

pub use libp2p::{Multiaddr, PeerId, StreamProtocol};
