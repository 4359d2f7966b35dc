//! Error types for the session layer.

use thiserror::Error;

/// Errors from the session layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),
    #[error("Network bind failed: {0}")]
    NetworkBind(String),
    #[error(transparent)]
    AddressParse(#[from] AddressParseError),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("Local input error: {0}")]
    LocalInput(#[source] std::io::Error),
    #[error("A stream handler is already registered for protocol {0}")]
    HandlerAlreadyRegistered(String),
    #[error("Host is closed")]
    HostClosed,
    #[error("Task failed: {0}")]
    Task(String),
}

/// Failure to turn an address string into a dialable peer.
#[derive(Debug, Error)]
pub enum AddressParseError {
    #[error("Malformed address '{input}': {reason}")]
    Malformed { input: String, reason: String },
    #[error("Address '{0}' does not end with a /p2p/<peer-id> segment")]
    MissingPeerId(String),
    #[error("Address '{0}' has no network address before its /p2p/ segment")]
    NoTransportAddress(String),
}

/// Failure to open a stream to a remote peer.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },
    #[error("Peer {peer} refused protocol {protocol}")]
    ProtocolRefused { peer: String, protocol: String },
    #[error("Stream to {peer} failed: {reason}")]
    Stream { peer: String, reason: String },
    #[error("Dial to {peer} timed out after {secs}s")]
    Timeout { peer: String, secs: u64 },
    #[error("Host is closed")]
    HostClosed,
}

/// Alias for session layer results.
pub type WireResult<T> = Result<T, WireError>;
