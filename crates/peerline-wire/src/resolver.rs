//! Peer resolution — turn `<network-address>/p2p/<peer-id>` into a dialable peer.

use crate::address_book::Retention;
use crate::error::AddressParseError;
use crate::host::Host;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// A remote peer ID plus the addresses it can be reached on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddressInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerAddressInfo {
    /// Split a full p2p address into its network part and peer ID.
    pub fn from_p2p_addr(addr: &Multiaddr) -> Result<Self, AddressParseError> {
        let mut transport = addr.clone();
        let peer_id = match transport.pop() {
            Some(Protocol::P2p(peer_id)) => peer_id,
            _ => return Err(AddressParseError::MissingPeerId(addr.to_string())),
        };
        if transport.is_empty() {
            return Err(AddressParseError::NoTransportAddress(addr.to_string()));
        }
        Ok(Self {
            peer_id,
            addrs: vec![transport],
        })
    }

    /// Each address with `/p2p/<peer-id>` re-appended.
    pub fn p2p_addrs(&self) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .map(|addr| addr.clone().with(Protocol::P2p(self.peer_id)))
            .collect()
    }
}

impl FromStr for PeerAddressInfo {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: Multiaddr = s.trim().parse().map_err(|e: libp2p::multiaddr::Error| {
            AddressParseError::Malformed {
                input: s.to_string(),
                reason: e.to_string(),
            }
        })?;
        Self::from_p2p_addr(&addr)
    }
}

impl fmt::Display for PeerAddressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.p2p_addrs().first() {
            Some(addr) => write!(f, "{addr}"),
            None => write!(f, "/p2p/{}", self.peer_id),
        }
    }
}

/// Parse `address` and record its network addresses in the host's address
/// book. Operator-supplied destinations never expire.
pub fn resolve_peer(host: &Host, address: &str) -> Result<PeerAddressInfo, AddressParseError> {
    let info: PeerAddressInfo = address.parse()?;
    host.address_book()
        .add_addrs(info.peer_id, &info.addrs, Retention::Permanent);
    debug!(peer = %info.peer_id, addrs = ?info.addrs, "Resolved peer");
    Ok(info)
}
