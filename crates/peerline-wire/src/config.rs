//! Host configuration.

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Configuration for a [`Host`](crate::host::Host).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Interface to listen on. All interfaces by default.
    pub listen_ip: IpAddr,
    /// TCP port to listen on. 0 lets the OS pick one.
    pub listen_port: u16,
    /// Upper bound on a single dial attempt.
    pub dial_timeout_secs: u64,
    /// How long a connection with no open streams is kept around.
    pub idle_connection_timeout_secs: u64,
    /// Interval between liveness pings on an open connection.
    pub ping_interval_secs: u64,
    /// Capacity of the command queue into the swarm task.
    pub command_buffer: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 0,
            dial_timeout_secs: 30,
            idle_connection_timeout_secs: 60,
            ping_interval_secs: 15,
            command_buffer: 64,
        }
    }
}

impl HostConfig {
    /// Config bound to all interfaces on `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            listen_port: port,
            ..Self::default()
        }
    }

    /// The listen address as a multiaddr, e.g. `/ip4/0.0.0.0/tcp/4001`.
    pub fn listen_multiaddr(&self) -> Multiaddr {
        let ip = match self.listen_ip {
            IpAddr::V4(v4) => Protocol::Ip4(v4),
            IpAddr::V6(v6) => Protocol::Ip6(v6),
        };
        Multiaddr::empty()
            .with(ip)
            .with(Protocol::Tcp(self.listen_port))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_connection_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}
