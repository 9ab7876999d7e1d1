//! ringleader application settings
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::config_error;
use crate::error::Result;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_PORT_NODE: u16 = 8765;
pub const DEFAULT_PORT_NODE: &str = "8765";
pub const STANDARD_PORT_BROADCAST: u16 = 34567;
pub const DEFAULT_PORT_BROADCAST: &str = "34567";
pub const STANDARD_PORT_HTTP: u16 = 8410;
pub const DEFAULT_PORT_HTTP: &str = "8410";

pub const DEFAULT_DELAY_MS: &str = "1000";
pub const DEFAULT_TIMEOUT_MS: &str = "3000";
pub const DEFAULT_ELECTION_TIMEOUT_MS: &str = "3000";
pub const DEFAULT_HOLDBACK_LIMIT: &str = "8";

/// Addresses the UDP transport binds and sends to
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Unicast socket: the node's own identity address
    pub listen_udp: SocketAddr,
    /// Destination for discovery, heartbeat and election-result broadcasts
    pub broadcast: SocketAddrV4,
    /// Optional multicast group used for heartbeat fan-out
    pub multicast: Option<SocketAddrV4>,
}

#[derive(Clone, Debug)]
pub struct Settings {
    // Address peers see this node as (its address in the broadcast domain)
    pub address: IpAddr,

    // Unicast UDP port, part of the node identity
    pub port: u16,

    // Broadcast destination address
    pub broadcast_address: Ipv4Addr,

    // Well-known broadcast port shared by all nodes
    pub broadcast_port: u16,

    // Optional multicast group for heartbeats
    pub multicast_group: Option<Ipv4Addr>,

    // Heartbeat interval in milliseconds
    pub delay_ms: u64,

    // Peer failure timeout in milliseconds
    pub timeout_ms: u64,

    // Stalled election rounds are abandoned after this many milliseconds
    pub election_timeout_ms: u64,

    // Out-of-order heartbeats held per peer before a gap is declared lost
    pub holdback_limit: usize,

    // Status API port, 0 disables the API
    pub http_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: STANDARD_PORT_NODE,
            broadcast_address: Ipv4Addr::BROADCAST,
            broadcast_port: STANDARD_PORT_BROADCAST,
            multicast_group: None,
            delay_ms: 1000,
            timeout_ms: 3000,
            election_timeout_ms: 3000,
            holdback_limit: 8,
            http_port: STANDARD_PORT_HTTP,
        }
    }
}

impl Settings {
    /// Reject settings that would break identity or failure detection
    pub fn validate(&self) -> Result<()> {
        // the address is the node's identity, so it must be one peers see us send from
        let unicast = match self.address {
            IpAddr::V4(ip) => !ip.is_unspecified() && !ip.is_multicast() && !ip.is_broadcast(),
            IpAddr::V6(ip) => !ip.is_unspecified() && !ip.is_multicast(),
        };
        if !unicast {
            return Err(config_error!(
                "{} cannot identify a node, use this host's interface address",
                self.address
            ));
        }
        if self.delay_ms == 0 {
            return Err(config_error!("heartbeat delay must be greater than zero"));
        }
        if self.timeout_ms < self.delay_ms.saturating_mul(2) {
            return Err(config_error!(
                "timeout {}ms must be at least twice the heartbeat delay {}ms",
                self.timeout_ms,
                self.delay_ms
            ));
        }
        if self.election_timeout_ms == 0 {
            return Err(config_error!("election timeout must be greater than zero"));
        }
        if self.holdback_limit == 0 {
            return Err(config_error!("holdback limit must be at least 1"));
        }
        if let Some(group) = self.multicast_group {
            if !group.is_multicast() {
                return Err(config_error!("{} is not a multicast address", group));
            }
        }
        Ok(())
    }

    /// Identity address of this node
    pub fn local_address(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn failure_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// A lone node waits this long for peers before promoting itself
    pub fn discovery_window(&self) -> Duration {
        self.failure_timeout()
    }

    pub fn http_address(&self) -> Option<SocketAddr> {
        (self.http_port != 0).then(|| SocketAddr::new(self.address, self.http_port))
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            listen_udp: self.local_address(),
            broadcast: SocketAddrV4::new(self.broadcast_address, self.broadcast_port),
            multicast: self
                .multicast_group
                .map(|group| SocketAddrV4::new(group, self.broadcast_port)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.local_address().port(), STANDARD_PORT_NODE);
        assert_eq!(settings.discovery_window(), settings.failure_timeout());
    }

    #[test]
    fn test_timeout_must_exceed_twice_delay() {
        let settings = Settings {
            delay_ms: 1000,
            timeout_ms: 1500,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(ClusterError::Config(_))));

        let settings = Settings {
            delay_ms: 1000,
            timeout_ms: 2000,
            ..Settings::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_multicast_group() {
        let settings = Settings {
            multicast_group: Some(Ipv4Addr::new(10, 0, 0, 1)),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            multicast_group: Some(Ipv4Addr::new(239, 1, 2, 3)),
            ..Settings::default()
        };
        let transport = settings.transport_config();
        assert_eq!(
            transport.multicast,
            Some(SocketAddrV4::new(
                Ipv4Addr::new(239, 1, 2, 3),
                STANDARD_PORT_BROADCAST
            ))
        );
    }

    #[test]
    fn test_rejects_non_unicast_identity_address() {
        let rejected: [IpAddr; 5] = [
            Ipv4Addr::UNSPECIFIED.into(),
            Ipv4Addr::BROADCAST.into(),
            Ipv4Addr::new(239, 1, 2, 3).into(),
            std::net::Ipv6Addr::UNSPECIFIED.into(),
            "ff02::1".parse().unwrap(),
        ];
        for address in rejected {
            let settings = Settings {
                address,
                ..Settings::default()
            };
            assert!(
                matches!(settings.validate(), Err(ClusterError::Config(_))),
                "{} accepted",
                address
            );
        }

        let settings = Settings {
            address: Ipv4Addr::new(192, 168, 1, 20).into(),
            ..Settings::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_http_port_zero_disables_api() {
        let settings = Settings {
            http_port: 0,
            ..Settings::default()
        };
        assert!(settings.http_address().is_none());
    }
}
