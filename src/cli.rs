//! CLI for this application
//!
use std::net::{IpAddr, Ipv4Addr};

use crate::settings;

pub use crate::settings::{APP_NAME, APP_VERSION};

#[derive(Clone, Debug, clap::Parser)]
#[command(name = "ringleader", version, about)]
pub struct Cli {
    // Address peers reach this node on
    #[clap(
        long,
        default_value = "127.0.0.1",
        env("RINGLEADER_ADDRESS"),
        help = "IP address of this node inside the broadcast domain"
    )]
    pub address: IpAddr,

    // Unicast UDP port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_NODE,
        env("RINGLEADER_PORT"),
        help = "UDP port for directed cluster messages"
    )]
    pub port: u16,

    // Broadcast destination
    #[clap(
        long,
        default_value = "255.255.255.255",
        env("RINGLEADER_BROADCAST_ADDRESS"),
        help = "Broadcast address of the local network"
    )]
    pub broadcast_address: Ipv4Addr,

    // Well-known broadcast port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_BROADCAST,
        env("RINGLEADER_BROADCAST_PORT"),
        help = "Port shared by every node for broadcast traffic"
    )]
    pub broadcast_port: u16,

    // Multicast group for heartbeats
    #[clap(
        long,
        env("RINGLEADER_MULTICAST_GROUP"),
        help = "Send heartbeats to this multicast group instead of broadcasting"
    )]
    pub multicast_group: Option<Ipv4Addr>,

    // Heartbeat interval
    #[clap(
        long,
        default_value = settings::DEFAULT_DELAY_MS,
        env("RINGLEADER_DELAY_MS"),
        help = "Heartbeat interval in milliseconds"
    )]
    pub delay: u64,

    // Failure detection
    #[clap(
        long,
        default_value = settings::DEFAULT_TIMEOUT_MS,
        env("RINGLEADER_TIMEOUT_MS"),
        help = "Evict peers silent for this many milliseconds (at least twice --delay)"
    )]
    pub timeout: u64,

    // Election stall detection
    #[clap(
        long,
        default_value = settings::DEFAULT_ELECTION_TIMEOUT_MS,
        env("RINGLEADER_ELECTION_TIMEOUT_MS"),
        help = "Restart an election that has not concluded after this many milliseconds"
    )]
    pub election_timeout: u64,

    // Heartbeat holdback bound
    #[clap(
        long,
        default_value = settings::DEFAULT_HOLDBACK_LIMIT,
        env("RINGLEADER_HOLDBACK_LIMIT"),
        help = "Out-of-order heartbeats buffered per peer before skipping a gap"
    )]
    pub holdback_limit: usize,

    // Status API
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_HTTP,
        env("RINGLEADER_HTTP_PORT"),
        help = "Port for the read-only status API (0 disables it)"
    )]
    pub http_port: u16,

    // Logging
    #[clap(
        long,
        default_value = "info",
        env("RINGLEADER_LOGLEVEL"),
        help = "Log level used when RUST_LOG is not set"
    )]
    pub loglevel: String,
}

impl Cli {
    pub fn into_settings(self) -> settings::Settings {
        settings::Settings {
            address: self.address,
            port: self.port,
            broadcast_address: self.broadcast_address,
            broadcast_port: self.broadcast_port,
            multicast_group: self.multicast_group,
            delay_ms: self.delay,
            timeout_ms: self.timeout,
            election_timeout_ms: self.election_timeout,
            holdback_limit: self.holdback_limit,
            http_port: self.http_port,
        }
    }

    /// Default tracing filter when RUST_LOG is absent
    pub fn log_filter(&self) -> String {
        format!(
            "{}={},tower_http=info",
            APP_NAME,
            self.loglevel.to_lowercase()
        )
    }
}
