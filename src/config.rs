//! Node configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration, usually loaded from `pulse-node.toml`.
///
/// Every section has working defaults, so a missing file or an empty one
/// yields a usable node: ephemeral identity, all-interface listeners, mDNS
/// discovery on, one counter per second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub p2p: P2PConfig,

    #[serde(default)]
    pub counter: CounterConfig,
}

/// Identity and storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding the persistent identity key. When unset, a fresh
    /// identity is generated on every start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// P2P networking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2PConfig {
    /// Multiaddrs to listen on
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,

    /// Enable mDNS peer discovery on the local network
    #[serde(default = "default_mdns_enabled")]
    pub mdns_enabled: bool,
}

/// Counter exchange settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Pacing of the outbound counter loop, in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            p2p: P2PConfig::default(),
            counter: CounterConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { data_dir: None }
    }
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            mdns_enabled: default_mdns_enabled(),
        }
    }
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn default_listen_addrs() -> Vec<String> {
    vec![
        "/ip4/0.0.0.0/tcp/0".to_string(),
        "/ip4/0.0.0.0/udp/0/quic-v1".to_string(),
    ]
}

fn default_mdns_enabled() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    1000
}
