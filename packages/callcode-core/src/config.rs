//! Client configuration.
//!
//! Endpoints and NAT-traversal servers are configuration, never constants
//! inside the negotiation code. TURN credentials are only ever read from
//! the environment.

use serde::{Deserialize, Serialize};

/// Default public STUN servers.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

const DEFAULT_REGISTRY_URL: &str = "http://localhost:3001";
const DEFAULT_RELAY_URL: &str = "ws://localhost:3001/ws";

/// One ICE server entry, shaped like `RTCIceServer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    /// STUN or TURN URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A credential-less STUN entry.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Configuration for a calling client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the call registry (`/api/calls` lives under it)
    pub registry_url: String,
    /// WebSocket URL of the signaling relay
    pub relay_url: String,
    /// ICE servers handed to the peer transport
    pub ice_servers: Vec<IceServer>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServer::stun(*url))
                .collect(),
        }
    }
}

impl ClientConfig {
    /// Build a configuration from `CALLCODE_*` environment variables.
    ///
    /// | Variable | Meaning |
    /// |----------|---------|
    /// | `CALLCODE_REGISTRY_URL` | registry base URL |
    /// | `CALLCODE_RELAY_URL` | relay WebSocket URL |
    /// | `CALLCODE_STUN_URLS` | comma-separated STUN URLs |
    /// | `CALLCODE_TURN_URL` | TURN URL (optional) |
    /// | `CALLCODE_TURN_USERNAME` | TURN username |
    /// | `CALLCODE_TURN_CREDENTIAL` | TURN credential |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let stun_servers = match non_empty("CALLCODE_STUN_URLS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::stun)
                .collect(),
            None => defaults.ice_servers,
        };

        let mut ice_servers: Vec<IceServer> = stun_servers;
        if let Some(turn_url) = non_empty("CALLCODE_TURN_URL") {
            ice_servers.push(IceServer {
                urls: vec![turn_url],
                username: non_empty("CALLCODE_TURN_USERNAME"),
                credential: non_empty("CALLCODE_TURN_CREDENTIAL"),
            });
        }

        Self {
            registry_url: non_empty("CALLCODE_REGISTRY_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.registry_url),
            relay_url: non_empty("CALLCODE_RELAY_URL").unwrap_or(defaults.relay_url),
            ice_servers,
        }
    }
}
