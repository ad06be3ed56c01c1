//! Broker configuration loading.
//!
//! TOML is the sole config source. Default path: `/etc/herald/broker.toml`.
//!
//! # Shape
//! ```toml
//! schema_version = 1
//!
//! [listen]
//! unix = "/run/herald/evp"
//! tcp = ["0.0.0.0:7100"]
//! ws = ["0.0.0.0:7101"]
//!
//! [tls]
//! cert = "/etc/herald/cert.pem"
//! key = "/etc/herald/key.pem"
//! ca = ["/etc/herald/extra-ca.pem"]
//!
//! [limits]
//! queue_capacity = 1024
//! max_line_bytes = 16777216
//!
//! [actions]
//! log = true
//! file = "/var/log/herald/events.log"
//!
//! [[relay]]
//! name = "hub"
//! uri = "evp://hub.example.com"      # or: discover = "hub"
//! # when using discover, a static oracle entry supplies the address:
//! # [[discovery.peers]]
//! # name = "hub"
//! # uri = "tcp://hub.example.com:7100"
//! forwards = ["im", "mail"]          # empty/absent = forward everything
//! subscriptions = []                 # present = SUBSCRIBE on connect
//! accept_unknown_ca = false
//! ping_interval_secs = 60
//! reconnect_timeout_secs = 5
//! reconnect_max_tries = 10
//! ```
//!
//! At least one `[listen]` entry is required. A non-loopback TCP or WS
//! bind without `[tls]` is accepted at load time; such peers are rejected
//! at accept time (the listener fails closed).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use herald_net::{ConnectUri, DEFAULT_MAX_LINE, UriError};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/herald/broker.toml";

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_RECONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RECONNECT_MAX_TRIES: u32 = 10;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub schema_version: u32,
    pub listen: ListenConfig,
    pub tls: Option<TlsConfig>,
    pub limits: LimitsConfig,
    /// Raw `[actions]` table, handed to `actions::parse_actions`.
    pub actions: toml::value::Table,
    pub relays: Vec<RelayConfig>,
    /// Statically known peers announced through the discovery oracle.
    pub discovery_peers: Vec<DiscoveryPeer>,
}

#[derive(Debug, Clone)]
pub struct DiscoveryPeer {
    pub name: String,
    pub uri: ConnectUri,
}

#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub unix: Option<PathBuf>,
    pub tcp: Vec<String>,
    pub ws: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub queue_capacity: usize,
    pub max_line_bytes: usize,
}

#[derive(Debug, Clone)]
pub enum RelayTarget {
    /// Fixed address.
    Uri(ConnectUri),
    /// Named peer supplied (and retracted) by the discovery oracle.
    Discover(String),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub name: String,
    pub target: RelayTarget,
    /// Categories forwarded upstream; empty = forward everything.
    pub forwards: BTreeSet<String>,
    /// `Some` = send SUBSCRIBE on connect (empty set = subscribe-all).
    pub subscriptions: Option<BTreeSet<String>>,
    pub accept_unknown_ca: bool,
    pub server_identity: Option<String>,
    pub ping_interval: Option<Duration>,
    pub reconnect_timeout: Duration,
    pub reconnect_max_tries: u32,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    listen: Option<RawListen>,
    tls: Option<RawTls>,
    limits: Option<RawLimits>,
    actions: Option<toml::value::Table>,
    #[serde(default)]
    relay: Vec<RawRelay>,
    discovery: Option<RawDiscovery>,
}

#[derive(Debug, Deserialize)]
struct RawDiscovery {
    #[serde(default)]
    peers: Vec<RawDiscoveryPeer>,
}

#[derive(Debug, Deserialize)]
struct RawDiscoveryPeer {
    name: Option<String>,
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawListen {
    unix: Option<PathBuf>,
    tcp: Option<Vec<String>>,
    ws: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawTls {
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    ca: Option<Vec<PathBuf>>,
}

#[derive(Debug, Deserialize)]
struct RawLimits {
    queue_capacity: Option<usize>,
    max_line_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawRelay {
    name: Option<String>,
    uri: Option<String>,
    discover: Option<String>,
    forwards: Option<Vec<String>>,
    subscriptions: Option<Vec<String>>,
    accept_unknown_ca: Option<bool>,
    server_identity: Option<String>,
    ping_interval_secs: Option<u64>,
    reconnect_timeout_secs: Option<u64>,
    reconnect_max_tries: Option<u32>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("unsupported schema_version {0} (expected 1)")]
    SchemaVersion(u32),
    #[error("no listeners configured: set [listen] unix, tcp or ws")]
    NoListeners,
    #[error("[tls] requires both cert and key")]
    TlsIncomplete,
    #[error("relay {name:?}: {detail}")]
    Relay { name: String, detail: String },
    #[error("relay {name:?}: {source}")]
    RelayUri {
        name: String,
        source: UriError,
    },
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config() -> Result<BrokerConfig, ConfigError> {
    load_config_from_path(Path::new(DEFAULT_CONFIG_PATH))
}

pub fn load_config_from_path(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<BrokerConfig, ConfigError> {
    let raw: RawConfig =
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw.schema_version.unwrap_or(1);
    if schema_version != 1 {
        return Err(ConfigError::SchemaVersion(schema_version));
    }

    let listen = match raw.listen {
        Some(l) => ListenConfig {
            unix: l.unix,
            tcp: l.tcp.unwrap_or_default(),
            ws: l.ws.unwrap_or_default(),
        },
        None => ListenConfig {
            unix: None,
            tcp: Vec::new(),
            ws: Vec::new(),
        },
    };
    if listen.unix.is_none() && listen.tcp.is_empty() && listen.ws.is_empty() {
        return Err(ConfigError::NoListeners);
    }

    let tls = match raw.tls {
        None => None,
        Some(raw_tls) => match (raw_tls.cert, raw_tls.key) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert,
                key,
                ca: raw_tls.ca.unwrap_or_default(),
            }),
            _ => return Err(ConfigError::TlsIncomplete),
        },
    };

    let limits = LimitsConfig {
        queue_capacity: raw
            .limits
            .as_ref()
            .and_then(|l| l.queue_capacity)
            .unwrap_or(DEFAULT_QUEUE_CAPACITY),
        max_line_bytes: raw
            .limits
            .as_ref()
            .and_then(|l| l.max_line_bytes)
            .unwrap_or(DEFAULT_MAX_LINE),
    };

    let mut relays = Vec::with_capacity(raw.relay.len());
    for raw_relay in raw.relay {
        relays.push(validate_relay(raw_relay)?);
    }

    let mut discovery_peers = Vec::new();
    for peer in raw.discovery.map(|d| d.peers).unwrap_or_default() {
        let name = peer.name.ok_or_else(|| ConfigError::Parse(
            "discovery peer missing name".to_owned(),
        ))?;
        let uri = peer.uri.ok_or_else(|| ConfigError::Relay {
            name: name.clone(),
            detail: "discovery peer missing uri".to_owned(),
        })?;
        let uri = ConnectUri::parse(&uri).map_err(|source| ConfigError::RelayUri {
            name: name.clone(),
            source,
        })?;
        discovery_peers.push(DiscoveryPeer { name, uri });
    }

    Ok(BrokerConfig {
        schema_version,
        listen,
        tls,
        limits,
        actions: raw.actions.unwrap_or_default(),
        relays,
        discovery_peers,
    })
}

fn validate_relay(raw: RawRelay) -> Result<RelayConfig, ConfigError> {
    let name = raw.name.ok_or_else(|| ConfigError::Relay {
        name: "<unnamed>".to_owned(),
        detail: "missing name".to_owned(),
    })?;

    let target = match (raw.uri, raw.discover) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::Relay {
                name,
                detail: "uri and discover are mutually exclusive".to_owned(),
            });
        }
        (None, None) => {
            return Err(ConfigError::Relay {
                name,
                detail: "one of uri or discover is required".to_owned(),
            });
        }
        (Some(uri), None) => RelayTarget::Uri(
            ConnectUri::parse(&uri).map_err(|source| ConfigError::RelayUri {
                name: name.clone(),
                source,
            })?,
        ),
        (None, Some(discover)) => RelayTarget::Discover(discover),
    };

    Ok(RelayConfig {
        name,
        target,
        forwards: raw.forwards.unwrap_or_default().into_iter().collect(),
        subscriptions: raw
            .subscriptions
            .map(|subs| subs.into_iter().collect()),
        accept_unknown_ca: raw.accept_unknown_ca.unwrap_or(false),
        server_identity: raw.server_identity,
        ping_interval: raw.ping_interval_secs.map(Duration::from_secs),
        reconnect_timeout: Duration::from_secs(
            raw.reconnect_timeout_secs
                .unwrap_or(DEFAULT_RECONNECT_TIMEOUT_SECS),
        ),
        reconnect_max_tries: raw
            .reconnect_max_tries
            .unwrap_or(DEFAULT_RECONNECT_MAX_TRIES),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
