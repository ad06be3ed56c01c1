//! Connection URI grammar.
//!
//! Client-side addressing for a broker:
//!
//! - `unix:/run/herald/evp` -- Unix socket path; `unix:@name` selects the
//!   abstract namespace where the platform supports it
//! - `file:///run/herald/port` -- the file contains a decimal TCP port on
//!   which to reach loopback
//! - `tcp://host[:port]` -- plain TCP, default service port when omitted
//! - `ws://host[:port]/` and `wss://host[:port]/` -- WebSocket, TLS for wss
//! - `evp://host[:port]` -- logical name; an omitted (or zero) port is
//!   resolved through the DNS-SRV record `_event._tcp.host`

use std::fmt;
use std::path::Path;

use hickory_resolver::TokioAsyncResolver;

/// Default service port when a URI names a host without one.
pub const DEFAULT_PORT: u16 = 7100;

/// DNS-SD / DNS-SRV service label.
const SRV_SERVICE: &str = "_event._tcp";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum UriError {
    #[error("unsupported URI: {uri}")]
    UnsupportedScheme { uri: String },
    #[error("URI {uri} has an empty host")]
    EmptyHost { uri: String },
    #[error("invalid port in {uri}")]
    InvalidPort { uri: String },
    #[error("port file {path}: {detail}")]
    PortFile { path: String, detail: String },
    #[error("SRV lookup for {name} failed: {detail}")]
    Srv { name: String, detail: String },
}

// ---------------------------------------------------------------------------
// ConnectUri
// ---------------------------------------------------------------------------

/// A parsed connection URI. Parsing is pure; resolution (`dial_target`)
/// may read a port file or perform a DNS-SRV lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectUri {
    Unix { path: String, abstract_ns: bool },
    PortFile { path: String },
    Tcp { host: String, port: u16 },
    Ws { url: String, tls: bool },
    Evp { host: String, port: Option<u16> },
}

/// A fully-resolved dial instruction, ready for a connect call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    Unix { path: String, abstract_ns: bool },
    Tcp { host: String, port: u16 },
    Ws { url: String, tls: bool },
}

impl ConnectUri {
    pub fn parse(uri: &str) -> Result<Self, UriError> {
        if let Some(path) = uri.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(UriError::EmptyHost {
                    uri: uri.to_owned(),
                });
            }
            return match path.strip_prefix('@') {
                Some(name) => Ok(ConnectUri::Unix {
                    path: name.to_owned(),
                    abstract_ns: true,
                }),
                None => Ok(ConnectUri::Unix {
                    path: path.to_owned(),
                    abstract_ns: false,
                }),
            };
        }
        if let Some(path) = uri.strip_prefix("file://") {
            if path.is_empty() {
                return Err(UriError::EmptyHost {
                    uri: uri.to_owned(),
                });
            }
            return Ok(ConnectUri::PortFile {
                path: path.to_owned(),
            });
        }
        if let Some(rest) = uri.strip_prefix("tcp://") {
            let (host, port) = split_host_port(rest, uri)?;
            return Ok(ConnectUri::Tcp {
                host,
                port: port.unwrap_or(DEFAULT_PORT),
            });
        }
        if uri.starts_with("ws://") || uri.starts_with("wss://") {
            let tls = uri.starts_with("wss://");
            let rest = uri.split_once("://").expect("scheme checked").1;
            let authority = rest.split('/').next().unwrap_or("");
            let (_host, _port) = split_host_port(authority, uri)?;
            // Keep the URL whole; the WebSocket handshake needs it verbatim.
            return Ok(ConnectUri::Ws {
                url: uri.to_owned(),
                tls,
            });
        }
        if let Some(rest) = uri.strip_prefix("evp://") {
            let (host, port) = split_host_port(rest, uri)?;
            let port = match port {
                Some(0) | None => None,
                Some(p) => Some(p),
            };
            return Ok(ConnectUri::Evp { host, port });
        }
        Err(UriError::UnsupportedScheme {
            uri: uri.to_owned(),
        })
    }

    /// True when the transport will be TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        matches!(self, ConnectUri::Ws { tls: true, .. })
    }

    /// Resolve to something a connect call can use. Reads the port file
    /// for `file://`; performs the SRV lookup for a port-less `evp://`.
    pub async fn dial_target(&self) -> Result<DialTarget, UriError> {
        match self {
            ConnectUri::Unix { path, abstract_ns } => Ok(DialTarget::Unix {
                path: path.clone(),
                abstract_ns: *abstract_ns,
            }),
            ConnectUri::PortFile { path } => {
                let port = read_port_file(Path::new(path))?;
                Ok(DialTarget::Tcp {
                    host: "127.0.0.1".to_owned(),
                    port,
                })
            }
            ConnectUri::Tcp { host, port } => Ok(DialTarget::Tcp {
                host: host.clone(),
                port: *port,
            }),
            ConnectUri::Ws { url, tls } => Ok(DialTarget::Ws {
                url: url.clone(),
                tls: *tls,
            }),
            ConnectUri::Evp {
                host,
                port: Some(port),
            } => Ok(DialTarget::Tcp {
                host: host.clone(),
                port: *port,
            }),
            ConnectUri::Evp { host, port: None } => {
                let (host, port) = lookup_srv(host).await?;
                Ok(DialTarget::Tcp { host, port })
            }
        }
    }
}

impl fmt::Display for ConnectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectUri::Unix {
                path,
                abstract_ns: false,
            } => write!(f, "unix:{}", path),
            ConnectUri::Unix {
                path,
                abstract_ns: true,
            } => write!(f, "unix:@{}", path),
            ConnectUri::PortFile { path } => write!(f, "file://{}", path),
            ConnectUri::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            ConnectUri::Ws { url, .. } => f.write_str(url),
            ConnectUri::Evp { host, port: None } => write!(f, "evp://{}", host),
            ConnectUri::Evp {
                host,
                port: Some(p),
            } => write!(f, "evp://{}:{}", host, p),
        }
    }
}

impl std::str::FromStr for ConnectUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Split `host[:port]`, handling a bracketed IPv6 host.
fn split_host_port(authority: &str, uri: &str) -> Result<(String, Option<u16>), UriError> {
    if authority.is_empty() {
        return Err(UriError::EmptyHost {
            uri: uri.to_owned(),
        });
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| UriError::EmptyHost {
            uri: uri.to_owned(),
        })?;
        let port = match tail.strip_prefix(':') {
            None if tail.is_empty() => None,
            None => {
                return Err(UriError::InvalidPort {
                    uri: uri.to_owned(),
                });
            }
            Some(p) => Some(parse_port(p, uri)?),
        };
        return Ok((host.to_owned(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            Ok((host.to_owned(), Some(parse_port(port, uri)?)))
        }
        Some(_) => Err(UriError::EmptyHost {
            uri: uri.to_owned(),
        }),
        None => Ok((authority.to_owned(), None)),
    }
}

fn parse_port(s: &str, uri: &str) -> Result<u16, UriError> {
    s.parse().map_err(|_| UriError::InvalidPort {
        uri: uri.to_owned(),
    })
}

/// The `file://` fallback: the file holds a decimal loopback port.
fn read_port_file(path: &Path) -> Result<u16, UriError> {
    let text = std::fs::read_to_string(path).map_err(|e| UriError::PortFile {
        path: path.display().to_string(),
        detail: e.to_string(),
    })?;
    let port: u32 = text.trim().parse().map_err(|_| UriError::PortFile {
        path: path.display().to_string(),
        detail: format!("contains wrong port {:?}", text.trim()),
    })?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(UriError::PortFile {
            path: path.display().to_string(),
            detail: format!("contains wrong port '{}'", port),
        });
    }
    Ok(port as u16)
}

/// Resolve `_event._tcp.<host>` and pick the best-priority target.
async fn lookup_srv(host: &str) -> Result<(String, u16), UriError> {
    let name = format!("{}.{}.", SRV_SERVICE, host);
    let resolver =
        TokioAsyncResolver::tokio_from_system_conf().map_err(|e| UriError::Srv {
            name: name.clone(),
            detail: e.to_string(),
        })?;
    let lookup = resolver.srv_lookup(&name).await.map_err(|e| UriError::Srv {
        name: name.clone(),
        detail: e.to_string(),
    })?;
    let record = lookup
        .iter()
        .min_by_key(|r| r.priority())
        .ok_or_else(|| UriError::Srv {
            name: name.clone(),
            detail: "no SRV records".to_owned(),
        })?;
    let target = record.target().to_utf8();
    Ok((target.trim_end_matches('.').to_owned(), record.port()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn unix_paths() {
        assert_eq!(
            ConnectUri::parse("unix:/run/herald/evp").unwrap(),
            ConnectUri::Unix {
                path: "/run/herald/evp".to_owned(),
                abstract_ns: false
            }
        );
        assert_eq!(
            ConnectUri::parse("unix:@herald").unwrap(),
            ConnectUri::Unix {
                path: "herald".to_owned(),
                abstract_ns: true
            }
        );
    }

    #[test]
    fn tcp_with_and_without_port() {
        assert_eq!(
            ConnectUri::parse("tcp://broker.lan:7200").unwrap(),
            ConnectUri::Tcp {
                host: "broker.lan".to_owned(),
                port: 7200
            }
        );
        assert_eq!(
            ConnectUri::parse("tcp://broker.lan").unwrap(),
            ConnectUri::Tcp {
                host: "broker.lan".to_owned(),
                port: DEFAULT_PORT
            }
        );
    }

    #[test]
    fn ipv6_host() {
        assert_eq!(
            ConnectUri::parse("tcp://[::1]:7100").unwrap(),
            ConnectUri::Tcp {
                host: "::1".to_owned(),
                port: 7100
            }
        );
    }

    #[test]
    fn ws_keeps_url_and_detects_tls() {
        let ws = ConnectUri::parse("ws://broker.lan:8080/").unwrap();
        assert_eq!(
            ws,
            ConnectUri::Ws {
                url: "ws://broker.lan:8080/".to_owned(),
                tls: false
            }
        );
        assert!(!ws.is_tls());
        assert!(ConnectUri::parse("wss://broker.lan/").unwrap().is_tls());
    }

    #[test]
    fn evp_port_zero_means_srv() {
        assert_eq!(
            ConnectUri::parse("evp://broker.lan:0").unwrap(),
            ConnectUri::Evp {
                host: "broker.lan".to_owned(),
                port: None
            }
        );
        assert_eq!(
            ConnectUri::parse("evp://broker.lan:7100").unwrap(),
            ConnectUri::Evp {
                host: "broker.lan".to_owned(),
                port: Some(7100)
            }
        );
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        assert!(matches!(
            ConnectUri::parse("gopher://old.lan"),
            Err(UriError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            ConnectUri::parse("tcp://host:notaport"),
            Err(UriError::InvalidPort { .. })
        ));
    }

    #[test]
    fn display_roundtrip() {
        for uri in [
            "unix:/run/herald/evp",
            "unix:@herald",
            "file:///run/herald/port",
            "tcp://broker.lan:7100",
            "ws://broker.lan:8080/",
            "evp://broker.lan",
        ] {
            assert_eq!(ConnectUri::parse(uri).unwrap().to_string(), uri);
        }
    }

    #[tokio::test]
    async fn port_file_resolution() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "7342").unwrap();
        let uri = ConnectUri::PortFile {
            path: f.path().display().to_string(),
        };
        assert_eq!(
            uri.dial_target().await.unwrap(),
            DialTarget::Tcp {
                host: "127.0.0.1".to_owned(),
                port: 7342
            }
        );
    }

    #[tokio::test]
    async fn bad_port_file_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "0").unwrap();
        let uri = ConnectUri::PortFile {
            path: f.path().display().to_string(),
        };
        assert!(matches!(
            uri.dial_target().await,
            Err(UriError::PortFile { .. })
        ));
    }
}
