//! Listener manager.
//!
//! Binds the configured Unix, TCP and WebSocket sockets and hands every
//! accepted byte stream to a fresh connection task. Policy for TCP-family
//! sockets: a loopback peer talks plaintext; a non-loopback peer gets the
//! TLS server handshake when an identity is configured and is rejected
//! outright when it is not -- the listener fails closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use herald_net::{
    StreamTransport, TlsError, WS_SUBPROTOCOL, WS_SUBPROTOCOL_JSON, WsTransport, server_config,
};
use herald_protocol::{EvpProtocol, JsonProtocol, Protocol};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::connection::serve_peer;
use crate::router::RouterHandle;

/// Connection counter used to label Unix peers, which have no address.
static UNIX_PEER_SEQ: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Errors (fatal at startup; exit code 1)
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("binding {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Tls(#[from] TlsError),
}

// ---------------------------------------------------------------------------
// Listener manager
// ---------------------------------------------------------------------------

/// Bind everything in `[listen]` and spawn the accept loops.
///
/// Returns the accept-loop handles so the caller can hold the process
/// open on them. Bind failures and unreadable TLS material are fatal.
pub async fn start_listeners(
    config: &BrokerConfig,
    router: RouterHandle,
) -> Result<Vec<JoinHandle<()>>, StartupError> {
    let acceptor = match &config.tls {
        Some(tls) => Some(TlsAcceptor::from(server_config(&tls.cert, &tls.key)?)),
        None => None,
    };
    let max_line = config.limits.max_line_bytes;
    let mut handles = Vec::new();

    if let Some(path) = &config.listen.unix {
        handles.push(bind_unix(path, router.clone(), max_line).await?);
    }
    for addr in &config.listen.tcp {
        let listener = bind_tcp(addr).await?;
        handles.push(spawn_tcp(listener, router.clone(), acceptor.clone(), max_line));
    }
    for addr in &config.listen.ws {
        let listener = bind_tcp(addr).await?;
        handles.push(spawn_ws(listener, router.clone(), acceptor.clone()));
    }
    Ok(handles)
}

/// Run the TCP accept loop on an already-bound listener.
pub fn spawn_tcp(
    listener: TcpListener,
    router: RouterHandle,
    acceptor: Option<TlsAcceptor>,
    max_line: usize,
) -> JoinHandle<()> {
    tokio::spawn(accept_tcp(listener, router, acceptor, max_line))
}

/// Run the WebSocket accept loop on an already-bound listener.
pub fn spawn_ws(
    listener: TcpListener,
    router: RouterHandle,
    acceptor: Option<TlsAcceptor>,
) -> JoinHandle<()> {
    tokio::spawn(accept_ws(listener, router, acceptor))
}

async fn bind_tcp(addr: &str) -> Result<TcpListener, StartupError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.to_owned(),
            source,
        })?;
    info!(addr, "listening (tcp)");
    Ok(listener)
}

// ---------------------------------------------------------------------------
// Unix
// ---------------------------------------------------------------------------

#[cfg(unix)]
async fn bind_unix(
    path: &std::path::Path,
    router: RouterHandle,
    max_line: usize,
) -> Result<JoinHandle<()>, StartupError> {
    // A stale socket file from a previous run blocks the bind.
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(StartupError::Bind {
                addr: path.display().to_string(),
                source,
            });
        }
    }
    let listener =
        tokio::net::UnixListener::bind(path).map_err(|source| StartupError::Bind {
            addr: path.display().to_string(),
            source,
        })?;
    info!(path = %path.display(), "listening (unix)");

    let label = path.display().to_string();
    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let seq = UNIX_PEER_SEQ.fetch_add(1, Ordering::Relaxed);
                    let remote_id = format!("unix:{}#{}", label, seq);
                    let transport =
                        Box::new(StreamTransport::with_max_line(stream, max_line));
                    tokio::spawn(serve_peer(
                        transport,
                        Box::new(EvpProtocol::new()),
                        router.clone(),
                        remote_id,
                    ));
                }
                Err(error) => {
                    warn!(%error, "unix accept failed");
                    break;
                }
            }
        }
    }))
}

#[cfg(not(unix))]
async fn bind_unix(
    path: &std::path::Path,
    _router: RouterHandle,
    _max_line: usize,
) -> Result<JoinHandle<()>, StartupError> {
    Err(StartupError::Bind {
        addr: path.display().to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        ),
    })
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

async fn accept_tcp(
    listener: TcpListener,
    router: RouterHandle,
    acceptor: Option<TlsAcceptor>,
    max_line: usize,
) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, "tcp accept failed");
                break;
            }
        };
        let remote_id = peer_addr.to_string();
        let router = router.clone();

        if peer_addr.ip().is_loopback() {
            let transport = Box::new(StreamTransport::with_max_line(stream, max_line));
            tokio::spawn(serve_peer(
                transport,
                Box::new(EvpProtocol::new()),
                router,
                remote_id,
            ));
            continue;
        }
        let Some(acceptor) = acceptor.clone() else {
            warn!(peer = %remote_id, "TLS required for non-loopback peer but none configured, rejecting");
            continue;
        };
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls) => {
                    let transport = Box::new(StreamTransport::with_max_line(tls, max_line));
                    serve_peer(transport, Box::new(EvpProtocol::new()), router, remote_id)
                        .await;
                }
                Err(error) => {
                    warn!(peer = %remote_id, %error, "TLS handshake failed");
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

async fn accept_ws(listener: TcpListener, router: RouterHandle, acceptor: Option<TlsAcceptor>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, "ws accept failed");
                break;
            }
        };
        let remote_id = format!("ws:{}", peer_addr);
        let router = router.clone();

        if peer_addr.ip().is_loopback() {
            tokio::spawn(upgrade_and_serve(stream, router, remote_id));
            continue;
        }
        let Some(acceptor) = acceptor.clone() else {
            warn!(peer = %remote_id, "TLS required for non-loopback peer but none configured, rejecting");
            continue;
        };
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls) => upgrade_and_serve(tls, router, remote_id).await,
                Err(error) => {
                    warn!(peer = %remote_id, %error, "TLS handshake failed");
                }
            }
        });
    }
}

/// The Handshaking phase of a WebSocket peer: HTTP upgrade negotiating
/// the subprotocol (`evp` text lines, or `evp-json` for the JSON
/// framing), then a normal connection task over text frames.
async fn upgrade_and_serve<S>(stream: S, router: RouterHandle, remote_id: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let json_selected = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let selected = json_selected.clone();
    let negotiate = move |request: &Request, mut response: Response| {
        let offered = request
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        // First offered protocol we speak wins.
        let chosen = offered.split(',').map(str::trim).find(|p| {
            p.eq_ignore_ascii_case(WS_SUBPROTOCOL) || p.eq_ignore_ascii_case(WS_SUBPROTOCOL_JSON)
        });
        if let Some(chosen) = chosen {
            if chosen.eq_ignore_ascii_case(WS_SUBPROTOCOL_JSON) {
                selected.store(true, Ordering::Relaxed);
            }
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                chosen.parse().expect("offered header value re-used"),
            );
        }
        Ok(response)
    };
    match tokio_tungstenite::accept_hdr_async(stream, negotiate).await {
        Ok(ws) => {
            let transport = Box::new(WsTransport::new(ws));
            let protocol: Box<dyn Protocol> = if json_selected.load(Ordering::Relaxed) {
                Box::new(JsonProtocol::new())
            } else {
                Box::new(EvpProtocol::new())
            };
            serve_peer(transport, protocol, router, remote_id).await;
        }
        Err(error) => {
            warn!(peer = %remote_id, %error, "websocket handshake failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
