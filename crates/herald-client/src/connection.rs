//! The outbound broker connection.
//!
//! A `Connection` is a reusable handle: `connect` dials the configured
//! URI (raw TCP, TLS, Unix socket, or WebSocket), spawns an I/O task that
//! owns the transport and codec, and returns the channel on which inbound
//! traffic arrives. `close` says BYE and tears the task down. The handle
//! can connect again after a disconnect, which is what the relay's
//! reconnect controller leans on.

use std::collections::BTreeSet;
use std::time::Duration;

use herald_event::Event;
use herald_net::{
    ConnectUri, LineTransport, StreamTransport, TlsError, TransportError, UriError,
    WS_SUBPROTOCOL, WsTransport, client_config,
};
use herald_protocol::{
    Parser, ProtocolMessage, generate_bye, generate_event, generate_ping, generate_subscribe,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// When to wrap a TCP connection in TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// TLS whenever the target host is not loopback (mirrors the broker's
    /// accept policy).
    #[default]
    Auto,
    Never,
    Always,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub tls_mode: TlsMode,
    /// Tolerate a server CA missing from the trust store. Hostname and
    /// validity checks still apply.
    pub accept_unknown_ca: bool,
    /// Extra PEM CA files appended to the trust store.
    pub extra_ca: Vec<std::path::PathBuf>,
    /// Expected server identity when it differs from the dialed host.
    pub server_identity: Option<String>,
    /// Emit a PING after this much send/receive silence.
    pub ping_interval: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    #[error("invalid server name {0:?}")]
    ServerName(String),
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

// ---------------------------------------------------------------------------
// Incoming traffic
// ---------------------------------------------------------------------------

/// What the I/O task surfaces to the owner.
#[derive(Debug)]
pub enum Incoming {
    /// An event fanned out by the remote broker.
    Event(Event),
    /// The link is gone; `reason` carries the error text when it was not
    /// an orderly BYE. Always the final message on the channel.
    Disconnected { reason: Option<String> },
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

enum Command {
    Send(String),
    Close,
}

struct Active {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

pub struct Connection {
    uri: ConnectUri,
    options: ConnectOptions,
    active: Option<Active>,
}

impl Connection {
    pub fn new(uri: ConnectUri, options: ConnectOptions) -> Self {
        Connection {
            uri,
            options,
            active: None,
        }
    }

    /// Resolve the default broker address: `$HERALD_HOST`, else the
    /// per-user runtime socket.
    pub fn default_uri() -> Result<ConnectUri, UriError> {
        if let Ok(uri) = std::env::var("HERALD_HOST") {
            if !uri.is_empty() {
                return ConnectUri::parse(&uri);
            }
        }
        let runtime_dir =
            std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/run".to_owned());
        ConnectUri::parse(&format!("unix:{}/herald/evp", runtime_dir))
    }

    pub fn uri(&self) -> &ConnectUri {
        &self.uri
    }

    /// Swap the target address (used when a discovery oracle hands the
    /// relay a fresh location). Only valid while disconnected.
    pub fn set_uri(&mut self, uri: ConnectUri) -> Result<(), ClientError> {
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }
        self.uri = uri;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| !a.task.is_finished())
    }

    /// Dial, hand the transport to a fresh I/O task, and return the
    /// inbound channel. Fails with `AlreadyConnected` on a live handle.
    pub async fn connect(&mut self) -> Result<mpsc::Receiver<Incoming>, ClientError> {
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }
        let transport = dial(&self.uri, &self.options).await?;
        debug!(uri = %self.uri, "connected");

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (incoming_tx, incoming_rx) = mpsc::channel(256);
        let ping_interval = self.options.ping_interval;
        let task = tokio::spawn(run_io(transport, cmd_rx, incoming_tx, ping_interval));
        self.active = Some(Active { cmd_tx, task });
        Ok(incoming_rx)
    }

    /// Publish one event to the remote broker.
    pub async fn send_event(&self, event: &Event) -> Result<(), ClientError> {
        self.send_raw(generate_event(event)).await
    }

    /// Send a SUBSCRIBE for the given categories (`None` = everything).
    pub async fn subscribe(
        &self,
        categories: Option<&BTreeSet<String>>,
    ) -> Result<(), ClientError> {
        self.send_raw(generate_subscribe(categories)).await
    }

    /// Orderly shutdown: BYE, drain, reap the I/O task.
    pub async fn close(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.cmd_tx.send(Command::Close).await;
            let _ = active.task.await;
        }
    }

    async fn send_raw(&self, message: String) -> Result<(), ClientError> {
        let active = self.active.as_ref().ok_or(ClientError::NotConnected)?;
        if active.task.is_finished() {
            return Err(ClientError::NotConnected);
        }
        active
            .cmd_tx
            .send(Command::Send(message))
            .await
            .map_err(|_| ClientError::NotConnected)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Dialing
// ---------------------------------------------------------------------------

async fn dial(
    uri: &ConnectUri,
    options: &ConnectOptions,
) -> Result<Box<dyn LineTransport>, ClientError> {
    let target = uri.dial_target().await?;
    match target {
        herald_net::DialTarget::Unix { path, abstract_ns } => {
            dial_unix(&path, abstract_ns).await
        }
        herald_net::DialTarget::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            let use_tls = match options.tls_mode {
                TlsMode::Never => false,
                TlsMode::Always => true,
                TlsMode::Auto => !is_loopback_host(&host),
            };
            if !use_tls {
                return Ok(Box::new(StreamTransport::new(stream)));
            }
            let config = client_config(&options.extra_ca, options.accept_unknown_ca)?;
            let identity = options.server_identity.as_deref().unwrap_or(&host);
            let server_name = rustls::pki_types::ServerName::try_from(identity.to_owned())
                .map_err(|_| ClientError::ServerName(identity.to_owned()))?;
            let connector = tokio_rustls::TlsConnector::from(config);
            let tls = connector.connect(server_name, stream).await?;
            Ok(Box::new(StreamTransport::new(tls)))
        }
        herald_net::DialTarget::Ws { url, tls } => {
            use tokio_tungstenite::tungstenite::client::IntoClientRequest;
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| ClientError::Handshake(e.to_string()))?;
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                WS_SUBPROTOCOL
                    .parse()
                    .expect("static subprotocol header value"),
            );
            let connector = if tls {
                let config = client_config(&options.extra_ca, options.accept_unknown_ca)?;
                Some(tokio_tungstenite::Connector::Rustls(config))
            } else {
                None
            };
            let (ws, _response) = tokio_tungstenite::connect_async_tls_with_config(
                request, None, false, connector,
            )
            .await
            .map_err(|e| ClientError::Handshake(e.to_string()))?;
            Ok(Box::new(WsTransport::new(ws)))
        }
    }
}

#[cfg(unix)]
async fn dial_unix(path: &str, abstract_ns: bool) -> Result<Box<dyn LineTransport>, ClientError> {
    if abstract_ns {
        #[cfg(target_os = "linux")]
        {
            use std::os::linux::net::SocketAddrExt;
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(path.as_bytes())?;
            let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            std_stream.set_nonblocking(true)?;
            let stream = tokio::net::UnixStream::from_std(std_stream)?;
            return Ok(Box::new(StreamTransport::new(stream)));
        }
        #[cfg(not(target_os = "linux"))]
        return Err(ClientError::Unsupported("abstract unix socket names"));
    }
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(StreamTransport::new(stream)))
}

#[cfg(not(unix))]
async fn dial_unix(_path: &str, _abstract_ns: bool) -> Result<Box<dyn LineTransport>, ClientError> {
    Err(ClientError::Unsupported("unix sockets"))
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// I/O task
// ---------------------------------------------------------------------------

enum Step {
    Line(Result<Option<String>, TransportError>),
    Cmd(Option<Command>),
    Quiet,
}

async fn run_io(
    mut transport: Box<dyn LineTransport>,
    mut cmd_rx: mpsc::Receiver<Command>,
    incoming_tx: mpsc::Sender<Incoming>,
    ping_interval: Option<Duration>,
) {
    let mut parser = Parser::new();
    let reason: Option<String> = loop {
        let quiet = async {
            match ping_interval {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        let step = tokio::select! {
            line = transport.next_line() => Step::Line(line),
            cmd = cmd_rx.recv() => Step::Cmd(cmd),
            _ = quiet => Step::Quiet,
        };
        match step {
            Step::Line(Ok(Some(line))) => match parser.feed_line(&line) {
                Ok(Some(ProtocolMessage::Event(event))) => {
                    if incoming_tx.send(Incoming::Event(event)).await.is_err() {
                        // Owner went away; say goodbye and stop.
                        let _ = transport.send_message(&generate_bye(None)).await;
                        let _ = transport.shutdown().await;
                        return;
                    }
                }
                Ok(Some(ProtocolMessage::Bye(message))) => {
                    debug!(?message, "server said BYE");
                    let _ = transport.send_message(&generate_bye(None)).await;
                    let _ = transport.shutdown().await;
                    break None;
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(%error, "protocol error from server");
                    let text = error.to_string();
                    let _ = transport.send_message(&generate_bye(Some(&text))).await;
                    let _ = transport.shutdown_on_error(&text).await;
                    break Some(text);
                }
            },
            Step::Line(Ok(None)) => break None,
            Step::Line(Err(e)) => {
                let _ = transport
                    .send_message(&generate_bye(Some(&e.to_string())))
                    .await;
                break Some(e.to_string());
            }
            Step::Cmd(Some(Command::Send(message))) => {
                if let Err(e) = transport.send_message(&message).await {
                    break Some(e.to_string());
                }
            }
            Step::Cmd(Some(Command::Close)) | Step::Cmd(None) => {
                let _ = transport.send_message(&generate_bye(None)).await;
                let _ = transport.shutdown().await;
                break None;
            }
            Step::Quiet => {
                if let Err(e) = transport.send_message(&generate_ping()).await {
                    break Some(e.to_string());
                }
            }
        }
    };
    let _ = incoming_tx.send(Incoming::Disconnected { reason }).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
