// herald-net: transport adapters and connection plumbing.
//
// Everything below the protocol codec lives here: the line-oriented
// transport contract and its stream/WebSocket implementations, TLS
// configuration for both ends, the connection URI grammar, and the
// exponential-backoff reconnect controller.

mod reconnect;
mod tls;
mod transport;
mod uri;
mod ws;

pub use reconnect::Reconnect;
pub use tls::{TlsError, client_config, server_config};
pub use transport::{
    DEFAULT_MAX_LINE, LineTransport, StreamTransport, TransportError,
};
pub use uri::{ConnectUri, DEFAULT_PORT, DialTarget, UriError};
pub use ws::{WS_SUBPROTOCOL, WS_SUBPROTOCOL_JSON, WsTransport};
