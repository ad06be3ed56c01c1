//! WebSocket line transport.
//!
//! One text frame carries one or more LF-terminated protocol lines. The
//! adapter enforces the framing rules itself:
//!
//! - binary frames close the connection with `UnsupportedData`
//! - a text frame missing its trailing LF closes with `ProtocolError`
//! - an orderly shutdown (after BYE) closes with `Normal`
//!
//! Dot-stuffing is not this layer's business; frames already carry
//! finished protocol lines.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

use crate::transport::{LineTransport, TransportError};

/// Subprotocol name offered and accepted during the HTTP upgrade.
pub const WS_SUBPROTOCOL: &str = "evp";

/// Subprotocol selecting the JSON framing instead of the text one.
pub const WS_SUBPROTOCOL_JSON: &str = "evp-json";

/// Line transport over an established WebSocket (either role).
pub struct WsTransport<S> {
    ws: WebSocketStream<S>,
    /// Lines from the last frame not yet handed to the codec.
    pending: VecDeque<String>,
    closed: bool,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        WsTransport {
            ws,
            pending: VecDeque::new(),
            closed: false,
        }
    }

    async fn close_with(&mut self, code: CloseCode, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        let _ = self.ws.close(Some(frame)).await;
    }

    /// Split one text frame into protocol lines, enforcing the trailing-LF
    /// rule. A lone trailing CR per line is trimmed later by the parser.
    fn split_frame(payload: &str) -> Result<Vec<String>, TransportError> {
        match payload.strip_suffix('\n') {
            None => Err(TransportError::UnterminatedFrame),
            Some(body) => Ok(body
                .split('\n')
                .map(str::to_owned)
                .collect()),
        }
    }
}

#[async_trait]
impl<S> LineTransport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_line(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
            if self.closed {
                return Ok(None);
            }
            match self.ws.next().await {
                None => {
                    self.closed = true;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.closed = true;
                    return Err(TransportError::Ws(e.to_string()));
                }
                Some(Ok(Message::Text(payload))) => match Self::split_frame(payload.as_str()) {
                    Ok(lines) => self.pending.extend(lines),
                    Err(e) => {
                        self.close_with(CloseCode::Protocol, "missing ending new line")
                            .await;
                        return Err(e);
                    }
                },
                Some(Ok(Message::Binary(_))) => {
                    self.close_with(CloseCode::Unsupported, "data must be UTF-8 text")
                        .await;
                    return Err(TransportError::BinaryFrame);
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    self.closed = true;
                    return Ok(None);
                }
                Some(Ok(_)) => {}
            }
        }
    }

    async fn send_message(&mut self, message: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.ws
            .send(Message::Text(message.to_owned().into()))
            .await
            .map_err(|e| TransportError::Ws(e.to_string()))
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.close_with(CloseCode::Normal, "").await;
        Ok(())
    }

    async fn shutdown_on_error(&mut self, reason: &str) -> Result<(), TransportError> {
        self.close_with(CloseCode::Protocol, reason).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
