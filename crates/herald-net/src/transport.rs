//! The line-oriented transport contract and its byte-stream implementation.
//!
//! A transport hands the codec whole lines (LF-delimited, terminator
//! stripped) and writes complete generated messages without interleaving.
//! Close is reported as `Ok(None)` from `next_line`, distinct from errors.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default bound on a single protocol line: 16 MiB.
pub const DEFAULT_MAX_LINE: usize = 16 * 1024 * 1024;

const INITIAL_BUF_CAPACITY: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line exceeds the {limit}-byte limit")]
    LineTooLong { limit: usize },
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("websocket error: {0}")]
    Ws(String),
    #[error("peer sent a binary frame")]
    BinaryFrame,
    #[error("text frame missing its trailing newline")]
    UnterminatedFrame,
    #[error("connection is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// LineTransport
// ---------------------------------------------------------------------------

/// Uniform contract the codec sees, whatever the wire underneath.
#[async_trait]
pub trait LineTransport: Send {
    /// Next line with its LF stripped; `Ok(None)` on clean close.
    ///
    /// Cancel-safe: partially received bytes stay buffered inside the
    /// transport, so dropping the future loses nothing.
    async fn next_line(&mut self) -> Result<Option<String>, TransportError>;

    /// Write one complete generated message (which may span several
    /// lines). The message is never interleaved with another's bytes.
    async fn send_message(&mut self, message: &str) -> Result<(), TransportError>;

    /// Orderly close, distinct from dropping on error.
    async fn shutdown(&mut self) -> Result<(), TransportError>;

    /// Close after a protocol violation. Framed transports surface the
    /// reason in their close handshake; byte streams just close.
    async fn shutdown_on_error(&mut self, _reason: &str) -> Result<(), TransportError> {
        self.shutdown().await
    }
}

// ---------------------------------------------------------------------------
// StreamTransport
// ---------------------------------------------------------------------------

/// Line transport over any byte stream: Unix socket, TCP, or TLS-wrapped
/// TCP all behave identically once connected.
pub struct StreamTransport<S> {
    stream: S,
    buf: BytesMut,
    max_line: usize,
    /// Bytes already scanned for LF, so repeated reads stay linear.
    scanned: usize,
    eof: bool,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self::with_max_line(stream, DEFAULT_MAX_LINE)
    }

    pub fn with_max_line(stream: S, max_line: usize) -> Self {
        StreamTransport {
            stream,
            buf: BytesMut::with_capacity(INITIAL_BUF_CAPACITY),
            max_line,
            scanned: 0,
            eof: false,
        }
    }

    /// Take a complete line out of the buffer, if one is there.
    fn take_line(&mut self) -> Result<Option<String>, TransportError> {
        if let Some(nl) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + nl;
            let line = self.buf.split_to(end + 1);
            self.scanned = 0;
            let text = std::str::from_utf8(&line[..end]).map_err(|_| TransportError::NotUtf8)?;
            return Ok(Some(text.to_owned()));
        }
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line {
            return Err(TransportError::LineTooLong {
                limit: self.max_line,
            });
        }
        Ok(None)
    }
}

#[async_trait]
impl<S> LineTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_line(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(Some(line));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                // Final unterminated fragment at EOF is delivered as a line.
                let rest = self.buf.split_to(self.buf.len());
                self.scanned = 0;
                let text =
                    std::str::from_utf8(&rest).map_err(|_| TransportError::NotUtf8)?;
                return Ok(Some(text.to_owned()));
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                self.eof = true;
            }
        }
    }

    async fn send_message(&mut self, message: &str) -> Result<(), TransportError> {
        self.stream.write_all(message.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
