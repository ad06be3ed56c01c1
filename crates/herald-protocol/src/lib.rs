// herald-protocol: wire-protocol parsers and generators.
//
// The primary framing is line-oriented UTF-8 text, LF-terminated (a
// trailing CR is tolerated and trimmed). Single-line messages carry their
// whole meaning; multi-line "dot messages" open with `.VERB`, carry one
// payload line per row, and close with a lone `.`. A literal payload line
// starting with `.` is escaped by doubling the leading dot
// ("dot-stuffing").
//
// The parser is a resumable state machine: it accepts one line at a time
// and keeps partial dot-message state across calls, so callers can hand it
// lines as they arrive from any transport.
//
// A second framing carries the same vocabulary as one JSON object per
// line (see `json`); the `Protocol` trait lets a connection drive either
// codec once the handshake has picked one.

mod error;
mod generator;
pub mod json;
mod message;
mod parser;
mod protocol;

pub use error::ParseError;
pub use generator::{generate_bye, generate_event, generate_ping, generate_subscribe};
pub use message::ProtocolMessage;
pub use parser::Parser;
pub use protocol::{EvpProtocol, JsonProtocol, Protocol};
