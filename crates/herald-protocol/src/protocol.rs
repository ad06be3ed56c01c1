//! The codec interface shared by both wire framings.
//!
//! Two framings carry the same message vocabulary: the line-oriented
//! text protocol (`evp`) and a JSON rendition used by web-facing
//! consumers, one object per line. A connection picks its codec at
//! handshake time and drives it through this interface.

use std::collections::BTreeSet;

use herald_event::Event;

use crate::error::ParseError;
use crate::message::ProtocolMessage;

pub trait Protocol: Send {
    /// Consume one line (terminator stripped). Returns a message when
    /// the line completes one.
    fn parse_line(&mut self, line: &str) -> Result<Option<ProtocolMessage>, ParseError>;

    /// Serialize an event, trailing newline included.
    fn generate_event(&self, event: &Event) -> String;

    /// Serialize a SUBSCRIBE (`None` = subscribe-all).
    fn generate_subscribe(&self, categories: Option<&BTreeSet<String>>) -> String;

    fn generate_bye(&self, message: Option<&str>) -> String;

    fn generate_ping(&self) -> String;
}

/// The line-oriented text framing.
#[derive(Default)]
pub struct EvpProtocol {
    parser: crate::parser::Parser,
}

impl EvpProtocol {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Protocol for EvpProtocol {
    fn parse_line(&mut self, line: &str) -> Result<Option<ProtocolMessage>, ParseError> {
        self.parser.feed_line(line)
    }

    fn generate_event(&self, event: &Event) -> String {
        crate::generator::generate_event(event)
    }

    fn generate_subscribe(&self, categories: Option<&BTreeSet<String>>) -> String {
        crate::generator::generate_subscribe(categories)
    }

    fn generate_bye(&self, message: Option<&str>) -> String {
        crate::generator::generate_bye(message)
    }

    fn generate_ping(&self) -> String {
        crate::generator::generate_ping()
    }
}

/// The JSON framing: one object per line.
#[derive(Default)]
pub struct JsonProtocol {
    terminal: bool,
}

impl JsonProtocol {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Protocol for JsonProtocol {
    fn parse_line(&mut self, line: &str) -> Result<Option<ProtocolMessage>, ParseError> {
        if self.terminal {
            return Err(ParseError::UnexpectedToken {
                token: line.to_owned(),
                state: "terminal",
            });
        }
        let message = crate::json::parse_message(line)?;
        if matches!(message, Some(ProtocolMessage::Bye(_))) {
            self.terminal = true;
        }
        Ok(message)
    }

    fn generate_event(&self, event: &Event) -> String {
        crate::json::generate_event(event)
    }

    fn generate_subscribe(&self, categories: Option<&BTreeSet<String>>) -> String {
        crate::json::generate_subscribe(categories)
    }

    fn generate_bye(&self, message: Option<&str>) -> String {
        crate::json::generate_bye(message)
    }

    fn generate_ping(&self) -> String {
        crate::json::generate_ping()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
