use std::collections::BTreeSet;

use herald_event::Event;

/// One complete message observed on (or destined for) the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    /// `EVENT` / `.EVENT` -- a published event.
    Event(Event),
    /// `SUBSCRIBE` family. `None` means subscribe-all; `Some` carries the
    /// requested categories.
    Subscribe(Option<BTreeSet<String>>),
    /// `BYE` with its optional farewell text.
    Bye(Option<String>),
    /// `PING` keep-alive. Generated by long-lived clients; the parser
    /// swallows inbound pings without surfacing them.
    Ping,
}
