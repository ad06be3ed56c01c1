//! The resumable line parser.
//!
//! States:
//! - `Base` -- between messages; single-line messages and dot-message
//!   openers are recognized here.
//! - `DotEvent` -- inside `.EVENT … .`, collecting `DATA` lines.
//! - `DotSubscribe` -- inside `.SUBSCRIBE … .`, collecting categories.
//! - `Ignoring` -- inside an unknown dot message; payload is skipped with
//!   a nesting depth counter so embedded dot messages do not end the
//!   skip early.
//! - `Terminal` -- after BYE; nothing further is valid.
//!
//! Errors leave the parser in `Base` (or `Terminal` once reached) with any
//! partial message dropped, per the recovery rules of the protocol.

use std::collections::BTreeSet;

use herald_event::{Event, Value};
use uuid::Uuid;

use crate::error::ParseError;
use crate::message::ProtocolMessage;

enum State {
    Base,
    DotEvent,
    DotSubscribe,
    Ignoring { depth: usize },
    Terminal,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Base => "base",
            State::DotEvent => "dot message EVENT",
            State::DotSubscribe => "dot message SUBSCRIBE",
            State::Ignoring { .. } => "ignoring",
            State::Terminal => "terminal",
        }
    }
}

/// Line-at-a-time protocol parser.
pub struct Parser {
    state: State,
    /// Partial event while in `DotEvent`.
    event: Option<Event>,
    /// Partial category set while in `DotSubscribe`.
    categories: BTreeSet<String>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            state: State::Base,
            event: None,
            categories: BTreeSet::new(),
        }
    }

    /// True once a BYE has been parsed; every further line is an error.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Terminal)
    }

    /// Parse a buffer of one or more LF-separated lines, returning every
    /// message produced. A trailing fragment without its LF is parsed as a
    /// final line. Stops at the first error; messages parsed before the
    /// error are lost, matching the terminate-the-peer recovery policy.
    pub fn feed(&mut self, buffer: &str) -> Result<Vec<ProtocolMessage>, ParseError> {
        let mut out = Vec::new();
        for line in buffer.split('\n') {
            if line.is_empty() {
                continue;
            }
            if let Some(msg) = self.feed_line(line)? {
                out.push(msg);
            }
        }
        Ok(out)
    }

    /// Parse a single line (without its LF terminator; a trailing CR is
    /// trimmed). Returns a message when the line completes one.
    pub fn feed_line(&mut self, line: &str) -> Result<Option<ProtocolMessage>, ParseError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        match self.state {
            State::Base => self.line_in_base(line),
            State::DotEvent => self.line_in_dot_event(line),
            State::DotSubscribe => self.line_in_dot_subscribe(line),
            State::Ignoring { depth } => {
                self.line_in_ignoring(line, depth);
                Ok(None)
            }
            State::Terminal => Err(ParseError::UnexpectedToken {
                token: line.to_owned(),
                state: self.state.name(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Base state
    // -----------------------------------------------------------------------

    fn line_in_base(&mut self, line: &str) -> Result<Option<ProtocolMessage>, ParseError> {
        if line.is_empty() {
            // Tolerated: blank keep-alive noise between messages.
            return Ok(None);
        }
        if line == "." {
            return Err(ParseError::UnexpectedToken {
                token: ".".to_owned(),
                state: self.state.name(),
            });
        }

        let (dotted, body) = match line.strip_prefix('.') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (verb, args) = split_verb(body);

        match (dotted, verb) {
            (false, "EVENT") => {
                let event = parse_event_args(args)?;
                Ok(Some(ProtocolMessage::Event(event)))
            }
            (true, "EVENT") => {
                match parse_event_args(args) {
                    Ok(event) => {
                        self.event = Some(event);
                        self.state = State::DotEvent;
                        Ok(None)
                    }
                    Err(e) => {
                        // The dot message still has to be consumed; skip its
                        // payload so the stream stays line-synchronized.
                        self.state = State::Ignoring { depth: 1 };
                        Err(e)
                    }
                }
            }
            (false, "SUBSCRIBE") => match args {
                None => Ok(Some(ProtocolMessage::Subscribe(None))),
                Some(rest) => {
                    let mut words = rest.split_ascii_whitespace();
                    let category = words.next().ok_or_else(|| ParseError::Malformed {
                        detail: "SUBSCRIBE takes at most one category".to_owned(),
                    })?;
                    if words.next().is_some() {
                        return Err(ParseError::Malformed {
                            detail: "SUBSCRIBE takes at most one category".to_owned(),
                        });
                    }
                    let mut set = BTreeSet::new();
                    set.insert(category.to_owned());
                    Ok(Some(ProtocolMessage::Subscribe(Some(set))))
                }
            },
            (true, "SUBSCRIBE") => {
                if args.is_some() {
                    return Err(ParseError::Malformed {
                        detail: ".SUBSCRIBE does not take arguments".to_owned(),
                    });
                }
                self.categories.clear();
                self.state = State::DotSubscribe;
                Ok(None)
            }
            (false, "BYE") => {
                self.state = State::Terminal;
                Ok(Some(ProtocolMessage::Bye(args.map(str::to_owned))))
            }
            (false, "PING") => {
                if args.is_some() {
                    return Err(ParseError::Malformed {
                        detail: "PING does not take arguments".to_owned(),
                    });
                }
                // Keep-alive: read and dropped, no observable message.
                Ok(None)
            }
            (true, _) => {
                // Unknown dot message from a newer peer; skip its payload.
                self.state = State::Ignoring { depth: 1 };
                Ok(None)
            }
            (false, _) => Err(ParseError::UnexpectedToken {
                token: verb.to_owned(),
                state: self.state.name(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // DotEvent state
    // -----------------------------------------------------------------------

    fn line_in_dot_event(&mut self, line: &str) -> Result<Option<ProtocolMessage>, ParseError> {
        if line == "." {
            let event = self.event.take().expect("DotEvent state holds an event");
            self.state = State::Base;
            return Ok(Some(ProtocolMessage::Event(event)));
        }

        let content = match classify_dot_line(line) {
            DotLine::Stuffed(rest) => rest,
            DotLine::Garbage => {
                self.unwind();
                return Err(ParseError::Garbage {
                    line: line.to_owned(),
                });
            }
            DotLine::Nested => {
                // Dot messages do not nest inside an event; the embedded
                // message is skipped and the partial event dropped.
                self.unwind();
                self.state = State::Ignoring { depth: 1 };
                return Ok(None);
            }
            DotLine::Plain => line,
        };

        match self.parse_data_line(content) {
            Ok(()) => Ok(None),
            Err(e) => {
                self.unwind();
                Err(e)
            }
        }
    }

    fn parse_data_line(&mut self, line: &str) -> Result<(), ParseError> {
        let (verb, args) = split_verb(line);
        if verb != "DATA" {
            return Err(ParseError::UnexpectedToken {
                token: verb.to_owned(),
                state: self.state.name(),
            });
        }
        let args = args.ok_or_else(|| ParseError::Malformed {
            detail: "DATA takes a key and a value".to_owned(),
        })?;
        let (key, literal) = args.split_once(' ').ok_or_else(|| ParseError::Malformed {
            detail: "DATA takes a key and a value".to_owned(),
        })?;
        let value = Value::parse_literal(literal).map_err(|e| ParseError::Malformed {
            detail: format!("DATA content malformed: {}", e),
        })?;
        self.event
            .as_mut()
            .expect("DotEvent state holds an event")
            .add_data(key, value)
            .map_err(|e| ParseError::Malformed {
                detail: e.to_string(),
            })
    }

    // -----------------------------------------------------------------------
    // DotSubscribe state
    // -----------------------------------------------------------------------

    fn line_in_dot_subscribe(&mut self, line: &str) -> Result<Option<ProtocolMessage>, ParseError> {
        if line == "." {
            let categories = std::mem::take(&mut self.categories);
            self.state = State::Base;
            if categories.len() < 2 {
                return Err(ParseError::Malformed {
                    detail: "SUBSCRIBE dot message requires at least two categories".to_owned(),
                });
            }
            return Ok(Some(ProtocolMessage::Subscribe(Some(categories))));
        }

        let category = match classify_dot_line(line) {
            DotLine::Stuffed(rest) => rest,
            DotLine::Garbage => {
                self.unwind();
                return Err(ParseError::Garbage {
                    line: line.to_owned(),
                });
            }
            // A category may itself start with a dot; the broker decides
            // what to do with internal categories.
            DotLine::Nested | DotLine::Plain => line,
        };

        if category.contains(char::is_whitespace) {
            self.unwind();
            return Err(ParseError::Malformed {
                detail: format!("category {:?} is not a word", category),
            });
        }
        self.categories.insert(category.to_owned());
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Ignoring state
    // -----------------------------------------------------------------------

    fn line_in_ignoring(&mut self, line: &str, depth: usize) {
        if line == "." {
            if depth <= 1 {
                self.state = State::Base;
            } else {
                self.state = State::Ignoring { depth: depth - 1 };
            }
        } else if line.starts_with('.') && !line.starts_with("..") {
            self.state = State::Ignoring { depth: depth + 1 };
        }
        // Everything else, stuffed lines included, is skipped silently.
    }

    /// Drop partial dot-message state and return to `Base`.
    fn unwind(&mut self) {
        self.event = None;
        self.categories.clear();
        self.state = State::Base;
    }
}

// ---------------------------------------------------------------------------
// Line helpers
// ---------------------------------------------------------------------------

enum DotLine<'a> {
    /// `..x` -- one stuffing dot stripped, rest is literal content.
    Stuffed(&'a str),
    /// `.` followed by whitespace -- trailing bytes on a terminator.
    Garbage,
    /// `.WORD…` -- a nested dot-message opener.
    Nested,
    /// No leading dot.
    Plain,
}

/// Callers handle the bare terminator `.` before classifying, so `rest`
/// is never empty here.
fn classify_dot_line(line: &str) -> DotLine<'_> {
    match line.strip_prefix('.') {
        None => DotLine::Plain,
        Some(rest) if rest.starts_with('.') => DotLine::Stuffed(rest),
        Some(rest) if rest.starts_with(char::is_whitespace) => DotLine::Garbage,
        Some(_) => DotLine::Nested,
    }
}

/// Split a line into its verb and the raw argument tail.
fn split_verb(line: &str) -> (&str, Option<&str>) {
    match line.split_once(' ') {
        Some((verb, rest)) => (verb, Some(rest)),
        None => (line, None),
    }
}

/// Parse the `<uuid> <category> <name>` argument triple of EVENT.
fn parse_event_args(args: Option<&str>) -> Result<Event, ParseError> {
    let args = args.ok_or_else(|| ParseError::Malformed {
        detail: "EVENT takes a UUID, a category and a name".to_owned(),
    })?;
    let mut words = args.split_ascii_whitespace();
    let (uuid_str, category, name) = match (words.next(), words.next(), words.next(), words.next())
    {
        (Some(u), Some(c), Some(n), None) => (u, c, n),
        _ => {
            return Err(ParseError::Malformed {
                detail: "EVENT takes a UUID, a category and a name".to_owned(),
            });
        }
    };
    let uuid = Uuid::try_parse(uuid_str).map_err(|_| ParseError::WrongUuid {
        uuid: uuid_str.to_owned(),
    })?;
    Event::with_uuid(uuid, category, name).map_err(|e| ParseError::Malformed {
        detail: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn one(parser: &mut Parser, line: &str) -> ProtocolMessage {
        parser
            .feed_line(line)
            .expect(line)
            .unwrap_or_else(|| panic!("no message from {:?}", line))
    }

    #[test]
    fn single_line_event() {
        let mut p = Parser::new();
        let msg = one(&mut p, "EVENT 2e6894bb-cf96-462e-a435-766c9b1b4f8a test test");
        match msg {
            ProtocolMessage::Event(e) => {
                assert_eq!(e.category(), "test");
                assert_eq!(e.name(), "test");
                assert!(e.data().is_empty());
            }
            other => panic!("expected event, got {:?}", other),
        }
        // Parser is back in Base: a second message parses cleanly.
        one(&mut p, "EVENT 2e6894bb-cf96-462e-a435-766c9b1b4f8a test again");
    }

    #[test]
    fn dot_event_with_data() {
        let mut p = Parser::new();
        assert!(
            p.feed_line(".EVENT 8d099ddd-2b3b-4bd6-8ff7-374632032493 test greet")
                .unwrap()
                .is_none()
        );
        assert!(p.feed_line("DATA who 'world'").unwrap().is_none());
        match one(&mut p, ".") {
            ProtocolMessage::Event(e) => {
                assert_eq!(e.name(), "greet");
                assert_eq!(e.data_value("who"), Some(&Value::string("world")));
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn crlf_lines_are_tolerated() {
        let mut p = Parser::new();
        let msg = one(&mut p, "EVENT 2e6894bb-cf96-462e-a435-766c9b1b4f8a test test\r");
        assert!(matches!(msg, ProtocolMessage::Event(_)));
    }

    #[test]
    fn dot_stuffed_payload_roundtrips() {
        let mut p = Parser::new();
        p.feed_line(".EVENT 8d099ddd-2b3b-4bd6-8ff7-374632032493 test file")
            .unwrap();
        p.feed_line("DATA body '.\\ninside\\n'").unwrap();
        match one(&mut p, ".") {
            ProtocolMessage::Event(e) => {
                assert_eq!(e.data_value("body"), Some(&Value::string(".\ninside\n")));
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn wrong_uuid_single_line() {
        let mut p = Parser::new();
        match p.feed_line("EVENT not-a-uuid c n") {
            Err(ParseError::WrongUuid { uuid }) => assert_eq!(uuid, "not-a-uuid"),
            other => panic!("expected WrongUuid, got {:?}", other),
        }
        // Recoverable: state is still Base.
        one(&mut p, "EVENT 2e6894bb-cf96-462e-a435-766c9b1b4f8a test test");
    }

    #[test]
    fn wrong_uuid_dot_event_skips_payload() {
        let mut p = Parser::new();
        assert!(matches!(
            p.feed_line(".EVENT nope c n"),
            Err(ParseError::WrongUuid { .. })
        ));
        // The unfinished dot message is consumed in Ignoring state.
        assert!(p.feed_line("DATA who 'world'").unwrap().is_none());
        assert!(p.feed_line(".").unwrap().is_none());
        one(&mut p, "EVENT 2e6894bb-cf96-462e-a435-766c9b1b4f8a test test");
    }

    #[test]
    fn subscribe_all_and_one() {
        let mut p = Parser::new();
        assert_eq!(one(&mut p, "SUBSCRIBE"), ProtocolMessage::Subscribe(None));
        match one(&mut p, "SUBSCRIBE test") {
            ProtocolMessage::Subscribe(Some(set)) => {
                assert_eq!(set.len(), 1);
                assert!(set.contains("test"));
            }
            other => panic!("expected subscribe, got {:?}", other),
        }
    }

    #[test]
    fn repeated_subscribe_is_accepted() {
        let mut p = Parser::new();
        one(&mut p, "SUBSCRIBE a");
        one(&mut p, "SUBSCRIBE b");
        one(&mut p, "SUBSCRIBE");
    }

    #[test]
    fn dot_subscribe_needs_two_categories() {
        let mut p = Parser::new();
        p.feed_line(".SUBSCRIBE").unwrap();
        p.feed_line("only-one").unwrap();
        assert!(matches!(
            p.feed_line("."),
            Err(ParseError::Malformed { .. })
        ));

        let mut p = Parser::new();
        p.feed_line(".SUBSCRIBE").unwrap();
        p.feed_line("one").unwrap();
        p.feed_line("two").unwrap();
        match one(&mut p, ".") {
            ProtocolMessage::Subscribe(Some(set)) => {
                assert!(set.contains("one") && set.contains("two"));
            }
            other => panic!("expected subscribe, got {:?}", other),
        }
    }

    #[test]
    fn bye_reaches_terminal() {
        let mut p = Parser::new();
        assert_eq!(
            one(&mut p, "BYE so long"),
            ProtocolMessage::Bye(Some("so long".to_owned()))
        );
        assert!(p.is_terminal());
        assert!(matches!(
            p.feed_line("PING"),
            Err(ParseError::UnexpectedToken { .. })
        ));
    }

    #[test]
    fn ping_is_swallowed() {
        let mut p = Parser::new();
        assert!(p.feed_line("PING").unwrap().is_none());
        assert!(matches!(
            p.feed_line("PING extra"),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn unknown_verb_is_unexpected() {
        let mut p = Parser::new();
        assert!(matches!(
            p.feed_line("FROBNICATE now"),
            Err(ParseError::UnexpectedToken { .. })
        ));
    }

    #[test]
    fn unknown_dot_message_is_skipped_with_nesting() {
        let mut p = Parser::new();
        assert!(p.feed_line(".FUTURE verb args").unwrap().is_none());
        assert!(p.feed_line("payload").unwrap().is_none());
        assert!(p.feed_line(".NESTED").unwrap().is_none());
        assert!(p.feed_line(".").unwrap().is_none()); // closes .NESTED
        assert!(p.feed_line("..stuffed payload").unwrap().is_none());
        assert!(p.feed_line(".").unwrap().is_none()); // closes .FUTURE
        one(&mut p, "EVENT 2e6894bb-cf96-462e-a435-766c9b1b4f8a test test");
    }

    #[test]
    fn garbage_after_terminator() {
        let mut p = Parser::new();
        p.feed_line(".EVENT 8d099ddd-2b3b-4bd6-8ff7-374632032493 c n")
            .unwrap();
        assert!(matches!(
            p.feed_line(". trailing"),
            Err(ParseError::Garbage { .. })
        ));
        // Partial event was dropped; parser is usable again.
        one(&mut p, "EVENT 2e6894bb-cf96-462e-a435-766c9b1b4f8a test test");
    }

    #[test]
    fn malformed_data_unwinds_to_base() {
        let mut p = Parser::new();
        p.feed_line(".EVENT 8d099ddd-2b3b-4bd6-8ff7-374632032493 c n")
            .unwrap();
        assert!(matches!(
            p.feed_line("DATA key not-a-literal"),
            Err(ParseError::Malformed { .. })
        ));
        // The partial event is gone; "." is now unexpected in Base.
        assert!(matches!(
            p.feed_line("."),
            Err(ParseError::UnexpectedToken { .. })
        ));
        one(&mut p, "EVENT 2e6894bb-cf96-462e-a435-766c9b1b4f8a test test");
    }

    #[test]
    fn nested_dot_message_inside_event_drops_event() {
        let mut p = Parser::new();
        p.feed_line(".EVENT 8d099ddd-2b3b-4bd6-8ff7-374632032493 c n")
            .unwrap();
        p.feed_line("DATA who 'world'").unwrap();
        assert!(p.feed_line(".SURPRISE").unwrap().is_none());
        assert!(p.feed_line(".").unwrap().is_none()); // closes .SURPRISE
        // The event under construction was discarded, not emitted.
        assert!(matches!(
            p.feed_line("."),
            Err(ParseError::UnexpectedToken { .. })
        ));
    }

    #[test]
    fn feed_splits_buffers() {
        let mut p = Parser::new();
        let msgs = p
            .feed(
                ".EVENT 8d099ddd-2b3b-4bd6-8ff7-374632032493 test greet\nDATA who 'world'\n.\nSUBSCRIBE test\n",
            )
            .unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], ProtocolMessage::Event(_)));
        assert!(matches!(msgs[1], ProtocolMessage::Subscribe(Some(_))));
    }
}
