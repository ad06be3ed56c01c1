//! Message generation -- the dual of the parser.
//!
//! All stuffing of payload lines happens here so transports only ever see
//! finished, escaped messages.

use std::collections::BTreeSet;
use std::fmt::Write;

use herald_event::Event;

/// Generate an EVENT message: the single-line form when the event carries
/// no data, the dot-message form otherwise.
pub fn generate_event(event: &Event) -> String {
    if event.data().is_empty() {
        return format!(
            "EVENT {} {} {}\n",
            event.uuid(),
            event.category(),
            event.name()
        );
    }

    let mut out = String::with_capacity(64 + event.data().len() * 32);
    let _ = writeln!(
        out,
        ".EVENT {} {} {}",
        event.uuid(),
        event.category(),
        event.name()
    );
    for (key, value) in event.data() {
        let line = format!("DATA {} {}", key, value);
        push_stuffed_line(&mut out, &line);
    }
    out.push_str(".\n");
    out
}

/// Generate a SUBSCRIBE message. `None` or an empty set is subscribe-all;
/// one category uses the single-line form; two or more use the dot form.
pub fn generate_subscribe(categories: Option<&BTreeSet<String>>) -> String {
    let categories = match categories {
        None => return "SUBSCRIBE\n".to_owned(),
        Some(c) if c.is_empty() => return "SUBSCRIBE\n".to_owned(),
        Some(c) => c,
    };
    if categories.len() == 1 {
        let only = categories.iter().next().expect("len checked");
        return format!("SUBSCRIBE {}\n", only);
    }

    let mut out = String::from(".SUBSCRIBE\n");
    for category in categories {
        push_stuffed_line(&mut out, category);
    }
    out.push_str(".\n");
    out
}

pub fn generate_bye(message: Option<&str>) -> String {
    match message {
        Some(m) => format!("BYE {}\n", m),
        None => "BYE\n".to_owned(),
    }
}

pub fn generate_ping() -> String {
    "PING\n".to_owned()
}

/// Append one payload line, doubling a leading dot so the line cannot be
/// mistaken for a terminator or a nested dot message.
fn push_stuffed_line(out: &mut String, line: &str) {
    if line.starts_with('.') {
        out.push('.');
    }
    out.push_str(line);
    out.push('\n');
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
