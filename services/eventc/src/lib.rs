//! eventc: basic CLI client for the broker.
//!
//! Two modes:
//! - send: `eventc <category> <name> [<uuid>]` publishes one event built
//!   from `--data`/`--data-string`/`--data-file` arguments. Passing an
//!   empty string as the UUID prints the generated one on stdout so a
//!   later call can reference the same event.
//! - subscribe: `eventc --subscribe [<category>...]` waits for events of
//!   the given categories (all of them when none is named) and prints
//!   each to stdout.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use herald_client::{ClientError, ConnectOptions, Connection, Incoming};
use herald_event::{Event, EventError, Value};
use herald_net::{ConnectUri, Reconnect, UriError};
use tokio::sync::mpsc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EventcError {
    #[error("invalid data argument {arg:?}: expected <name>=<value>")]
    BadDataArg { arg: String },
    #[error("invalid UUID {uuid:?}")]
    BadUuid { uuid: String },
    #[error("reading {path}: {source}")]
    DataFile {
        path: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("could not connect after {tries} attempts")]
    OutOfTries { tries: u32 },
}

// ---------------------------------------------------------------------------
// Data arguments
// ---------------------------------------------------------------------------

/// `--data <name>=<literal>`: the value is parsed with the literal
/// grammar; anything that does not parse is taken as a bare string.
pub fn parse_data_arg(arg: &str) -> Result<(String, Value), EventcError> {
    let (name, raw) = split_data_arg(arg)?;
    let value = Value::parse_literal(raw).unwrap_or_else(|_| Value::String(raw.to_owned()));
    Ok((name.to_owned(), value))
}

/// `--data-string <name>=<string>`: the value is always a plain string.
pub fn parse_data_string_arg(arg: &str) -> Result<(String, Value), EventcError> {
    let (name, raw) = split_data_arg(arg)?;
    Ok((name.to_owned(), Value::String(raw.to_owned())))
}

/// `--data-file <name>=[<mime-type>@]<filename>`: the file's bytes become
/// a binary payload with the optional MIME type.
pub fn parse_data_file_arg(arg: &str) -> Result<(String, Value), EventcError> {
    let (name, spec) = split_data_arg(arg)?;
    let (mime, path) = match spec.split_once('@') {
        Some((mime, path)) if !mime.is_empty() => (Some(mime.to_owned()), path),
        _ => (None, spec),
    };
    let bytes = std::fs::read(Path::new(path)).map_err(|source| EventcError::DataFile {
        path: path.to_owned(),
        source,
    })?;
    Ok((name.to_owned(), Value::Binary { mime, bytes }))
}

fn split_data_arg(arg: &str) -> Result<(&str, &str), EventcError> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name, value)),
        _ => Err(EventcError::BadDataArg {
            arg: arg.to_owned(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Event assembly
// ---------------------------------------------------------------------------

pub struct SendRequest {
    pub category: String,
    pub name: String,
    /// `None` generates a fresh UUID; `Some("")` also generates one but
    /// asks for it to be printed.
    pub uuid: Option<String>,
    pub data: Vec<(String, Value)>,
}

pub fn build_event(request: &SendRequest) -> Result<(Event, bool), EventcError> {
    let (uuid, print_uuid) = match request.uuid.as_deref() {
        None => (Uuid::new_v4(), false),
        Some("") => (Uuid::new_v4(), true),
        Some(s) => (
            Uuid::try_parse(s).map_err(|_| EventcError::BadUuid { uuid: s.to_owned() })?,
            false,
        ),
    };
    let mut event = Event::with_uuid(uuid, request.category.clone(), request.name.clone())?;
    for (name, value) in &request.data {
        event.add_data(name.clone(), value.clone())?;
    }
    Ok((event, print_uuid))
}

/// Render one received event the way the subscribe mode prints it.
pub fn format_event(event: &Event) -> String {
    let mut out = format!("{} {} {}", event.uuid(), event.category(), event.name());
    for (key, value) in event.data() {
        out.push_str(&format!("\n    {} {}", key, value));
    }
    out
}

// ---------------------------------------------------------------------------
// Connection with bounded retries
// ---------------------------------------------------------------------------

pub struct ClientOptions {
    pub uri: Option<String>,
    pub identity: Option<String>,
    pub insecure: bool,
    pub ping_interval: Option<Duration>,
    pub max_tries: u32,
}

/// Resolve the target URI and connect, retrying with backoff up to
/// `max_tries` attempts (0 = infinite).
pub async fn connect(
    options: &ClientOptions,
) -> Result<(Connection, mpsc::Receiver<Incoming>), EventcError> {
    let uri = match &options.uri {
        Some(uri) => ConnectUri::parse(uri)?,
        None => Connection::default_uri()?,
    };
    let connect_options = ConnectOptions {
        accept_unknown_ca: options.insecure,
        server_identity: options.identity.clone(),
        ping_interval: options.ping_interval,
        ..ConnectOptions::default()
    };
    let mut connection = Connection::new(uri, connect_options);

    let (mut reconnect, mut retry_rx) = Reconnect::new(Duration::from_secs(1), options.max_tries);
    let mut tries = 0u32;
    loop {
        match connection.connect().await {
            Ok(rx) => return Ok((connection, rx)),
            Err(error) => {
                tries += 1;
                tracing::warn!(%error, tries, "connect failed");
                if !reconnect.try_schedule() {
                    return Err(EventcError::OutOfTries { tries });
                }
                let _ = retry_rx.recv().await;
            }
        }
    }
}

/// Send one event and close cleanly. Returns the UUID to print, if any.
pub async fn run_send(
    options: &ClientOptions,
    request: &SendRequest,
) -> Result<Option<Uuid>, EventcError> {
    let (event, print_uuid) = build_event(request)?;
    let (mut connection, _rx) = connect(options).await?;
    connection.send_event(&event).await?;
    connection.close().await;
    Ok(print_uuid.then(|| event.uuid()))
}

/// Subscribe and hand every received event to `on_event` until the peer
/// goes away.
pub async fn run_subscribe(
    options: &ClientOptions,
    categories: &[String],
    mut on_event: impl FnMut(&Event),
) -> Result<(), EventcError> {
    let (mut connection, mut rx) = connect(options).await?;
    let request: Option<BTreeSet<String>> = if categories.is_empty() {
        None
    } else {
        Some(categories.iter().cloned().collect())
    };
    connection.subscribe(request.as_ref()).await?;

    while let Some(incoming) = rx.recv().await {
        match incoming {
            Incoming::Event(event) => on_event(&event),
            Incoming::Disconnected { reason } => {
                if let Some(reason) = reason {
                    tracing::warn!(%reason, "disconnected");
                }
                break;
            }
        }
    }
    connection.close().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn data_arg_parses_literals_with_string_fallback() {
        let (name, value) = parse_data_arg("count=42").unwrap();
        assert_eq!(name, "count");
        assert_eq!(value, Value::Integer(42));

        let (_, value) = parse_data_arg("who='world'").unwrap();
        assert_eq!(value, Value::string("world"));

        // Not a literal: taken as a raw string.
        let (_, value) = parse_data_arg("who=world").unwrap();
        assert_eq!(value, Value::string("world"));

        assert!(matches!(
            parse_data_arg("nameonly"),
            Err(EventcError::BadDataArg { .. })
        ));
        assert!(matches!(
            parse_data_arg("=value"),
            Err(EventcError::BadDataArg { .. })
        ));
    }

    #[test]
    fn data_string_arg_never_parses() {
        let (_, value) = parse_data_string_arg("count=42").unwrap();
        assert_eq!(value, Value::string("42"));
    }

    #[test]
    fn data_file_arg_reads_bytes_and_mime() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x89PNG").unwrap();
        let path = file.path().display().to_string();

        let (name, value) = parse_data_file_arg(&format!("icon=image/png@{}", path)).unwrap();
        assert_eq!(name, "icon");
        assert_eq!(
            value,
            Value::Binary {
                mime: Some("image/png".to_owned()),
                bytes: b"\x89PNG".to_vec(),
            }
        );

        let (_, value) = parse_data_file_arg(&format!("blob={}", path)).unwrap();
        assert!(matches!(value, Value::Binary { mime: None, .. }));
    }

    #[test]
    fn build_event_uuid_modes() {
        let mut request = SendRequest {
            category: "test".to_owned(),
            name: "cli".to_owned(),
            uuid: None,
            data: vec![("who".to_owned(), Value::string("world"))],
        };
        let (event, print) = build_event(&request).unwrap();
        assert!(!print);
        assert_eq!(event.data().len(), 1);

        request.uuid = Some(String::new());
        let (_, print) = build_event(&request).unwrap();
        assert!(print);

        request.uuid = Some("2e6894bb-cf96-462e-a435-766c9b1b4f8a".to_owned());
        let (event, print) = build_event(&request).unwrap();
        assert!(!print);
        assert_eq!(
            event.uuid().to_string(),
            "2e6894bb-cf96-462e-a435-766c9b1b4f8a"
        );

        request.uuid = Some("nope".to_owned());
        assert!(matches!(
            build_event(&request),
            Err(EventcError::BadUuid { .. })
        ));
    }

    #[test]
    fn format_event_lists_data() {
        let mut event = Event::new("test", "greet").unwrap();
        event.add_data("who", Value::string("world")).unwrap();
        let text = format_event(&event);
        assert!(text.ends_with("test greet\n    who 'world'"));
    }

    #[tokio::test]
    async fn connect_gives_up_after_max_tries() {
        // Reserve a port with nothing listening behind it.
        let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = dead.local_addr().unwrap();
        drop(dead);

        let options = ClientOptions {
            uri: Some(format!("tcp://127.0.0.1:{}", addr.port())),
            identity: None,
            insecure: false,
            ping_interval: None,
            max_tries: 2,
        };
        match connect(&options).await {
            Err(EventcError::OutOfTries { tries }) => assert_eq!(tries, 3),
            other => panic!("expected OutOfTries, got {:?}", other.map(|_| ())),
        }
    }
}
