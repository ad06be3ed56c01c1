//! JSON rendition of the protocol, one object per line.
//!
//! Used by web-facing consumers that would rather not implement the
//! dot-message framing. The vocabulary is identical; `message-type`
//! discriminates:
//!
//! ```json
//! {"message-type":"event","uuid":"…","category":"c","name":"n",
//!  "answers":["yes"],"data":{"who":"'world'"}}
//! {"message-type":"subscribe","categories":["mail","im"]}
//! {"message-type":"bye","message":"done"}
//! {"message-type":"ping"}
//! ```
//!
//! Data values carry their text-literal encoding inside JSON strings; a
//! value that does not parse as a literal is taken as a bare string, so
//! peers that send raw text interoperate.

use std::collections::BTreeSet;

use herald_event::{Event, Value};
use serde_json::{Map, json};
use uuid::Uuid;

use crate::error::ParseError;
use crate::message::ProtocolMessage;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one JSON message. Unknown `message-type`s from newer peers are
/// skipped, mirroring the unknown-dot-message rule of the text framing.
pub fn parse_message(line: &str) -> Result<Option<ProtocolMessage>, ParseError> {
    let root: serde_json::Value =
        serde_json::from_str(line).map_err(|e| ParseError::Malformed {
            detail: format!("invalid JSON: {}", e),
        })?;
    let object = root.as_object().ok_or_else(|| ParseError::UnexpectedToken {
        token: line.chars().take(16).collect(),
        state: "json",
    })?;

    let message_type = object
        .get("message-type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ParseError::Malformed {
            detail: "missing message-type".to_owned(),
        })?;

    match message_type {
        "event" => parse_event(object).map(Some),
        "subscribe" => parse_subscribe(object).map(Some),
        "bye" => {
            let message = match object.get("message") {
                None => None,
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(_) => {
                    return Err(ParseError::Malformed {
                        detail: "bye message must be a string".to_owned(),
                    });
                }
            };
            Ok(Some(ProtocolMessage::Bye(message)))
        }
        "ping" => Ok(None),
        _ => Ok(None),
    }
}

fn parse_event(object: &Map<String, serde_json::Value>) -> Result<ProtocolMessage, ParseError> {
    let uuid_str = require_str(object, "uuid")?;
    let uuid = Uuid::try_parse(uuid_str).map_err(|_| ParseError::WrongUuid {
        uuid: uuid_str.to_owned(),
    })?;
    let category = require_str(object, "category")?;
    let name = require_str(object, "name")?;
    let mut event =
        Event::with_uuid(uuid, category, name).map_err(|e| ParseError::Malformed {
            detail: e.to_string(),
        })?;

    if let Some(answers) = object.get("answers") {
        let answers = answers.as_array().ok_or_else(|| ParseError::Malformed {
            detail: "answers must be an array".to_owned(),
        })?;
        for answer in answers {
            let answer = answer.as_str().ok_or_else(|| ParseError::Malformed {
                detail: "answers must be strings".to_owned(),
            })?;
            event.add_answer(answer);
        }
    }

    if let Some(data) = object.get("data") {
        let data = data.as_object().ok_or_else(|| ParseError::Malformed {
            detail: "data must be an object".to_owned(),
        })?;
        for (key, raw) in data {
            let raw = raw.as_str().ok_or_else(|| ParseError::Malformed {
                detail: format!("data value for {:?} must be a string", key),
            })?;
            let value = Value::parse_literal(raw)
                .unwrap_or_else(|_| Value::String(raw.to_owned()));
            event
                .add_data(key, value)
                .map_err(|e| ParseError::Malformed {
                    detail: e.to_string(),
                })?;
        }
    }

    Ok(ProtocolMessage::Event(event))
}

fn parse_subscribe(
    object: &Map<String, serde_json::Value>,
) -> Result<ProtocolMessage, ParseError> {
    let Some(categories) = object.get("categories") else {
        return Ok(ProtocolMessage::Subscribe(None));
    };
    let categories = categories.as_array().ok_or_else(|| ParseError::Malformed {
        detail: "categories must be an array".to_owned(),
    })?;
    if categories.is_empty() {
        return Ok(ProtocolMessage::Subscribe(None));
    }
    let mut set = BTreeSet::new();
    for category in categories {
        let category = category.as_str().ok_or_else(|| ParseError::Malformed {
            detail: "categories must be strings".to_owned(),
        })?;
        set.insert(category.to_owned());
    }
    Ok(ProtocolMessage::Subscribe(Some(set)))
}

fn require_str<'a>(
    object: &'a Map<String, serde_json::Value>,
    key: &str,
) -> Result<&'a str, ParseError> {
    object
        .get(key)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ParseError::Malformed {
            detail: format!("missing or non-string {:?}", key),
        })
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

pub fn generate_event(event: &Event) -> String {
    let mut object = Map::new();
    object.insert("message-type".to_owned(), json!("event"));
    object.insert("uuid".to_owned(), json!(event.uuid().to_string()));
    object.insert("category".to_owned(), json!(event.category()));
    object.insert("name".to_owned(), json!(event.name()));
    if !event.answers().is_empty() {
        object.insert("answers".to_owned(), json!(event.answers()));
    }
    if !event.data().is_empty() {
        let data: Map<String, serde_json::Value> = event
            .data()
            .iter()
            .map(|(key, value)| (key.clone(), json!(value.to_string())))
            .collect();
        object.insert("data".to_owned(), serde_json::Value::Object(data));
    }
    finish(object)
}

pub fn generate_subscribe(categories: Option<&BTreeSet<String>>) -> String {
    let mut object = Map::new();
    object.insert("message-type".to_owned(), json!("subscribe"));
    if let Some(categories) = categories {
        if !categories.is_empty() {
            object.insert("categories".to_owned(), json!(categories));
        }
    }
    finish(object)
}

pub fn generate_bye(message: Option<&str>) -> String {
    let mut object = Map::new();
    object.insert("message-type".to_owned(), json!("bye"));
    if let Some(message) = message {
        object.insert("message".to_owned(), json!(message));
    }
    finish(object)
}

pub fn generate_ping() -> String {
    let mut object = Map::new();
    object.insert("message-type".to_owned(), json!("ping"));
    finish(object)
}

fn finish(object: Map<String, serde_json::Value>) -> String {
    let mut out = serde_json::Value::Object(object).to_string();
    out.push('\n');
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
