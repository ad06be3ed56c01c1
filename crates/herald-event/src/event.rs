//! The event record.
//!
//! An event is a single classified notification unit: a `<category>/<name>`
//! pair, a stable UUID, an optional timeout hint, and a string-keyed map of
//! typed data values. Events are built by a producer (or by the wire
//! parser), then treated as immutable once handed to the router.

use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

use crate::value::Value;

/// Timeout sentinel meaning "use the system default".
pub const TIMEOUT_UNSET: i64 = -1;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A single event crossing the wire.
///
/// `category` and `name` are non-empty words (no whitespace). A category
/// starting with `.` marks an internal event: it is delivered to the
/// action interface but never fans out to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    uuid: Uuid,
    category: String,
    name: String,
    timeout_ms: i64,
    data: BTreeMap<String, Value>,
    answers: Vec<String>,
}

impl Event {
    /// Create an event with a fresh v4 UUID.
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Result<Self, EventError> {
        Self::with_uuid(Uuid::new_v4(), category, name)
    }

    /// Create an event with an explicit UUID (used when re-materializing a
    /// received event; the UUID must survive forwarding unchanged).
    pub fn with_uuid(
        uuid: Uuid,
        category: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, EventError> {
        let category = category.into();
        let name = name.into();
        check_word(&category, "category")?;
        check_word(&name, "name")?;
        Ok(Event {
            uuid,
            category,
            name,
            timeout_ms: TIMEOUT_UNSET,
            data: BTreeMap::new(),
            answers: Vec::new(),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the category starts with `.` -- system/meta traffic that
    /// must never reach subscription fan-out.
    pub fn is_internal(&self) -> bool {
        self.category.starts_with('.')
    }

    /// Timeout hint in milliseconds; [`TIMEOUT_UNSET`] when the producer
    /// left it to the consumer's default.
    pub fn timeout_ms(&self) -> i64 {
        self.timeout_ms
    }

    pub fn set_timeout_ms(&mut self, timeout_ms: i64) {
        self.timeout_ms = timeout_ms;
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    pub fn data_value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Attach a named value. The key must be a word; re-adding a key
    /// replaces the previous value.
    pub fn add_data(&mut self, key: impl Into<String>, value: Value) -> Result<(), EventError> {
        let key = key.into();
        check_word(&key, "data key")?;
        self.data.insert(key, value);
        Ok(())
    }

    /// Permissible user responses, in the order the producer declared them.
    /// Consumed by notification frontends; not part of the wire encoding.
    pub fn answers(&self) -> &[String] {
        &self.answers
    }

    pub fn add_answer(&mut self, answer: impl Into<String>) {
        self.answers.push(answer.into());
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.uuid, self.category, self.name)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("{field} must be a non-empty word without whitespace, got {got:?}")]
    NotAWord { field: &'static str, got: String },
}

fn check_word(s: &str, field: &'static str) -> Result<(), EventError> {
    if s.is_empty() || s.chars().any(char::is_whitespace) {
        return Err(EventError::NotAWord {
            field,
            got: s.to_owned(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
