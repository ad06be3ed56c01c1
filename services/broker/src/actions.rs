//! The action interface: the outbound contract toward consumer plugins.
//!
//! The router calls [`Action::dispatch`] exactly once per admitted event,
//! internal ones included. Dispatch runs on the router task, so an
//! implementation must not block and must not call back into the router;
//! anything heavier than queueing belongs on the action's own task.

use herald_event::Event;
use tracing::info;

/// A consumer plugin as the router sees it.
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    /// Side-effecting, non-blocking, no synchronous re-entry into the
    /// broker.
    fn dispatch(&self, event: &Event);
}

/// Boxed action produced at configuration time.
pub type ActionHandle = Box<dyn Action>;

/// Build one action from its config section. `None` when the section
/// disables it or names an unknown action.
pub fn parse_action(name: &str, value: &toml::Value) -> Option<ActionHandle> {
    match name {
        "log" => match value {
            toml::Value::Boolean(true) => Some(Box::new(LogAction)),
            _ => None,
        },
        "file" => match value {
            toml::Value::String(path) => FileAction::open(std::path::Path::new(path))
                .map(|action| Box::new(action) as ActionHandle)
                .map_err(|error| {
                    tracing::warn!(path, %error, "file action disabled");
                    error
                })
                .ok(),
            _ => None,
        },
        _ => None,
    }
}

/// Build every configured action.
pub fn parse_actions(sections: &toml::value::Table) -> Vec<ActionHandle> {
    sections
        .iter()
        .filter_map(|(name, value)| parse_action(name, value))
        .collect()
}

// ---------------------------------------------------------------------------
// LogAction
// ---------------------------------------------------------------------------

/// Writes every admitted event to the structured log.
pub struct LogAction;

impl Action for LogAction {
    fn name(&self) -> &str {
        "log"
    }

    fn dispatch(&self, event: &Event) {
        info!(
            uuid = %event.uuid(),
            category = event.category(),
            name = event.name(),
            data = event.data().len(),
            "event"
        );
    }
}

// ---------------------------------------------------------------------------
// FileAction
// ---------------------------------------------------------------------------

/// Appends one line per event to a file. Dispatch only queues the
/// formatted line; a dedicated task owns the file handle, so the router
/// never waits on disk.
pub struct FileAction {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
}

impl FileAction {
    pub fn open(path: &std::path::Path) -> std::io::Result<Self> {
        use std::io::Write;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(error) = writeln!(file, "{}", line) {
                    tracing::warn!(%error, "event file write failed");
                    break;
                }
            }
        });
        Ok(FileAction { tx })
    }
}

impl Action for FileAction {
    fn name(&self) -> &str {
        "file"
    }

    fn dispatch(&self, event: &Event) {
        let mut line = format!("{} {} {}", event.uuid(), event.category(), event.name());
        for (key, value) in event.data() {
            line.push_str(&format!(" {}={}", key, value));
        }
        let _ = self.tx.send(line);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use herald_event::Value;

    #[test]
    fn parse_action_knows_log() {
        assert!(parse_action("log", &toml::Value::Boolean(true)).is_some());
        assert!(parse_action("log", &toml::Value::Boolean(false)).is_none());
        assert!(parse_action("nope", &toml::Value::Boolean(true)).is_none());
    }

    #[tokio::test]
    async fn parse_actions_collects_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let toml_str = format!("log = true\nunknown = true\nfile = {:?}", path);
        let table: toml::value::Table = toml::from_str(&toml_str).unwrap();
        let actions = parse_actions(&table);
        assert_eq!(actions.len(), 2);
        let mut names: Vec<&str> = actions.iter().map(|a| a.name()).collect();
        names.sort_unstable();
        assert_eq!(names, ["file", "log"]);
    }

    #[tokio::test]
    async fn file_action_appends_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let action = FileAction::open(&path).unwrap();

        let mut event = Event::new("test", "written").unwrap();
        event.add_data("who", Value::string("disk")).unwrap();
        action.dispatch(&event);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("test written"));
        assert!(contents.contains("who='disk'"));
    }
}

