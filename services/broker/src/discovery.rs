//! Discovery oracle interface.
//!
//! The relay does not browse the network itself; an oracle feeds it
//! `{peer-name → connect-address}` updates. DNS-SD and SSDP providers
//! live outside this crate; in-tree there is a static provider that
//! announces configured peers once at startup.

use herald_net::ConnectUri;
use tokio::sync::mpsc;

/// One oracle observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// `name` is reachable at `uri` from now on.
    Found { name: String, uri: ConnectUri },
    /// `name` went away; any connection to it should be closed until a
    /// new `Found` arrives.
    Lost { name: String },
}

/// A source of discovery events.
pub trait DiscoveryOracle: Send {
    /// Begin producing events into `sink`. Called once.
    fn start(&mut self, sink: mpsc::Sender<DiscoveryEvent>);

    /// Stop producing events. Idempotent.
    fn stop(&mut self);
}

// ---------------------------------------------------------------------------
// StaticOracle
// ---------------------------------------------------------------------------

/// Announces a fixed name → address table once. Stands in for a network
/// browser when peers are known ahead of time.
pub struct StaticOracle {
    entries: Vec<(String, ConnectUri)>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl StaticOracle {
    pub fn new(entries: Vec<(String, ConnectUri)>) -> Self {
        StaticOracle {
            entries,
            task: None,
        }
    }
}

impl DiscoveryOracle for StaticOracle {
    fn start(&mut self, sink: mpsc::Sender<DiscoveryEvent>) {
        let entries = self.entries.clone();
        self.task = Some(tokio::spawn(async move {
            for (name, uri) in entries {
                if sink
                    .send(DiscoveryEvent::Found { name, uri })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
