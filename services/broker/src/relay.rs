//! Relay: the outbound link that forwards selected local events to a
//! remote broker and re-injects whatever the remote fans back.
//!
//! Each configured relay runs one task. Locally it is a dedicated
//! subscribe-all peer, so origin suppression keeps re-injected events
//! from bouncing straight back through the tables; the upstream
//! direction is guarded by remembering the UUIDs of recently forwarded
//! events and dropping them when the remote echoes them down again.
//!
//! Connection loss feeds the exponential-backoff controller. When the
//! try budget runs out the relay goes dormant until a control command
//! or a discovery announcement revives it.

use std::collections::{HashSet, VecDeque};

use herald_client::{ClientError, ConnectOptions, Connection, Incoming};
use herald_event::Event;
use herald_net::{ConnectUri, Reconnect};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{RelayConfig, RelayTarget};
use crate::discovery::DiscoveryEvent;
use crate::router::{PeerKind, RouterHandle};

// ---------------------------------------------------------------------------
// Control surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// Waiting on the discovery oracle for an address.
    NoAddress,
    Disconnected,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("no such relay {name:?}")]
    UnknownRelay { name: String },
    #[error("relay {name:?} is gone")]
    Gone { name: String },
}

enum Ctl {
    Connect,
    Disconnect,
    Status(oneshot::Sender<RelayStatus>),
    Found(ConnectUri),
    Lost,
}

struct RelayEntry {
    ctl_tx: mpsc::Sender<Ctl>,
    /// Discover name when oracle-driven; used to route discovery events.
    discover: Option<String>,
    task: JoinHandle<()>,
}

/// Owns every configured relay and the in-process control verbs.
pub struct RelayManager {
    relays: std::collections::HashMap<String, RelayEntry>,
}

impl RelayManager {
    /// Spawn one task per configured relay.
    pub fn start(configs: Vec<RelayConfig>, router: RouterHandle) -> Self {
        let mut relays = std::collections::HashMap::new();
        for config in configs {
            let name = config.name.clone();
            let discover = match &config.target {
                RelayTarget::Discover(d) => Some(d.clone()),
                RelayTarget::Uri(_) => None,
            };
            let (ctl_tx, ctl_rx) = mpsc::channel(16);
            let task = tokio::spawn(run_relay(config, router.clone(), ctl_rx));
            relays.insert(
                name,
                RelayEntry {
                    ctl_tx,
                    discover,
                    task,
                },
            );
        }
        RelayManager { relays }
    }

    /// The sink an oracle feeds; found/lost updates are routed to the
    /// relays that watch for the announced name.
    pub fn discovery_sink(&self) -> mpsc::Sender<DiscoveryEvent> {
        let (tx, mut rx) = mpsc::channel::<DiscoveryEvent>(16);
        let watchers: Vec<(String, mpsc::Sender<Ctl>)> = self
            .relays
            .values()
            .filter_map(|entry| {
                entry
                    .discover
                    .as_ref()
                    .map(|d| (d.clone(), entry.ctl_tx.clone()))
            })
            .collect();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    DiscoveryEvent::Found { name, uri } => {
                        for (watched, ctl) in &watchers {
                            if *watched == name {
                                let _ = ctl.send(Ctl::Found(uri.clone())).await;
                            }
                        }
                    }
                    DiscoveryEvent::Lost { name } => {
                        for (watched, ctl) in &watchers {
                            if *watched == name {
                                let _ = ctl.send(Ctl::Lost).await;
                            }
                        }
                    }
                }
            }
        });
        tx
    }

    pub async fn connect(&self, name: &str) -> Result<(), ControlError> {
        self.send_ctl(name, Ctl::Connect).await
    }

    pub async fn disconnect(&self, name: &str) -> Result<(), ControlError> {
        self.send_ctl(name, Ctl::Disconnect).await
    }

    pub async fn status(&self, name: &str) -> Result<RelayStatus, ControlError> {
        let entry = self.entry(name)?;
        let (reply, rx) = oneshot::channel();
        entry
            .ctl_tx
            .send(Ctl::Status(reply))
            .await
            .map_err(|_| ControlError::Gone {
                name: name.to_owned(),
            })?;
        rx.await.map_err(|_| ControlError::Gone {
            name: name.to_owned(),
        })
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.relays.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn shutdown(&mut self) {
        for entry in self.relays.values() {
            entry.task.abort();
        }
    }

    fn entry(&self, name: &str) -> Result<&RelayEntry, ControlError> {
        self.relays.get(name).ok_or_else(|| ControlError::UnknownRelay {
            name: name.to_owned(),
        })
    }

    async fn send_ctl(&self, name: &str, ctl: Ctl) -> Result<(), ControlError> {
        self.entry(name)?
            .ctl_tx
            .send(ctl)
            .await
            .map_err(|_| ControlError::Gone {
                name: name.to_owned(),
            })
    }
}

// ---------------------------------------------------------------------------
// Forwarding filter
// ---------------------------------------------------------------------------

/// Whether a local event goes upstream: internal traffic never does, and
/// a non-empty whitelist admits only its categories.
fn should_forward(config: &RelayConfig, event: &Event) -> bool {
    if event.is_internal() {
        return false;
    }
    config.forwards.is_empty() || config.forwards.contains(event.category())
}

// ---------------------------------------------------------------------------
// Recently-forwarded UUID window
// ---------------------------------------------------------------------------

/// Fixed-size window of event UUIDs sent upstream, consulted to drop the
/// copy the upstream fans back down.
struct UuidWindow {
    order: VecDeque<Uuid>,
    set: HashSet<Uuid>,
    capacity: usize,
}

impl UuidWindow {
    fn new(capacity: usize) -> Self {
        UuidWindow {
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn insert(&mut self, uuid: Uuid) {
        if !self.set.insert(uuid) {
            return;
        }
        self.order.push_back(uuid);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }

    /// Check-and-consume: one echo per forwarded event is absorbed.
    fn take(&mut self, uuid: &Uuid) -> bool {
        if self.set.remove(uuid) {
            self.order.retain(|u| u != uuid);
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Relay task
// ---------------------------------------------------------------------------

const SENT_WINDOW: usize = 1024;

enum Step {
    Ctl(Option<Ctl>),
    RetryDue,
    Local(Option<std::sync::Arc<Event>>),
    Upstream(Option<Incoming>),
}

async fn run_relay(config: RelayConfig, router: RouterHandle, mut ctl_rx: mpsc::Receiver<Ctl>) {
    let remote_label = format!("relay:{}", config.name);
    let Some((peer_id, local_queue)) = router.attach(PeerKind::Relay, remote_label).await else {
        return;
    };
    // The relay hears every non-internal local event; the forwards
    // whitelist is applied per event below.
    router.subscribe(peer_id, None).await;

    let initial_uri = match &config.target {
        RelayTarget::Uri(uri) => Some(uri.clone()),
        RelayTarget::Discover(_) => None,
    };
    let has_address = initial_uri.is_some();
    let options = ConnectOptions {
        accept_unknown_ca: config.accept_unknown_ca,
        server_identity: config.server_identity.clone(),
        ping_interval: config.ping_interval,
        ..ConnectOptions::default()
    };
    // Placeholder until the oracle hands over a real address.
    let placeholder = ConnectUri::Tcp {
        host: "0.0.0.0".to_owned(),
        port: 1,
    };
    let mut connection = Connection::new(initial_uri.unwrap_or(placeholder), options);
    let (mut reconnect, mut retry_rx) =
        Reconnect::new(config.reconnect_timeout, config.reconnect_max_tries);
    let mut state = RelayState {
        config,
        router,
        peer_id,
        has_address,
        incoming: None,
        sent_upstream: UuidWindow::new(SENT_WINDOW),
    };

    if state.has_address {
        state.try_connect(&mut connection, &mut reconnect).await;
    }

    loop {
        let upstream = async {
            match state.incoming.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };
        let step = tokio::select! {
            ctl = ctl_rx.recv() => Step::Ctl(ctl),
            fired = retry_rx.recv() => match fired {
                Some(()) => Step::RetryDue,
                None => continue,
            },
            event = local_queue.pop() => Step::Local(event),
            incoming = upstream => Step::Upstream(incoming),
        };
        match step {
            Step::Ctl(None) => break,
            Step::Ctl(Some(Ctl::Connect)) => {
                reconnect.reset();
                state.try_connect(&mut connection, &mut reconnect).await;
            }
            Step::Ctl(Some(Ctl::Disconnect)) => {
                reconnect.reset();
                state.incoming = None;
                connection.close().await;
            }
            Step::Ctl(Some(Ctl::Status(reply))) => {
                let status = if !state.has_address {
                    RelayStatus::NoAddress
                } else if connection.is_connected() {
                    RelayStatus::Connected
                } else {
                    RelayStatus::Disconnected
                };
                let _ = reply.send(status);
            }
            Step::Ctl(Some(Ctl::Found(uri))) => {
                info!(relay = %state.config.name, %uri, "discovered");
                state.incoming = None;
                connection.close().await;
                if connection.set_uri(uri).is_ok() {
                    state.has_address = true;
                    reconnect.reset();
                    state.try_connect(&mut connection, &mut reconnect).await;
                }
            }
            Step::Ctl(Some(Ctl::Lost)) => {
                info!(relay = %state.config.name, "peer lost, waiting for discovery");
                state.has_address = false;
                state.incoming = None;
                reconnect.reset();
                connection.close().await;
            }
            Step::RetryDue => {
                state.try_connect(&mut connection, &mut reconnect).await;
            }
            Step::Local(None) => break,
            Step::Local(Some(event)) => {
                state
                    .forward(&mut connection, &mut reconnect, event.as_ref())
                    .await;
            }
            Step::Upstream(Some(Incoming::Event(event))) => {
                if state.sent_upstream.take(&event.uuid()) {
                    debug!(relay = %state.config.name, uuid = %event.uuid(), "dropping bounced event");
                    continue;
                }
                state.router.publish(Some(state.peer_id), event).await;
            }
            Step::Upstream(Some(Incoming::Disconnected { reason })) => {
                warn!(relay = %state.config.name, ?reason, "upstream connection lost");
                state.incoming = None;
                if state.has_address && !reconnect.try_schedule() {
                    warn!(
                        relay = %state.config.name,
                        "reconnect budget exhausted, relay dormant"
                    );
                }
            }
            Step::Upstream(None) => {
                state.incoming = None;
            }
        }
    }
    connection.close().await;
    state.router.detach(peer_id).await;
}

struct RelayState {
    config: RelayConfig,
    router: RouterHandle,
    peer_id: crate::router::PeerId,
    has_address: bool,
    incoming: Option<mpsc::Receiver<Incoming>>,
    sent_upstream: UuidWindow,
}

impl RelayState {
    async fn try_connect(&mut self, connection: &mut Connection, reconnect: &mut Reconnect) {
        if !self.has_address || connection.is_connected() {
            return;
        }
        match connection.connect().await {
            Ok(rx) => {
                info!(relay = %self.config.name, uri = %connection.uri(), "connected");
                reconnect.reset();
                self.incoming = Some(rx);
                if let Some(subscriptions) = &self.config.subscriptions {
                    let request = if subscriptions.is_empty() {
                        None
                    } else {
                        Some(subscriptions)
                    };
                    if let Err(error) = connection.subscribe(request).await {
                        warn!(relay = %self.config.name, %error, "subscribe failed");
                    }
                }
            }
            Err(ClientError::AlreadyConnected) => {}
            Err(error) => {
                warn!(relay = %self.config.name, %error, "connect failed");
                if !reconnect.try_schedule() {
                    warn!(
                        relay = %self.config.name,
                        "reconnect budget exhausted, relay dormant"
                    );
                }
            }
        }
    }

    async fn forward(
        &mut self,
        connection: &mut Connection,
        reconnect: &mut Reconnect,
        event: &Event,
    ) {
        if !should_forward(&self.config, event) {
            return;
        }
        if !connection.is_connected() {
            return;
        }
        self.sent_upstream.insert(event.uuid());
        if let Err(error) = connection.send_event(event).await {
            warn!(relay = %self.config.name, %error, "forward failed");
            self.incoming = None;
            if !reconnect.try_schedule() {
                warn!(
                    relay = %self.config.name,
                    "reconnect budget exhausted, relay dormant"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
