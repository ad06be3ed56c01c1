//! The subscription/routing engine.
//!
//! One task owns every subscription table; peers talk to it through
//! [`RouterHandle`]. That keeps the invariants cheap to uphold:
//!
//! - a peer appears at most once in the subscribe-all list and at most
//!   once per category list
//! - events whose category starts with `.` never reach the subscription
//!   tables; they are delivered to the action interface only
//! - the peer that originated an event is never among its delivery
//!   targets
//! - tables are mutated from the router task alone
//!
//! Delivery to one subscriber is FIFO in publish order; nothing is
//! promised across subscribers.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use herald_event::Event;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, warn};

use crate::actions::Action;

/// Stable peer index handed out on attach; never reused within a run.
pub type PeerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Inbound,
    Relay,
}

// ---------------------------------------------------------------------------
// Outbound event queue (per peer)
// ---------------------------------------------------------------------------

/// Bounded writer queue between the router and one peer's connection
/// task. When full, the oldest event is dropped in favor of the newest --
/// the system prefers freshness over completeness -- and the drop is
/// logged at most once per minute per peer.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

struct QueueState {
    queue: VecDeque<Arc<Event>>,
    closed: bool,
    dropped_since_warn: u64,
    last_warn: Option<Instant>,
}

const DROP_WARN_INTERVAL: Duration = Duration::from_secs(60);

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        EventQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    closed: false,
                    dropped_since_warn: 0,
                    last_warn: None,
                }),
                notify: Notify::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Enqueue for delivery, applying the drop-oldest policy.
    pub fn push(&self, event: Arc<Event>, peer: &str) {
        let mut state = self.inner.state.lock().expect("queue lock");
        if state.closed {
            return;
        }
        if state.queue.len() >= self.inner.capacity {
            state.queue.pop_front();
            state.dropped_since_warn += 1;
            let due = state
                .last_warn
                .is_none_or(|at| at.elapsed() >= DROP_WARN_INTERVAL);
            if due {
                warn!(
                    peer,
                    dropped = state.dropped_since_warn,
                    capacity = self.inner.capacity,
                    "outbound queue full, dropping oldest events"
                );
                state.last_warn = Some(Instant::now());
                state.dropped_since_warn = 0;
            }
        }
        state.queue.push_back(event);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Dequeue the next event; `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Arc<Event>> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().expect("queue lock");
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.inner.state.lock().expect("queue lock").closed = true;
        self.inner.notify.notify_one();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.state.lock().expect("queue lock").queue.len()
    }
}

// ---------------------------------------------------------------------------
// Router handle
// ---------------------------------------------------------------------------

enum RouterCmd {
    Attach {
        kind: PeerKind,
        remote_id: String,
        reply: oneshot::Sender<(PeerId, EventQueue)>,
    },
    Detach {
        peer: PeerId,
    },
    Subscribe {
        peer: PeerId,
        categories: Option<BTreeSet<String>>,
    },
    Publish {
        origin: Option<PeerId>,
        event: Event,
    },
}

/// Cloneable handle used by connection tasks and the relay.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterCmd>,
}

impl RouterHandle {
    /// Register a peer; returns its id and the queue its writer drains.
    pub async fn attach(&self, kind: PeerKind, remote_id: String) -> Option<(PeerId, EventQueue)> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterCmd::Attach {
                kind,
                remote_id,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn detach(&self, peer: PeerId) {
        let _ = self.tx.send(RouterCmd::Detach { peer }).await;
    }

    /// Additive subscription; `None` is subscribe-all. Repeats are
    /// idempotent and later calls union into the existing set.
    pub async fn subscribe(&self, peer: PeerId, categories: Option<BTreeSet<String>>) {
        let _ = self.tx.send(RouterCmd::Subscribe { peer, categories }).await;
    }

    /// Admit an event. `origin` is the peer it arrived from, used to
    /// suppress echo; `None` marks a locally produced event.
    pub async fn publish(&self, origin: Option<PeerId>, event: Event) {
        let _ = self.tx.send(RouterCmd::Publish { origin, event }).await;
    }
}

// ---------------------------------------------------------------------------
// Router task
// ---------------------------------------------------------------------------

struct PeerEntry {
    kind: PeerKind,
    remote_id: String,
    queue: EventQueue,
    subscribe_all: bool,
    /// Auxiliary index so detach walks only this peer's categories.
    categories: BTreeSet<String>,
}

struct Router {
    peers: HashMap<PeerId, PeerEntry>,
    subscribe_all: Vec<PeerId>,
    by_category: HashMap<String, Vec<PeerId>>,
    actions: Vec<Box<dyn Action>>,
    queue_capacity: usize,
    next_peer: PeerId,
}

/// Spawn the router task; all state lives inside it.
pub fn spawn_router(actions: Vec<Box<dyn Action>>, queue_capacity: usize) -> RouterHandle {
    let (tx, rx) = mpsc::channel(1024);
    let router = Router {
        peers: HashMap::new(),
        subscribe_all: Vec::new(),
        by_category: HashMap::new(),
        actions,
        queue_capacity,
        next_peer: 1,
    };
    tokio::spawn(router.run(rx));
    RouterHandle { tx }
}

impl Router {
    async fn run(mut self, mut rx: mpsc::Receiver<RouterCmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RouterCmd::Attach {
                    kind,
                    remote_id,
                    reply,
                } => {
                    let id = self.attach(kind, remote_id);
                    let queue = self.peers[&id].queue.clone();
                    if reply.send((id, queue)).is_err() {
                        self.detach(id);
                    }
                }
                RouterCmd::Detach { peer } => self.detach(peer),
                RouterCmd::Subscribe { peer, categories } => self.subscribe(peer, categories),
                RouterCmd::Publish { origin, event } => self.publish(origin, event),
            }
        }
    }

    fn attach(&mut self, kind: PeerKind, remote_id: String) -> PeerId {
        let id = self.next_peer;
        self.next_peer += 1;
        debug!(peer = id, %remote_id, ?kind, "peer attached");
        self.peers.insert(
            id,
            PeerEntry {
                kind,
                remote_id: remote_id.clone(),
                queue: EventQueue::new(self.queue_capacity),
                subscribe_all: false,
                categories: BTreeSet::new(),
            },
        );
        self.publish_meta("connected", id, &remote_id);
        id
    }

    /// Internal lifecycle traffic: actions see it, subscribers never do.
    fn publish_meta(&mut self, name: &str, peer: PeerId, remote_id: &str) {
        let Ok(mut event) = Event::new(".herald", name) else {
            return;
        };
        let _ = event.add_data("peer", herald_event::Value::Integer(peer as i64));
        let _ = event.add_data(
            "remote",
            herald_event::Value::String(remote_id.to_owned()),
        );
        self.publish(None, event);
    }

    fn detach(&mut self, peer: PeerId) {
        let Some(entry) = self.peers.remove(&peer) else {
            return;
        };
        if entry.subscribe_all {
            self.subscribe_all.retain(|&p| p != peer);
        }
        for category in &entry.categories {
            if let Some(list) = self.by_category.get_mut(category) {
                list.retain(|&p| p != peer);
                if list.is_empty() {
                    self.by_category.remove(category);
                }
            }
        }
        entry.queue.close();
        debug!(peer, remote_id = %entry.remote_id, kind = ?entry.kind, "peer detached");
        self.publish_meta("disconnected", peer, &entry.remote_id);
    }

    fn subscribe(&mut self, peer: PeerId, categories: Option<BTreeSet<String>>) {
        let Some(entry) = self.peers.get_mut(&peer) else {
            return;
        };
        match categories {
            None => {
                if !entry.subscribe_all {
                    entry.subscribe_all = true;
                    self.subscribe_all.push(peer);
                }
            }
            Some(categories) => {
                for category in categories {
                    // Internal categories are not subscribable.
                    if category.starts_with('.') {
                        continue;
                    }
                    if entry.categories.insert(category.clone()) {
                        self.by_category.entry(category).or_default().push(peer);
                    }
                }
            }
        }
    }

    fn publish(&mut self, origin: Option<PeerId>, event: Event) {
        for action in &self.actions {
            action.dispatch(&event);
        }
        if event.is_internal() {
            return;
        }

        let event = Arc::new(event);
        let mut delivered: Vec<PeerId> = Vec::new();
        let category_list = self
            .by_category
            .get(event.category())
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        for &peer in self.subscribe_all.iter().chain(category_list) {
            if Some(peer) == origin || delivered.contains(&peer) {
                continue;
            }
            delivered.push(peer);
            if let Some(entry) = self.peers.get(&peer) {
                entry.queue.push(Arc::clone(&event), &entry.remote_id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
