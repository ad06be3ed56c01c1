//! Relay pair tests: a downstream broker forwarding to an upstream one,
//! with loop suppression in both directions.

use std::collections::BTreeSet;
use std::time::Duration;

use broker::config::{RelayConfig, RelayTarget};
use broker::listener::spawn_tcp;
use broker::relay::{RelayManager, RelayStatus};
use broker::router::{RouterHandle, spawn_router};
use herald_client::{ConnectOptions, Connection, Incoming};
use herald_event::Event;
use herald_net::ConnectUri;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

async fn start_broker() -> (RouterHandle, std::net::SocketAddr) {
    let router = spawn_router(Vec::new(), 64);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    spawn_tcp(listener, router.clone(), None, 1024 * 1024);
    (router, addr)
}

fn relay_to(addr: std::net::SocketAddr) -> RelayConfig {
    RelayConfig {
        name: "upstream".to_owned(),
        target: RelayTarget::Uri(
            ConnectUri::parse(&format!("tcp://127.0.0.1:{}", addr.port())).unwrap(),
        ),
        forwards: BTreeSet::new(),
        subscriptions: Some(BTreeSet::new()),
        accept_unknown_ca: false,
        server_identity: None,
        ping_interval: None,
        reconnect_timeout: Duration::from_secs(1),
        reconnect_max_tries: 3,
    }
}

async fn connect(addr: std::net::SocketAddr) -> (Connection, mpsc::Receiver<Incoming>) {
    let uri = ConnectUri::parse(&format!("tcp://127.0.0.1:{}", addr.port())).unwrap();
    let mut conn = Connection::new(uri, ConnectOptions::default());
    let rx = conn.connect().await.unwrap();
    (conn, rx)
}

async fn recv_event(rx: &mut mpsc::Receiver<Incoming>) -> Event {
    match timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(Incoming::Event(event))) => event,
        other => panic!("expected an event, got {:?}", other),
    }
}

async fn assert_quiet(rx: &mut mpsc::Receiver<Incoming>) {
    match timeout(Duration::from_millis(300), rx.recv()).await {
        Err(_) => {}
        Ok(got) => panic!("expected silence, got {:?}", got),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn local_events_are_forwarded_upstream() {
    let (_up_router, up_addr) = start_broker().await;
    let (down_router, down_addr) = start_broker().await;
    let manager = RelayManager::start(vec![relay_to(up_addr)], down_router);
    settle().await;
    assert_eq!(
        manager.status("upstream").await.unwrap(),
        RelayStatus::Connected
    );

    // A consumer on the upstream broker hears events produced downstream.
    let (up_consumer, mut up_rx) = connect(up_addr).await;
    up_consumer.subscribe(None).await.unwrap();
    settle().await;

    let (down_producer, _down_producer_rx) = connect(down_addr).await;
    let event = Event::new("test", "travels").unwrap();
    down_producer.send_event(&event).await.unwrap();

    let got = recv_event(&mut up_rx).await;
    assert_eq!(got.uuid(), event.uuid());

    drop(down_producer);
    drop(up_consumer);
}

#[tokio::test]
async fn bounced_event_is_dropped_by_uuid() {
    let (_up_router, up_addr) = start_broker().await;
    let (down_router, down_addr) = start_broker().await;
    // The relay subscribes to everything upstream, so whatever it
    // forwards comes straight back down -- the UUID check must eat it.
    let _manager = RelayManager::start(vec![relay_to(up_addr)], down_router);
    settle().await;

    let (down_consumer, mut down_rx) = connect(down_addr).await;
    down_consumer.subscribe(None).await.unwrap();
    settle().await;

    let (down_producer, _rx) = connect(down_addr).await;
    let event = Event::new("test", "boomerang").unwrap();
    down_producer.send_event(&event).await.unwrap();

    // Exactly one delivery: the direct local fan-out. No relayed twin.
    let got = recv_event(&mut down_rx).await;
    assert_eq!(got.uuid(), event.uuid());
    assert_quiet(&mut down_rx).await;

    drop(down_producer);
    drop(down_consumer);
}

#[tokio::test]
async fn upstream_events_are_reinjected_once() {
    let (_up_router, up_addr) = start_broker().await;
    let (down_router, down_addr) = start_broker().await;
    let _manager = RelayManager::start(vec![relay_to(up_addr)], down_router);
    settle().await;

    let (down_consumer, mut down_rx) = connect(down_addr).await;
    down_consumer.subscribe(None).await.unwrap();
    let (up_consumer, mut up_rx) = connect(up_addr).await;
    up_consumer.subscribe(None).await.unwrap();
    settle().await;

    let (up_producer, _rx) = connect(up_addr).await;
    let event = Event::new("test", "downhill").unwrap();
    up_producer.send_event(&event).await.unwrap();

    // Downstream hears it through the relay.
    assert_eq!(recv_event(&mut down_rx).await.uuid(), event.uuid());
    // Upstream's own consumer hears it exactly once: the relay must not
    // forward it back up.
    assert_eq!(recv_event(&mut up_rx).await.uuid(), event.uuid());
    assert_quiet(&mut up_rx).await;
    assert_quiet(&mut down_rx).await;

    drop(up_producer);
    drop(up_consumer);
    drop(down_consumer);
}

#[tokio::test]
async fn forwards_whitelist_limits_upstream_traffic() {
    let (_up_router, up_addr) = start_broker().await;
    let (down_router, down_addr) = start_broker().await;
    let mut config = relay_to(up_addr);
    config.forwards = ["mail".to_owned()].into();
    let _manager = RelayManager::start(vec![config], down_router);
    settle().await;

    let (up_consumer, mut up_rx) = connect(up_addr).await;
    up_consumer.subscribe(None).await.unwrap();
    settle().await;

    let (down_producer, _rx) = connect(down_addr).await;
    down_producer
        .send_event(&Event::new("music", "skipped").unwrap())
        .await
        .unwrap();
    down_producer
        .send_event(&Event::new("mail", "delivered").unwrap())
        .await
        .unwrap();

    assert_eq!(recv_event(&mut up_rx).await.name(), "delivered");
    assert_quiet(&mut up_rx).await;

    drop(down_producer);
    drop(up_consumer);
}

#[tokio::test]
async fn discovered_relay_connects_and_loses_address() {
    use broker::discovery::{DiscoveryEvent, DiscoveryOracle, StaticOracle};

    let (_up_router, up_addr) = start_broker().await;
    let (down_router, _down_addr) = start_broker().await;

    let mut config = relay_to(up_addr);
    config.target = RelayTarget::Discover("hub".to_owned());
    let manager = RelayManager::start(vec![config], down_router);
    assert_eq!(
        manager.status("upstream").await.unwrap(),
        RelayStatus::NoAddress
    );

    // The oracle announces the upstream; the relay connects.
    let uri = ConnectUri::parse(&format!("tcp://127.0.0.1:{}", up_addr.port())).unwrap();
    let mut oracle = StaticOracle::new(vec![("hub".to_owned(), uri)]);
    let sink = manager.discovery_sink();
    oracle.start(sink.clone());
    settle().await;
    assert_eq!(
        manager.status("upstream").await.unwrap(),
        RelayStatus::Connected
    );

    // A lost announcement drops the link and the address with it.
    sink.send(DiscoveryEvent::Lost {
        name: "hub".to_owned(),
    })
    .await
    .unwrap();
    settle().await;
    assert_eq!(
        manager.status("upstream").await.unwrap(),
        RelayStatus::NoAddress
    );
    oracle.stop();
}

#[tokio::test]
async fn relay_reports_disconnected_when_upstream_is_down() {
    // Reserve a port, then close it so nothing is listening.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let (down_router, _down_addr) = start_broker().await;
    let manager = RelayManager::start(vec![relay_to(dead_addr)], down_router);
    settle().await;

    assert_eq!(
        manager.status("upstream").await.unwrap(),
        RelayStatus::Disconnected
    );
    assert_eq!(manager.list(), vec!["upstream".to_owned()]);
}

#[tokio::test]
async fn control_disconnect_and_connect() {
    let (_up_router, up_addr) = start_broker().await;
    let (down_router, _down_addr) = start_broker().await;
    let manager = RelayManager::start(vec![relay_to(up_addr)], down_router);
    settle().await;
    assert_eq!(
        manager.status("upstream").await.unwrap(),
        RelayStatus::Connected
    );

    manager.disconnect("upstream").await.unwrap();
    settle().await;
    assert_eq!(
        manager.status("upstream").await.unwrap(),
        RelayStatus::Disconnected
    );

    manager.connect("upstream").await.unwrap();
    settle().await;
    assert_eq!(
        manager.status("upstream").await.unwrap(),
        RelayStatus::Connected
    );
}
