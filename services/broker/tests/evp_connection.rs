//! End-to-end broker tests over plain TCP: subscribe fan-out, echo
//! suppression, internal categories and protocol-error hangup.

use std::time::Duration;

use broker::listener::spawn_tcp;
use broker::router::spawn_router;
use herald_client::{ConnectOptions, Connection, Incoming};
use herald_event::{Event, Value};
use herald_net::ConnectUri;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

/// Start an in-process broker on an ephemeral loopback port.
async fn start_broker() -> std::net::SocketAddr {
    let router = spawn_router(Vec::new(), 64);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    spawn_tcp(listener, router, None, 1024 * 1024);
    addr
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
    match timeout(Duration::from_millis(200), rx.recv()).await {
        Err(_) => {}
        Ok(got) => panic!("expected silence, got {:?}", got),
    }
}

/// Let in-flight subscriptions settle before publishing.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribe_fanout_reaches_subscriber_not_originator() {
    let addr = start_broker().await;
    let (producer, mut producer_rx) = connect(addr).await;
    let (consumer, mut consumer_rx) = connect(addr).await;

    // Both ends subscribe; the originator must still be skipped.
    producer
        .subscribe(Some(&["test".to_owned()].into()))
        .await
        .unwrap();
    consumer
        .subscribe(Some(&["test".to_owned()].into()))
        .await
        .unwrap();
    settle().await;

    let mut event = Event::new("test", "alert").unwrap();
    event.add_data("who", Value::string("world")).unwrap();
    producer.send_event(&event).await.unwrap();

    let got = recv_event(&mut consumer_rx).await;
    assert_eq!(got.uuid(), event.uuid());
    assert_eq!(got.data_value("who"), Some(&Value::string("world")));

    // Exactly one copy, and nothing echoes to the producer.
    assert_quiet(&mut consumer_rx).await;
    assert_quiet(&mut producer_rx).await;

    drop(producer);
    drop(consumer);
}

#[tokio::test]
async fn unrelated_category_is_not_delivered() {
    let addr = start_broker().await;
    let (producer, _producer_rx) = connect(addr).await;
    let (consumer, mut consumer_rx) = connect(addr).await;

    consumer
        .subscribe(Some(&["mail".to_owned()].into()))
        .await
        .unwrap();
    settle().await;

    producer
        .send_event(&Event::new("music", "track").unwrap())
        .await
        .unwrap();
    assert_quiet(&mut consumer_rx).await;

    producer
        .send_event(&Event::new("mail", "arrived").unwrap())
        .await
        .unwrap();
    assert_eq!(recv_event(&mut consumer_rx).await.name(), "arrived");

    drop(producer);
    drop(consumer);
}

#[tokio::test]
async fn subscribe_all_sees_everything_but_internal() {
    let addr = start_broker().await;
    let (producer, _producer_rx) = connect(addr).await;
    let (consumer, mut consumer_rx) = connect(addr).await;

    consumer.subscribe(None).await.unwrap();
    settle().await;

    producer
        .send_event(&Event::new(".system", "tick").unwrap())
        .await
        .unwrap();
    producer
        .send_event(&Event::new("anything", "goes").unwrap())
        .await
        .unwrap();

    // The internal event is invisible; the ordinary one arrives.
    assert_eq!(recv_event(&mut consumer_rx).await.name(), "goes");
    assert_quiet(&mut consumer_rx).await;

    drop(producer);
    drop(consumer);
}

#[tokio::test]
async fn bad_uuid_is_answered_with_bye_and_broker_survives() {
    let addr = start_broker().await;

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(b"EVENT not-a-uuid c n\n").await.unwrap();
    let mut reply = String::new();
    raw.read_to_string(&mut reply).await.unwrap();
    assert!(reply.starts_with("BYE "), "got: {:?}", reply);

    // The broker still serves fresh connections.
    let (producer, _producer_rx) = connect(addr).await;
    let (consumer, mut consumer_rx) = connect(addr).await;
    consumer.subscribe(None).await.unwrap();
    settle().await;
    producer
        .send_event(&Event::new("still", "alive").unwrap())
        .await
        .unwrap();
    assert_eq!(recv_event(&mut consumer_rx).await.name(), "alive");

    drop(producer);
    drop(consumer);
}

#[tokio::test]
async fn dot_event_spanning_writes_is_reassembled() {
    let addr = start_broker().await;
    let (consumer, mut consumer_rx) = connect(addr).await;
    consumer.subscribe(None).await.unwrap();
    settle().await;

    // Feed a multi-line event byte by byte over a raw socket.
    let mut raw = TcpStream::connect(addr).await.unwrap();
    let wire = ".EVENT 8d099ddd-2b3b-4bd6-8ff7-374632032493 test greet\nDATA who 'world'\n.\n";
    for chunk in wire.as_bytes().chunks(7) {
        raw.write_all(chunk).await.unwrap();
        raw.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let got = recv_event(&mut consumer_rx).await;
    assert_eq!(got.name(), "greet");
    assert_eq!(got.data_value("who"), Some(&Value::string("world")));

    drop(consumer);
}
