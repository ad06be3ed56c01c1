//! eventc against a live in-process broker: one invocation subscribes,
//! another publishes, the event arrives.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use broker::listener::spawn_tcp;
use broker::router::spawn_router;
use eventc::{ClientOptions, SendRequest};
use herald_event::{Event, Value};
use tokio::net::TcpListener;

async fn start_broker() -> std::net::SocketAddr {
    let router = spawn_router(Vec::new(), 64);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    spawn_tcp(listener, router, None, 1024 * 1024);
    addr
}

fn options_for(addr: std::net::SocketAddr) -> ClientOptions {
    ClientOptions {
        uri: Some(format!("tcp://127.0.0.1:{}", addr.port())),
        identity: None,
        insecure: false,
        ping_interval: None,
        max_tries: 1,
    }
}

#[tokio::test]
async fn send_reaches_subscriber() {
    let addr = start_broker().await;

    let received: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let subscriber = tokio::spawn(async move {
        eventc::run_subscribe(&options_for(addr), &["cli-test".to_owned()], |event| {
            sink.lock().unwrap().push(event.clone());
        })
        .await
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let request = SendRequest {
        category: "cli-test".to_owned(),
        name: "ping".to_owned(),
        uuid: Some(String::new()),
        data: vec![("who".to_owned(), Value::string("cli"))],
    };
    let printed = eventc::run_send(&options_for(addr), &request)
        .await
        .unwrap();
    let uuid = printed.expect("empty-string uuid argument asks for printing");

    tokio::time::sleep(Duration::from_millis(300)).await;
    subscriber.abort();

    let events = received.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].uuid(), uuid);
    assert_eq!(events[0].category(), "cli-test");
    assert_eq!(events[0].data_value("who"), Some(&Value::string("cli")));
}

#[tokio::test]
async fn subscribe_filter_is_honored() {
    let addr = start_broker().await;

    let received: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let subscriber = tokio::spawn(async move {
        eventc::run_subscribe(&options_for(addr), &["wanted".to_owned()], |event| {
            sink.lock().unwrap().push(event.clone());
        })
        .await
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    for category in ["unwanted", "wanted"] {
        let request = SendRequest {
            category: category.to_owned(),
            name: "n".to_owned(),
            uuid: None,
            data: Vec::new(),
        };
        eventc::run_send(&options_for(addr), &request).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    subscriber.abort();

    let events = received.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].category(), "wanted");
}
