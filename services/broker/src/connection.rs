//! Per-peer connection state machine.
//!
//! One task per accepted peer. It owns the transport and the codec,
//! funnels inbound events and subscriptions into the router, and drains
//! the peer's outbound queue. The lifecycle runs Handshaking (WebSocket
//! upgrade only, done before this task starts) → Active → Closing (a BYE
//! has been sent or received) → Closed (detached, transport shut down).

use herald_net::{LineTransport, TransportError};
use herald_protocol::{ParseError, Protocol, ProtocolMessage};
use tracing::{debug, warn};

use crate::router::{PeerKind, RouterHandle};

enum Step {
    Line(Result<Option<String>, TransportError>),
    Outbound(Option<std::sync::Arc<herald_event::Event>>),
}

/// Why the Active phase ended; decides what Closing writes.
enum CloseReason {
    /// Peer said BYE; reply in kind.
    PeerBye,
    /// Clean transport close without BYE.
    PeerGone,
    /// Protocol violation; BYE carries the parse error text.
    Protocol(ParseError),
    /// Transport failure; BYE carries the error text, best-effort.
    Transport(TransportError),
    /// The router dropped the peer (shutdown).
    RouterGone,
}

/// Serve one accepted peer until either side ends the session.
pub async fn serve_peer(
    mut transport: Box<dyn LineTransport>,
    mut protocol: Box<dyn Protocol>,
    router: RouterHandle,
    remote_id: String,
) {
    let Some((peer_id, queue)) = router.attach(PeerKind::Inbound, remote_id.clone()).await else {
        return;
    };

    let reason = loop {
        let step = tokio::select! {
            line = transport.next_line() => Step::Line(line),
            event = queue.pop() => Step::Outbound(event),
        };
        match step {
            Step::Line(Ok(Some(line))) => match protocol.parse_line(&line) {
                Ok(Some(ProtocolMessage::Event(event))) => {
                    router.publish(Some(peer_id), event).await;
                }
                Ok(Some(ProtocolMessage::Subscribe(categories))) => {
                    router.subscribe(peer_id, categories).await;
                }
                Ok(Some(ProtocolMessage::Bye(message))) => {
                    debug!(peer = peer_id, ?message, "peer said BYE");
                    break CloseReason::PeerBye;
                }
                Ok(Some(ProtocolMessage::Ping)) | Ok(None) => {}
                Err(error) => {
                    warn!(peer = peer_id, %remote_id, %error, "protocol error");
                    break CloseReason::Protocol(error);
                }
            },
            Step::Line(Ok(None)) => break CloseReason::PeerGone,
            Step::Line(Err(error)) => {
                warn!(peer = peer_id, %remote_id, %error, "transport error");
                break CloseReason::Transport(error);
            }
            Step::Outbound(Some(event)) => {
                if let Err(error) = transport
                    .send_message(&protocol.generate_event(&event))
                    .await
                {
                    warn!(peer = peer_id, %remote_id, %error, "write failed");
                    break CloseReason::Transport(error);
                }
            }
            Step::Outbound(None) => break CloseReason::RouterGone,
        }
    };

    // Closing: detach first so no further events are queued, then say BYE.
    router.detach(peer_id).await;
    match reason {
        CloseReason::PeerBye => {
            let _ = transport.send_message(&protocol.generate_bye(None)).await;
            let _ = transport.shutdown().await;
        }
        CloseReason::PeerGone | CloseReason::RouterGone => {
            let _ = transport.shutdown().await;
        }
        CloseReason::Protocol(error) => {
            let text = error.to_string();
            let _ = transport
                .send_message(&protocol.generate_bye(Some(&text)))
                .await;
            let _ = transport.shutdown_on_error(&text).await;
        }
        CloseReason::Transport(error) => {
            let text = error.to_string();
            let _ = transport
                .send_message(&protocol.generate_bye(Some(&text)))
                .await;
            let _ = transport.shutdown_on_error(&text).await;
        }
    }
    debug!(peer = peer_id, %remote_id, "connection closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::spawn_router;
    use herald_net::StreamTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn harness(router: &RouterHandle, name: &str) -> DuplexStream {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let transport = Box::new(StreamTransport::new(theirs));
        tokio::spawn(serve_peer(
            transport,
            Box::new(herald_protocol::EvpProtocol::new()),
            router.clone(),
            name.to_owned(),
        ));
        ours
    }

    #[tokio::test]
    async fn subscribe_fanout_between_two_peers() {
        let router = spawn_router(Vec::new(), 64);
        let mut a = harness(&router, "peer-a");
        let mut b = harness(&router, "peer-b");

        b.write_all(b"SUBSCRIBE test\n").await.unwrap();
        // Subscription races the publish below through independent tasks;
        // give the router a beat to process it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        a.write_all(b"EVENT 2e6894bb-cf96-462e-a435-766c9b1b4f8a test alert\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 256];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(
            std::str::from_utf8(&buf[..n]).unwrap(),
            "EVENT 2e6894bb-cf96-462e-a435-766c9b1b4f8a test alert\n"
        );
    }

    #[tokio::test]
    async fn bad_uuid_gets_bye() {
        let router = spawn_router(Vec::new(), 64);
        let mut a = harness(&router, "peer-a");

        a.write_all(b"EVENT not-a-uuid c n\n").await.unwrap();
        let mut buf = String::new();
        a.read_to_string(&mut buf).await.unwrap();
        assert!(buf.starts_with("BYE "), "got: {:?}", buf);
        assert!(buf.contains("not-a-uuid"));
    }

    #[tokio::test]
    async fn bye_is_answered_with_bye() {
        let router = spawn_router(Vec::new(), 64);
        let mut a = harness(&router, "peer-a");

        a.write_all(b"BYE done\n").await.unwrap();
        let mut buf = String::new();
        a.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "BYE\n");
    }

    #[tokio::test]
    async fn detached_peer_gets_no_further_events() {
        let router = spawn_router(Vec::new(), 64);
        let mut a = harness(&router, "peer-a");
        let mut b = harness(&router, "peer-b");

        b.write_all(b"SUBSCRIBE test\n").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        b.write_all(b"BYE\n").await.unwrap();
        let mut bye = String::new();
        b.read_to_string(&mut bye).await.unwrap();

        // B is gone; publishing must not error out A's session.
        a.write_all(b"EVENT 2e6894bb-cf96-462e-a435-766c9b1b4f8a test late\nPING\n")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        a.write_all(b"BYE\n").await.unwrap();
        let mut rest = String::new();
        a.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "BYE\n");
    }
}
