//! Integration tests against a mock WebSocket upgrade peer, covering the
//! happy-path (S1), auth-rejection (S2), and protocol-level ping/pong
//! scenarios from the testable-properties scenarios.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use tunvpn::codec::TunnelMessage;
use tunvpn::config::{ClientConfig, DnsSettings, TunSettings};
use tunvpn::session::{SessionClient, SessionEvent};

fn test_config(server_url: String) -> ClientConfig {
    ClientConfig {
        server_url,
        auth_token: "T".into(),
        heartbeat_interval_ms: 30_000,
        reconnect_initial_ms: 100,
        reconnect_max_attempts: 3,
        tun: TunSettings::default(),
        dns: DnsSettings::default(),
    }
}

async fn mock_server_addr() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, format!("ws://{addr}/"))
}

/// S1-style happy path: server accepts the upgrade, sends `welcome`,
/// and the client's Welcome-deadline wait resolves successfully.
#[tokio::test]
async fn welcome_within_deadline_reaches_active() {
    let (listener, url) = mock_server_addr().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let welcome = json!({
            "type": "welcome",
            "client_id": "c1",
            "server_info": { "server_version": "9.9.9", "nodes": [] },
        });
        ws.send(Message::Text(welcome.to_string())).await.unwrap();

        // Keep the stream alive long enough for the client to observe it.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    });

    let config = Arc::new(test_config(url));
    let (inbound_tx, _inbound_rx) = mpsc::channel::<TunnelMessage>(16);
    let cancel = CancellationToken::new();

    let (mut session, _outbound_tx, event) =
        SessionClient::connect(config, inbound_tx, cancel.clone()).await.unwrap();

    match event {
        SessionEvent::Authenticated { nodes } => assert!(nodes.is_empty()),
        other => panic!("expected Authenticated, got {other:?}"),
    }

    cancel.cancel();
    session.close().await;
    server.await.unwrap();
}

/// S2: the server rejects the upgrade with 401. The client must surface
/// `AuthRejected` and never attempt a retry itself.
#[tokio::test]
async fn auth_rejection_is_fatal_and_not_retried() {
    let (listener, url) = mock_server_addr().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        reject_upgrade(stream).await;
    });

    let config = Arc::new(test_config(url));
    let (inbound_tx, _inbound_rx) = mpsc::channel::<TunnelMessage>(16);
    let cancel = CancellationToken::new();

    let result = SessionClient::connect(config, inbound_tx, cancel).await;
    assert!(matches!(result, Err(tunvpn::ClientError::AuthRejected(_))));

    server.await.unwrap();
}

async fn reject_upgrade(stream: TcpStream) {
    let callback = |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
        let response = ErrorResponse::builder().status(401).body(None::<String>).unwrap();
        Err(response)
    };
    let _ = tokio_tungstenite::accept_hdr_async(stream, callback).await;
}

/// Ping sent by the client over the outbound channel reaches the server
/// verbatim, and a `pong` sent back decodes with its echoed timestamp
/// intact (the wire-compatibility quirk noted in `codec::message`).
#[tokio::test]
async fn ping_pong_round_trip_preserves_timestamp() {
    let (listener, url) = mock_server_addr().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let welcome = json!({
            "type": "welcome",
            "client_id": "c1",
            "server_info": { "server_version": "1.0.0", "nodes": [] },
        });
        ws.send(Message::Text(welcome.to_string())).await.unwrap();

        // Wait for the client's ping, then answer with a pong echoing it.
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            let decoded = TunnelMessage::decode(&text, 4096).unwrap();
            if let TunnelMessage::Ping { ts_ms } = decoded {
                let pong = TunnelMessage::Pong { echo_ts_ms: ts_ms, responder_ts_ms: ts_ms + 5 };
                ws.send(Message::Text(pong.encode(4096).unwrap())).await.unwrap();
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    });

    let config = Arc::new(test_config(url));
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<TunnelMessage>(16);
    let cancel = CancellationToken::new();

    let (mut session, outbound_tx, _event) =
        SessionClient::connect(config, inbound_tx, cancel.clone()).await.unwrap();

    outbound_tx.send(TunnelMessage::Ping { ts_ms: 1_000 }).await.unwrap();

    let pong = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        loop {
            match inbound_rx.recv().await {
                Some(msg @ TunnelMessage::Pong { .. }) => return msg,
                Some(_) => continue,
                None => panic!("channel closed before pong"),
            }
        }
    })
    .await
    .unwrap();

    match pong {
        TunnelMessage::Pong { echo_ts_ms, responder_ts_ms } => {
            assert_eq!(echo_ts_ms, 1_000);
            assert_eq!(responder_ts_ms, 1_005);
        }
        _ => unreachable!(),
    }

    cancel.cancel();
    session.close().await;
    server.await.unwrap();
}
