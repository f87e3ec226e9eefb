//! End-to-end signaling flows against an in-process lobby on an ephemeral
//! port.

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use tandem_lobby::auth;
use tandem_lobby::config::Config;
use tandem_lobby::websocket::Lobby;
use tandem_proto::{ClientEnvelope, ServerEnvelope};

const SECRET: &str = "test-secret";

async fn start_lobby() -> String {
    let config = Config {
        port: 0,
        jwt_secret: SECRET.to_string(),
        keepalive_seconds: 30,
    };
    let app = tandem_lobby::router(Lobby::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}")
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect and consume the `connected` handshake acknowledgment.
    async fn connect(base: &str, user: i64, name: &str) -> Self {
        let token = auth::issue_token(user, name, SECRET, 60).unwrap();
        let (ws, _) = connect_async(format!("{base}/ws?token={token}"))
            .await
            .expect("handshake failed");
        let mut client = Self { ws };
        match client.recv().await {
            ServerEnvelope::Connected => client,
            other => panic!("expected connected, got {other:?}"),
        }
    }

    async fn send(&mut self, envelope: &ClientEnvelope) {
        let json = serde_json::to_string(envelope).unwrap();
        self.ws.send(Message::Text(json.into())).await.unwrap();
    }

    async fn recv(&mut self) -> ServerEnvelope {
        loop {
            let frame = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for envelope")
                .expect("stream ended")
                .expect("websocket error");
            match frame {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str()).expect("bad envelope")
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    /// Receive with a short deadline; `None` when nothing arrives.
    async fn recv_opt(&mut self, wait: Duration) -> Option<ServerEnvelope> {
        match timeout(wait, self.ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                Some(serde_json::from_str(text.as_str()).expect("bad envelope"))
            }
            _ => None,
        }
    }
}

fn join(topic: &str) -> ClientEnvelope {
    ClientEnvelope::JoinQueue {
        topic: Some(topic.to_string()),
    }
}

#[tokio::test]
async fn happy_path_same_topic_pairs_both_sides() {
    let base = start_lobby().await;
    let mut a = TestClient::connect(&base, 1, "Ana").await;
    let mut b = TestClient::connect(&base, 2, "Ben").await;

    a.send(&join("travel")).await;
    assert!(matches!(a.recv().await, ServerEnvelope::Searching));

    b.send(&join("travel")).await;

    let (sid_a, partner_a, topic_a) = match a.recv().await {
        ServerEnvelope::Matched {
            session_id,
            partner,
            topic,
        } => (session_id, partner, topic),
        other => panic!("expected matched, got {other:?}"),
    };
    let (sid_b, partner_b, topic_b) = match b.recv().await {
        ServerEnvelope::Matched {
            session_id,
            partner,
            topic,
        } => (session_id, partner, topic),
        other => panic!("expected matched, got {other:?}"),
    };

    assert_eq!(sid_a, sid_b);
    assert_eq!(topic_a, "travel");
    assert_eq!(topic_b, "travel");
    assert_eq!(partner_a.id, 2);
    assert_eq!(partner_a.full_name, "Ben");
    assert_eq!(partner_b.id, 1);
}

#[tokio::test]
async fn topic_mismatch_leaves_both_searching() {
    let base = start_lobby().await;
    let mut a = TestClient::connect(&base, 1, "Ana").await;
    let mut b = TestClient::connect(&base, 2, "Ben").await;

    a.send(&join("travel")).await;
    assert!(matches!(a.recv().await, ServerEnvelope::Searching));
    b.send(&join("business")).await;
    assert!(matches!(b.recv().await, ServerEnvelope::Searching));

    assert!(a.recv_opt(Duration::from_millis(300)).await.is_none());
    assert!(b.recv_opt(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn chat_is_relayed_with_server_stamped_sender() {
    let base = start_lobby().await;
    let mut a = TestClient::connect(&base, 1, "Ana").await;
    let mut b = TestClient::connect(&base, 2, "Ben").await;
    a.send(&join("travel")).await;
    let _ = a.recv().await; // searching
    b.send(&join("travel")).await;
    let _ = a.recv().await; // matched
    let _ = b.recv().await; // matched

    a.send(&ClientEnvelope::Chat {
        content: "hallo!".to_string(),
    })
    .await;

    match b.recv().await {
        ServerEnvelope::Chat {
            content,
            from_user_id,
            seq,
            ..
        } => {
            assert_eq!(content, "hallo!");
            assert_eq!(from_user_id, 1);
            assert_eq!(seq, 1);
        }
        other => panic!("expected chat, got {other:?}"),
    }

    a.send(&ClientEnvelope::Chat {
        content: "nog een".to_string(),
    })
    .await;
    match b.recv().await {
        ServerEnvelope::Chat { seq, .. } => assert_eq!(seq, 2),
        other => panic!("expected chat, got {other:?}"),
    }
}

#[tokio::test]
async fn voice_control_and_sdp_relay_verbatim() {
    let base = start_lobby().await;
    let mut a = TestClient::connect(&base, 1, "Ana").await;
    let mut b = TestClient::connect(&base, 2, "Ben").await;
    a.send(&join("travel")).await;
    let _ = a.recv().await;
    b.send(&join("travel")).await;
    let _ = a.recv().await;
    let _ = b.recv().await;

    a.send(&ClientEnvelope::VoiceRequest).await;
    assert!(matches!(b.recv().await, ServerEnvelope::VoiceRequest));
    b.send(&ClientEnvelope::VoiceAccept).await;
    assert!(matches!(a.recv().await, ServerEnvelope::VoiceAccept));

    let sdp = serde_json::json!({"type": "offer", "sdp": "v=0\r\no=- 0 0 IN IP4 127.0.0.1"});
    a.send(&ClientEnvelope::Offer { data: sdp.clone() }).await;
    match b.recv().await {
        ServerEnvelope::Offer { data } => assert_eq!(data, sdp),
        other => panic!("expected offer, got {other:?}"),
    }
}

#[tokio::test]
async fn disconnect_mid_session_notifies_partner() {
    let base = start_lobby().await;
    let mut a = TestClient::connect(&base, 1, "Ana").await;
    let mut b = TestClient::connect(&base, 2, "Ben").await;
    a.send(&join("travel")).await;
    let _ = a.recv().await;
    b.send(&join("travel")).await;
    let _ = a.recv().await;
    let _ = b.recv().await;

    drop(a);

    assert!(matches!(b.recv().await, ServerEnvelope::PartnerLeft { .. }));
}

#[tokio::test]
async fn rejoining_while_matched_is_a_protocol_error() {
    let base = start_lobby().await;
    let mut a = TestClient::connect(&base, 1, "Ana").await;
    let mut b = TestClient::connect(&base, 2, "Ben").await;
    a.send(&join("travel")).await;
    let _ = a.recv().await;
    b.send(&join("travel")).await;
    let _ = a.recv().await;
    let _ = b.recv().await;

    a.send(&join("travel")).await;
    match a.recv().await {
        ServerEnvelope::Error { message } => assert_eq!(message, "already matched"),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn bad_token_is_refused_before_any_envelope() {
    let base = start_lobby().await;
    let result = connect_async(format!("{base}/ws?token=not-a-token")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn explicit_leave_notifies_partner_and_frees_both() {
    let base = start_lobby().await;
    let mut a = TestClient::connect(&base, 1, "Ana").await;
    let mut b = TestClient::connect(&base, 2, "Ben").await;
    a.send(&join("travel")).await;
    let _ = a.recv().await;
    b.send(&join("travel")).await;
    let _ = a.recv().await;
    let _ = b.recv().await;

    a.send(&ClientEnvelope::Leave).await;
    assert!(matches!(b.recv().await, ServerEnvelope::PartnerLeft { .. }));

    // Both sides can queue again.
    a.send(&join("food")).await;
    assert!(matches!(a.recv().await, ServerEnvelope::Searching));
    b.send(&join("food")).await;
    assert!(matches!(b.recv().await, ServerEnvelope::Matched { .. }));
    assert!(matches!(a.recv().await, ServerEnvelope::Matched { .. }));
}
