/// STOMP WebSocket connector against a loopback broker
use convsync_core::push::{Command, Credentials, Frame, PushConnector, StompWsConnector};
use convsync_core::{Config, OutboundMessage, SyncError};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type Ws = WebSocketStream<TcpStream>;

/// Bind a broker and hand the first accepted socket to `script`
async fn broker<F, Fut, T>(script: F) -> (Config, JoinHandle<T>)
where
    F: FnOnce(Ws) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = T> + Send,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        script(ws).await
    });

    let config = Config {
        user_id: "alice".to_string(),
        auth_token: Some("t0k".to_string()),
        push_url: format!("ws://{}/ws", addr),
        heartbeat_interval: Duration::from_millis(50),
        http_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    (config, handle)
}

/// Next STOMP frame from the client, skipping heart-beats
async fn next_frame(ws: &mut Ws) -> Frame {
    loop {
        let msg = ws.next().await.expect("client went away").expect("read error");
        if let Message::Text(text) = msg {
            if let Some(frame) = Frame::decode(text.as_str()).unwrap() {
                return frame;
            }
        }
    }
}

async fn send_frame(ws: &mut Ws, frame: Frame) {
    ws.send(Message::Text(frame.encode().into())).await.unwrap();
}

fn connected(heart_beat: &str) -> Frame {
    Frame::new(Command::Connected)
        .with_header("version", "1.2")
        .with_header("heart-beat", heart_beat)
}

/// CONNECT + SUBSCRIBE, returning both frames as the broker saw them
async fn accept_session(ws: &mut Ws, heart_beat: &str) -> (Frame, Frame) {
    let connect = next_frame(ws).await;
    send_frame(ws, connected(heart_beat)).await;
    let subscribe = next_frame(ws).await;
    (connect, subscribe)
}

fn credentials() -> Credentials {
    Credentials::new("alice", Some("t0k".to_string()))
}

#[tokio::test]
async fn test_handshake_delivery_send_and_teardown() {
    let (config, broker) = broker(|mut ws| async move {
        let (connect, subscribe) = accept_session(&mut ws, "0,0").await;

        let message = Frame::new(Command::Message)
            .with_header("destination", "/user/alice/queue/messages")
            .with_header("subscription", "sub-0")
            .with_header("message-id", "1")
            .with_body(r#"{"id":1,"senderId":"bob","receiverId":"alice","content":"hi"}"#.to_string());
        send_frame(&mut ws, message).await;

        let send = next_frame(&mut ws).await;
        let unsubscribe = next_frame(&mut ws).await;
        let disconnect = next_frame(&mut ws).await;
        vec![connect, subscribe, send, unsubscribe, disconnect]
    })
    .await;

    let connector = StompWsConnector::new(&config);
    let mut link = connector.connect(&credentials()).await.unwrap();

    let body = timeout(Duration::from_secs(2), link.frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(body.contains("\"content\":\"hi\""));

    link.outbound
        .send(OutboundMessage {
            sender_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            content: "hello".to_string(),
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    drop(link);

    let seen = timeout(Duration::from_secs(2), broker).await.unwrap().unwrap();

    assert_eq!(seen[0].command, Command::Connect);
    assert_eq!(seen[0].header("accept-version"), Some("1.2"));
    assert_eq!(seen[0].header("login"), Some("alice"));
    assert_eq!(seen[0].header("Authorization"), Some("Bearer t0k"));
    assert_eq!(seen[0].header("heart-beat"), Some("50,50"));

    assert_eq!(seen[1].command, Command::Subscribe);
    assert_eq!(seen[1].header("destination"), Some("/user/alice/queue/messages"));
    assert_eq!(seen[1].header("id"), Some("sub-0"));

    assert_eq!(seen[2].command, Command::Send);
    assert_eq!(seen[2].header("destination"), Some("/app/chat"));
    let sent: serde_json::Value = serde_json::from_str(&seen[2].body).unwrap();
    assert_eq!(sent["senderId"], "alice");
    assert_eq!(sent["receiverId"], "bob");
    assert_eq!(sent["content"], "hello");

    assert_eq!(seen[3].command, Command::Unsubscribe);
    assert_eq!(seen[3].header("id"), Some("sub-0"));
    assert_eq!(seen[4].command, Command::Disconnect);
}

#[tokio::test]
async fn test_error_frame_rejects_connect() {
    let (config, broker) = broker(|mut ws| async move {
        let connect = next_frame(&mut ws).await;
        let error = Frame::new(Command::Error)
            .with_header("message", "bad credentials")
            .with_body("token expired".to_string());
        send_frame(&mut ws, error).await;
        connect
    })
    .await;

    let connector = StompWsConnector::new(&config);
    let err = match connector.connect(&credentials()).await {
        Ok(_) => panic!("connect should have been rejected"),
        Err(e) => e,
    };
    assert!(matches!(err, SyncError::TransportUnavailable(ref text) if text.contains("bad credentials")));

    let connect = broker.await.unwrap();
    assert_eq!(connect.command, Command::Connect);
}

#[tokio::test]
async fn test_error_frame_after_subscribe_ends_link() {
    let (config, _broker) = broker(|mut ws| async move {
        accept_session(&mut ws, "0,0").await;
        send_frame(&mut ws, Frame::new(Command::Error).with_header("message", "session revoked")).await;
        sleep(Duration::from_secs(5)).await;
    })
    .await;

    let connector = StompWsConnector::new(&config);
    let mut link = connector.connect(&credentials()).await.unwrap();
    let ended = timeout(Duration::from_secs(2), link.frames.recv()).await.unwrap();
    assert!(ended.is_none());
}

#[tokio::test]
async fn test_silent_broker_drops_link() {
    let (config, _broker) = broker(|mut ws| async move {
        accept_session(&mut ws, "50,50").await;
        // Beat for a while, then go quiet without closing the socket
        for _ in 0..10 {
            ws.send(Message::Text("\n".into())).await.unwrap();
            sleep(Duration::from_millis(30)).await;
        }
        sleep(Duration::from_secs(5)).await;
        ws
    })
    .await;

    let connector = StompWsConnector::new(&config);
    let mut link = connector.connect(&credentials()).await.unwrap();

    // Still alive while the broker beats
    assert!(timeout(Duration::from_millis(200), link.frames.recv()).await.is_err());

    let ended = timeout(Duration::from_secs(2), link.frames.recv()).await.unwrap();
    assert!(ended.is_none());
}

#[tokio::test]
async fn test_unreachable_broker_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = Config {
        user_id: "alice".to_string(),
        push_url: format!("ws://{}/ws", addr),
        http_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let connector = StompWsConnector::new(&config);
    assert!(connector.connect(&credentials()).await.is_err());
}
