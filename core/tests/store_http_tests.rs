/// HTTP store and directory clients against a loopback hyper server
use bytes::Bytes;
use convsync_core::directory::{HttpUserDirectory, UserDirectory};
use convsync_core::dispatcher;
use convsync_core::store::{HttpMessageStore, MessageStore};
use convsync_core::{Config, MessageId, OutboundMessage, SyncError};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Seen {
    method: String,
    path: String,
    auth: Option<String>,
    body: String,
}

type Log = Arc<Mutex<Vec<Seen>>>;

fn reply(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

async fn route(req: Request<hyper::body::Incoming>, log: Log) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let auth = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = req.into_body().collect().await.unwrap().to_bytes();
    log.lock().unwrap().push(Seen {
        method: method.clone(),
        path: path.clone(),
        auth,
        body: String::from_utf8_lossy(&body).to_string(),
    });

    let resp = match (method.as_str(), path.as_str()) {
        ("GET", "/api/messages/user/alice") => reply(
            StatusCode::OK,
            r#"[
                {"id": 1, "senderId": "alice", "receiverId": "bob", "content": "hi", "sentAt": "2024-05-01T10:00:00", "read": true},
                {"id": 2, "senderId": "bob", "receiverId": "alice", "content": "hey", "sentAt": [2024, 5, 1, 10, 1, 0], "read": false},
                {"id": 3, "senderId": "bob", "content": "broken"}
            ]"#,
        ),
        ("GET", "/api/messages/conversation/alice/bob%20jr") => reply(StatusCode::OK, "[]"),
        ("POST", "/api/messages") => reply(
            StatusCode::OK,
            r#"{"id": 77, "senderId": "alice", "receiverId": "bob", "content": "sent", "sentAt": 1714557600000, "read": false}"#,
        ),
        ("PUT", "/api/messages/2/read") => reply(StatusCode::OK, ""),
        ("PUT", "/api/messages/9/read") => reply(StatusCode::SERVICE_UNAVAILABLE, "maintenance"),
        ("GET", "/api/users/bob") => reply(StatusCode::OK, r#"{"id": 2, "username": "bob", "displayName": "Bob"}"#),
        _ => reply(StatusCode::NOT_FOUND, r#"{"error": "not found"}"#),
    };
    Ok(resp)
}

async fn spawn_store() -> (Config, Log) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let server_log = log.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let log = server_log.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req| route(req, log.clone()));
                let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), svc).await;
            });
        }
    });

    let config = Config {
        user_id: "alice".to_string(),
        auth_token: Some("secret".to_string()),
        store_url: format!("http://{}", addr),
        http_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    (config, log)
}

#[tokio::test]
async fn test_fetch_history_sends_bearer_and_normalizes() {
    let (config, log) = spawn_store().await;
    let store = HttpMessageStore::new(&config);

    let raw = store.fetch_history("alice").await.unwrap();
    assert_eq!(raw.len(), 3);

    // The broken element is dropped, the rest survive
    let messages = dispatcher::normalize_batch(raw);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, MessageId::Store("1".to_string()));
    assert!(messages[0].sent_at < messages[1].sent_at);

    let seen = log.lock().unwrap()[0].clone();
    assert_eq!(seen.method, "GET");
    assert_eq!(seen.auth.as_deref(), Some("Bearer secret"));
}

#[tokio::test]
async fn test_conversation_path_segments_are_encoded() {
    let (config, log) = spawn_store().await;
    let store = HttpMessageStore::new(&config);

    let raw = store.fetch_conversation("alice", "bob jr").await.unwrap();
    assert!(raw.is_empty());
    assert_eq!(log.lock().unwrap()[0].path, "/api/messages/conversation/alice/bob%20jr");
}

#[tokio::test]
async fn test_send_posts_camel_case_body() {
    let (config, log) = spawn_store().await;
    let store = HttpMessageStore::new(&config);

    let created = store
        .send(&OutboundMessage {
            sender_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            content: "sent".to_string(),
        })
        .await
        .unwrap();
    let message = dispatcher::normalize(created).unwrap();
    assert_eq!(message.id, MessageId::Store("77".to_string()));
    assert_eq!(message.sent_at.timestamp_millis(), 1_714_557_600_000);

    let body: serde_json::Value = serde_json::from_str(&log.lock().unwrap()[0].body).unwrap();
    assert_eq!(body["senderId"], "alice");
    assert_eq!(body["receiverId"], "bob");
    assert_eq!(body["content"], "sent");
}

#[tokio::test]
async fn test_mark_read_reports_backend_failure() {
    let (config, _log) = spawn_store().await;
    let store = HttpMessageStore::new(&config);

    store.mark_read("2").await.unwrap();
    let err = store.mark_read("9").await.unwrap_err();
    assert!(matches!(err, SyncError::Http(ref text) if text.contains("503") && text.contains("maintenance")));
}

#[tokio::test]
async fn test_directory_lookup() {
    let (config, _log) = spawn_store().await;
    let directory = HttpUserDirectory::new(&config);

    let bob = directory.lookup("bob").await.unwrap().unwrap();
    assert_eq!(bob.label().as_deref(), Some("Bob"));
    assert!(directory.lookup("nobody").await.unwrap().is_none());
}

#[tokio::test]
async fn test_unreachable_store_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = Config {
        user_id: "alice".to_string(),
        store_url: format!("http://{}", addr),
        http_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let store = HttpMessageStore::new(&config);
    assert!(store.fetch_history("alice").await.is_err());
}
