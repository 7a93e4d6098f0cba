/// Message store client: history fetch, fallback writes and read marks over HTTP
///
/// Endpoints (relative to `store_url`):
///   GET  /api/messages/user/{userId}
///   GET  /api/messages/conversation/{userA}/{userB}
///   POST /api/messages                 body: {"senderId","receiverId","content"}
///   PUT  /api/messages/{id}/read
use crate::config::Config;
use crate::dispatcher::RawMessageEvent;
use crate::error::{Result, SyncError};
use crate::model::OutboundMessage;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// The authoritative backend as seen by the engine
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Every message the user sent or received, in no particular order
    async fn fetch_history(&self, user_id: &str) -> Result<Vec<RawMessageEvent>>;

    /// Messages exchanged between two users
    async fn fetch_conversation(&self, user_a: &str, user_b: &str) -> Result<Vec<RawMessageEvent>>;

    /// Synchronous write; returns the created message
    async fn send(&self, message: &OutboundMessage) -> Result<RawMessageEvent>;

    async fn mark_read(&self, message_id: &str) -> Result<()>;
}

/// Thin JSON-over-HTTP helper shared by the store and directory clients
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpConnector, Full<Bytes>>,
    base: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base: config.store_base().to_string(),
            token: config.auth_token.clone(),
            timeout: config.http_timeout,
        }
    }

    /// Base URL followed by `path`, which must start with '/'
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn request(&self, method: Method, url: &str, body: Option<Vec<u8>>) -> Result<(StatusCode, Bytes)> {
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(url)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = match body {
            Some(bytes) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(bytes)))?,
            None => builder.body(Full::new(Bytes::new()))?,
        };

        debug!(%method, %url, "Store request");
        let exchange = async {
            let resp = self.client.request(req).await?;
            let status = resp.status();
            let body = resp.into_body().collect().await?.to_bytes();
            Ok::<_, SyncError>((status, body))
        };
        timeout(self.timeout, exchange)
            .await
            .map_err(|_| SyncError::Timeout(format!("{} {}", method, url)))?
    }

    fn check(method: &Method, url: &str, status: StatusCode, body: &Bytes) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        let snippet: String = String::from_utf8_lossy(body).chars().take(200).collect();
        Err(SyncError::Http(format!("{} {} -> {}: {}", method, url, status, snippet)))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let (status, body) = self.request(Method::GET, url, None).await?;
        Self::check(&Method::GET, url, status, &body)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Like `get_json` but maps 404 to `None`
    pub async fn get_json_opt<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        let (status, body) = self.request(Method::GET, url, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check(&Method::GET, url, status, &body)?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    pub async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(&self, url: &str, body: &B) -> Result<T> {
        let payload = serde_json::to_vec(body)?;
        let (status, resp) = self.request(Method::POST, url, Some(payload)).await?;
        Self::check(&Method::POST, url, status, &resp)?;
        Ok(serde_json::from_slice(&resp)?)
    }

    pub async fn put_empty(&self, url: &str) -> Result<()> {
        let (status, body) = self.request(Method::PUT, url, None).await?;
        Self::check(&Method::PUT, url, status, &body)
    }
}

/// `MessageStore` backed by the store's REST API
#[derive(Clone)]
pub struct HttpMessageStore {
    http: HttpClient,
}

impl HttpMessageStore {
    pub fn new(config: &Config) -> Self {
        Self {
            http: HttpClient::new(config),
        }
    }
}

#[async_trait::async_trait]
impl MessageStore for HttpMessageStore {
    async fn fetch_history(&self, user_id: &str) -> Result<Vec<RawMessageEvent>> {
        let url = self
            .http
            .url(&format!("/api/messages/user/{}", urlencoding::encode(user_id)));
        self.http.get_json(&url).await
    }

    async fn fetch_conversation(&self, user_a: &str, user_b: &str) -> Result<Vec<RawMessageEvent>> {
        let url = self.http.url(&format!(
            "/api/messages/conversation/{}/{}",
            urlencoding::encode(user_a),
            urlencoding::encode(user_b)
        ));
        self.http.get_json(&url).await
    }

    async fn send(&self, message: &OutboundMessage) -> Result<RawMessageEvent> {
        let url = self.http.url("/api/messages");
        self.http.post_json(&url, message).await
    }

    async fn mark_read(&self, message_id: &str) -> Result<()> {
        let url = self
            .http
            .url(&format!("/api/messages/{}/read", urlencoding::encode(message_id)));
        self.http.put_empty(&url).await
    }
}
