//! Test doubles for the engine's collaborators
#![allow(dead_code)]

use async_trait::async_trait;
use convsync_core::directory::{UserDirectory, UserProfile};
use convsync_core::dispatcher::RawMessageEvent;
use convsync_core::push::{Credentials, PushConnector, PushLink};
use convsync_core::store::MessageStore;
use convsync_core::{ChatEngine, Config, ConnectionState, OutboundMessage, Result, SyncError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

pub const ME: &str = "alice";

/// Config with short reconnect delays and no automatic read flush
pub fn test_config() -> Config {
    Config {
        user_id: ME.to_string(),
        reconnect_base_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(50),
        reconnect_jitter: 0.0,
        read_flush_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

/// Store-shaped message
pub fn raw(id: u64, from: &str, to: &str, content: &str, sent_at: &str, read: bool) -> RawMessageEvent {
    RawMessageEvent {
        id: Some(json!(id)),
        sender_id: Some(json!(from)),
        receiver_id: Some(json!(to)),
        content: Some(content.to_string()),
        sent_at: Some(json!(sent_at)),
        read: Some(read),
    }
}

pub fn frame(id: u64, from: &str, to: &str, content: &str, sent_at: &str) -> String {
    serde_json::to_string(&raw(id, from, to, content, sent_at, false)).unwrap()
}

#[derive(Default)]
struct LinkState {
    failing: bool,
    connects: usize,
    frames: Option<mpsc::Sender<String>>,
    published: Vec<OutboundMessage>,
}

/// Push connector whose links are driven by the test
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<LinkState>>,
}

impl FakeConnector {
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().unwrap().published.clone()
    }

    /// Deliver a frame body on the current link
    pub async fn push(&self, body: String) {
        let frames = self.state.lock().unwrap().frames.clone();
        frames
            .expect("no live push link")
            .send(body)
            .await
            .expect("push link closed");
    }

    /// End the current link as if the server went away
    pub fn drop_link(&self) {
        self.state.lock().unwrap().frames = None;
    }
}

#[async_trait]
impl PushConnector for FakeConnector {
    async fn connect(&self, _credentials: &Credentials) -> Result<PushLink> {
        let (frames_tx, frames_rx) = mpsc::channel(64);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(64);
        {
            let mut state = self.state.lock().unwrap();
            state.connects += 1;
            if state.failing {
                return Err(SyncError::TransportUnavailable("connection refused".to_string()));
            }
            state.frames = Some(frames_tx);
        }

        let shared = self.state.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                shared.lock().unwrap().published.push(message);
            }
        });

        Ok(PushLink {
            frames: frames_rx,
            outbound: outbound_tx,
        })
    }
}

#[derive(Default)]
struct StoreState {
    messages: Vec<RawMessageEvent>,
    next_id: u64,
    fail_history: bool,
    fail_send: bool,
    fail_mark_read: bool,
    history_calls: usize,
    read_calls: Vec<String>,
}

/// Message store kept in memory, with switchable failures
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

fn involves(raw: &RawMessageEvent, user: &str) -> bool {
    let user = Value::String(user.to_string());
    raw.sender_id.as_ref() == Some(&user) || raw.receiver_id.as_ref() == Some(&user)
}

impl InMemoryStore {
    pub fn with_messages(messages: Vec<RawMessageEvent>) -> Self {
        let store = Self::default();
        {
            let mut state = store.state.lock().unwrap();
            state.next_id = 1000;
            state.messages = messages;
        }
        store
    }

    pub fn add(&self, message: RawMessageEvent) {
        self.state.lock().unwrap().messages.push(message);
    }

    pub fn set_fail_history(&self, fail: bool) {
        self.state.lock().unwrap().fail_history = fail;
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.state.lock().unwrap().fail_send = fail;
    }

    pub fn set_fail_mark_read(&self, fail: bool) {
        self.state.lock().unwrap().fail_mark_read = fail;
    }

    pub fn history_calls(&self) -> usize {
        self.state.lock().unwrap().history_calls
    }

    pub fn read_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().read_calls.clone()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn fetch_history(&self, user_id: &str) -> Result<Vec<RawMessageEvent>> {
        let mut state = self.state.lock().unwrap();
        state.history_calls += 1;
        if state.fail_history {
            return Err(SyncError::Http("history unavailable".to_string()));
        }
        Ok(state
            .messages
            .iter()
            .filter(|m| involves(m, user_id))
            .cloned()
            .collect())
    }

    async fn fetch_conversation(&self, user_a: &str, user_b: &str) -> Result<Vec<RawMessageEvent>> {
        let state = self.state.lock().unwrap();
        if state.fail_history {
            return Err(SyncError::Http("history unavailable".to_string()));
        }
        Ok(state
            .messages
            .iter()
            .filter(|m| involves(m, user_a) && involves(m, user_b))
            .cloned()
            .collect())
    }

    async fn send(&self, message: &OutboundMessage) -> Result<RawMessageEvent> {
        let mut state = self.state.lock().unwrap();
        if state.fail_send {
            return Err(SyncError::Http("POST /api/messages -> 503".to_string()));
        }
        state.next_id += 1;
        let created = RawMessageEvent {
            id: Some(json!(state.next_id)),
            sender_id: Some(json!(message.sender_id)),
            receiver_id: Some(json!(message.receiver_id)),
            content: Some(message.content.clone()),
            sent_at: Some(json!(chrono::Utc::now().to_rfc3339())),
            read: Some(false),
        };
        state.messages.push(created.clone());
        Ok(created)
    }

    async fn mark_read(&self, message_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.read_calls.push(message_id.to_string());
        if state.fail_mark_read {
            return Err(SyncError::Http(format!("PUT /api/messages/{}/read -> 503", message_id)));
        }
        let id = Value::from(message_id.parse::<u64>().unwrap_or_default());
        for message in state.messages.iter_mut().filter(|m| m.id.as_ref() == Some(&id)) {
            message.read = Some(true);
        }
        Ok(())
    }
}

/// Directory backed by a fixed map
#[derive(Clone, Default)]
pub struct StaticDirectory {
    users: HashMap<String, UserProfile>,
}

impl StaticDirectory {
    pub fn with_user(mut self, id: &str, display_name: &str) -> Self {
        self.users.insert(
            id.to_string(),
            UserProfile {
                username: Some(id.to_string()),
                display_name: Some(display_name.to_string()),
            },
        );
        self
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn lookup(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.users.get(user_id).cloned())
    }
}

pub struct Harness {
    pub engine: ChatEngine,
    pub connector: FakeConnector,
    pub store: InMemoryStore,
}

pub fn harness(store: InMemoryStore) -> Harness {
    harness_with(test_config(), store, StaticDirectory::default())
}

pub fn harness_with(config: Config, store: InMemoryStore, directory: StaticDirectory) -> Harness {
    let connector = FakeConnector::default();
    let engine = ChatEngine::new(
        config,
        Arc::new(connector.clone()),
        Arc::new(store.clone()),
        Arc::new(directory),
    )
    .unwrap();
    Harness {
        engine,
        connector,
        store,
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub async fn wait_for_state(engine: &ChatEngine, wanted: ConnectionState) {
    let mut rx = engine.watch_transport();
    timeout(Duration::from_secs(2), async {
        while *rx.borrow_and_update() != wanted {
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("transport never reached {:?}", wanted));
}
