/// Transport manager: owns the push connection and its reconnect loop
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::model::OutboundMessage;
use crate::push::{Credentials, PushConnector, PushLink};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Connection state of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected, no reconnect scheduled
    Disconnected,
    /// First connection attempt(s) in progress
    Connecting,
    /// Subscribed and receiving
    Connected,
    /// Lost an established link, retrying
    Reconnecting,
}

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of each delay that may be removed at random
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base: config.reconnect_base_delay,
            max: config.reconnect_max_delay,
            jitter: config.reconnect_jitter,
        }
    }

    /// Un-jittered delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay with jitter applied, never above `max`
    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=1.0);
        delay.mul_f64(factor)
    }
}

struct Session {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the physical push connection. Inbound frame bodies are forwarded
/// verbatim to the sink given at construction.
pub struct TransportManager {
    connector: Arc<dyn PushConnector>,
    backoff: BackoffPolicy,
    frames: mpsc::Sender<String>,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Number of links established so far
    epoch: Arc<watch::Sender<u64>>,
    outbound: Arc<Mutex<Option<mpsc::Sender<OutboundMessage>>>>,
    session: Mutex<Option<Session>>,
}

impl TransportManager {
    pub fn new(connector: Arc<dyn PushConnector>, backoff: BackoffPolicy, frames: mpsc::Sender<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (epoch, _) = watch::channel(0);
        Self {
            connector,
            backoff,
            frames,
            state: Arc::new(state),
            epoch: Arc::new(epoch),
            outbound: Arc::new(Mutex::new(None)),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Links established since construction. Bumped before `Connected` is
    /// published, so a receiver that misses intermediate states still sees
    /// every new link as a larger number.
    pub fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    pub fn watch_epoch(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    /// Start connecting in the background. Returns immediately; failures are
    /// retried forever until `disconnect`.
    pub async fn connect(&self, credentials: Credentials) {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            if !existing.handle.is_finished() {
                debug!("Push channel already connecting or connected");
                return;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        self.state.send_replace(ConnectionState::Connecting);

        let worker = ConnectionLoop {
            connector: self.connector.clone(),
            backoff: self.backoff.clone(),
            frames: self.frames.clone(),
            state: self.state.clone(),
            epoch: self.epoch.clone(),
            outbound: self.outbound.clone(),
            credentials,
        };
        let handle = tokio::spawn(worker.run(stop_rx));
        *session = Some(Session { stop: stop_tx, handle });
    }

    /// Tear down the link and stop reconnecting. Idempotent.
    pub async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(Session { stop, handle }) = session {
            let _ = stop.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Push connection task ended abnormally");
            }
            info!("Push channel disconnected");
        }
        *self.outbound.lock().await = None;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Queue a send request on the push channel. Fails unless `Connected`.
    pub async fn publish(&self, message: OutboundMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let sender = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(SyncError::NotConnected)?;
        sender
            .send(message)
            .await
            .map_err(|_| SyncError::TransportUnavailable("push link closed while publishing".to_string()))
    }
}

struct ConnectionLoop {
    connector: Arc<dyn PushConnector>,
    backoff: BackoffPolicy,
    frames: mpsc::Sender<String>,
    state: Arc<watch::Sender<ConnectionState>>,
    epoch: Arc<watch::Sender<u64>>,
    outbound: Arc<Mutex<Option<mpsc::Sender<OutboundMessage>>>>,
    credentials: Credentials,
}

impl ConnectionLoop {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        let mut connected_once = false;

        loop {
            if *stop.borrow() {
                break;
            }
            self.state.send_replace(if connected_once {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            let result = tokio::select! {
                result = self.connector.connect(&self.credentials) => result,
                _ = stopped(&mut stop) => break,
            };

            match result {
                Ok(link) => {
                    attempt = 0;
                    connected_once = true;
                    if !self.pump(link, &mut stop).await {
                        break;
                    }
                    self.state.send_replace(ConnectionState::Reconnecting);
                    warn!("Push channel dropped, reconnecting");
                }
                Err(e) => {
                    let e = SyncError::TransportUnavailable(e.to_string());
                    warn!(error = %e, attempt = attempt + 1, "Push channel connect failed");
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.backoff.jittered(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = stopped(&mut stop) => break,
            }
        }

        *self.outbound.lock().await = None;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Forward frames until the link ends. Returns false if the loop should stop.
    async fn pump(&self, link: PushLink, stop: &mut watch::Receiver<bool>) -> bool {
        let PushLink { mut frames, outbound } = link;
        *self.outbound.lock().await = Some(outbound);
        self.epoch.send_modify(|epoch| *epoch += 1);
        self.state.send_replace(ConnectionState::Connected);
        info!(user = %self.credentials.user_id, epoch = *self.epoch.borrow(), "Push channel connected");

        let keep_running = loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(body) => {
                        if self.frames.send(body).await.is_err() {
                            debug!("Frame sink closed, stopping transport");
                            break false;
                        }
                    }
                    None => break true,
                },
                _ = stopped(stop) => break false,
            }
        };

        // Dropping the last outbound sender unsubscribes and closes the link
        *self.outbound.lock().await = None;
        keep_running
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}
