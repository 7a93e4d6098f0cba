/// WebSocket push connector speaking STOMP
use super::stomp::{Command, Frame};
use super::{Credentials, PushConnector, PushLink};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::model::OutboundMessage;
use futures_util::{SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

const SUBSCRIPTION_ID: &str = "sub-0";
const FRAME_BUFFER: usize = 256;

/// Connects to the push endpoint over WebSocket and subscribes with STOMP
#[derive(Debug, Clone)]
pub struct StompWsConnector {
    url: String,
    subscribe_destination: String,
    publish_destination: String,
    heartbeat: Duration,
    handshake_timeout: Duration,
}

impl StompWsConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            url: config.push_url.clone(),
            subscribe_destination: config.inbound_destination(),
            publish_destination: config.publish_destination.clone(),
            heartbeat: config.heartbeat_interval,
            handshake_timeout: config.http_timeout,
        }
    }

    fn host(&self) -> &str {
        let without_scheme = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        without_scheme.split('/').next().unwrap_or(without_scheme)
    }
}

#[async_trait::async_trait]
impl PushConnector for StompWsConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<PushLink> {
        info!(url = %self.url, user = %credentials.user_id, "Connecting push channel");

        let (ws_stream, _) = timeout(self.handshake_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| SyncError::Timeout("WebSocket handshake".to_string()))??;
        let (mut write, mut read) = ws_stream.split();

        let connect = Frame::connect(
            self.host(),
            &credentials.user_id,
            credentials.token.as_deref(),
            self.heartbeat.as_millis() as u64,
        );
        write.send(Message::Text(connect.encode().into())).await?;

        let connected = timeout(self.handshake_timeout, await_connected(&mut read))
            .await
            .map_err(|_| SyncError::Timeout("STOMP handshake".to_string()))??;
        let (send_every, expect_every) = negotiate_heartbeat(self.heartbeat, connected.header("heart-beat"));
        debug!(
            version = ?connected.header("version"),
            send_every_ms = ?send_every.map(|d| d.as_millis()),
            expect_every_ms = ?expect_every.map(|d| d.as_millis()),
            "STOMP session established"
        );

        let subscribe = Frame::subscribe(SUBSCRIPTION_ID, &self.subscribe_destination);
        write.send(Message::Text(subscribe.encode().into())).await?;
        info!(destination = %self.subscribe_destination, "Subscribed to private channel");

        let (frames_tx, frames_rx) = mpsc::channel::<String>(FRAME_BUFFER);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(FRAME_BUFFER);
        let publish_destination = self.publish_destination.clone();

        tokio::spawn(async move {
            let mut ticker = send_every.map(|period| {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker
            });
            // Broker silent for two of its periods means the link is gone
            let silence_limit = expect_every.map(|period| period * 2);
            let mut last_seen = Instant::now();

            loop {
                tokio::select! {
                    incoming = read.next() => {
                        last_seen = Instant::now();
                        let text = match incoming {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | None => {
                                info!("Push channel closed by server");
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                error!(error = %e, "Push channel read error");
                                break;
                            }
                        };
                        match Frame::decode(text.as_str()) {
                            Ok(Some(frame)) if frame.command == Command::Message => {
                                if frames_tx.send(frame.body).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Some(frame)) if frame.command == Command::Error => {
                                warn!(message = ?frame.header("message"), "Broker sent ERROR, dropping link");
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Ignoring undecodable push frame"),
                        }
                    }
                    outgoing = outbound_rx.recv() => {
                        match outgoing {
                            Some(msg) => {
                                let body = match serde_json::to_string(&msg) {
                                    Ok(body) => body,
                                    Err(e) => {
                                        error!(error = %e, "Failed to serialize outbound message");
                                        continue;
                                    }
                                };
                                let frame = Frame::send_json(&publish_destination, body);
                                if let Err(e) = write.send(Message::Text(frame.encode().into())).await {
                                    error!(error = %e, "Push channel write error");
                                    break;
                                }
                            }
                            None => {
                                // Link dropped by its owner: leave politely
                                let _ = write.send(Message::Text(Frame::unsubscribe(SUBSCRIPTION_ID).encode().into())).await;
                                let _ = write.send(Message::Text(Frame::disconnect("bye").encode().into())).await;
                                let _ = write.close().await;
                                debug!("Push channel torn down");
                                break;
                            }
                        }
                    }
                    _ = tick(&mut ticker) => {
                        if write.send(Message::Text("\n".into())).await.is_err() {
                            break;
                        }
                    }
                    _ = silence(last_seen, silence_limit) => {
                        warn!(
                            silent_ms = last_seen.elapsed().as_millis() as u64,
                            "No heart-beat from broker, dropping link"
                        );
                        break;
                    }
                }
            }
        });

        Ok(PushLink {
            frames: frames_rx,
            outbound: outbound_tx,
        })
    }
}

/// Heart-beat periods as (we send, we expect) after negotiation with the
/// broker's CONNECTED `heart-beat` header. `None` disables that direction.
/// A missing header means the broker does neither.
fn negotiate_heartbeat(ours: Duration, theirs: Option<&str>) -> (Option<Duration>, Option<Duration>) {
    let (server_sends, server_wants) = theirs
        .and_then(|value| value.split_once(','))
        .and_then(|(sx, sy)| Some((sx.trim().parse::<u64>().ok()?, sy.trim().parse::<u64>().ok()?)))
        .unwrap_or((0, 0));
    let pick = |server_ms: u64| {
        (server_ms > 0 && !ours.is_zero()).then(|| ours.max(Duration::from_millis(server_ms)))
    };
    (pick(server_wants), pick(server_sends))
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn silence(last_seen: Instant, limit: Option<Duration>) {
    match limit {
        Some(limit) => sleep_until(last_seen + limit).await,
        None => std::future::pending().await,
    }
}

/// Wait for CONNECTED before subscribing
async fn await_connected<S>(read: &mut S) -> Result<Frame>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = read.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match Frame::decode(text.as_str())? {
            Some(frame) if frame.command == Command::Connected => return Ok(frame),
            Some(frame) if frame.command == Command::Error => {
                return Err(SyncError::TransportUnavailable(format!(
                    "broker rejected CONNECT: {}",
                    frame.header("message").unwrap_or(&frame.body)
                )));
            }
            _ => continue,
        }
    }
    Err(SyncError::TransportUnavailable(
        "closed during STOMP handshake".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_from_url() {
        let config = Config {
            user_id: "alice".to_string(),
            push_url: "ws://chat.example.com:8443/ws/chat".to_string(),
            ..Default::default()
        };
        let connector = StompWsConnector::new(&config);
        assert_eq!(connector.host(), "chat.example.com:8443");
        assert_eq!(connector.subscribe_destination, "/user/alice/queue/messages");
    }

    #[test]
    fn test_heartbeat_negotiation() {
        let ours = Duration::from_secs(10);
        assert_eq!(
            negotiate_heartbeat(ours, Some("5000,20000")),
            (Some(Duration::from_secs(20)), Some(Duration::from_secs(10)))
        );
        assert_eq!(
            negotiate_heartbeat(ours, Some("0,15000")),
            (Some(Duration::from_secs(15)), None)
        );
        assert_eq!(negotiate_heartbeat(ours, Some("0,0")), (None, None));
        assert_eq!(negotiate_heartbeat(ours, None), (None, None));
        assert_eq!(negotiate_heartbeat(ours, Some("garbage")), (None, None));
        assert_eq!(negotiate_heartbeat(Duration::ZERO, Some("100,100")), (None, None));
    }
}
