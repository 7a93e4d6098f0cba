/// Outbound sender: push channel first, store write as fallback
use crate::dispatcher::{self, RawMessageEvent};
use crate::error::{Result, SyncError};
use crate::model::{Message, OutboundMessage};
use crate::store::MessageStore;
use crate::transport::TransportManager;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct OutboundSender {
    local_user_id: String,
    transport: Arc<TransportManager>,
    store: Arc<dyn MessageStore>,
}

impl OutboundSender {
    pub fn new(local_user_id: String, transport: Arc<TransportManager>, store: Arc<dyn MessageStore>) -> Self {
        Self {
            local_user_id,
            transport,
            store,
        }
    }

    /// Send a message and return something the UI can show right away.
    ///
    /// While the push channel is up the request is published there and a
    /// local echo (temporary id, already read) is returned. Otherwise the
    /// store's write path is used and its authoritative message returned.
    /// `SendFailed` means nothing was sent and nothing should be recorded.
    pub async fn send(&self, sender_id: &str, receiver_id: &str, content: &str) -> Result<Message> {
        if sender_id != self.local_user_id {
            return Err(SyncError::SendFailed(format!(
                "cannot send as {} while signed in as {}",
                sender_id, self.local_user_id
            )));
        }
        if receiver_id.trim().is_empty() || receiver_id == self.local_user_id {
            return Err(SyncError::SendFailed(format!("invalid receiver '{}'", receiver_id)));
        }
        if content.trim().is_empty() {
            return Err(SyncError::SendFailed("message content is empty".to_string()));
        }

        let outbound = OutboundMessage {
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
        };

        if self.transport.is_connected() {
            match self.transport.publish(outbound.clone()).await {
                Ok(()) => {
                    let echo = dispatcher::normalize(RawMessageEvent::echo(&outbound, Utc::now()))?;
                    debug!(id = %echo.id, receiver = %receiver_id, "Published on push channel");
                    return Ok(echo);
                }
                Err(e) => warn!(error = %e, "Push publish failed, falling back to store write"),
            }
        }

        match self.store.send(&outbound).await.and_then(dispatcher::normalize) {
            Ok(message) => {
                info!(id = %message.id, receiver = %receiver_id, "Sent through store fallback");
                Ok(message)
            }
            Err(e) => {
                warn!(error = %e, receiver = %receiver_id, "Fallback send failed");
                Err(SyncError::SendFailed(e.to_string()))
            }
        }
    }
}
