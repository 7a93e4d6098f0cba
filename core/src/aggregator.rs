/// Conversation aggregator: folds canonical messages into per-peer threads
///
/// Owns the only mutable copy of conversation state. It is not synchronized;
/// the engine actor is its single caller.
use crate::model::{ConversationSummary, Message, MessageId};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// What a fold did to the state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// New message stored
    Inserted,
    /// Replaced a duplicate or a local echo
    Merged,
    /// Nothing changed
    Ignored,
}

/// Result of flipping a message to read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMark {
    pub peer_id: String,
    /// The message counted towards `unread_count` before this call
    pub was_unread: bool,
}

#[derive(Debug, Clone)]
struct ConversationState {
    peer_id: String,
    display_name: String,
    /// Ascending by `sent_at`, ties in arrival order
    messages: Vec<Message>,
    unread_count: usize,
    created_at: DateTime<Utc>,
}

impl ConversationState {
    fn new(peer_id: String, display_name: String, created_at: DateTime<Utc>) -> Self {
        Self {
            peer_id,
            display_name,
            messages: Vec::new(),
            unread_count: 0,
            created_at,
        }
    }

    fn activity(&self) -> DateTime<Utc> {
        self.messages
            .last()
            .map(|m| m.sent_at)
            .unwrap_or(self.created_at)
    }

    fn insert_sorted(&mut self, message: Message, local_user: &str) {
        if message.is_unread_for(local_user) {
            self.unread_count += 1;
        }
        let pos = self.messages.partition_point(|m| m.sent_at <= message.sent_at);
        self.messages.insert(pos, message);
    }

    fn remove_at(&mut self, idx: usize, local_user: &str) -> Message {
        let old = self.messages.remove(idx);
        if old.is_unread_for(local_user) {
            self.unread_count = self.unread_count.saturating_sub(1);
        }
        old
    }

    fn position_of(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    /// Oldest unconfirmed echo that `incoming` confirms
    fn find_echo(&self, incoming: &Message, window: Duration) -> Option<usize> {
        self.messages.iter().position(|m| {
            m.id.is_local() && m.same_payload(incoming) && gap(m.sent_at, incoming.sent_at) <= window
        })
    }

    /// Confirmed copy of a local echo that was folded after its confirmation.
    /// Store messages that already stand in for another echo are skipped.
    fn find_confirmation(
        &self,
        echo: &Message,
        window: Duration,
        paired: &HashSet<MessageId>,
    ) -> Option<usize> {
        self.messages.iter().position(|m| {
            !m.id.is_local()
                && !paired.contains(&m.id)
                && m.same_payload(echo)
                && gap(m.sent_at, echo.sent_at) <= window
        })
    }

    fn summary(&self) -> ConversationSummary {
        let last = self.messages.last();
        ConversationSummary {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            last_message: last.map(|m| m.content.clone()),
            last_activity: last.map(|m| m.sent_at),
            unread_count: self.unread_count,
            message_count: self.messages.len(),
        }
    }
}

fn gap(a: DateTime<Utc>, b: DateTime<Utc>) -> Duration {
    if a >= b {
        a - b
    } else {
        b - a
    }
}

/// Per-peer conversation map with recency ordering and unread accounting
pub struct ConversationAggregator {
    local_user_id: String,
    echo_window: Duration,
    conversations: HashMap<String, ConversationState>,
    /// Peer ids, most recently active first
    order: Vec<String>,
    /// Message id -> owning peer
    index: HashMap<MessageId, String>,
    /// Store ids that already confirmed a local echo
    paired: HashSet<MessageId>,
}

impl ConversationAggregator {
    pub fn new(local_user_id: impl Into<String>, echo_window: std::time::Duration) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            echo_window: Duration::from_std(echo_window).unwrap_or_else(|_| Duration::seconds(30)),
            conversations: HashMap::new(),
            order: Vec::new(),
            index: HashMap::new(),
            paired: HashSet::new(),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Merge one message into conversation state
    pub fn fold(&mut self, mut message: Message) -> FoldOutcome {
        let peer = match message.peer_of(&self.local_user_id) {
            Some(peer) => peer.to_string(),
            None => {
                warn!(
                    message_id = %message.id,
                    sender = %message.sender_id,
                    receiver = %message.receiver_id,
                    "Ignoring message that does not involve the local user"
                );
                return FoldOutcome::Ignored;
            }
        };

        if let Some(owner) = self.index.get(&message.id) {
            if owner != &peer {
                warn!(message_id = %message.id, owner = %owner, peer = %peer, "Message id already used by another conversation");
                return FoldOutcome::Ignored;
            }
        }

        let before = self.conversations.get(&peer).map(ConversationState::activity);
        let conv = self
            .conversations
            .entry(peer.clone())
            .or_insert_with(|| ConversationState::new(peer.clone(), peer.clone(), message.sent_at));
        let local = self.local_user_id.as_str();

        let replaced = match conv.position_of(&message.id) {
            Some(idx) => Some(idx),
            None if !message.id.is_local() => conv.find_echo(&message, self.echo_window),
            None => {
                if let Some(idx) = conv.find_confirmation(&message, self.echo_window, &self.paired) {
                    let confirmed = conv.messages[idx].id.clone();
                    debug!(echo = %message.id, confirmed = %confirmed, "Echo already confirmed");
                    self.paired.insert(confirmed);
                    return FoldOutcome::Ignored;
                }
                None
            }
        };

        let outcome = match replaced {
            Some(idx) => {
                let old = conv.remove_at(idx, local);
                // Read never flips back within this subsystem
                message.read |= old.read;
                if old.id != message.id {
                    debug!(echo = %old.id, confirmed = %message.id, peer = %peer, "Reconciled local echo");
                    self.index.remove(&old.id);
                    self.paired.insert(message.id.clone());
                }
                FoldOutcome::Merged
            }
            None => FoldOutcome::Inserted,
        };

        self.index.insert(message.id.clone(), peer.clone());
        conv.insert_sorted(message, local);
        let after = conv.activity();

        if before != Some(after) {
            self.reposition(&peer, after);
        }
        outcome
    }

    /// Create an empty conversation shell if the peer is unknown.
    /// Returns true if a shell was created.
    pub fn ensure_conversation(&mut self, peer_id: &str, display_name: Option<String>) -> bool {
        if let Some(conv) = self.conversations.get_mut(peer_id) {
            if let Some(name) = display_name {
                conv.display_name = name;
            }
            return false;
        }
        let now = Utc::now();
        let name = display_name.unwrap_or_else(|| peer_id.to_string());
        self.conversations
            .insert(peer_id.to_string(), ConversationState::new(peer_id.to_string(), name, now));
        self.reposition(peer_id, now);
        true
    }

    pub fn set_display_name(&mut self, peer_id: &str, display_name: String) -> bool {
        match self.conversations.get_mut(peer_id) {
            Some(conv) => {
                conv.display_name = display_name;
                true
            }
            None => false,
        }
    }

    /// Flip a message to read and keep the unread cache in step.
    /// `None` if the message is unknown.
    pub fn mark_read(&mut self, id: &MessageId) -> Option<ReadMark> {
        let peer = self.index.get(id)?.clone();
        let conv = self.conversations.get_mut(&peer)?;
        let idx = conv.position_of(id)?;
        let was_unread = conv.messages[idx].is_unread_for(&self.local_user_id);
        conv.messages[idx].read = true;
        if was_unread {
            conv.unread_count = conv.unread_count.saturating_sub(1);
        }
        Some(ReadMark { peer_id: peer, was_unread })
    }

    /// Unread inbound messages of a conversation, oldest first
    pub fn unread_ids(&self, peer_id: &str) -> Vec<MessageId> {
        self.conversations
            .get(peer_id)
            .map(|conv| {
                conv.messages
                    .iter()
                    .filter(|m| m.is_unread_for(&self.local_user_id))
                    .map(|m| m.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Conversation summaries, most recently active first
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.order
            .iter()
            .filter_map(|peer| self.conversations.get(peer))
            .map(ConversationState::summary)
            .collect()
    }

    pub fn conversation(&self, peer_id: &str) -> Option<ConversationSummary> {
        self.conversations.get(peer_id).map(ConversationState::summary)
    }

    pub fn messages(&self, peer_id: &str) -> Option<Vec<Message>> {
        self.conversations.get(peer_id).map(|conv| conv.messages.clone())
    }

    pub fn find(&self, id: &MessageId) -> Option<&Message> {
        let peer = self.index.get(id)?;
        let conv = self.conversations.get(peer)?;
        conv.position_of(id).map(|idx| &conv.messages[idx])
    }

    pub fn peer_of_message(&self, id: &MessageId) -> Option<&str> {
        self.index.get(id).map(String::as_str)
    }

    /// Full recount of unread inbound messages, independent of the cache
    pub fn recount_unread(&self, peer_id: &str) -> Option<usize> {
        self.conversations.get(peer_id).map(|conv| {
            conv.messages
                .iter()
                .filter(|m| m.is_unread_for(&self.local_user_id))
                .count()
        })
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    fn reposition(&mut self, peer_id: &str, activity: DateTime<Utc>) {
        self.order.retain(|p| p != peer_id);
        let conversations = &self.conversations;
        let pos = self
            .order
            .iter()
            .position(|p| {
                conversations
                    .get(p)
                    .map(|c| c.activity() <= activity)
                    .unwrap_or(true)
            })
            .unwrap_or(self.order.len());
        self.order.insert(pos, peer_id.to_string());
    }
}
