/// Read-state tracker: optimistic read marks and their backend confirmation
///
/// Local state is flipped first; the backend call happens afterwards outside
/// the engine actor. Failed confirmations are retried on flush and finally
/// abandoned, but the local mark is never rolled back.
use crate::aggregator::ConversationAggregator;
use crate::model::{Message, MessageId};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Result of one optimistic mark
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    /// No such message
    Unknown,
    /// Already read (or self-authored); nothing changed
    AlreadyRead { peer_id: String },
    /// Flipped to read. `confirm` holds the store id the backend must be told about.
    Marked { peer_id: String, confirm: Option<String> },
}

impl MarkOutcome {
    pub fn confirm_id(&self) -> Option<&str> {
        match self {
            MarkOutcome::Marked { confirm, .. } => confirm.as_deref(),
            _ => None,
        }
    }

    pub fn peer_id(&self) -> Option<&str> {
        match self {
            MarkOutcome::Unknown => None,
            MarkOutcome::AlreadyRead { peer_id } | MarkOutcome::Marked { peer_id, .. } => Some(peer_id),
        }
    }
}

pub struct ReadStateTracker {
    active: Option<String>,
    /// Store id -> failed attempts so far
    pending: HashMap<String, u32>,
    in_flight: HashSet<String>,
    retry_limit: u32,
}

impl ReadStateTracker {
    pub fn new(retry_limit: u32) -> Self {
        Self {
            active: None,
            pending: HashMap::new(),
            in_flight: HashSet::new(),
            retry_limit: retry_limit.max(1),
        }
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn is_active(&self, peer_id: &str) -> bool {
        self.active.as_deref() == Some(peer_id)
    }

    /// Switch the active conversation. Returns the previous one.
    pub fn set_active(&mut self, peer_id: Option<String>) -> Option<String> {
        debug!(from = ?self.active, to = ?peer_id, "Active conversation switched");
        std::mem::replace(&mut self.active, peer_id)
    }

    /// Optimistically mark one message read
    pub fn mark_read(&mut self, aggregator: &mut ConversationAggregator, id: &MessageId) -> MarkOutcome {
        match aggregator.mark_read(id) {
            None => MarkOutcome::Unknown,
            Some(mark) if !mark.was_unread => MarkOutcome::AlreadyRead { peer_id: mark.peer_id },
            Some(mark) => MarkOutcome::Marked {
                peer_id: mark.peer_id,
                confirm: match id {
                    MessageId::Store(store_id) => Some(store_id.clone()),
                    MessageId::Local(_) => None,
                },
            },
        }
    }

    /// Mark a freshly folded message if it landed unread in the active conversation
    pub fn auto_mark(&mut self, aggregator: &mut ConversationAggregator, message: &Message) -> Option<MarkOutcome> {
        let peer = message.peer_of(aggregator.local_user_id())?;
        if !self.is_active(peer) || !message.is_unread_for(aggregator.local_user_id()) {
            return None;
        }
        Some(self.mark_read(aggregator, &message.id))
    }

    /// Mark every unread inbound message of a conversation, oldest first
    pub fn mark_all(&mut self, aggregator: &mut ConversationAggregator, peer_id: &str) -> Vec<MarkOutcome> {
        aggregator
            .unread_ids(peer_id)
            .iter()
            .map(|id| self.mark_read(aggregator, id))
            .collect()
    }

    pub fn record_success(&mut self, store_id: &str) {
        self.in_flight.remove(store_id);
        self.pending.remove(store_id);
    }

    /// Queue a failed confirmation for retry. Returns false once the retry
    /// budget is spent and the id has been dropped.
    pub fn record_failure(&mut self, store_id: &str) -> bool {
        self.in_flight.remove(store_id);
        let attempts = self.pending.entry(store_id.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts >= self.retry_limit {
            warn!(message_id = %store_id, attempts = *attempts, "Giving up on read confirmation; keeping local state");
            self.pending.remove(store_id);
            return false;
        }
        true
    }

    /// Ids due for another confirmation attempt; they stay in flight until
    /// `record_success` / `record_failure`
    pub fn take_due(&mut self) -> Vec<String> {
        let due: Vec<String> = self
            .pending
            .keys()
            .filter(|id| !self.in_flight.contains(*id))
            .cloned()
            .collect();
        self.in_flight.extend(due.iter().cloned());
        due
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const ME: &str = "alice";

    fn inbound(id: &str, from: &str, secs: i64) -> Message {
        Message {
            id: MessageId::Store(id.to_string()),
            sender_id: from.to_string(),
            receiver_id: ME.to_string(),
            content: format!("msg {}", id),
            sent_at: Utc::now() + chrono::Duration::seconds(secs),
            read: false,
        }
    }

    fn setup() -> (ReadStateTracker, ConversationAggregator) {
        let mut agg = ConversationAggregator::new(ME, std::time::Duration::from_secs(30));
        agg.fold(inbound("1", "bob", 1));
        agg.fold(inbound("2", "bob", 2));
        agg.fold(inbound("3", "carol", 3));
        (ReadStateTracker::new(3), agg)
    }

    #[test]
    fn test_mark_read_returns_store_id_once() {
        let (mut tracker, mut agg) = setup();
        let id = MessageId::Store("1".to_string());

        let first = tracker.mark_read(&mut agg, &id);
        assert_eq!(first.confirm_id(), Some("1"));
        let second = tracker.mark_read(&mut agg, &id);
        assert_eq!(second, MarkOutcome::AlreadyRead { peer_id: "bob".to_string() });
        assert_eq!(tracker.mark_read(&mut agg, &MessageId::Store("9".into())), MarkOutcome::Unknown);
        assert_eq!(agg.conversation("bob").unwrap().unread_count, 1);
    }

    #[test]
    fn test_auto_mark_only_in_active_conversation() {
        let (mut tracker, mut agg) = setup();
        tracker.set_active(Some("bob".to_string()));

        let for_bob = inbound("4", "bob", 4);
        agg.fold(for_bob.clone());
        assert!(tracker.auto_mark(&mut agg, &for_bob).is_some());

        let for_carol = inbound("5", "carol", 5);
        agg.fold(for_carol.clone());
        assert!(tracker.auto_mark(&mut agg, &for_carol).is_none());

        // Switching is a hard boundary
        tracker.set_active(Some("carol".to_string()));
        let late_for_bob = inbound("6", "bob", 6);
        agg.fold(late_for_bob.clone());
        assert!(tracker.auto_mark(&mut agg, &late_for_bob).is_none());
        assert_eq!(agg.conversation("bob").unwrap().unread_count, 3);
    }

    #[test]
    fn test_mark_all_oldest_first() {
        let (mut tracker, mut agg) = setup();
        let outcomes = tracker.mark_all(&mut agg, "bob");
        let ids: Vec<&str> = outcomes.iter().filter_map(MarkOutcome::confirm_id).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(agg.conversation("bob").unwrap().unread_count, 0);
        assert_eq!(agg.conversation("carol").unwrap().unread_count, 1);
    }

    #[test]
    fn test_retry_budget() {
        let mut tracker = ReadStateTracker::new(3);
        assert!(tracker.record_failure("1"));
        assert_eq!(tracker.take_due(), vec!["1".to_string()]);
        // In flight: not handed out twice
        assert!(tracker.take_due().is_empty());
        assert!(tracker.record_failure("1"));
        assert!(!tracker.record_failure("1"));
        assert_eq!(tracker.pending_len(), 0);
    }

    #[test]
    fn test_success_clears_pending() {
        let mut tracker = ReadStateTracker::new(3);
        tracker.record_failure("7");
        let due = tracker.take_due();
        assert_eq!(due.len(), 1);
        tracker.record_success("7");
        assert_eq!(tracker.pending_len(), 0);
        assert!(tracker.take_due().is_empty());
    }
}
