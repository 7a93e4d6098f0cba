/// Conversation sync engine
///
/// A single actor task owns the aggregator and the read-state tracker. Push
/// frames, history batches, send results and read marks all reach it through
/// one queue, so conversation state is only ever touched from that task.
/// `ChatEngine` is the cloneable handle the host application talks to.
use crate::aggregator::{ConversationAggregator, FoldOutcome};
use crate::config::Config;
use crate::directory::{HttpUserDirectory, UserDirectory};
use crate::dispatcher;
use crate::error::{Result, SyncError};
use crate::model::{ConversationSummary, EngineEvent, Message, MessageId};
use crate::push::{Credentials, PushConnector, StompWsConnector};
use crate::read_state::{MarkOutcome, ReadStateTracker};
use crate::sender::OutboundSender;
use crate::store::{HttpMessageStore, MessageStore};
use crate::transport::{BackoffPolicy, ConnectionState, TransportManager};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Snapshot for status displays
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub user_id: String,
    pub transport: ConnectionState,
    pub conversations: usize,
    pub messages: usize,
    pub unread: usize,
    pub active_conversation: Option<String>,
    pub pending_read_confirmations: usize,
}

enum Command {
    Fold {
        messages: Vec<Message>,
        reply: Option<oneshot::Sender<Vec<FoldOutcome>>>,
    },
    EnsureConversation {
        peer_id: String,
        display_name: Option<String>,
        reply: oneshot::Sender<Option<ConversationSummary>>,
    },
    MarkRead {
        id: MessageId,
        reply: oneshot::Sender<MarkOutcome>,
    },
    MarkAllRead {
        peer_id: String,
        reply: oneshot::Sender<Vec<MarkOutcome>>,
    },
    SetActive {
        peer_id: Option<String>,
        reply: oneshot::Sender<usize>,
    },
    ReadConfirmed {
        message_id: String,
        result: std::result::Result<(), String>,
    },
    FlushReadState,
    Conversations {
        reply: oneshot::Sender<Vec<ConversationSummary>>,
    },
    Conversation {
        peer_id: String,
        reply: oneshot::Sender<Option<ConversationSummary>>,
    },
    Messages {
        peer_id: String,
        reply: oneshot::Sender<Option<Vec<Message>>>,
    },
    RecountUnread {
        peer_id: String,
        reply: oneshot::Sender<Option<usize>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown,
}

struct EngineInner {
    config: Config,
    commands: mpsc::Sender<Command>,
    transport: Arc<TransportManager>,
    sender: OutboundSender,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn UserDirectory>,
    events: broadcast::Sender<EngineEvent>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<EngineInner>,
}

impl ChatEngine {
    /// Build an engine around the given collaborators and spawn its actor.
    /// Must be called from within a Tokio runtime. Nothing connects until
    /// [`ChatEngine::activate`]. The config is validated first.
    pub fn new(
        config: Config,
        connector: Arc<dyn PushConnector>,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn UserDirectory>,
    ) -> Result<Self> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::channel(config.command_queue_depth);
        let (frames_tx, frames_rx) = mpsc::channel(config.command_queue_depth);
        let (events, _) = broadcast::channel(config.event_buffer);

        let transport = Arc::new(TransportManager::new(
            connector,
            BackoffPolicy::from_config(&config),
            frames_tx,
        ));
        let sender = OutboundSender::new(config.user_id.clone(), transport.clone(), store.clone());

        let actor = EngineActor {
            local_user_id: config.user_id.clone(),
            aggregator: ConversationAggregator::new(config.user_id.clone(), config.echo_match_window),
            read_state: ReadStateTracker::new(config.read_retry_limit),
            store: store.clone(),
            events: events.clone(),
            commands: commands_tx.downgrade(),
            transport_state: ConnectionState::Disconnected,
            link_epoch: 0,
        };
        let handle = tokio::spawn(actor.run(
            commands_rx,
            frames_rx,
            transport.watch_state(),
            transport.watch_epoch(),
            config.read_flush_interval,
        ));

        info!(user = %config.user_id, "Created sync engine");

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                commands: commands_tx,
                transport,
                sender,
                store,
                directory,
                events,
                actor: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Engine wired to the STOMP push channel and the HTTP store
    pub fn with_http(config: Config) -> Result<Self> {
        let connector = Arc::new(StompWsConnector::new(&config));
        let store = Arc::new(HttpMessageStore::new(&config));
        let directory = Arc::new(HttpUserDirectory::new(&config));
        Self::new(config, connector, store, directory)
    }

    pub fn user_id(&self) -> &str {
        &self.inner.config.user_id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Connect the push channel and seed conversations from history.
    ///
    /// The push channel keeps retrying in the background regardless of the
    /// outcome. A failed history fetch is returned to the caller, who may
    /// call [`ChatEngine::resync`] later; every reconnection also backfills.
    /// Returns the number of history messages applied.
    pub async fn activate(&self) -> Result<usize> {
        let config = &self.inner.config;
        info!(
            user = %config.user_id,
            push = %config.push_url,
            store = %config.store_url,
            "Activating sync engine"
        );
        self.inner
            .transport
            .connect(Credentials::new(config.user_id.clone(), config.auth_token.clone()))
            .await;
        self.resync().await
    }

    /// Fetch the full history and fold it in. Idempotent.
    pub async fn resync(&self) -> Result<usize> {
        let raw = self
            .inner
            .store
            .fetch_history(self.user_id())
            .await
            .map_err(|e| {
                warn!(error = %e, "History fetch failed");
                e
            })?;
        let fetched = raw.len();
        let outcomes = self.fold(dispatcher::normalize_batch(raw)).await?;
        let applied = outcomes
            .iter()
            .filter(|outcome| **outcome != FoldOutcome::Ignored)
            .count();
        info!(fetched, applied, "History folded");
        Ok(applied)
    }

    /// Send a message from the local user and fold the result immediately
    pub async fn send(&self, receiver_id: &str, content: &str) -> Result<Message> {
        self.send_as(self.user_id(), receiver_id, content).await
    }

    /// Like [`ChatEngine::send`] with an explicit sender, which must be the
    /// local user
    pub async fn send_as(&self, sender_id: &str, receiver_id: &str, content: &str) -> Result<Message> {
        let message = self.inner.sender.send(sender_id, receiver_id, content).await?;
        self.fold(vec![message.clone()]).await?;
        Ok(message)
    }

    /// Mark one message read. The local change is applied before the backend
    /// is told; a failed confirmation surfaces as the soft
    /// `ReadStateSyncFailed` and is retried on the next flush.
    /// Returns whether anything changed locally.
    pub async fn mark_read(&self, id: &MessageId) -> Result<bool> {
        let outcome = self
            .request(|reply| Command::MarkRead {
                id: id.clone(),
                reply,
            })
            .await?;
        let changed = matches!(outcome, MarkOutcome::Marked { .. });
        if let Some(store_id) = outcome.confirm_id() {
            self.confirm_read(store_id).await?;
        }
        Ok(changed)
    }

    /// Mark every unread inbound message of a conversation, oldest first.
    /// A failed confirmation does not stop the rest; the first failure is
    /// returned once all were attempted.
    pub async fn mark_all_read(&self, peer_id: &str) -> Result<usize> {
        let outcomes = self
            .request(|reply| Command::MarkAllRead {
                peer_id: peer_id.to_string(),
                reply,
            })
            .await?;
        let marked = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, MarkOutcome::Marked { .. }))
            .count();

        let mut first_failure = None;
        for store_id in outcomes.iter().filter_map(MarkOutcome::confirm_id) {
            if let Err(e) = self.confirm_read(store_id).await {
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(marked),
        }
    }

    /// Switch the conversation the user is looking at. Its unread messages
    /// are marked read, as is anything arriving there until the next switch.
    /// Returns how many messages were marked.
    pub async fn set_active_conversation(&self, peer_id: Option<&str>) -> Result<usize> {
        self.request(|reply| Command::SetActive {
            peer_id: peer_id.map(str::to_string),
            reply,
        })
        .await
    }

    /// Load a conversation's messages from the store and return the merged
    /// thread. Falls back to local state if the store is unreachable. An
    /// unseen peer gets an empty conversation shell.
    pub async fn open_conversation(&self, peer_id: &str) -> Result<Vec<Message>> {
        self.check_peer(peer_id)?;
        match self.inner.store.fetch_conversation(self.user_id(), peer_id).await {
            Ok(raw) => {
                self.fold(dispatcher::normalize_batch(raw)).await?;
            }
            Err(e) => warn!(peer = %peer_id, error = %e, "Conversation fetch failed, using local state"),
        }
        if self.conversation(peer_id).await?.is_none() {
            self.start_conversation(peer_id).await?;
        }
        self.messages(peer_id).await
    }

    /// Make sure a conversation with `peer_id` exists, creating an empty
    /// shell named from the user directory when needed
    pub async fn start_conversation(&self, peer_id: &str) -> Result<ConversationSummary> {
        self.check_peer(peer_id)?;
        if let Some(existing) = self.conversation(peer_id).await? {
            return Ok(existing);
        }

        let display_name = match self.inner.directory.lookup(peer_id).await {
            Ok(Some(profile)) => profile.label(),
            Ok(None) => {
                debug!(peer = %peer_id, "Peer not found in directory");
                None
            }
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "Directory lookup failed");
                None
            }
        };

        self.request(|reply| Command::EnsureConversation {
            peer_id: peer_id.to_string(),
            display_name,
            reply,
        })
        .await?
        .ok_or_else(|| SyncError::InvalidPeer(peer_id.to_string()))
    }

    /// Conversations, most recently active first
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.request(|reply| Command::Conversations { reply }).await
    }

    pub async fn conversation(&self, peer_id: &str) -> Result<Option<ConversationSummary>> {
        self.request(|reply| Command::Conversation {
            peer_id: peer_id.to_string(),
            reply,
        })
        .await
    }

    /// Messages of one conversation in chronological order; empty if unknown
    pub async fn messages(&self, peer_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .request(|reply| Command::Messages {
                peer_id: peer_id.to_string(),
                reply,
            })
            .await?
            .unwrap_or_default())
    }

    /// Unread count recomputed from the messages, for consistency checks
    pub async fn recount_unread(&self, peer_id: &str) -> Result<Option<usize>> {
        self.request(|reply| Command::RecountUnread {
            peer_id: peer_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Retry unconfirmed read marks now instead of waiting for the timer
    pub async fn flush_read_state(&self) -> Result<()> {
        self.inner
            .commands
            .send(Command::FlushReadState)
            .await
            .map_err(|_| SyncError::EngineStopped)
    }

    pub fn transport_state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    pub fn watch_transport(&self) -> watch::Receiver<ConnectionState> {
        self.inner.transport.watch_state()
    }

    /// Subscribe to engine events. Slow subscribers may observe `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Disconnect the push channel and stop the actor. Idempotent.
    pub async fn shutdown(&self) {
        let handle = self.inner.actor.lock().await.take();
        let Some(handle) = handle else {
            return;
        };
        info!("Shutting down sync engine");
        self.inner.transport.disconnect().await;
        let _ = self.inner.commands.send(Command::Shutdown).await;
        if let Err(e) = handle.await {
            warn!(error = %e, "Engine actor ended abnormally");
        }
        info!("Sync engine stopped");
    }

    fn check_peer(&self, peer_id: &str) -> Result<()> {
        if peer_id.trim().is_empty() || peer_id == self.user_id() {
            return Err(SyncError::InvalidPeer(peer_id.to_string()));
        }
        Ok(())
    }

    async fn fold(&self, messages: Vec<Message>) -> Result<Vec<FoldOutcome>> {
        self.request(|reply| Command::Fold {
            messages,
            reply: Some(reply),
        })
        .await
    }

    async fn confirm_read(&self, message_id: &str) -> Result<()> {
        let result = self.inner.store.mark_read(message_id).await;
        let report = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
        let _ = self
            .inner
            .commands
            .send(Command::ReadConfirmed {
                message_id: message_id.to_string(),
                result: report,
            })
            .await;
        result.map_err(|e| {
            warn!(message_id = %message_id, error = %e, "Read confirmation failed, will retry");
            SyncError::ReadStateSyncFailed {
                message_id: message_id.to_string(),
                reason: e.to_string(),
            }
        })
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(make(tx))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }
}

struct EngineActor {
    local_user_id: String,
    aggregator: ConversationAggregator,
    read_state: ReadStateTracker,
    store: Arc<dyn MessageStore>,
    events: broadcast::Sender<EngineEvent>,
    /// Weak so that dropping every handle still stops the actor
    commands: mpsc::WeakSender<Command>,
    transport_state: ConnectionState,
    /// Highest push link epoch handled so far
    link_epoch: u64,
}

impl EngineActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut frames: mpsc::Receiver<String>,
        mut transport: watch::Receiver<ConnectionState>,
        mut epochs: watch::Receiver<u64>,
        flush_every: Duration,
    ) {
        let mut flush = interval(flush_every);
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        flush.tick().await;

        let mut frames_open = true;
        let mut transport_open = true;
        let mut epochs_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                frame = frames.recv(), if frames_open => match frame {
                    Some(body) => self.on_frame(&body),
                    None => frames_open = false,
                },
                changed = transport.changed(), if transport_open => match changed {
                    Ok(()) => {
                        let state = *transport.borrow_and_update();
                        self.on_transport_state(state);
                    }
                    Err(_) => transport_open = false,
                },
                changed = epochs.changed(), if epochs_open => match changed {
                    Ok(()) => {
                        let epoch = *epochs.borrow_and_update();
                        self.on_link_epoch(epoch);
                    }
                    Err(_) => epochs_open = false,
                },
                _ = flush.tick() => self.flush_read_state(),
            }
        }

        debug!(
            conversations = self.aggregator.len(),
            pending_reads = self.read_state.pending_len(),
            "Engine actor exiting"
        );
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Fold { messages, reply } => {
                let outcomes = self.fold_batch(messages);
                if let Some(reply) = reply {
                    let _ = reply.send(outcomes);
                }
            }
            Command::EnsureConversation {
                peer_id,
                display_name,
                reply,
            } => {
                if self.aggregator.ensure_conversation(&peer_id, display_name) {
                    info!(peer = %peer_id, "Started new conversation");
                    self.emit_conversation(&peer_id);
                }
                let _ = reply.send(self.aggregator.conversation(&peer_id));
            }
            Command::MarkRead { id, reply } => {
                let outcome = self.read_state.mark_read(&mut self.aggregator, &id);
                if let MarkOutcome::Marked { peer_id, .. } = &outcome {
                    self.emit_conversation(peer_id);
                }
                let _ = reply.send(outcome);
            }
            Command::MarkAllRead { peer_id, reply } => {
                let outcomes = self.read_state.mark_all(&mut self.aggregator, &peer_id);
                if !outcomes.is_empty() {
                    self.emit_conversation(&peer_id);
                }
                let _ = reply.send(outcomes);
            }
            Command::SetActive { peer_id, reply } => {
                self.read_state.set_active(peer_id.clone());
                let outcomes = match &peer_id {
                    Some(peer) => self.read_state.mark_all(&mut self.aggregator, peer),
                    None => Vec::new(),
                };
                if let (Some(peer), false) = (&peer_id, outcomes.is_empty()) {
                    self.emit_conversation(peer);
                }
                self.confirm_in_background(
                    outcomes
                        .iter()
                        .filter_map(MarkOutcome::confirm_id)
                        .map(str::to_string)
                        .collect(),
                );
                let _ = reply.send(outcomes.len());
            }
            Command::ReadConfirmed { message_id, result } => match result {
                Ok(()) => self.read_state.record_success(&message_id),
                Err(reason) => {
                    if self.read_state.record_failure(&message_id) {
                        debug!(message_id = %message_id, "Read confirmation queued for retry");
                    }
                    self.emit(EngineEvent::ReadStateSyncFailed { message_id, reason });
                }
            },
            Command::FlushReadState => self.flush_read_state(),
            Command::Conversations { reply } => {
                let _ = reply.send(self.aggregator.conversations());
            }
            Command::Conversation { peer_id, reply } => {
                let _ = reply.send(self.aggregator.conversation(&peer_id));
            }
            Command::Messages { peer_id, reply } => {
                let _ = reply.send(self.aggregator.messages(&peer_id));
            }
            Command::RecountUnread { peer_id, reply } => {
                let _ = reply.send(self.aggregator.recount_unread(&peer_id));
            }
            Command::Status { reply } => {
                let conversations = self.aggregator.conversations();
                let _ = reply.send(EngineStatus {
                    user_id: self.local_user_id.clone(),
                    transport: self.transport_state,
                    conversations: conversations.len(),
                    messages: conversations.iter().map(|c| c.message_count).sum(),
                    unread: conversations.iter().map(|c| c.unread_count).sum(),
                    active_conversation: self.read_state.active().map(str::to_string),
                    pending_read_confirmations: self.read_state.pending_len(),
                });
            }
            Command::Shutdown => {}
        }
    }

    fn on_frame(&mut self, body: &str) {
        match dispatcher::decode_frame(body) {
            Ok(message) => {
                debug!(id = %message.id, sender = %message.sender_id, "Push message received");
                self.fold_batch(vec![message]);
            }
            Err(e) => warn!(error = %e, "Dropping push frame"),
        }
    }

    /// Fold messages in order, auto-marking those that land in the active
    /// conversation, and publish what changed
    fn fold_batch(&mut self, messages: Vec<Message>) -> Vec<FoldOutcome> {
        let mut outcomes = Vec::with_capacity(messages.len());
        let mut touched: Vec<String> = Vec::new();
        let mut confirm = Vec::new();

        for message in messages {
            let id = message.id.clone();
            let outcome = self.aggregator.fold(message);
            outcomes.push(outcome);
            if outcome == FoldOutcome::Ignored {
                continue;
            }

            let Some(stored) = self.aggregator.find(&id).cloned() else {
                continue;
            };
            let Some(peer_id) = stored.peer_of(&self.local_user_id).map(str::to_string) else {
                continue;
            };

            if let Some(mark) = self.read_state.auto_mark(&mut self.aggregator, &stored) {
                if let Some(store_id) = mark.confirm_id() {
                    confirm.push(store_id.to_string());
                }
            }

            let message = self.aggregator.find(&id).cloned().unwrap_or(stored);
            self.emit(EngineEvent::MessageFolded {
                peer_id: peer_id.clone(),
                message,
            });
            if !touched.contains(&peer_id) {
                touched.push(peer_id);
            }
        }

        for peer_id in &touched {
            self.emit_conversation(peer_id);
        }
        self.confirm_in_background(confirm);
        outcomes
    }

    fn on_transport_state(&mut self, state: ConnectionState) {
        self.transport_state = state;
        self.emit(EngineEvent::TransportState { state });
    }

    /// Every link after the first may have missed pushes while down. The
    /// first one is seeded by `activate`.
    fn on_link_epoch(&mut self, epoch: u64) {
        if epoch <= self.link_epoch {
            return;
        }
        if epoch > 1 {
            info!(epoch, "Push channel re-established, backfilling history");
            self.backfill();
            self.flush_read_state();
        }
        self.link_epoch = epoch;
    }

    /// Fetch history off-actor and feed it back through the queue
    fn backfill(&self) {
        let store = self.store.clone();
        let commands = self.commands.clone();
        let user_id = self.local_user_id.clone();
        tokio::spawn(async move {
            let raw = match store.fetch_history(&user_id).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "Backfill after reconnect failed");
                    return;
                }
            };
            let messages = dispatcher::normalize_batch(raw);
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Fold { messages, reply: None }).await;
            }
        });
    }

    fn flush_read_state(&mut self) {
        let due = self.read_state.take_due();
        if !due.is_empty() {
            debug!(count = due.len(), "Retrying read confirmations");
            self.confirm_in_background(due);
        }
    }

    /// Tell the store about read marks without blocking the actor. Results
    /// come back as `ReadConfirmed`.
    fn confirm_in_background(&self, message_ids: Vec<String>) {
        if message_ids.is_empty() {
            return;
        }
        let store = self.store.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            for message_id in message_ids {
                let result = store.mark_read(&message_id).await.map_err(|e| {
                    warn!(message_id = %message_id, error = %e, "Read confirmation failed");
                    e.to_string()
                });
                let Some(commands) = commands.upgrade() else {
                    return;
                };
                let _ = commands.send(Command::ReadConfirmed { message_id, result }).await;
            }
        });
    }

    fn emit_conversation(&self, peer_id: &str) {
        if let Some(conversation) = self.aggregator.conversation(peer_id) {
            self.emit(EngineEvent::ConversationUpdated { conversation });
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
