//! In-process engine that keeps conversations in memory.
//!
//! It follows the same notification contract as a networked engine: every
//! mutation is announced on the broadcast stream, and delete requests only
//! complete once [`MemoryEngine::confirm_deletion`] or
//! [`MemoryEngine::fail_deletion`] is called.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::mpsc::{UnboundedSender, unbounded};
use snafu::{OptionExt, ensure};
use tokio::sync::broadcast;

use super::error::{ConversationNotFoundSnafu, DeleteRejectedSnafu, EngineResult};
use super::ids::ConversationId;
use super::listener::StateListener;
use super::types::{ConversationRef, ConversationState, EngineEvent, EventLog};
use super::{Conversation, ConversationEngine, EngineSubscription};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct MemoryConversation {
    id: ConversationId,
    is_group: bool,
    last_update_time: AtomicI64,
    unread_messages_count: AtomicU32,
    subject: Mutex<Option<String>>,
    history: Mutex<Vec<EventLog>>,
    state: Mutex<ConversationState>,
    references: AtomicUsize,
}

impl MemoryConversation {
    pub fn new(id: ConversationId, is_group: bool, last_update_time: i64) -> Self {
        Self {
            id,
            is_group,
            last_update_time: AtomicI64::new(last_update_time),
            unread_messages_count: AtomicU32::new(0),
            subject: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            state: Mutex::new(ConversationState::Instantiated),
            references: AtomicUsize::new(0),
        }
    }

    pub fn with_subject(self, subject: impl Into<String>) -> Self {
        *lock(&self.subject) = Some(subject.into());
        self
    }

    pub fn state(&self) -> ConversationState {
        *lock(&self.state)
    }

    /// Number of holders that retained this conversation and have not released it.
    pub fn references(&self) -> usize {
        self.references.load(Ordering::SeqCst)
    }

    pub fn push_history(&self, event: EventLog) {
        self.last_update_time
            .fetch_max(event.created_at_unix_seconds, Ordering::SeqCst);
        lock(&self.history).push(event);
    }

    fn set_state(&self, state: ConversationState) {
        *lock(&self.state) = state;
    }
}

impl Conversation for MemoryConversation {
    fn id(&self) -> ConversationId {
        self.id.clone()
    }

    fn last_update_time(&self) -> i64 {
        self.last_update_time.load(Ordering::SeqCst)
    }

    fn subject(&self) -> Option<String> {
        lock(&self.subject).clone()
    }

    fn unread_messages_count(&self) -> u32 {
        self.unread_messages_count.load(Ordering::SeqCst)
    }

    fn is_group(&self) -> bool {
        self.is_group
    }

    fn history_events(&self, begin: usize) -> Vec<EventLog> {
        lock(&self.history).iter().skip(begin).cloned().collect()
    }

    fn retain(&self) {
        self.references.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        let released = self
            .references
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });
        if released.is_err() {
            tracing::warn!(conversation = %self.id, "release called without a matching retain");
        }
    }
}

pub struct MemoryEngine {
    conversations: Mutex<Vec<Arc<MemoryConversation>>>,
    retired: Mutex<Vec<Arc<MemoryConversation>>>,
    state_listeners: Mutex<HashMap<ConversationId, Vec<UnboundedSender<ConversationState>>>>,
    pending_deletions: Mutex<HashSet<ConversationId>>,
    events: broadcast::Sender<EngineEvent>,
    enumerations: AtomicUsize,
    group_chat_available: bool,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MemoryEngine {
    pub fn new(group_chat_available: bool) -> Self {
        Self::with_event_capacity(group_chat_available, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(group_chat_available: bool, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            conversations: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            state_listeners: Mutex::new(HashMap::new()),
            pending_deletions: Mutex::new(HashSet::new()),
            events,
            enumerations: AtomicUsize::new(0),
            group_chat_available,
        }
    }

    /// Adds an already existing conversation without announcing it.
    pub fn insert_conversation(&self, conversation: MemoryConversation) -> Arc<MemoryConversation> {
        let conversation = Arc::new(conversation);
        conversation.set_state(ConversationState::Created);
        lock(&self.conversations).push(conversation.clone());
        conversation
    }

    /// Adds a conversation and announces it as created.
    pub fn create_conversation(&self, conversation: MemoryConversation) -> Arc<MemoryConversation> {
        let conversation = self.insert_conversation(conversation);
        tracing::debug!(conversation = %conversation.id, "memory engine created conversation");
        self.publish(EngineEvent::StateChanged {
            conversation: conversation.clone(),
            state: ConversationState::Created,
        });
        conversation
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<Arc<MemoryConversation>> {
        lock(&self.conversations)
            .iter()
            .find(|conversation| &conversation.id == conversation_id)
            .cloned()
    }

    pub fn send_message(&self, conversation_id: &ConversationId, at: i64) -> EngineResult<()> {
        let conversation = self.require(conversation_id, "send-message")?;
        conversation.push_history(EventLog::chat_message(at, Vec::new()));
        self.publish(EngineEvent::MessageSent { conversation });
        Ok(())
    }

    pub fn receive_messages(
        &self,
        conversation_id: &ConversationId,
        count: usize,
        at: i64,
    ) -> EngineResult<()> {
        self.receive_messages_with_attachments(conversation_id, count, at, Vec::new())
    }

    pub fn receive_messages_with_attachments(
        &self,
        conversation_id: &ConversationId,
        count: usize,
        at: i64,
        attachments: Vec<PathBuf>,
    ) -> EngineResult<()> {
        let conversation = self.require(conversation_id, "receive-messages")?;
        for index in 0..count {
            let files = if index == 0 {
                attachments.clone()
            } else {
                Vec::new()
            };
            conversation.push_history(EventLog::chat_message(at, files));
        }
        let added = u32::try_from(count).unwrap_or(u32::MAX);
        conversation
            .unread_messages_count
            .fetch_add(added, Ordering::SeqCst);
        self.publish(EngineEvent::MessagesReceived {
            conversation,
            count,
        });
        Ok(())
    }

    pub fn mark_read(&self, conversation_id: &ConversationId) -> EngineResult<()> {
        let conversation = self.require(conversation_id, "mark-read")?;
        conversation.unread_messages_count.store(0, Ordering::SeqCst);
        self.publish(EngineEvent::ConversationRead { conversation });
        Ok(())
    }

    pub fn set_subject(
        &self,
        conversation_id: &ConversationId,
        subject: impl Into<String>,
    ) -> EngineResult<()> {
        let conversation = self.require(conversation_id, "set-subject")?;
        *lock(&conversation.subject) = Some(subject.into());
        self.publish(EngineEvent::SubjectChanged { conversation });
        Ok(())
    }

    /// Drops the newest history record as if its ephemeral lifetime ran out.
    pub fn expire_ephemeral_message(&self, conversation_id: &ConversationId) -> EngineResult<()> {
        let conversation = self.require(conversation_id, "expire-ephemeral-message")?;
        lock(&conversation.history).pop();
        self.publish(EngineEvent::EphemeralMessageDeleted { conversation });
        Ok(())
    }

    /// Completes a pending delete request successfully.
    pub fn confirm_deletion(&self, conversation_id: &ConversationId) -> EngineResult<()> {
        let conversation = self.take_pending(conversation_id, "confirm-deletion")?;
        {
            let mut conversations = lock(&self.conversations);
            conversations.retain(|candidate| &candidate.id != conversation_id);
        }
        lock(&self.retired).push(conversation.clone());
        self.transition(conversation, ConversationState::Deleted);
        Ok(())
    }

    /// Completes a pending delete request with a failure.
    pub fn fail_deletion(&self, conversation_id: &ConversationId) -> EngineResult<()> {
        let conversation = self.take_pending(conversation_id, "fail-deletion")?;
        self.transition(conversation, ConversationState::TerminationFailed);
        Ok(())
    }

    pub fn pending_deletions(&self) -> Vec<ConversationId> {
        let mut pending = lock(&self.pending_deletions)
            .iter()
            .cloned()
            .collect::<Vec<_>>();
        pending.sort();
        pending
    }

    /// How many times the full conversation set was enumerated.
    pub fn enumeration_count(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    /// Retains not yet released across live and deleted conversations.
    pub fn outstanding_references(&self) -> usize {
        let live = lock(&self.conversations)
            .iter()
            .map(|conversation| conversation.references())
            .sum::<usize>();
        let retired = lock(&self.retired)
            .iter()
            .map(|conversation| conversation.references())
            .sum::<usize>();
        live + retired
    }

    pub fn attached_state_listeners(&self, conversation_id: &ConversationId) -> usize {
        lock(&self.state_listeners)
            .get(conversation_id)
            .map_or(0, |senders| {
                senders.iter().filter(|sender| !sender.is_closed()).count()
            })
    }

    fn require(
        &self,
        conversation_id: &ConversationId,
        stage: &'static str,
    ) -> EngineResult<Arc<MemoryConversation>> {
        self.conversation(conversation_id)
            .context(ConversationNotFoundSnafu {
                stage,
                id: conversation_id.clone(),
            })
    }

    fn take_pending(
        &self,
        conversation_id: &ConversationId,
        stage: &'static str,
    ) -> EngineResult<Arc<MemoryConversation>> {
        let conversation = self.require(conversation_id, stage)?;
        let was_pending = lock(&self.pending_deletions).remove(conversation_id);
        ensure!(
            was_pending,
            DeleteRejectedSnafu {
                stage,
                id: conversation_id.clone(),
                reason: "no delete request is pending",
            }
        );
        Ok(conversation)
    }

    fn transition(&self, conversation: Arc<MemoryConversation>, state: ConversationState) {
        conversation.set_state(state);
        self.notify_state_listeners(&conversation.id, state);
        self.publish(EngineEvent::StateChanged {
            conversation,
            state,
        });
    }

    fn notify_state_listeners(&self, conversation_id: &ConversationId, state: ConversationState) {
        let mut listeners = lock(&self.state_listeners);
        if let Some(senders) = listeners.get_mut(conversation_id) {
            senders.retain(|sender| sender.unbounded_send(state).is_ok());
            if senders.is_empty() {
                listeners.remove(conversation_id);
            }
        }
    }

    fn publish(&self, event: EngineEvent) {
        let kind = event.kind();
        if self.events.send(event).is_err() {
            tracing::trace!(kind, "engine event dropped without subscribers");
        }
    }
}

impl ConversationEngine for MemoryEngine {
    fn conversations(&self) -> Vec<ConversationRef> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        lock(&self.conversations)
            .iter()
            .map(|conversation| conversation.clone() as ConversationRef)
            .collect()
    }

    fn subscribe(&self) -> EngineSubscription {
        self.events.subscribe()
    }

    fn add_state_listener(&self, conversation_id: &ConversationId) -> EngineResult<StateListener> {
        self.require(conversation_id, "add-state-listener")?;
        let (sender, receiver) = unbounded();
        let mut listeners = lock(&self.state_listeners);
        let senders = listeners.entry(conversation_id.clone()).or_default();
        senders.retain(|existing| !existing.is_closed());
        senders.push(sender);
        Ok(StateListener::new(conversation_id.clone(), receiver))
    }

    fn delete_conversation(&self, conversation_id: &ConversationId) -> EngineResult<()> {
        let conversation = self.require(conversation_id, "delete-conversation")?;
        let newly_pending = lock(&self.pending_deletions).insert(conversation_id.clone());
        ensure!(
            newly_pending,
            DeleteRejectedSnafu {
                stage: "delete-conversation",
                id: conversation_id.clone(),
                reason: "a delete request is already pending",
            }
        );
        self.transition(conversation, ConversationState::TerminationPending);
        Ok(())
    }

    fn group_chat_available(&self) -> bool {
        self.group_chat_available
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
