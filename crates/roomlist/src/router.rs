use std::sync::Arc;

use futures::stream::SelectAll;
use futures::{FutureExt, StreamExt};
use roomlist_engine::{
    ArtifactCleaner, ConversationEngine, ConversationRef, ConversationState,
    ConversationStateEvent, EngineEvent, EngineSubscription, StateListener,
};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::config::ChatListConfig;
use crate::deletion::{DeletionBatch, DeletionTracker};
use crate::error::ChatListResult;
use crate::notifier::{IndexNotifier, Notice, NoticeChannel, SharedFlags};
use crate::store::{ConversationListStore, ListReader, ListSnapshot};

/// Anything the router reacts to, in delivery order.
#[derive(Debug)]
pub enum RouterInput {
    Engine(EngineEvent),
    /// The engine stream overflowed and `skipped` notifications were lost.
    Lagged { skipped: u64 },
    EngineClosed,
    ConversationState(ConversationStateEvent),
}

/// Classifies engine notifications and applies them to the conversation list.
///
/// All inputs are handled one at a time; each handler runs to completion,
/// including the snapshot publish, before the next input is looked at.
pub struct EventRouter {
    engine: Arc<dyn ConversationEngine>,
    store: ConversationListStore,
    tracker: DeletionTracker,
    index_notifier: IndexNotifier,
    notices: NoticeChannel,
    flags: Arc<SharedFlags>,
    subscription: Option<EngineSubscription>,
    state_listeners: SelectAll<StateListener>,
}

impl EventRouter {
    pub fn new(
        engine: Arc<dyn ConversationEngine>,
        cleaner: Arc<dyn ArtifactCleaner>,
        config: &ChatListConfig,
    ) -> Self {
        let flags = SharedFlags::new(engine.group_chat_available());
        Self {
            store: ConversationListStore::new(engine.clone()),
            tracker: DeletionTracker::new(engine.clone(), cleaner, config),
            index_notifier: IndexNotifier::new(config.index_event_capacity),
            notices: NoticeChannel::new(config.notice_capacity),
            flags: Arc::new(flags),
            subscription: None,
            state_listeners: SelectAll::new(),
            engine,
        }
    }

    pub fn reader(&self) -> ListReader {
        self.store.reader()
    }

    pub fn snapshot(&self) -> Arc<ListSnapshot> {
        self.store.snapshot()
    }

    pub fn index_notifier(&self) -> &IndexNotifier {
        &self.index_notifier
    }

    pub fn notices(&self) -> &NoticeChannel {
        &self.notices
    }

    pub fn flags(&self) -> Arc<SharedFlags> {
        self.flags.clone()
    }

    pub fn tracker(&self) -> &DeletionTracker {
        &self.tracker
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_some()
    }

    /// Subscribes to the engine and loads the initial list.
    pub fn activate(&mut self) {
        if self.subscription.is_some() {
            return;
        }
        // Subscribe first so nothing emitted during the rebuild is missed.
        self.subscription = Some(self.engine.subscribe());
        self.store.rebuild();
        tracing::info!("conversation list activated");
    }

    /// Unsubscribes, drops pending deletion listeners and releases every summary.
    pub fn deactivate(&mut self) {
        self.subscription = None;
        self.state_listeners = SelectAll::new();
        self.tracker.clear();
        self.store.clear();
        tracing::info!("conversation list deactivated");
    }

    pub fn refresh(&mut self) {
        self.store.rebuild();
    }

    pub fn delete_one(&mut self, conversation: &ConversationRef) -> ChatListResult<()> {
        let batch = self.tracker.begin_batch(1);
        self.submit_deletion(batch, conversation)
    }

    /// Submits every conversation; the first refusal is returned after all were tried.
    pub fn delete_many(&mut self, conversations: &[ConversationRef]) -> ChatListResult<()> {
        let batch = self.tracker.begin_batch(conversations.len());
        let mut first_error = None;
        for conversation in conversations {
            if let Err(error) = self.submit_deletion(batch, conversation) {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn handle_input(&mut self, input: RouterInput) {
        match input {
            RouterInput::Engine(event) => self.handle_engine_event(event),
            RouterInput::Lagged { skipped } => {
                tracing::warn!(skipped, "engine notifications lost, rebuilding conversation list");
                self.store.rebuild();
            }
            RouterInput::EngineClosed => {
                tracing::warn!("engine notification stream closed");
                self.subscription = None;
            }
            RouterInput::ConversationState(event) => self.handle_state_event(event),
        }
    }

    pub fn handle_engine_event(&mut self, event: EngineEvent) {
        tracing::debug!(kind = event.kind(), conversation = %event.conversation().id(), "engine event");
        match event {
            EngineEvent::StateChanged {
                conversation,
                state: ConversationState::Created,
            } => self.store.insert_at_front(conversation),
            EngineEvent::StateChanged {
                conversation,
                state: ConversationState::TerminationFailed,
            } => {
                let conversation_id = conversation.id();
                tracing::error!(
                    conversation = %conversation_id,
                    peer = conversation_id.peer_address(),
                    "conversation removal failed"
                );
                self.notices
                    .raise(Notice::ConversationRemovalFailed { conversation_id });
            }
            EngineEvent::StateChanged { .. } => {}
            EngineEvent::MessageSent { conversation }
            | EngineEvent::MessagesReceived { conversation, .. } => {
                self.on_conversation_changed(&conversation);
            }
            EngineEvent::ConversationRead { conversation }
            | EngineEvent::EphemeralMessageDeleted { conversation }
            | EngineEvent::SubjectChanged { conversation } => {
                self.notify_changed(&conversation);
            }
        }
    }

    /// Applies an event delivered by a per-conversation deletion listener.
    pub fn handle_state_event(&mut self, event: ConversationStateEvent) {
        match event.state {
            ConversationState::Deleted => {
                tracing::info!(conversation = %event.conversation_id, "conversation deleted, removing it from list");
                self.store.remove_by_id(&event.conversation_id);
                self.tracker.complete(&event.conversation_id);
            }
            ConversationState::TerminationFailed => {
                // The notice comes from the engine-wide stream; only the watch ends here.
                self.tracker.complete(&event.conversation_id);
            }
            state => {
                tracing::debug!(conversation = %event.conversation_id, %state, "deletion in progress");
            }
        }
    }

    /// Message activity: the item may have changed rank.
    pub fn on_conversation_changed(&mut self, conversation: &ConversationRef) {
        match self.store.index_of(&conversation.id()) {
            None => {
                tracing::warn!(conversation = %conversation.id(), "changed conversation not listed, rebuilding");
                self.store.rebuild();
            }
            Some(0) => self.index_notifier.notify(0),
            Some(_) => self.store.reorder_by_recency(),
        }
    }

    /// Metadata change: the item keeps its rank, only its row needs a refresh.
    pub fn notify_changed(&mut self, conversation: &ConversationRef) {
        match self.store.index_of(&conversation.id()) {
            None => {
                tracing::warn!(conversation = %conversation.id(), "updated conversation not listed, rebuilding");
                self.store.rebuild();
            }
            Some(index) => self.index_notifier.notify(index),
        }
    }

    /// Whether [`EventRouter::next_input`] has anything to wait on.
    pub fn has_inputs(&self) -> bool {
        self.subscription.is_some() || !self.state_listeners.is_empty()
    }

    pub async fn next_input(&mut self) -> Option<RouterInput> {
        let listeners = &mut self.state_listeners;
        let has_listeners = !listeners.is_empty();
        match self.subscription.as_mut() {
            Some(subscription) => tokio::select! {
                received = subscription.recv() => Some(match received {
                    Ok(event) => RouterInput::Engine(event),
                    Err(RecvError::Lagged(skipped)) => RouterInput::Lagged { skipped },
                    Err(RecvError::Closed) => RouterInput::EngineClosed,
                }),
                Some(event) = listeners.next(), if has_listeners => {
                    Some(RouterInput::ConversationState(event))
                }
            },
            None if has_listeners => listeners.next().await.map(RouterInput::ConversationState),
            None => None,
        }
    }

    /// Handles every input that is ready without waiting; returns how many were handled.
    pub fn process_ready(&mut self) -> usize {
        let mut handled = 0;
        while let Some(input) = self.try_next_input() {
            self.handle_input(input);
            handled += 1;
        }
        handled
    }

    fn try_next_input(&mut self) -> Option<RouterInput> {
        if let Some(subscription) = self.subscription.as_mut() {
            match subscription.try_recv() {
                Ok(event) => return Some(RouterInput::Engine(event)),
                Err(TryRecvError::Lagged(skipped)) => return Some(RouterInput::Lagged { skipped }),
                Err(TryRecvError::Closed) => return Some(RouterInput::EngineClosed),
                Err(TryRecvError::Empty) => {}
            }
        }
        if self.state_listeners.is_empty() {
            return None;
        }
        self.state_listeners
            .next()
            .now_or_never()
            .flatten()
            .map(RouterInput::ConversationState)
    }

    fn submit_deletion(
        &mut self,
        batch: DeletionBatch,
        conversation: &ConversationRef,
    ) -> ChatListResult<()> {
        match self.tracker.submit(batch, conversation) {
            Ok(listener) => {
                self.state_listeners.push(listener);
                Ok(())
            }
            Err(error) => {
                tracing::error!("failed to delete conversation: {error}");
                self.notices.raise(Notice::ConversationRemovalFailed {
                    conversation_id: conversation.id(),
                });
                Err(error)
            }
        }
    }
}
