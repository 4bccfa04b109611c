pub mod error;
pub mod ids;
pub mod listener;
pub mod memory;
pub mod types;

use std::fmt;

use tokio::sync::broadcast;

pub use error::{EngineError, EngineResult};
pub use ids::{ConversationId, EventLogId};
pub use listener::StateListener;
pub use memory::{MemoryConversation, MemoryEngine};
pub use types::{ConversationRef, ConversationState, ConversationStateEvent, EngineEvent, EventLog};

/// Receiver side of the engine-wide notification stream.
pub type EngineSubscription = broadcast::Receiver<EngineEvent>;

/// One conversation as seen through the engine.
///
/// The engine keeps the conversation alive while at least one holder has called
/// [`Conversation::retain`] without a matching [`Conversation::release`].
pub trait Conversation: fmt::Debug + Send + Sync {
    fn id(&self) -> ConversationId;
    /// Unix timestamp of the most recent activity.
    fn last_update_time(&self) -> i64;
    fn subject(&self) -> Option<String>;
    fn unread_messages_count(&self) -> u32;
    fn is_group(&self) -> bool;
    /// History records starting at `begin` (0 is the oldest).
    fn history_events(&self, begin: usize) -> Vec<EventLog>;
    fn retain(&self);
    fn release(&self);
}

pub trait ConversationEngine: Send + Sync {
    /// Current conversations in the engine's native order.
    fn conversations(&self) -> Vec<ConversationRef>;
    fn subscribe(&self) -> EngineSubscription;
    /// Attaches a listener that receives state changes of one conversation.
    fn add_state_listener(&self, conversation_id: &ConversationId) -> EngineResult<StateListener>;
    /// Requests deletion; the outcome arrives as a state change.
    fn delete_conversation(&self, conversation_id: &ConversationId) -> EngineResult<()>;
    fn group_chat_available(&self) -> bool;
}

/// Side effects tied to a conversation that live outside the engine.
pub trait ArtifactCleaner: Send + Sync {
    fn delete_attachments(&self, event: &EventLog);
    fn dismiss_notification(&self, conversation_id: &ConversationId);
    fn remove_shortcut(&self, conversation_id: &ConversationId);
}
