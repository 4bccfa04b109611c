use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::Conversation;
use super::ids::{ConversationId, EventLogId};

/// Shared reference to an engine-owned conversation.
pub type ConversationRef = Arc<dyn Conversation>;

/// Engine lifecycle of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationState {
    Instantiated,
    CreationPending,
    Created,
    CreationFailed,
    TerminationPending,
    Terminated,
    TerminationFailed,
    Deleted,
}

impl ConversationState {
    /// Returns true for the two outcomes a delete request can end in.
    pub fn is_deletion_outcome(self) -> bool {
        matches!(self, Self::Deleted | Self::TerminationFailed)
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Instantiated => "instantiated",
            Self::CreationPending => "creation-pending",
            Self::Created => "created",
            Self::CreationFailed => "creation-failed",
            Self::TerminationPending => "termination-pending",
            Self::Terminated => "terminated",
            Self::TerminationFailed => "termination-failed",
            Self::Deleted => "deleted",
        };
        formatter.write_str(name)
    }
}

/// One historical record of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLog {
    pub id: EventLogId,
    // Files the engine downloaded or sent for this record; removed before deletion.
    pub attachments: Vec<PathBuf>,
    pub created_at_unix_seconds: i64,
}

impl EventLog {
    pub fn chat_message(created_at_unix_seconds: i64, attachments: Vec<PathBuf>) -> Self {
        Self {
            id: EventLogId::new_v7(),
            attachments,
            created_at_unix_seconds,
        }
    }
}

/// Notifications published on the engine-wide stream.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged {
        conversation: ConversationRef,
        state: ConversationState,
    },
    MessageSent {
        conversation: ConversationRef,
    },
    MessagesReceived {
        conversation: ConversationRef,
        count: usize,
    },
    ConversationRead {
        conversation: ConversationRef,
    },
    EphemeralMessageDeleted {
        conversation: ConversationRef,
    },
    SubjectChanged {
        conversation: ConversationRef,
    },
}

impl EngineEvent {
    pub fn conversation(&self) -> &ConversationRef {
        match self {
            Self::StateChanged { conversation, .. }
            | Self::MessageSent { conversation }
            | Self::MessagesReceived { conversation, .. }
            | Self::ConversationRead { conversation }
            | Self::EphemeralMessageDeleted { conversation }
            | Self::SubjectChanged { conversation } => conversation,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state-changed",
            Self::MessageSent { .. } => "message-sent",
            Self::MessagesReceived { .. } => "messages-received",
            Self::ConversationRead { .. } => "conversation-read",
            Self::EphemeralMessageDeleted { .. } => "ephemeral-message-deleted",
            Self::SubjectChanged { .. } => "subject-changed",
        }
    }
}

/// State change delivered through a per-conversation listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationStateEvent {
    pub conversation_id: ConversationId,
    pub state: ConversationState,
}
