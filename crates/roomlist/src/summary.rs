use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use roomlist_engine::{ConversationId, ConversationRef};

/// Display-ready view of one conversation.
///
/// The summary holds a retained engine reference until [`ConversationSummary::destroy`]
/// runs. Fields read for rendering are captured at construction so an older
/// snapshot stays readable after its summaries were destroyed.
#[derive(Debug)]
pub struct ConversationSummary {
    id: ConversationId,
    conversation: ConversationRef,
    subject: Option<String>,
    unread_messages_count: u32,
    is_group: bool,
    last_update_time: AtomicI64,
    released: AtomicBool,
}

impl ConversationSummary {
    pub fn new(conversation: ConversationRef) -> Self {
        conversation.retain();
        Self {
            id: conversation.id(),
            subject: conversation.subject(),
            unread_messages_count: conversation.unread_messages_count(),
            is_group: conversation.is_group(),
            last_update_time: AtomicI64::new(conversation.last_update_time()),
            conversation,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn unread_messages_count(&self) -> u32 {
        self.unread_messages_count
    }

    pub fn is_group(&self) -> bool {
        self.is_group
    }

    /// Recency key; live from the engine while the summary is still retained.
    pub fn last_update_time(&self) -> i64 {
        if self.is_released() {
            self.last_update_time.load(Ordering::Acquire)
        } else {
            self.conversation.last_update_time()
        }
    }

    pub fn conversation(&self) -> Option<&ConversationRef> {
        (!self.is_released()).then_some(&self.conversation)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Freezes the recency key and releases the engine reference. Later calls are no-ops.
    pub fn destroy(&self) {
        if self.is_released() {
            return;
        }
        self.last_update_time
            .store(self.conversation.last_update_time(), Ordering::Release);
        if !self.released.swap(true, Ordering::AcqRel) {
            self.conversation.release();
        }
    }
}

impl Drop for ConversationSummary {
    fn drop(&mut self) {
        if !self.is_released() {
            tracing::warn!(conversation = %self.id, "summary dropped without destroy, releasing");
            self.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use roomlist_engine::{Conversation, MemoryConversation};

    use super::*;

    fn conversation() -> Arc<MemoryConversation> {
        Arc::new(
            MemoryConversation::new(
                ConversationId::from_addresses("sip:me@example.org", "sip:alice@example.org"),
                false,
                100,
            )
            .with_subject("Alice"),
        )
    }

    #[test]
    fn destroy_releases_exactly_once() {
        let conversation = conversation();
        let summary = ConversationSummary::new(conversation.clone());
        assert_eq!(conversation.references(), 1);

        summary.destroy();
        summary.destroy();
        assert_eq!(conversation.references(), 0);

        drop(summary);
        assert_eq!(conversation.references(), 0);
    }

    #[test]
    fn drop_without_destroy_still_releases() {
        let conversation = conversation();
        drop(ConversationSummary::new(conversation.clone()));
        assert_eq!(conversation.references(), 0);
    }

    #[test]
    fn released_summary_freezes_recency_at_release() {
        let conversation = conversation();
        let summary = ConversationSummary::new(conversation.clone());
        conversation.push_history(roomlist_engine::EventLog::chat_message(250, Vec::new()));
        assert_eq!(summary.last_update_time(), 250);

        summary.destroy();
        conversation.push_history(roomlist_engine::EventLog::chat_message(300, Vec::new()));
        assert_eq!(summary.last_update_time(), 250);
        assert_eq!(summary.subject(), Some("Alice"));
        assert!(summary.conversation().is_none());
        assert_eq!(conversation.last_update_time(), 300);
    }
}
