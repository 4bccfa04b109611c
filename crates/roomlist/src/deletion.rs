use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;

use roomlist_engine::{
    ArtifactCleaner, ConversationEngine, ConversationId, ConversationRef, EventLog, StateListener,
};
use snafu::ResultExt;

use crate::config::ChatListConfig;
use crate::error::{AttachListenerSnafu, ChatListResult, DeleteRequestSnafu};

/// Removes attachment files from disk. Platform notifications and shortcuts do
/// not exist outside a desktop or mobile shell, so those steps only log.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsArtifactCleaner;

impl ArtifactCleaner for FsArtifactCleaner {
    fn delete_attachments(&self, event: &EventLog) {
        for path in &event.attachments {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(event = %event.id, "deleted attachment {:?}", path),
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => {
                    tracing::warn!(event = %event.id, "failed to delete attachment {:?}: {error}", path);
                }
            }
        }
    }

    fn dismiss_notification(&self, conversation_id: &ConversationId) {
        tracing::debug!(conversation = %conversation_id, "no notification shell, nothing to dismiss");
    }

    fn remove_shortcut(&self, conversation_id: &ConversationId) {
        tracing::debug!(conversation = %conversation_id, "no shortcut shell, nothing to remove");
    }
}

/// Batch a watched conversation was submitted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeletionBatch(pub u64);

/// Coordinates delete requests and the one-shot listeners observing their outcome.
pub struct DeletionTracker {
    engine: Arc<dyn ConversationEngine>,
    cleaner: Arc<dyn ArtifactCleaner>,
    cleanup_attachments: bool,
    dismiss_platform_artifacts: bool,
    pending_count: usize,
    watched: HashMap<ConversationId, DeletionBatch>,
    next_batch: u64,
}

impl DeletionTracker {
    pub fn new(
        engine: Arc<dyn ConversationEngine>,
        cleaner: Arc<dyn ArtifactCleaner>,
        config: &ChatListConfig,
    ) -> Self {
        Self {
            engine,
            cleaner,
            cleanup_attachments: config.cleanup_attachments,
            dismiss_platform_artifacts: config.dismiss_platform_artifacts,
            pending_count: 0,
            watched: HashMap::new(),
            next_batch: 0,
        }
    }

    /// Size of the most recent delete batch. Instrumentation only.
    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    /// Conversations whose deletion outcome has not been observed yet.
    pub fn outstanding(&self) -> usize {
        self.watched.len()
    }

    pub fn is_watching(&self, conversation_id: &ConversationId) -> bool {
        self.watched.contains_key(conversation_id)
    }

    pub fn batch_of(&self, conversation_id: &ConversationId) -> Option<DeletionBatch> {
        self.watched.get(conversation_id).copied()
    }

    /// Starts a batch of `size` deletions.
    pub fn begin_batch(&mut self, size: usize) -> DeletionBatch {
        self.pending_count = size;
        self.next_batch += 1;
        DeletionBatch(self.next_batch)
    }

    /// Cleans up one conversation, attaches its outcome listener and submits the delete.
    pub fn submit(
        &mut self,
        batch: DeletionBatch,
        conversation: &ConversationRef,
    ) -> ChatListResult<StateListener> {
        let conversation_id = conversation.id();
        self.release_artifacts(conversation, &conversation_id);

        let listener = self
            .engine
            .add_state_listener(&conversation_id)
            .context(AttachListenerSnafu {
                stage: "attach-deletion-listener",
                id: conversation_id.clone(),
            })?;
        let previous = self.watched.insert(conversation_id.clone(), batch);

        if let Err(source) = self.engine.delete_conversation(&conversation_id) {
            match previous {
                Some(earlier) => self.watched.insert(conversation_id.clone(), earlier),
                None => self.watched.remove(&conversation_id),
            };
            return Err(source).context(DeleteRequestSnafu {
                stage: "request-conversation-deletion",
                id: conversation_id,
            });
        }

        tracing::info!(conversation = %conversation_id, batch = batch.0, "requested conversation deletion");
        Ok(listener)
    }

    /// Detaches the watch for `conversation_id`, returning its batch if one was attached.
    pub fn complete(&mut self, conversation_id: &ConversationId) -> Option<DeletionBatch> {
        self.watched.remove(conversation_id)
    }

    /// Forgets every watch; their listeners are dropped by the caller.
    pub fn clear(&mut self) {
        self.watched.clear();
    }

    fn release_artifacts(&self, conversation: &ConversationRef, conversation_id: &ConversationId) {
        if self.cleanup_attachments {
            for event in conversation.history_events(0) {
                self.cleaner.delete_attachments(&event);
            }
        }
        if self.dismiss_platform_artifacts {
            self.cleaner.dismiss_notification(conversation_id);
            self.cleaner.remove_shortcut(conversation_id);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use roomlist_engine::{MemoryConversation, MemoryEngine};

    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct RecordingCleaner {
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl RecordingCleaner {
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("calls lock").push(call);
        }
    }

    impl ArtifactCleaner for RecordingCleaner {
        fn delete_attachments(&self, event: &EventLog) {
            self.record(format!("attachments:{}", event.attachments.len()));
        }

        fn dismiss_notification(&self, conversation_id: &ConversationId) {
            self.record(format!("notification:{}", conversation_id.peer_address()));
        }

        fn remove_shortcut(&self, conversation_id: &ConversationId) {
            self.record(format!("shortcut:{}", conversation_id.peer_address()));
        }
    }

    fn id(peer: &str) -> ConversationId {
        ConversationId::from_addresses("sip:me@example.org", peer)
    }

    #[test]
    fn submit_cleans_up_before_deleting() {
        let engine = Arc::new(MemoryEngine::default());
        let conversation = engine.insert_conversation(MemoryConversation::new(id("bob"), false, 1));
        engine
            .receive_messages(&id("bob"), 2, 5)
            .expect("messages received");
        let cleaner = Arc::new(RecordingCleaner::default());
        let mut tracker =
            DeletionTracker::new(engine.clone(), cleaner.clone(), &ChatListConfig::default());

        let batch = tracker.begin_batch(1);
        let conversation: ConversationRef = conversation;
        let _listener = tracker.submit(batch, &conversation).expect("submitted");

        assert_eq!(
            cleaner.calls(),
            vec!["attachments:0", "attachments:0", "notification:bob", "shortcut:bob"]
        );
        assert_eq!(engine.pending_deletions(), vec![id("bob")]);
        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(tracker.batch_of(&id("bob")), Some(batch));
    }

    #[test]
    fn disabled_cleanup_skips_artifacts() {
        let engine = Arc::new(MemoryEngine::default());
        let conversation: ConversationRef =
            engine.insert_conversation(MemoryConversation::new(id("bob"), false, 1));
        let cleaner = Arc::new(RecordingCleaner::default());
        let config = ChatListConfig {
            cleanup_attachments: false,
            dismiss_platform_artifacts: false,
            ..ChatListConfig::default()
        };
        let mut tracker = DeletionTracker::new(engine, cleaner.clone(), &config);

        let batch = tracker.begin_batch(1);
        tracker.submit(batch, &conversation).expect("submitted");
        assert!(cleaner.calls().is_empty());
    }

    #[test]
    fn refused_delete_keeps_the_earlier_watch() {
        let engine = Arc::new(MemoryEngine::default());
        let conversation: ConversationRef =
            engine.insert_conversation(MemoryConversation::new(id("bob"), false, 1));
        let mut tracker = DeletionTracker::new(
            engine.clone(),
            Arc::new(FsArtifactCleaner),
            &ChatListConfig::default(),
        );

        let first_batch = tracker.begin_batch(1);
        let _first = tracker.submit(first_batch, &conversation).expect("submitted");
        let second_batch = tracker.begin_batch(1);
        let second = tracker.submit(second_batch, &conversation);

        assert!(second.is_err());
        assert_eq!(tracker.batch_of(&id("bob")), Some(first_batch));
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn unknown_conversation_is_not_watched() {
        let engine = Arc::new(MemoryEngine::default());
        let conversation: ConversationRef =
            Arc::new(MemoryConversation::new(id("ghost"), false, 1));
        let mut tracker = DeletionTracker::new(
            engine.clone(),
            Arc::new(FsArtifactCleaner),
            &ChatListConfig::default(),
        );

        let batch = tracker.begin_batch(1);
        assert!(tracker.submit(batch, &conversation).is_err());
        assert_eq!(tracker.outstanding(), 0);
        assert!(engine.pending_deletions().is_empty());
    }

    #[test]
    fn fs_cleaner_removes_files_and_ignores_missing_ones() {
        let directory = tempfile::tempdir().expect("tempdir");
        let present = directory.path().join("photo.jpg");
        std::fs::write(&present, b"jpeg").expect("write attachment");
        let missing = directory.path().join("gone.jpg");

        let event = EventLog::chat_message(1, vec![present.clone(), missing]);
        FsArtifactCleaner.delete_attachments(&event);

        assert!(!present.exists());
    }
}
