use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use roomlist_engine::{ConversationEngine, ConversationId, ConversationRef};
use tokio::sync::watch;

use crate::summary::ConversationSummary;

/// Immutable list published by the store.
#[derive(Debug, Default)]
pub struct ListSnapshot {
    generation: u64,
    items: Vec<Arc<ConversationSummary>>,
}

impl ListSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn items(&self) -> &[Arc<ConversationSummary>] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<ConversationSummary>> {
        self.items.get(index)
    }

    pub fn ids(&self) -> Vec<ConversationId> {
        self.items.iter().map(|item| item.id().clone()).collect()
    }

    pub fn position(&self, conversation_id: &ConversationId) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.id() == conversation_id)
    }
}

/// Read side of the store, safe to clone into any thread.
#[derive(Debug, Clone)]
pub struct ListReader {
    current: Arc<ArcSwap<ListSnapshot>>,
    published: watch::Receiver<u64>,
}

impl ListReader {
    pub fn snapshot(&self) -> Arc<ListSnapshot> {
        self.current.load_full()
    }

    /// Waits for the next publish and returns the snapshot current at that time.
    pub async fn changed(&mut self) -> Option<Arc<ListSnapshot>> {
        self.published.changed().await.ok()?;
        Some(self.snapshot())
    }
}

/// Owns the ordered conversation list.
///
/// Every mutation builds a fresh [`ListSnapshot`] and swaps it in, so readers never
/// observe a partially built list. Summaries dropped from the list are destroyed
/// when the replacing snapshot is built.
pub struct ConversationListStore {
    engine: Arc<dyn ConversationEngine>,
    current: Arc<ArcSwap<ListSnapshot>>,
    published: watch::Sender<u64>,
    generation: u64,
}

impl ConversationListStore {
    pub fn new(engine: Arc<dyn ConversationEngine>) -> Self {
        let (published, _) = watch::channel(0);
        Self {
            engine,
            current: Arc::new(ArcSwap::from_pointee(ListSnapshot::default())),
            published,
            generation: 0,
        }
    }

    pub fn reader(&self) -> ListReader {
        ListReader {
            current: self.current.clone(),
            published: self.published.subscribe(),
        }
    }

    pub fn snapshot(&self) -> Arc<ListSnapshot> {
        self.current.load_full()
    }

    /// Replaces the list with the engine's current conversations, in engine order.
    pub fn rebuild(&mut self) {
        self.snapshot().items.iter().for_each(|item| item.destroy());

        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for conversation in self.engine.conversations() {
            let id = conversation.id();
            if !seen.insert(id.clone()) {
                tracing::warn!(conversation = %id, "engine listed conversation twice, keeping first");
                continue;
            }
            items.push(Arc::new(ConversationSummary::new(conversation)));
        }

        tracing::info!(count = items.len(), "rebuilt conversation list");
        self.publish(items);
    }

    pub fn insert_at_front(&mut self, conversation: ConversationRef) {
        let summary = Arc::new(ConversationSummary::new(conversation));
        let current = self.snapshot();

        let mut items = Vec::with_capacity(current.len() + 1);
        items.push(summary.clone());
        for item in current.items() {
            if item.id() == summary.id() {
                // A rebuild may already have listed it; the new summary replaces it.
                item.destroy();
                continue;
            }
            items.push(item.clone());
        }

        tracing::info!(conversation = %summary.id(), "added conversation at front");
        self.publish(items);
    }

    /// Drops the item with `conversation_id`; absent ids still publish a new snapshot.
    pub fn remove_by_id(&mut self, conversation_id: &ConversationId) {
        let current = self.snapshot();
        let mut items = Vec::with_capacity(current.len());
        let mut removed = false;
        for item in current.items() {
            if item.id() == conversation_id {
                item.destroy();
                removed = true;
                continue;
            }
            items.push(item.clone());
        }

        if removed {
            tracing::info!(conversation = %conversation_id, "removed conversation from list");
        } else {
            tracing::debug!(conversation = %conversation_id, "remove ignored, conversation not listed");
        }
        self.publish(items);
    }

    /// Sorts by most recent activity first; equal timestamps keep their order.
    ///
    /// Each timestamp is read once up front, since the engine may move it while
    /// the sort runs.
    pub fn reorder_by_recency(&mut self) {
        let mut items = self.snapshot().items.clone();
        items.sort_by_cached_key(|item| Reverse(item.last_update_time()));
        tracing::debug!(count = items.len(), "reordered conversation list by recency");
        self.publish(items);
    }

    pub fn index_of(&self, conversation_id: &ConversationId) -> Option<usize> {
        self.snapshot().position(conversation_id)
    }

    /// Destroys every summary and publishes an empty list.
    pub fn clear(&mut self) {
        self.snapshot().items.iter().for_each(|item| item.destroy());
        self.publish(Vec::new());
    }

    fn publish(&mut self, items: Vec<Arc<ConversationSummary>>) {
        self.generation += 1;
        self.current.store(Arc::new(ListSnapshot {
            generation: self.generation,
            items,
        }));
        self.published.send_replace(self.generation);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    use roomlist_engine::{Conversation, EventLog, MemoryConversation, MemoryEngine};

    use super::*;

    fn id(peer: &str) -> ConversationId {
        ConversationId::from_addresses("sip:me@example.org", format!("sip:{peer}@example.org"))
    }

    fn engine_with(peers: &[(&str, i64)]) -> Arc<MemoryEngine> {
        let engine = Arc::new(MemoryEngine::default());
        for (peer, at) in peers {
            engine.insert_conversation(MemoryConversation::new(id(peer), false, *at));
        }
        engine
    }

    #[test]
    fn rebuild_keeps_engine_order_and_releases_previous_items() {
        let engine = engine_with(&[("a", 1), ("b", 3), ("c", 2)]);
        let mut store = ConversationListStore::new(engine.clone());

        store.rebuild();
        let first = store.snapshot();
        assert_eq!(first.ids(), vec![id("a"), id("b"), id("c")]);
        assert_eq!(engine.outstanding_references(), 3);

        store.rebuild();
        assert!(first.items().iter().all(|item| item.is_released()));
        assert_eq!(engine.outstanding_references(), 3);
        assert_eq!(engine.enumeration_count(), 2);
    }

    #[test]
    fn insert_at_front_prepends_and_replaces_duplicates() {
        let engine = engine_with(&[("a", 1)]);
        let mut store = ConversationListStore::new(engine.clone());
        store.rebuild();

        let b = engine.insert_conversation(MemoryConversation::new(id("b"), false, 5));
        store.insert_at_front(b);
        assert_eq!(store.snapshot().ids(), vec![id("b"), id("a")]);

        let a = engine.conversation(&id("a")).expect("a exists");
        store.insert_at_front(a);
        assert_eq!(store.snapshot().ids(), vec![id("a"), id("b")]);
        assert_eq!(engine.outstanding_references(), 2);
    }

    #[test]
    fn remove_by_id_publishes_even_when_absent() {
        let engine = engine_with(&[("a", 1), ("b", 2)]);
        let mut store = ConversationListStore::new(engine.clone());
        store.rebuild();
        let before = store.snapshot();

        store.remove_by_id(&id("zzz"));
        let after = store.snapshot();
        assert_eq!(after.ids(), before.ids());
        assert!(after.generation() > before.generation());
        assert!(!Arc::ptr_eq(&before, &after));

        store.remove_by_id(&id("a"));
        assert_eq!(store.snapshot().ids(), vec![id("b")]);
        assert!(before.items()[0].is_released());
        assert_eq!(engine.outstanding_references(), 1);
    }

    #[test]
    fn reorder_is_descending_and_stable_for_ties() {
        let engine = engine_with(&[("a", 5), ("b", 9), ("c", 5), ("d", 7)]);
        let mut store = ConversationListStore::new(engine);
        store.rebuild();

        store.reorder_by_recency();
        assert_eq!(
            store.snapshot().ids(),
            vec![id("b"), id("d"), id("a"), id("c")]
        );
    }

    /// Reports a different activity time on every read, like an engine
    /// receiving messages while the list is being sorted.
    #[derive(Debug)]
    struct DriftingConversation {
        id: ConversationId,
        seed: i64,
        reads: AtomicI64,
    }

    impl Conversation for DriftingConversation {
        fn id(&self) -> ConversationId {
            self.id.clone()
        }

        fn last_update_time(&self) -> i64 {
            let read = self.reads.fetch_add(1, Ordering::SeqCst);
            (read * 7919 + self.seed * 104_729) % 1000
        }

        fn subject(&self) -> Option<String> {
            None
        }

        fn unread_messages_count(&self) -> u32 {
            0
        }

        fn is_group(&self) -> bool {
            false
        }

        fn history_events(&self, _begin: usize) -> Vec<EventLog> {
            Vec::new()
        }

        fn retain(&self) {}

        fn release(&self) {}
    }

    #[test]
    fn reorder_reads_each_timestamp_once_while_engine_moves_them() {
        let mut store = ConversationListStore::new(Arc::new(MemoryEngine::default()));
        let conversations = (0..500)
            .map(|seed| {
                Arc::new(DriftingConversation {
                    id: id(&format!("drift{seed}")),
                    seed,
                    reads: AtomicI64::new(0),
                })
            })
            .collect::<Vec<_>>();
        for conversation in &conversations {
            store.insert_at_front(conversation.clone());
        }
        let reads_before = conversations
            .iter()
            .map(|conversation| conversation.reads.load(Ordering::SeqCst))
            .collect::<Vec<_>>();

        store.reorder_by_recency();

        assert_eq!(store.snapshot().len(), 500);
        for (conversation, before) in conversations.iter().zip(reads_before) {
            assert_eq!(conversation.reads.load(Ordering::SeqCst), before + 1);
        }
        store.clear();
    }

    #[test]
    fn index_of_reports_position_or_none() {
        let engine = engine_with(&[("a", 1), ("b", 2)]);
        let mut store = ConversationListStore::new(engine);
        store.rebuild();

        assert_eq!(store.index_of(&id("b")), Some(1));
        assert_eq!(store.index_of(&id("c")), None);
    }

    #[test]
    fn earlier_snapshots_are_never_mutated() {
        let engine = engine_with(&[("a", 1), ("b", 2)]);
        let mut store = ConversationListStore::new(engine);
        store.rebuild();
        let held = store.snapshot();

        store.reorder_by_recency();
        store.remove_by_id(&id("a"));

        assert_eq!(held.ids(), vec![id("a"), id("b")]);
        assert_eq!(store.snapshot().ids(), vec![id("b")]);
    }

    #[test]
    fn clear_releases_everything() {
        let engine = engine_with(&[("a", 1), ("b", 2)]);
        let mut store = ConversationListStore::new(engine.clone());
        store.rebuild();

        store.clear();
        assert!(store.snapshot().is_empty());
        assert_eq!(engine.outstanding_references(), 0);
    }

    #[tokio::test]
    async fn reader_wakes_on_publish() {
        let engine = engine_with(&[("a", 1)]);
        let mut store = ConversationListStore::new(engine);
        let mut reader = store.reader();

        store.rebuild();
        let snapshot = reader.changed().await.expect("store alive");
        assert_eq!(snapshot.ids(), vec![id("a")]);
    }
}
