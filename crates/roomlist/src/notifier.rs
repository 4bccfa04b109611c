use roomlist_engine::ConversationId;
use tokio::sync::{broadcast, watch};

/// One row of the published list changed in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexUpdated {
    pub index: usize,
}

/// Advisory channel telling renderers which row to refresh.
///
/// Emissions are discrete: a receiver only sees events sent after it subscribed,
/// and nothing about list content depends on anyone listening.
#[derive(Debug, Clone)]
pub struct IndexNotifier {
    sender: broadcast::Sender<IndexUpdated>,
}

impl IndexNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexUpdated> {
        self.sender.subscribe()
    }

    pub fn notify(&self, index: usize) {
        if self.sender.send(IndexUpdated { index }).is_err() {
            tracing::trace!(index, "index update dropped without subscribers");
        }
    }
}

/// User-facing message raised by the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    ConversationRemovalFailed { conversation_id: ConversationId },
}

impl Notice {
    /// Stable key a rendering layer maps to a localized string.
    pub fn message_key(&self) -> &'static str {
        match self {
            Self::ConversationRemovalFailed { .. } => "chat_room_removal_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NoticeChannel {
    sender: broadcast::Sender<Notice>,
}

impl NoticeChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    pub fn raise(&self, notice: Notice) {
        let key = notice.message_key();
        if self.sender.send(notice).is_err() {
            tracing::debug!(key, "notice raised without subscribers");
        }
    }
}

/// Boolean state shared between the list and whoever starts a share or forward.
#[derive(Debug)]
pub struct SharedFlags {
    pub file_sharing_pending: watch::Sender<bool>,
    pub text_sharing_pending: watch::Sender<bool>,
    pub forward_pending: watch::Sender<bool>,
    group_chat_available: watch::Sender<bool>,
}

impl SharedFlags {
    pub fn new(group_chat_available: bool) -> Self {
        Self {
            file_sharing_pending: watch::Sender::new(false),
            text_sharing_pending: watch::Sender::new(false),
            forward_pending: watch::Sender::new(false),
            group_chat_available: watch::Sender::new(group_chat_available),
        }
    }

    /// Fixed when the list is created from the engine's capability.
    pub fn group_chat_available(&self) -> watch::Receiver<bool> {
        self.group_chat_available.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_subscriber_misses_earlier_index_updates() {
        let notifier = IndexNotifier::new(4);
        let mut early = notifier.subscribe();
        notifier.notify(0);

        let mut late = notifier.subscribe();
        notifier.notify(2);

        assert_eq!(early.try_recv().expect("first"), IndexUpdated { index: 0 });
        assert_eq!(early.try_recv().expect("second"), IndexUpdated { index: 2 });
        assert_eq!(late.try_recv().expect("only"), IndexUpdated { index: 2 });
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn sharing_flags_are_observable() {
        let flags = SharedFlags::new(true);
        let mut forward = flags.forward_pending.subscribe();
        flags.forward_pending.send_replace(true);

        assert!(forward.has_changed().expect("sender alive"));
        assert!(*forward.borrow_and_update());
        assert!(*flags.group_chat_available().borrow());
    }
}
