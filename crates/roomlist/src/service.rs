use std::sync::Arc;

use roomlist_engine::{ArtifactCleaner, ConversationEngine, ConversationRef};
use snafu::OptionExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::ChatListConfig;
use crate::error::{ChatListResult, ServiceStoppedSnafu};
use crate::notifier::{IndexNotifier, IndexUpdated, Notice, NoticeChannel, SharedFlags};
use crate::router::EventRouter;
use crate::store::ListReader;

type Reply = oneshot::Sender<ChatListResult<()>>;

#[derive(Debug)]
enum Command {
    DeleteOne {
        conversation: ConversationRef,
        reply: Reply,
    },
    DeleteMany {
        conversations: Vec<ConversationRef>,
        reply: Reply,
    },
    Refresh {
        reply: Reply,
    },
}

/// Consumer side of a running [`ChatListService`].
#[derive(Clone)]
pub struct ChatListHandle {
    commands: mpsc::Sender<Command>,
    reader: ListReader,
    index_notifier: IndexNotifier,
    notices: NoticeChannel,
    flags: Arc<SharedFlags>,
}

impl ChatListHandle {
    pub fn list(&self) -> ListReader {
        self.reader.clone()
    }

    pub fn subscribe_index_updates(&self) -> broadcast::Receiver<IndexUpdated> {
        self.index_notifier.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn group_chat_available(&self) -> watch::Receiver<bool> {
        self.flags.group_chat_available()
    }

    pub fn flags(&self) -> &SharedFlags {
        &self.flags
    }

    pub async fn delete_one(&self, conversation: ConversationRef) -> ChatListResult<()> {
        self.request(|reply| Command::DeleteOne {
            conversation,
            reply,
        })
        .await
    }

    pub async fn delete_many(&self, conversations: Vec<ConversationRef>) -> ChatListResult<()> {
        self.request(|reply| Command::DeleteMany {
            conversations,
            reply,
        })
        .await
    }

    /// Forces a full rebuild from the engine.
    pub async fn refresh(&self) -> ChatListResult<()> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> ChatListResult<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .ok()
            .context(ServiceStoppedSnafu {
                stage: "send-chat-list-command",
            })?;
        response.await.ok().context(ServiceStoppedSnafu {
            stage: "await-chat-list-reply",
        })?
    }
}

/// Drives an [`EventRouter`] from engine notifications and consumer commands.
pub struct ChatListService {
    router: EventRouter,
    commands: mpsc::Receiver<Command>,
}

impl ChatListService {
    pub fn new(
        engine: Arc<dyn ConversationEngine>,
        cleaner: Arc<dyn ArtifactCleaner>,
        config: &ChatListConfig,
    ) -> (Self, ChatListHandle) {
        let router = EventRouter::new(engine, cleaner, config);
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity.max(1));
        let handle = ChatListHandle {
            commands: commands_tx,
            reader: router.reader(),
            index_notifier: router.index_notifier().clone(),
            notices: router.notices().clone(),
            flags: router.flags(),
        };
        (
            Self {
                router,
                commands: commands_rx,
            },
            handle,
        )
    }

    /// Runs until `shutdown` flips to true or every handle is dropped, then
    /// releases the list.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.router.activate();

        loop {
            let has_inputs = self.router.has_inputs();
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("chat list shutdown requested");
                        break;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::info!("all chat list handles dropped");
                        break;
                    }
                },
                input = self.router.next_input(), if has_inputs => {
                    if let Some(input) = input {
                        self.router.handle_input(input);
                    }
                }
            }
        }

        self.router.deactivate();
    }

    fn handle_command(&mut self, command: Command) {
        let (result, reply) = match command {
            Command::DeleteOne {
                conversation,
                reply,
            } => (self.router.delete_one(&conversation), reply),
            Command::DeleteMany {
                conversations,
                reply,
            } => (self.router.delete_many(&conversations), reply),
            Command::Refresh { reply } => {
                self.router.refresh();
                (Ok(()), reply)
            }
        };
        if reply.send(result).is_err() {
            tracing::debug!("chat list command caller went away before the reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use roomlist_engine::{ConversationId, MemoryConversation, MemoryEngine};

    use super::*;
    use crate::deletion::FsArtifactCleaner;
    use crate::error::ChatListError;
    use crate::store::ListSnapshot;

    fn id(peer: &str) -> ConversationId {
        ConversationId::from_addresses("sip:me@example.org", format!("sip:{peer}@example.org"))
    }

    async fn wait_for(reader: &mut ListReader, expected: Vec<ConversationId>) -> Arc<ListSnapshot> {
        let current = reader.snapshot();
        if current.ids() == expected {
            return current;
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = reader.changed().await.expect("service alive");
                if snapshot.ids() == expected {
                    return snapshot;
                }
            }
        })
        .await
        .expect("list reached expected state")
    }

    fn start(
        engine: Arc<MemoryEngine>,
    ) -> (
        ChatListHandle,
        watch::Sender<bool>,
        tokio::task::JoinHandle<()>,
    ) {
        let (service, handle) = ChatListService::new(
            engine,
            Arc::new(FsArtifactCleaner),
            &ChatListConfig::default(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(service.run(shutdown_rx));
        (handle, shutdown_tx, task)
    }

    #[tokio::test]
    async fn service_applies_engine_notifications_and_commands() {
        let engine = Arc::new(MemoryEngine::default());
        for (peer, at) in [("a", 3), ("b", 2), ("c", 1)] {
            engine.insert_conversation(MemoryConversation::new(id(peer), false, at));
        }
        let (handle, shutdown, task) = start(engine.clone());
        let mut reader = handle.list();
        wait_for(&mut reader, vec![id("a"), id("b"), id("c")]).await;

        let b = engine.conversation(&id("b")).expect("b exists");
        handle.delete_one(b).await.expect("delete accepted");
        engine.confirm_deletion(&id("b")).expect("confirmed");
        wait_for(&mut reader, vec![id("a"), id("c")]).await;

        engine.create_conversation(MemoryConversation::new(id("d"), false, 9));
        wait_for(&mut reader, vec![id("d"), id("a"), id("c")]).await;

        shutdown.send_replace(true);
        task.await.expect("service task");
        assert_eq!(engine.outstanding_references(), 0);
    }

    #[tokio::test]
    async fn failed_deletion_surfaces_a_notice() {
        let engine = Arc::new(MemoryEngine::default());
        engine.insert_conversation(MemoryConversation::new(id("a"), true, 1));
        let (handle, shutdown, task) = start(engine.clone());
        let mut notices = handle.subscribe_notices();
        assert!(*handle.group_chat_available().borrow());

        let a = engine.conversation(&id("a")).expect("a exists");
        handle.delete_many(vec![a]).await.expect("delete accepted");
        engine.fail_deletion(&id("a")).expect("failure reported");

        let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
            .await
            .expect("notice in time")
            .expect("notice channel open");
        assert_eq!(notice.message_key(), "chat_room_removal_failed");
        assert_eq!(handle.list().snapshot().ids(), vec![id("a")]);

        shutdown.send_replace(true);
        task.await.expect("service task");
    }

    #[tokio::test]
    async fn commands_fail_once_the_service_stopped() {
        let engine = Arc::new(MemoryEngine::default());
        let (handle, shutdown, task) = start(engine);
        shutdown.send_replace(true);
        task.await.expect("service task");

        assert!(matches!(
            handle.refresh().await,
            Err(ChatListError::ServiceStopped { .. })
        ));
    }

    #[tokio::test]
    async fn refresh_rebuilds_from_the_engine() {
        let engine = Arc::new(MemoryEngine::default());
        engine.insert_conversation(MemoryConversation::new(id("a"), false, 1));
        let (handle, shutdown, task) = start(engine.clone());
        let mut reader = handle.list();
        wait_for(&mut reader, vec![id("a")]).await;

        engine.insert_conversation(MemoryConversation::new(id("b"), false, 2));
        handle.refresh().await.expect("refreshed");
        assert_eq!(reader.snapshot().ids(), vec![id("a"), id("b")]);

        drop(handle);
        task.await.expect("service task");
        drop(shutdown);
        assert_eq!(engine.outstanding_references(), 0);
    }
}
