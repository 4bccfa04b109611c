#![deny(unsafe_code)]

//! Keeps an ordered, observable list of conversation summaries in step with a
//! conversation engine that only reports changes through notifications.

pub mod config;
/// Multi-conversation deletion and the cleanup that precedes it.
pub mod deletion;
pub mod error;
/// Advisory and user-facing channels published next to the list.
pub mod notifier;
/// Classification of engine notifications into list mutations.
pub mod router;
pub mod service;
pub mod store;
pub mod summary;

pub use config::{ChatListConfig, ConfigStore};
pub use deletion::{DeletionBatch, DeletionTracker, FsArtifactCleaner};
pub use error::{ChatListError, ChatListResult, ConfigError};
pub use notifier::{IndexNotifier, IndexUpdated, Notice, NoticeChannel, SharedFlags};
pub use router::{EventRouter, RouterInput};
pub use service::{ChatListHandle, ChatListService};
pub use store::{ConversationListStore, ListReader, ListSnapshot};
pub use summary::ConversationSummary;
