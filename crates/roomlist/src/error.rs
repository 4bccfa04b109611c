use std::path::PathBuf;

use roomlist_engine::{ConversationId, EngineError};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatListError {
    #[snafu(display("chat list service is no longer running on `{stage}`"))]
    ServiceStopped { stage: &'static str },
    #[snafu(display("delete request for conversation '{id}' was refused on `{stage}`: {source}"))]
    DeleteRequest {
        stage: &'static str,
        id: ConversationId,
        source: EngineError,
    },
    #[snafu(display("failed to attach state listener to '{id}' on `{stage}`: {source}"))]
    AttachListener {
        stage: &'static str,
        id: ConversationId,
        source: EngineError,
    },
}

pub type ChatListResult<T> = Result<T, ChatListError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to create config directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize config on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write config file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace config file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
