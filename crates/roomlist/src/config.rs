use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{
    ConfigError, CreateDirSnafu, RenameTempFileSnafu, SerializeConfigSnafu, WriteFileSnafu,
};

pub const CONFIG_DIRECTORY_NAME: &str = "roomlist";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const ENV_PREFIX: &str = "ROOMLIST_";

const DEFAULT_INDEX_EVENT_CAPACITY: usize = 64;
const DEFAULT_NOTICE_CAPACITY: usize = 16;
const DEFAULT_COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatListConfig {
    #[serde(default = "default_index_event_capacity")]
    pub index_event_capacity: usize,
    #[serde(default = "default_notice_capacity")]
    pub notice_capacity: usize,
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
    /// Remove files attached to history records before deleting a conversation.
    #[serde(default = "default_true")]
    pub cleanup_attachments: bool,
    /// Dismiss notifications and shortcuts before deleting a conversation.
    #[serde(default = "default_true")]
    pub dismiss_platform_artifacts: bool,
}

impl Default for ChatListConfig {
    fn default() -> Self {
        Self {
            index_event_capacity: DEFAULT_INDEX_EVENT_CAPACITY,
            notice_capacity: DEFAULT_NOTICE_CAPACITY,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            cleanup_attachments: true,
            dismiss_platform_artifacts: true,
        }
    }
}

impl ChatListConfig {
    /// Replaces zero capacities, which tokio channels reject.
    pub fn normalized(mut self) -> Self {
        if self.index_event_capacity == 0 {
            self.index_event_capacity = DEFAULT_INDEX_EVENT_CAPACITY;
        }
        if self.notice_capacity == 0 {
            self.notice_capacity = DEFAULT_NOTICE_CAPACITY;
        }
        if self.command_capacity == 0 {
            self.command_capacity = DEFAULT_COMMAND_CAPACITY;
        }
        self
    }
}

pub struct ConfigStore {
    config: Arc<ArcSwap<ChatListConfig>>,
    config_path: PathBuf,
}

impl ConfigStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".roomlist"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let config = Self::load_from_disk(&config_path);
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config(&self) -> Arc<ChatListConfig> {
        self.config.load_full()
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, config: ChatListConfig) -> Result<(), ConfigError> {
        let normalized_config = config.normalized();
        self.persist(&normalized_config)?;
        self.config.store(Arc::new(normalized_config));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ChatListConfig {
        let mut figment = Figment::from(Serialized::defaults(ChatListConfig::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("config file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ChatListConfig>() {
            Ok(config) => config.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse config from {:?}: {}. using defaults",
                    path,
                    error
                );
                ChatListConfig::default()
            }
        }
    }

    fn persist(&self, config: &ChatListConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-config-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(config).context(SerializeConfigSnafu {
            stage: "serialize-config-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-config-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-config-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved config to {:?}", self.config_path);
        Ok(())
    }
}

fn default_index_event_capacity() -> usize {
    DEFAULT_INDEX_EVENT_CAPACITY
}

fn default_notice_capacity() -> usize {
    DEFAULT_NOTICE_CAPACITY
}

fn default_command_capacity() -> usize {
    DEFAULT_COMMAND_CAPACITY
}

fn default_true() -> bool {
    true
}
