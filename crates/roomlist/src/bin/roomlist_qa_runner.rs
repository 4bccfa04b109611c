use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu, ensure};

use roomlist::{
    ChatListConfig, ChatListError, ChatListService, ConfigError, ConfigStore, EventRouter,
    FsArtifactCleaner, Notice,
};
use roomlist_engine::{
    ConversationId, ConversationRef, EngineError, MemoryConversation, MemoryEngine,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    config_path: Option<PathBuf>,
    write_config: bool,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    InsertFront,
    FrontUpdate,
    ReorderOnActivity,
    RebuildOnStale,
    DeleteOne,
    BatchDelete,
    FailedDelete,
    AttachmentCleanup,
    ServiceRoundtrip,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "insert_front" => Some(Self::InsertFront),
            "front_update" => Some(Self::FrontUpdate),
            "reorder_on_activity" => Some(Self::ReorderOnActivity),
            "rebuild_on_stale" => Some(Self::RebuildOnStale),
            "delete_one" => Some(Self::DeleteOne),
            "batch_delete" => Some(Self::BatchDelete),
            "failed_delete" => Some(Self::FailedDelete),
            "attachment_cleanup" => Some(Self::AttachmentCleanup),
            "service_roundtrip" => Some(Self::ServiceRoundtrip),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::InsertFront => "insert_front",
            Self::FrontUpdate => "front_update",
            Self::ReorderOnActivity => "reorder_on_activity",
            Self::RebuildOnStale => "rebuild_on_stale",
            Self::DeleteOne => "delete_one",
            Self::BatchDelete => "batch_delete",
            Self::FailedDelete => "failed_delete",
            Self::AttachmentCleanup => "attachment_cleanup",
            Self::ServiceRoundtrip => "service_roundtrip",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("engine call failed: {source}"))]
    Engine {
        stage: &'static str,
        source: EngineError,
    },
    #[snafu(display("chat list call failed: {source}"))]
    ChatList {
        stage: &'static str,
        source: ChatListError,
    },
    #[snafu(display("config write failed: {source}"))]
    Config {
        stage: &'static str,
        source: ConfigError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("file operation failed at '{path}': {source}"))]
    FileIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());

    let store = match args.config_path.clone() {
        Some(path) => ConfigStore::new(path),
        None => ConfigStore::load(),
    };
    let config = store.config();
    println!("config_path={}", store.path().display());
    if args.write_config {
        // Writes the effective config back, env overrides and normalisation included.
        store.update(ChatListConfig::clone(&config)).context(ConfigSnafu {
            stage: "write-effective-config",
        })?;
        println!("config_written=true");
    }

    match args.scenario {
        Scenario::InsertFront => run_insert_front(&config)?,
        Scenario::FrontUpdate => run_front_update(&config)?,
        Scenario::ReorderOnActivity => run_reorder_on_activity(&config)?,
        Scenario::RebuildOnStale => run_rebuild_on_stale(&config)?,
        Scenario::DeleteOne => run_delete_one(&config)?,
        Scenario::BatchDelete => run_batch_delete(&config)?,
        Scenario::FailedDelete => run_failed_delete(&config)?,
        Scenario::AttachmentCleanup => run_attachment_cleanup(&config)?,
        Scenario::ServiceRoundtrip => run_service_roundtrip(&config).await?,
        Scenario::All => run_all(&config).await?,
    }

    println!("runner_ok=true");
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut config_path = None;
    let mut write_config = false;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--scenario" => {
                let raw = args.next().context(MissingArgumentValueSnafu {
                    stage: "parse-scenario-value",
                    arg: "--scenario",
                })?;
                let parsed = Scenario::parse(&raw).context(UnknownScenarioSnafu {
                    stage: "parse-scenario-name",
                    raw,
                })?;
                scenario = Some(parsed);
            }
            "--config" => {
                let raw = args.next().context(MissingArgumentValueSnafu {
                    stage: "parse-config-value",
                    arg: "--config",
                })?;
                config_path = Some(PathBuf::from(raw));
            }
            "--write-config" => write_config = true,
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: arg,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "require-scenario",
        })?,
        config_path,
        write_config,
    })
}

async fn run_all(config: &ChatListConfig) -> RunnerResult<()> {
    run_insert_front(config)?;
    run_front_update(config)?;
    run_reorder_on_activity(config)?;
    run_rebuild_on_stale(config)?;
    run_delete_one(config)?;
    run_batch_delete(config)?;
    run_failed_delete(config)?;
    run_attachment_cleanup(config)?;
    run_service_roundtrip(config).await
}

fn run_insert_front(config: &ChatListConfig) -> RunnerResult<()> {
    let scenario = Scenario::InsertFront.name();
    let (engine, mut router) = fixture(&[], config);

    engine.create_conversation(MemoryConversation::new(conversation_id("a"), false, 1));
    engine.create_conversation(MemoryConversation::new(conversation_id("b"), false, 2));
    router.process_ready();

    expect_ids(scenario, &router, &["b", "a"])
}

fn run_front_update(config: &ChatListConfig) -> RunnerResult<()> {
    let scenario = Scenario::FrontUpdate.name();
    let (engine, mut router) = fixture(&[("a", 20), ("b", 10)], config);
    let mut updates = router.index_notifier().subscribe();

    engine
        .send_message(&conversation_id("a"), 30)
        .context(EngineSnafu {
            stage: "send-front-message",
        })?;
    router.process_ready();

    let update = updates.try_recv().ok();
    ensure!(
        update.map(|update| update.index) == Some(0),
        ScenarioFailedSnafu {
            stage: "check-front-index-update",
            scenario,
            reason: format!("expected index update 0, got {update:?}"),
        }
    );
    expect_ids(scenario, &router, &["a", "b"])
}

fn run_reorder_on_activity(config: &ChatListConfig) -> RunnerResult<()> {
    let scenario = Scenario::ReorderOnActivity.name();
    let (engine, mut router) = fixture(&[("a", 10), ("b", 30), ("c", 20)], config);

    engine
        .receive_messages(&conversation_id("c"), 2, 40)
        .context(EngineSnafu {
            stage: "receive-messages",
        })?;
    router.process_ready();

    expect_ids(scenario, &router, &["c", "b", "a"])
}

fn run_rebuild_on_stale(config: &ChatListConfig) -> RunnerResult<()> {
    let scenario = Scenario::RebuildOnStale.name();
    let (engine, mut router) = fixture(&[("a", 10)], config);
    let before = engine.enumeration_count();

    engine.insert_conversation(MemoryConversation::new(conversation_id("z"), false, 5));
    engine
        .receive_messages(&conversation_id("z"), 1, 50)
        .context(EngineSnafu {
            stage: "receive-unlisted-messages",
        })?;
    router.process_ready();

    let after = engine.enumeration_count();
    ensure!(
        after == before + 1,
        ScenarioFailedSnafu {
            stage: "check-enumeration-count",
            scenario,
            reason: format!("expected one rebuild, enumerations went {before} -> {after}"),
        }
    );
    expect_ids(scenario, &router, &["a", "z"])
}

fn run_delete_one(config: &ChatListConfig) -> RunnerResult<()> {
    let scenario = Scenario::DeleteOne.name();
    let (engine, mut router) = fixture(&[("a", 3), ("b", 2), ("c", 1)], config);

    let target = require_conversation(&engine, "b", scenario)?;
    router.delete_one(&target).context(ChatListSnafu {
        stage: "delete-one",
    })?;
    engine
        .confirm_deletion(&conversation_id("b"))
        .context(EngineSnafu {
            stage: "confirm-deletion",
        })?;
    router.process_ready();

    expect_ids(scenario, &router, &["a", "c"])
}

fn run_batch_delete(config: &ChatListConfig) -> RunnerResult<()> {
    let scenario = Scenario::BatchDelete.name();
    let (engine, mut router) = fixture(&[("a", 4), ("b", 3), ("c", 2), ("d", 1)], config);

    let targets = vec![
        require_conversation(&engine, "b", scenario)?,
        require_conversation(&engine, "d", scenario)?,
    ];
    router.delete_many(&targets).context(ChatListSnafu {
        stage: "delete-many",
    })?;
    for peer in ["d", "b"] {
        engine
            .confirm_deletion(&conversation_id(peer))
            .context(EngineSnafu {
                stage: "confirm-batch-deletion",
            })?;
        router.process_ready();
    }

    expect_ids(scenario, &router, &["a", "c"])
}

fn run_failed_delete(config: &ChatListConfig) -> RunnerResult<()> {
    let scenario = Scenario::FailedDelete.name();
    let (engine, mut router) = fixture(&[("a", 3), ("b", 2), ("c", 1)], config);
    let mut notices = router.notices().subscribe();

    let target = require_conversation(&engine, "b", scenario)?;
    router.delete_one(&target).context(ChatListSnafu {
        stage: "delete-one",
    })?;
    engine
        .fail_deletion(&conversation_id("b"))
        .context(EngineSnafu {
            stage: "fail-deletion",
        })?;
    router.process_ready();

    let mut raised = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        raised.push(notice);
    }
    ensure!(
        raised
            == vec![Notice::ConversationRemovalFailed {
                conversation_id: conversation_id("b"),
            }],
        ScenarioFailedSnafu {
            stage: "check-failure-notice",
            scenario,
            reason: format!("expected exactly one removal notice, got {raised:?}"),
        }
    );
    expect_ids(scenario, &router, &["a", "b", "c"])
}

fn run_attachment_cleanup(config: &ChatListConfig) -> RunnerResult<()> {
    let scenario = Scenario::AttachmentCleanup.name();
    let (engine, mut router) = fixture(&[("a", 1)], config);

    let attachment = env::temp_dir().join(format!("roomlist-qa-{}.bin", std::process::id()));
    std::fs::write(&attachment, b"attachment").context(FileIoSnafu {
        stage: "write-attachment-fixture",
        path: attachment.display().to_string(),
    })?;
    engine
        .receive_messages_with_attachments(&conversation_id("a"), 1, 2, vec![attachment.clone()])
        .context(EngineSnafu {
            stage: "receive-attachment",
        })?;
    router.process_ready();

    let target = require_conversation(&engine, "a", scenario)?;
    router.delete_one(&target).context(ChatListSnafu {
        stage: "delete-with-attachment",
    })?;

    let expected_removed = config.cleanup_attachments;
    ensure!(
        attachment.exists() != expected_removed,
        ScenarioFailedSnafu {
            stage: "check-attachment-removed",
            scenario,
            reason: format!(
                "attachment exists={} with cleanup_attachments={expected_removed}",
                attachment.exists()
            ),
        }
    );
    if attachment.exists() {
        std::fs::remove_file(&attachment).context(FileIoSnafu {
            stage: "remove-attachment-fixture",
            path: attachment.display().to_string(),
        })?;
    }
    println!("{scenario}_ok=true");
    Ok(())
}

async fn run_service_roundtrip(config: &ChatListConfig) -> RunnerResult<()> {
    let scenario = Scenario::ServiceRoundtrip.name();
    let engine = Arc::new(MemoryEngine::default());
    for (peer, at) in [("a", 2), ("b", 1)] {
        engine.insert_conversation(MemoryConversation::new(conversation_id(peer), false, at));
    }
    let (service, handle) = ChatListService::new(engine.clone(), Arc::new(FsArtifactCleaner), config);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(service.run(shutdown_rx));

    let target = require_conversation(&engine, "a", scenario)?;
    handle.delete_one(target).await.context(ChatListSnafu {
        stage: "service-delete-one",
    })?;
    engine
        .confirm_deletion(&conversation_id("a"))
        .context(EngineSnafu {
            stage: "service-confirm-deletion",
        })?;

    let mut reader = handle.list();
    let expected = vec![conversation_id("b")];
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if reader.snapshot().ids() == expected {
                return true;
            }
            if reader.changed().await.is_none() {
                return false;
            }
        }
    })
    .await
    .unwrap_or(false);

    shutdown_tx.send_replace(true);
    let joined = task.await.is_ok();
    let leaked = engine.outstanding_references();

    ensure!(
        reached && joined && leaked == 0,
        ScenarioFailedSnafu {
            stage: "check-service-roundtrip",
            scenario,
            reason: format!("reached={reached} joined={joined} leaked_references={leaked}"),
        }
    );
    println!("{scenario}_ok=true");
    Ok(())
}

fn fixture(peers: &[(&str, i64)], config: &ChatListConfig) -> (Arc<MemoryEngine>, EventRouter) {
    let engine = Arc::new(MemoryEngine::default());
    for (peer, at) in peers {
        engine.insert_conversation(MemoryConversation::new(conversation_id(peer), false, *at));
    }
    let mut router = EventRouter::new(engine.clone(), Arc::new(FsArtifactCleaner), config);
    router.activate();
    (engine, router)
}

fn conversation_id(peer: &str) -> ConversationId {
    ConversationId::from_addresses("sip:qa@example.org", format!("sip:{peer}@example.org"))
}

fn require_conversation(
    engine: &MemoryEngine,
    peer: &str,
    scenario: &'static str,
) -> RunnerResult<ConversationRef> {
    let conversation: ConversationRef = engine
        .conversation(&conversation_id(peer))
        .context(ScenarioFailedSnafu {
            stage: "require-conversation",
            scenario,
            reason: format!("conversation '{peer}' missing from engine"),
        })?;
    Ok(conversation)
}

fn expect_ids(scenario: &'static str, router: &EventRouter, peers: &[&str]) -> RunnerResult<()> {
    let expected = peers
        .iter()
        .map(|peer| conversation_id(peer))
        .collect::<Vec<_>>();
    let actual = router.snapshot().ids();
    ensure!(
        actual == expected,
        ScenarioFailedSnafu {
            stage: "check-list-order",
            scenario,
            reason: format!("expected {expected:?}, got {actual:?}"),
        }
    );
    println!("{scenario}_ok=true");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> RunnerResult<RunnerArgs> {
        parse_args(raw.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn write_config_flag_is_parsed_with_config_path() {
        let parsed = args(&["--scenario", "all", "--config", "/tmp/roomlist.json", "--write-config"])
            .expect("valid args");
        assert!(parsed.write_config);
        assert_eq!(parsed.config_path, Some(PathBuf::from("/tmp/roomlist.json")));
        assert_eq!(parsed.scenario.name(), "all");
    }

    #[test]
    fn scenario_is_required_and_validated() {
        assert!(matches!(args(&[]), Err(RunnerError::MissingScenario { .. })));
        assert!(matches!(
            args(&["--scenario", "nope"]),
            Err(RunnerError::UnknownScenario { .. })
        ));
        assert!(!args(&["--scenario", "delete_one"]).expect("valid args").write_config);
    }

    #[test]
    fn write_config_persists_the_effective_config() {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join("config.json");
        std::fs::write(&path, r#"{ "notice_capacity": 0, "cleanup_attachments": false }"#)
            .expect("write config");

        let store = ConfigStore::new(path.clone());
        store
            .update(ChatListConfig::clone(&store.config()))
            .expect("persist config");

        let written = std::fs::read_to_string(&path).expect("read config");
        let reloaded: ChatListConfig = serde_json::from_str(&written).expect("valid json");
        assert_eq!(reloaded.notice_capacity, ChatListConfig::default().notice_capacity);
        assert!(!reloaded.cleanup_attachments);
    }
}
