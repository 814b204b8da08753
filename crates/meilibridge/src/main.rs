//! The `meilibridge` CLI (spec.md §2, §8): loads the YAML config, then
//! dispatches to one of the three sync pipelines or an index-management
//! one-shot, shutting down cleanly on SIGINT/SIGTERM.

use clap::{
    Parser,
    Subcommand,
    ValueEnum,
};
use cmd_util::env::config_service;
use meilibridge_config::{
    Bridge,
    Config,
    DEFAULT_CONFIG_PATH,
};
use meilibridge_dest::{
    DestinationAdapter,
    MeiliDestination,
};
use meilibridge_types::{
    TriggerDocument,
    TriggerOp,
    TriggerRequest,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "meilibridge", about = "Unidirectional replication from a source database into Meilisearch")]
struct Cli {
    /// Path to the YAML configuration file (spec.md §6).
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one of the three sync pipelines (spec.md §4.4-§4.6).
    Sync {
        #[command(subcommand)]
        mode: SyncMode,
    },
    /// One-shot index management against a bridge's Meilisearch instance.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
    /// Standalone trigger-endpoint tooling.
    Trigger {
        #[command(subcommand)]
        action: TriggerAction,
    },
    /// Print the build version and exit.
    Version,
}

#[derive(Subcommand)]
enum SyncMode {
    /// Page through every configured collection and upsert into Meilisearch.
    Bulk {
        /// Skip recreation and short-circuit already-synced indexes (I3).
        #[arg(long = "continue")]
        continue_mode: bool,
        /// Repeat every `general.auto_bulk_interval` seconds.
        #[arg(long)]
        auto: bool,
    },
    /// Start the change-stream pipeline and run until interrupted.
    Start,
    /// Start the HTTP trigger server and run until interrupted.
    Trigger,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Recreate every configured index across every bridge (spec.md §6).
    Create,
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Push the configured settings for every configured index across every
    /// bridge (spec.md §6).
    Update,
}

#[derive(Subcommand)]
enum TriggerAction {
    /// POST a single trigger request at a running trigger server, without
    /// needing a full bridge config (spec.md §4.6 supplement: a debug tool
    /// for exercising `POST /{bridge}/{index_uid}` by hand).
    Send {
        /// Full URL, e.g. http://localhost:8787/my-bridge/movies
        #[arg(long)]
        url: String,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        index_uid: String,
        #[arg(long, value_enum)]
        op: TriggerOpArg,
        #[arg(long)]
        primary_key: String,
        #[arg(long)]
        primary_value: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TriggerOpArg {
    Insert,
    Update,
    Delete,
}

impl From<TriggerOpArg> for TriggerOp {
    fn from(value: TriggerOpArg) -> Self {
        match value {
            TriggerOpArg::Insert => TriggerOp::Insert,
            TriggerOpArg::Update => TriggerOp::Update,
            TriggerOpArg::Delete => TriggerOp::Delete,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let _guard = config_service();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Version => {
            println!("meilibridge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        },
        Command::Sync { mode } => {
            let config = Config::load(&cli.config)?;
            let cancel = shutdown_token()?;
            match mode {
                SyncMode::Bulk { continue_mode, auto } => {
                    meilibridge_core::supervisor::run_bulk_sync(&config, continue_mode, auto, cancel).await
                },
                SyncMode::Start => meilibridge_core::supervisor::run_sync(&config, cancel).await,
                SyncMode::Trigger => meilibridge_core::supervisor::run_trigger_sync(&config, cancel).await,
            }
        },
        Command::Index { action } => {
            let config = Config::load(&cli.config)?;
            run_index_action(&config, action).await
        },
        Command::Trigger { action } => run_trigger_action(action).await,
    }
}

/// A [`CancellationToken`] cancelled on the first SIGINT or SIGTERM. The
/// signal handler is installed before returning, not inside the spawned
/// task, so a setup failure surfaces to the caller instead of panicking in
/// the background (mirrors `config_loader`'s signal-stream setup).
fn shutdown_token() -> anyhow::Result<CancellationToken> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        tracing::info!("received shutdown signal, draining in-flight work");
        signal_cancel.cancel();
    });
    Ok(cancel)
}

/// Connects to one bridge's Meilisearch instance, warning and skipping the
/// bridge on failure rather than aborting the whole command (mirrors the
/// original's `buildIndexSettingsUpdate`, which logs and continues to the
/// next bridge when it cannot reach Meilisearch).
async fn connect_bridge_dest(bridge: &Bridge, cancel: CancellationToken) -> Option<MeiliDestination> {
    tracing::info!(bridge = %bridge.name, "connecting to meilisearch");
    match MeiliDestination::connect(&bridge.meilisearch_api_url, bridge.meilisearch_api_key.as_deref(), cancel).await {
        Ok(dest) => Some(dest),
        Err(error) => {
            tracing::warn!(bridge = %bridge.name, %error, "failed to connect to meilisearch, skipping bridge");
            None
        },
    }
}

/// `meilibridge index create`: recreates every configured index across every
/// bridge (spec.md §6). Grounded on the original's per-bridge, per-index
/// loop (`cmd/meilibridge/commands/index.go`): a failure on one index is
/// logged and the loop moves on to the next index, rather than aborting the
/// whole command.
async fn run_index_create(config: &Config) -> anyhow::Result<()> {
    for bridge in &config.bridges {
        tracing::info!(bridge = %bridge.name, "started index create");
        let Some(dest) = connect_bridge_dest(bridge, CancellationToken::new()).await else {
            continue;
        };
        for index_config in bridge.index_map.values() {
            tracing::info!(index = %index_config.index_name, "creating index");
            if let Err(error) = dest
                .recreate(&index_config.index_name, &index_config.primary_key, index_config.settings.as_ref())
                .await
            {
                tracing::warn!(index = %index_config.index_name, %error, "failed to create meilisearch index");
            }
        }
        tracing::info!(bridge = %bridge.name, "completed index create");
    }
    Ok(())
}

/// `meilibridge index settings update`: pushes configured settings for every
/// index across every bridge, skipping indices with none configured (spec.md
/// §6; grounded on the original's `buildIndexSettingsUpdate`).
async fn run_index_settings_update(config: &Config) -> anyhow::Result<()> {
    for bridge in &config.bridges {
        tracing::info!(bridge = %bridge.name, "started index update");
        let Some(dest) = connect_bridge_dest(bridge, CancellationToken::new()).await else {
            continue;
        };
        for index_config in bridge.index_map.values() {
            let Some(settings) = &index_config.settings else {
                tracing::warn!(index = %index_config.index_name, "no settings configured, skipping");
                continue;
            };
            tracing::info!(index = %index_config.index_name, "updating index");
            if let Err(error) = dest.update_index_settings(&index_config.index_name, settings).await {
                tracing::warn!(index = %index_config.index_name, %error, "failed to update meilisearch index");
            }
        }
        tracing::info!(bridge = %bridge.name, "completed index update");
    }
    Ok(())
}

async fn run_index_action(config: &Config, action: IndexAction) -> anyhow::Result<()> {
    match action {
        IndexAction::Create => run_index_create(config).await,
        IndexAction::Settings { action: SettingsAction::Update } => run_index_settings_update(config).await,
    }
}

async fn run_trigger_action(action: TriggerAction) -> anyhow::Result<()> {
    match action {
        TriggerAction::Send {
            url,
            token,
            index_uid,
            op,
            primary_key,
            primary_value,
        } => {
            let request = TriggerRequest {
                index_uid,
                r#type: op.into(),
                document: TriggerDocument {
                    primary_key,
                    primary_value: serde_json::from_str(&primary_value)
                        .unwrap_or(serde_json::Value::String(primary_value)),
                },
            };
            request.validate()?;

            let client = reqwest::Client::new();
            let mut req = client.post(&url).json(&request);
            if let Some(token) = token {
                req = req.header("x-token-key", token);
            }
            let response = req.send().await?;
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            println!("{status}: {body}");
            Ok(())
        },
    }
}
