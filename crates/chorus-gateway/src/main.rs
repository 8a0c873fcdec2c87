use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use chorus_agent::openai::OpenAiClient;
use chorus_agent::stats::StoreStatsCapability;
use chorus_agent::{CapabilityRegistry, FlowDeps, FlowDispatcher, LlmClient};
use chorus_core::config::ChorusConfig;
use chorus_store::{ConversationStore, SqliteSnapshots};

mod terminal;

/// Chorus chat pipeline with a terminal front-end.
#[derive(Parser, Debug)]
#[command(name = "chorus-gateway", version, about, long_about = None)]
struct Cli {
    /// Path to chorus.toml. Falls back to CHORUS_CONFIG, then ~/.chorus/chorus.toml.
    #[arg(short, long)]
    config: Option<String>,

    /// Author id for plain input lines.
    #[arg(short, long, default_value = "local")]
    user: String,

    /// Send plain lines to this shared channel instead of a direct message.
    #[arg(long)]
    channel: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorus_gateway=info,chorus_agent=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // explicit path > CHORUS_CONFIG env > ~/.chorus/chorus.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("CHORUS_CONFIG").ok());
    let config = ChorusConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        ChorusConfig::default()
    });
    let config = Arc::new(config);

    let store = Arc::new(ConversationStore::new(
        config.store.clone(),
        config.persona.system_prompt.clone(),
    ));

    // snapshots live in a single SQLite file
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening snapshot database");
    let snapshots = Arc::new(SqliteSnapshots::open(db_path)?);
    if chorus_store::restore_latest(&store, snapshots.as_ref()).await? {
        let stats = store.stats();
        info!(
            conversations = stats.conversations,
            channels = stats.channels,
            "store restored from snapshot"
        );
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let maintenance = tokio::spawn(chorus_store::run_maintenance(
        Arc::clone(&store),
        Arc::clone(&snapshots),
        Duration::from_secs(config.store.cleanup_interval_secs.max(1)),
        shutdown_rx,
    ));

    let llm = build_client(&config);
    let capabilities = CapabilityRegistry::new(Duration::from_millis(
        config.executor.capability_timeout_ms,
    ))
    .with(Arc::new(StoreStatsCapability::new(Arc::clone(&store))));

    let deps = FlowDeps {
        store: Arc::clone(&store),
        llm,
        capabilities: Arc::new(capabilities),
        config: Arc::clone(&config),
    };
    let dispatcher = FlowDispatcher::new(&deps)?;

    let speaker = terminal::Speaker {
        user: cli.user,
        channel: cli.channel,
    };
    info!(user = %speaker.user, "Chorus ready, reading messages from stdin");
    let result = terminal::run(&dispatcher, &speaker).await;

    // stop maintenance; it writes a final snapshot on the way out
    let _ = shutdown_tx.send(true);
    if let Err(e) = maintenance.await {
        warn!(error = %e, "maintenance task ended abnormally");
    }
    result
}

/// OpenAI-compatible client from the `[provider]` section.
///
/// Requests without a key are still sent, which suits local servers; hosted
/// endpoints will answer with an auth error that surfaces as a failed turn.
fn build_client(config: &ChorusConfig) -> Arc<dyn LlmClient> {
    if config.provider.api_key.is_none() {
        warn!(
            base_url = %config.provider.base_url,
            "no provider api_key configured, sending unauthenticated requests"
        );
    }
    let client = OpenAiClient::from_config(&config.provider);
    info!(provider = client.name(), model = %config.provider.model, "LLM client configured");
    Arc::new(client)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
