//! dbchat server binary - composition root.
//!
//! 1. Parse CLI flags and load configuration from TOML
//! 2. Load the document store
//! 3. Connect the oracle and build the system prompt
//! 4. Start the axum API server

mod cli;
mod startup;

use std::sync::Arc;

use clap::Parser;

use dbchat_api::AppState;
use dbchat_chat::{OpenAiOracle, PipelineSettings, QueryPipeline, SessionCache};
use dbchat_core::config::DbChatConfig;
use dbchat_store::MemoryStore;

use cli::CliArgs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let mut config = DbChatConfig::load_or_default(&config_file);
    args.apply(&mut config);

    // Tracing. RUST_LOG overrides the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting dbchat v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration loaded");
    config.validate()?;

    // Store.
    let data_dir = startup::expand_home(&config.store.data_dir);
    let store = match MemoryStore::load_dir(&data_dir, config.store.kind.as_str()) {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!(path = %data_dir.display(), error = %e, "Failed to load data directory; serving an empty store");
            MemoryStore::new(config.store.kind.as_str())
        }
    };
    tracing::info!(collections = ?store.collection_names(), "Store ready");

    // Oracle and system prompt.
    let oracle = match OpenAiOracle::from_config(&config.oracle) {
        Ok(oracle) => oracle,
        Err(e) => {
            tracing::error!(error = %e, "Oracle unavailable");
            tracing::error!("Try: {}=sk-... dbchat", config.oracle.api_key_env);
            return Err(e.into());
        }
    };
    let system_prompt = startup::load_system_prompt(
        &config.prompt,
        &store,
        &oracle,
        config.store.sample_size,
    )
    .await;

    let pipeline = QueryPipeline::new(
        Arc::new(oracle),
        Arc::new(store),
        Arc::new(SessionCache::from_config(&config.cache)),
        PipelineSettings::from(&config.pipeline),
        system_prompt,
    );
    let state = AppState::new(pipeline, config.oracle.model.clone());

    if let Err(e) = dbchat_api::start_server(&config.general, state).await {
        tracing::error!(error = %e, "Server stopped");
        tracing::error!(
            "Try: DBCHAT_PORT={} dbchat",
            config.general.port.saturating_add(1)
        );
        return Err(e.into());
    }

    Ok(())
}
