use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use webloom_core::{generate_app_info, AgentRunner, ConfigStore};
use webloom_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use webloom_providers::ProviderRegistry;
use webloom_runtime::default_provider_specs;
use webloom_sandbox::{PortAllocator, SandboxManager};
use webloom_server::{serve, AppState};
use webloom_storage::Storage;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "webloom-engine")]
#[command(about = "Headless Webloom backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
        #[arg(long, env = "WEBLOOM_STATE_DIR")]
        state_dir: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Generate project info for an app description and print it.
    Plan {
        description: String,
        #[arg(long, env = "WEBLOOM_STATE_DIR")]
        state_dir: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            provider,
            api_key,
            model,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let (_guard, log_info) = init_process_logging(
                ProcessKind::Api,
                &canonical_logs_dir_from_root(&state_dir),
                LOG_RETENTION_DAYS,
            )?;
            info!(logs_dir = %log_info.logs_dir, "logging initialized");

            let overrides = provider_overrides(provider.as_deref(), api_key.as_deref(), model.as_deref());
            let config = ConfigStore::new(state_dir.join("config.json"), overrides).await?;
            let app_config = config.get().await;

            let storage = Arc::new(Storage::new(state_dir.join("data")).await?);
            let providers = ProviderRegistry::new(app_config.providers_config());
            let sandbox_settings = app_config.sandbox.clone();
            let ports = Arc::new(PortAllocator::new(
                storage.clone(),
                sandbox_settings.port_min,
                sandbox_settings.port_max,
            ));
            let sandbox = Arc::new(SandboxManager::new(sandbox_settings.clone()));
            let runner = AgentRunner::new(
                providers.clone(),
                sandbox_settings.root.clone(),
                default_provider_specs(),
            )
            .with_model(provider, model);

            let state = AppState::new(storage, config, providers, ports, sandbox, runner);
            let addr: SocketAddr = format!("{hostname}:{port}").parse()?;
            serve(addr, state).await
        }
        Command::Plan {
            description,
            state_dir,
            provider,
            api_key,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let overrides = provider_overrides(provider.as_deref(), api_key.as_deref(), None);
            let config = ConfigStore::new(state_dir.join("config.json"), overrides).await?;
            let providers = ProviderRegistry::new(config.get().await.providers_config());
            let info = generate_app_info(&providers, &description).await;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}

fn resolve_state_dir(explicit: Option<String>) -> PathBuf {
    if let Some(dir) = explicit.map(|d| d.trim().to_string()).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("webloom");
    }
    dirs::home_dir()
        .map(|home| home.join(".webloom"))
        .unwrap_or_else(|| PathBuf::from(".webloom"))
}

fn provider_overrides(
    provider: Option<&str>,
    api_key: Option<&str>,
    model: Option<&str>,
) -> Option<serde_json::Value> {
    let provider = provider?;
    let mut entry = serde_json::Map::new();
    if let Some(api_key) = api_key {
        entry.insert("api_key".to_string(), json!(api_key));
    }
    if let Some(model) = model {
        entry.insert("default_model".to_string(), json!(model));
    }
    Some(json!({
        "default_provider": provider,
        "providers": { provider: entry },
    }))
}
