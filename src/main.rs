mod channels;
mod config;
mod context;
mod excel;
mod extract;
mod gateway;
mod provider;
mod ratelimit;
mod templates;
mod types;
mod upstream;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::channels::TelegramChannel;
use crate::config::AppConfig;
use crate::context::{ContextStore, SqliteContextStore};
use crate::extract::StructuredExtractor;
use crate::gateway::Gateway;
use crate::provider::{ModelProvider, OpenAiCompatibleProvider};
use crate::ratelimit::RateLimiter;
use crate::upstream::{RetryClassifier, RetryEverything, RetryPolicy, RetryTransient, RetryingUpstreamClient};

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-V" => {
                println!("switchboard {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("switchboard {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: switchboard [OPTIONS]\n");
                println!("Reads config.toml from the working directory.\n");
                println!("Options:");
                println!("  -h, --help       Print help");
                println!("  -V, --version    Print version");
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: {}. Try --help.", other);
                std::process::exit(1);
            }
        }
    }

    let config_path = PathBuf::from("config.toml");
    let config = AppConfig::load(&config_path)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config))
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store: Arc<dyn ContextStore> = Arc::new(
        SqliteContextStore::new(&config.state.db_path, config.limits.max_history_turns).await?,
    );

    let provider: Arc<dyn ModelProvider> = Arc::new(
        OpenAiCompatibleProvider::new(&config.provider.base_url, &config.provider.api_key)
            .map_err(|e| anyhow::anyhow!(e))?,
    );

    let classifier: Arc<dyn RetryClassifier> = if config.provider.retry_all_errors {
        Arc::new(RetryEverything)
    } else {
        Arc::new(RetryTransient)
    };
    let client = Arc::new(RetryingUpstreamClient::new(
        provider,
        RetryPolicy::default(),
        classifier,
        config.provider.models.temperature,
    ));

    let limiter = RateLimiter::new(
        Duration::from_secs(config.limits.cooldown_seconds),
        config.limits.max_per_minute,
    );
    let extractor = StructuredExtractor::new(
        client.clone(),
        config.provider.models.chat.clone(),
        config.provider.models.vision.clone(),
    );
    let gateway = Arc::new(Gateway::new(
        limiter,
        client,
        store,
        extractor,
        config.provider.models.chat.clone(),
        config.limits.max_history_turns,
    ));

    info!(
        base_url = %config.provider.base_url,
        chat_model = %config.provider.models.chat,
        vision_model = %config.provider.models.vision,
        "Starting switchboard"
    );

    let channel = Arc::new(TelegramChannel::new(
        &config.telegram.bot_token,
        config.telegram.admin_ids.clone(),
        gateway,
        config.provider.models.chat.clone(),
        config.provider.models.vision.clone(),
        config.limits.cooldown_seconds,
        config.limits.max_per_minute,
    ));
    channel.start_with_retry().await;

    Ok(())
}
