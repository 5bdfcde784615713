use clap::Parser;
use gemini_proxy::config::config_search_paths;
use gemini_proxy::{build_router, AppState, ProxyConfig, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "gemini-proxy",
    about = "OpenAI-compatible chat completions proxy for the Gemini API",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Gemini API base URL (overrides config)
    #[arg(long)]
    base_url: Option<String>,

    /// Append diagnostic log entries to this JSONL file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gemini_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;

    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(base_url) = cli.base_url {
        config.upstream.base_url = base_url;
    }

    let logger = match cli.log_file {
        Some(ref path) => SharedLogger::with_file(path)?,
        None => SharedLogger::in_memory(),
    };

    let api_key = config.resolve_api_key();

    info!("gemini-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Upstream:  {}", config.upstream.base_url);
    info!("  SSE:       {}", config.upstream.sse);
    info!(
        "  Defaults:  temperature={} max_tokens={}",
        config.generation.temperature, config.generation.max_tokens
    );
    match api_key {
        Some(ref key) => info!("  API key:   {} ({})", config.upstream.api_key_env, key.masked_prefix()),
        None => warn!(
            "  API key:   {} is not set; chat requests will fail",
            config.upstream.api_key_env
        ),
    }
    if let Some(ref path) = cli.log_file {
        info!("  Log file:  {}", path.display());
    }

    let client = reqwest::Client::builder().build()?;

    let bind_addr = config.bind_addr();
    let state = Arc::new(AppState {
        config,
        api_key,
        client,
        logger: logger.clone(),
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    logger.info("startup", format!("Listening on http://{bind_addr}"));

    axum::serve(listener, app).await?;

    Ok(())
}
