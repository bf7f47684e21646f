use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use bed_forecast_agent::backend::{GeminiClient, ReasoningBackend, RemoteInference};
use bed_forecast_agent::config::require_credential;
use bed_forecast_agent::store::SupabaseStore;
use bed_forecast_agent::{AgentConfig, AgentError, FileResultCache, PollLoop, TrendAnalyzer};

/// Bed occupancy forecast agent
#[derive(Parser)]
#[command(name = "bed-forecast-agent")]
#[command(version)]
#[command(about = "Summarizes bed-occupancy telemetry into a forecast and risk severity")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Inference API key; without it only the heuristic is used
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    gemini_api_key: Option<String>,

    #[arg(long, env = "SUPABASE_URL")]
    supabase_url: Option<String>,

    #[arg(long, env = "SUPABASE_KEY", hide_env_values = true)]
    supabase_key: Option<String>,

    /// Department to analyze (defaults to the first one in the database)
    #[arg(long)]
    department: Option<String>,

    /// Seconds between polls
    #[arg(long, default_value_t = 60)]
    poll_secs: u64,

    /// Cache file for the last good remote analysis
    #[arg(long, default_value = "agent_cache.json")]
    cache: PathBuf,

    #[arg(long, default_value = "gemini-2.0-flash")]
    model: String,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "agent failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AgentError> {
    let config = AgentConfig {
        poll_interval: Duration::from_secs(cli.poll_secs),
        cache_path: cli.cache,
        model: cli.model,
        ..AgentConfig::default()
    };
    config.validate()?;

    let url = require_credential("SUPABASE_URL", cli.supabase_url.as_deref())?;
    let key = require_credential("SUPABASE_KEY", cli.supabase_key.as_deref())?;
    let store = Arc::new(SupabaseStore::new(&url, key, config.remote_timeout)?);

    let remote: Option<Box<dyn ReasoningBackend>> =
        match require_credential("GEMINI_API_KEY", cli.gemini_api_key.as_deref()) {
            Ok(api_key) => match GeminiClient::new(api_key, config.remote_timeout) {
                Ok(client) => Some(Box::new(
                    RemoteInference::new(Arc::new(client), config.model.clone())
                        .with_spacing(config.request_spacing),
                )),
                Err(e) => {
                    warn!(error = %e, "inference client unavailable; heuristic mode");
                    None
                }
            },
            Err(e) => {
                warn!(reason = %e, "no inference key; heuristic mode");
                None
            }
        };

    info!(
        remote = remote.is_some(),
        model = %config.model,
        cache = %config.cache_path.display(),
        "forecast agent active"
    );

    let cache = Arc::new(FileResultCache::new(config.cache_path.clone()));
    let analyzer = TrendAnalyzer::from_config(&config, remote, cache);

    let mut poller = PollLoop::new(analyzer, store.clone(), store, &config);
    if let Some(department) = cli.department {
        poller = poller.with_unit(department);
    }

    if cli.once {
        poller.tick().await?;
        return Ok(());
    }

    poller
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
            info!("received Ctrl+C");
        })
        .await;
    Ok(())
}
