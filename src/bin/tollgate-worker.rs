use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use tollgate::config::BillingConfig;
use tollgate::store::Database;
use tollgate::worker::BillingWorker;

#[derive(Parser)]
#[command(name = "tollgate-worker")]
#[command(about = "Drain deduction streams into the durable billing store")]
struct Cli {
    /// TOML config file; omit to use defaults plus TOLLGATE_* env vars.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    redis_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    /// Create billing tables before starting.
    #[arg(long)]
    init_schema: bool,
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let mut config = BillingConfig::load(cli.config.as_deref())?;
    if let Some(redis_url) = cli.redis_url {
        config.redis_url = redis_url;
    }
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }

    let db = Database::connect(&config.database_url).await?;
    db.health_check().await?;
    if cli.init_schema {
        db.init_schema().await?;
        tracing::info!("billing schema initialized");
    }
    let client = redis::Client::open(config.redis_url.as_str())?;

    let token = CancellationToken::new();
    let shutdown_token = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        tracing::info!("shutdown signal received");
        shutdown_token.cancel();
    });

    BillingWorker::new(config, db, client).run(token).await?;
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::warn!(%err, "sigterm handler unavailable, using ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
