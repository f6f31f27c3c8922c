use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use quotagate::config::QuotagateConfig;
use quotagate::dispatch::DEFAULT_API_KEY_PARAM;
use quotagate::{Credentials, RequestDispatcher};

#[derive(Parser)]
#[command(name = "quotagate", version, about = "Rate-limited request dispatcher")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch one or more URLs through a single dispatcher
    Fetch {
        /// URLs to fetch, issued in order
        #[arg(required = true)]
        urls: Vec<String>,

        /// API key appended to every request as a query parameter
        #[arg(long, env = "QUOTAGATE_API_KEY")]
        api_key: Option<String>,

        /// Query parameter name for the API key
        #[arg(long, default_value = DEFAULT_API_KEY_PARAM)]
        api_key_param: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = QuotagateConfig::load(cli.config.as_deref())?;
    info!(
        max_requests = config.limiter.max_requests_per_window,
        window_secs = config.limiter.window_secs,
        max_retries = config.limiter.max_retries,
        "Configuration loaded"
    );

    match cli.command {
        Command::Fetch {
            urls,
            api_key,
            api_key_param,
        } => {
            let credentials = match api_key {
                Some(value) => Credentials::ApiKey {
                    param: api_key_param,
                    value,
                },
                None => Credentials::None,
            };
            let dispatcher = RequestDispatcher::from_config(&config)?;

            tokio::select! {
                failures = fetch_all(&dispatcher, &urls, &credentials) => {
                    dispatcher.shutdown().await;
                    dispatcher.limiter().cancel_backoff();
                    if failures > 0 {
                        anyhow::bail!("{} of {} requests failed", failures, urls.len());
                    }
                }
                _ = shutdown_signal() => {
                    dispatcher.shutdown().await;
                    dispatcher.limiter().cancel_backoff();
                }
            }
        }
    }

    Ok(())
}

/// Submit every URL at once and print results in submission order.
async fn fetch_all(
    dispatcher: &RequestDispatcher,
    urls: &[String],
    credentials: &Credentials,
) -> usize {
    let results =
        futures::future::join_all(urls.iter().map(|url| dispatcher.fetch(url, credentials))).await;

    let mut failures = 0;
    for (url, result) in urls.iter().zip(results) {
        match result {
            Ok(value) => match serde_json::to_string_pretty(&value) {
                Ok(pretty) => println!("{}", pretty),
                Err(e) => error!(url = %url, error = %e, "Failed to render response"),
            },
            Err(e) => {
                error!(url = %url, error = %e, "Request failed");
                failures += 1;
            }
        }
    }
    failures
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
