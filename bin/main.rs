use std::path::PathBuf;

use anyhow::Context as _;
use mailgate::{logging, Config, Engine};

/// Configuration search order: explicit env var, working directory, then
/// the system location.
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("MAILGATE_CONFIG") {
        return Some(PathBuf::from(path));
    }

    ["mailgate.toml", "/etc/mailgate/mailgate.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = match find_config_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading configuration");
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("unable to read {}", path.display()))?;
            toml::from_str::<Config>(&raw)
                .with_context(|| format!("unable to parse {}", path.display()))?
        }
        None => {
            tracing::warn!("no configuration file found, using defaults");
            Config::default()
        }
    };

    let deadline = config.shutdown_deadline();
    let running = Engine::new(config).start().await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("unable to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
        }
        _ = sigterm.recv() => {
            tracing::info!("termination signal received");
        }
    }

    // A drain that exceeds the deadline means something is wedged; give
    // up rather than hang the supervisor.
    if tokio::time::timeout(deadline, running.shutdown())
        .await
        .is_err()
    {
        tracing::error!(?deadline, "shutdown deadline exceeded, aborting");
        std::process::exit(1);
    }

    Ok(())
}
