use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use qbitd::Config;
use qbitd::Engine;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Expose qBittorrent instances as switches over a small HTTP API
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "qbitd.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    if cli.check {
        println!("{}: OK", cli.config.display());
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.targets())
        .init();

    tracing::info!("qbitd starting");
    tracing::info!("Loaded config from: {}", cli.config.display());

    let engine = Arc::new(Engine::new());
    engine.register_integrations_from_config(&config);

    let runner = engine.clone();
    tokio::spawn(async move { runner.run().await });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let mut api_task = tokio::spawn(qbitd::api::serve(
        config.api.listen.clone(),
        config.api.port,
        engine.clone(),
        shutdown_rx,
    ));

    tracing::info!("Press Ctrl+C to exit");
    let api_result = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => tracing::info!("Received shutdown signal"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            }
            None
        }
        result = &mut api_task => Some(result),
    };

    // Stop accepting commands before the integrations go away
    let api_result = match api_result {
        Some(result) => result,
        None => {
            let _ = shutdown_tx.send(());
            api_task.await
        }
    };
    match api_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("HTTP API server failed: {}", e),
        Err(e) => tracing::error!("HTTP API task ended abnormally: {}", e),
    }

    tracing::info!("Shutting down integrations...");
    engine.shutdown().await;

    tracing::info!("qbitd shutdown complete");
    Ok(())
}
