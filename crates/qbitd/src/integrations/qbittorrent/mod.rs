mod client;
mod config;
mod coordinator;
#[allow(clippy::module_inception)]
mod qbittorrent;
mod switch;

use std::sync::Arc;

use anyhow::Context;
pub use config::Config as QbittorrentConfig;
use linkme::distributed_slice;
pub use qbittorrent::QbittorrentIntegration;
use tracing::info;

use crate::engine;

/// Domain used in device identifiers and integration names
pub const DOMAIN: &str = "qbittorrent";

#[distributed_slice(engine::INTEGRATION_REGISTRY)]
fn init_qbittorrent(ctx: &engine::IntegrationContext) -> engine::IntegrationFactoryResult {
    let mut integrations: Vec<Box<dyn engine::Integration>> = Vec::new();

    for (entry_id, config) in &ctx.config.integrations.qbittorrent {
        if !config.enabled {
            info!("qBittorrent entry {} is disabled, skipping", entry_id);
            continue;
        }

        let client = client::WebUiClient::new(config)
            .with_context(|| format!("Failed to create qBittorrent client for {}", entry_id))?;
        integrations.push(Box::new(QbittorrentIntegration::new(
            entry_id.clone(),
            config.clone(),
            Arc::new(client),
        )));
    }

    Ok(integrations)
}
