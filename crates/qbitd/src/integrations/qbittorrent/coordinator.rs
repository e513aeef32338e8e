//! Data coordinator for a qBittorrent instance.
//!
//! Polls `sync/maindata` together with the alternative speed mode and caches both. The
//! cached mode is what switches report; it only changes when a refresh succeeds.

use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::client::ClientError;
use super::client::QbittorrentClient;
use super::client::Snapshot;
use crate::engine::Coordinator;
use crate::engine::RefreshableStatusSource;
use crate::engine::coordinator::CoordinatorUpdate;
use crate::engine::coordinator::RefreshError;
use crate::engine::coordinator::UpdateError;

/// Result of one successful refresh
#[derive(Debug, Clone, PartialEq)]
pub struct QbittorrentStatus {
    pub main_data: Snapshot,
    pub alt_speed_enabled: bool,

    /// Toggles that had completed when this refresh started, so are reflected in it
    pub toggles_seen: u64,
}

/// Alternative speed mode a completed toggle should have produced, plus the toggle's
/// sequence number
type PendingToggle = Option<(bool, u64)>;

/// Fetches status from the remote client for the generic coordinator
pub struct StatusSource {
    client: Arc<dyn QbittorrentClient>,

    /// Number of completed toggle commands
    toggles: AtomicU64,

    /// Latest toggle. Superseded once a stored refresh has `toggles_seen` >= its sequence.
    pending: std::sync::Mutex<PendingToggle>,
}

impl StatusSource {
    fn new(client: Arc<dyn QbittorrentClient>) -> Self {
        Self {
            client,
            toggles: AtomicU64::new(0),
            pending: std::sync::Mutex::new(None),
        }
    }

    fn pending(&self) -> PendingToggle {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_toggle(&self, target: bool) {
        let sequence = self.toggles.fetch_add(1, Ordering::AcqRel) + 1;
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some((target, sequence));
    }
}

fn update_error(e: ClientError) -> UpdateError {
    match e {
        ClientError::LoginRequired => UpdateError::Auth("Invalid authentication".to_string()),
        other => UpdateError::failed(other),
    }
}

#[async_trait]
impl RefreshableStatusSource for StatusSource {
    type Data = QbittorrentStatus;

    async fn update(&self) -> Result<QbittorrentStatus, UpdateError> {
        let toggles_seen = self.toggles.load(Ordering::Acquire);

        let main_data = self.client.sync_main_data().await.map_err(update_error)?;
        let alt_speed_enabled = self
            .client
            .alternative_speed_status()
            .await
            .map_err(update_error)?;

        Ok(QbittorrentStatus {
            main_data,
            alt_speed_enabled,
            toggles_seen,
        })
    }
}

/// Coordinator for updating qBittorrent data
pub struct QbittorrentDataCoordinator {
    coordinator: Arc<Coordinator<StatusSource>>,

    /// Reported until the first refresh succeeds
    initial_alt_speed: bool,

    /// Serializes alternative speed commands
    command_lock: Mutex<()>,
}

impl QbittorrentDataCoordinator {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn QbittorrentClient>,
        poll_interval: Duration,
        is_alternative_mode_enabled: bool,
    ) -> Self {
        Self {
            coordinator: Arc::new(Coordinator::new(
                name,
                StatusSource::new(client),
                poll_interval,
            )),
            initial_alt_speed: is_alternative_mode_enabled,
            command_lock: Mutex::new(()),
        }
    }

    pub fn client(&self) -> &Arc<dyn QbittorrentClient> {
        &self.coordinator.source().client
    }

    pub fn name(&self) -> &str {
        self.coordinator.name()
    }

    pub fn last_update(&self) -> CoordinatorUpdate {
        self.coordinator.last_update()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorUpdate> {
        self.coordinator.subscribe()
    }

    pub async fn first_refresh(&self) -> Result<Arc<QbittorrentStatus>, RefreshError> {
        self.coordinator.first_refresh().await
    }

    /// Refresh now and wait for it; concurrent requests share one refresh
    pub async fn refresh(&self) -> Result<Arc<QbittorrentStatus>, RefreshError> {
        self.coordinator.request_refresh().await
    }

    /// Spawn the scheduled refresh task
    pub fn start(&self) -> JoinHandle<()> {
        Arc::clone(&self.coordinator).start()
    }

    /// Get the alternative speed mode as of the last successful refresh
    pub fn get_alt_speed_enabled(&self) -> bool {
        self.coordinator
            .data()
            .map(|status| status.alt_speed_enabled)
            .unwrap_or(self.initial_alt_speed)
    }

    /// Set the alternative speed mode
    ///
    /// Only toggles when the mode differs from the last refreshed value, or from the
    /// target of a toggle no refresh has observed yet.
    pub async fn set_alt_speed_enabled(&self, is_enabled: bool) -> Result<(), ClientError> {
        let _guard = self.command_lock.lock().await;
        if self.expected_alt_speed() != is_enabled {
            self.toggle_locked().await?;
        } else {
            debug!(
                "[{}] Alternative speed already {}, not toggling",
                self.name(),
                is_enabled
            );
        }
        Ok(())
    }

    /// Toggle the alternative speed mode
    ///
    /// Does not touch the cached mode; refresh afterwards to observe the result.
    pub async fn toggle_alt_speed_enabled(&self) -> Result<(), ClientError> {
        let _guard = self.command_lock.lock().await;
        self.toggle_locked().await
    }

    async fn toggle_locked(&self) -> Result<(), ClientError> {
        let target = !self.expected_alt_speed();
        self.client().toggle_alternative_speed().await?;
        self.coordinator.source().record_toggle(target);
        Ok(())
    }

    /// Mode the remote should be in once every completed toggle is visible
    ///
    /// Checked against the stored refresh itself, so a refresh that has finished but
    /// not yet been stored cannot hide a toggle.
    fn expected_alt_speed(&self) -> bool {
        let data = self.coordinator.data();
        let toggles_seen = data.as_ref().map_or(0, |status| status.toggles_seen);
        match self.coordinator.source().pending() {
            Some((target, sequence)) if sequence > toggles_seen => target,
            _ => data.map_or(self.initial_alt_speed, |status| status.alt_speed_enabled),
        }
    }
}
