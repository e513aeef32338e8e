//! Switches for a qBittorrent instance.
//!
//! Each switch type is a `QbittorrentSwitchDescription` in `SWITCH_TYPES`; one
//! `QbittorrentSwitch` entity is created per description and instance.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use tracing::warn;

use super::DOMAIN;
use super::client::ClientError;
use super::coordinator::QbittorrentDataCoordinator;
use crate::engine::DeviceInfo;
use crate::engine::Entity;
use crate::engine::SwitchEntity;
use crate::engine::device::DeviceEntryType;
use crate::engine::entity::EntityError;

const MANUFACTURER: &str = "qBittorrent";

pub type CommandFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>>;

/// A switch command run against the coordinator
pub type CommandFn = for<'a> fn(&'a QbittorrentDataCoordinator) -> CommandFuture<'a>;

/// Describes one kind of qBittorrent switch
pub struct QbittorrentSwitchDescription {
    pub key: &'static str,
    pub translation_key: &'static str,
    pub is_on_fn: fn(&QbittorrentDataCoordinator) -> bool,
    pub on_fn: CommandFn,
    pub off_fn: CommandFn,
    /// When absent, toggling turns the switch off if it is on and on otherwise
    pub toggle_fn: Option<CommandFn>,
}

impl fmt::Debug for QbittorrentSwitchDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QbittorrentSwitchDescription")
            .field("key", &self.key)
            .field("translation_key", &self.translation_key)
            .finish_non_exhaustive()
    }
}

fn alt_speed_is_on(coordinator: &QbittorrentDataCoordinator) -> bool {
    coordinator.get_alt_speed_enabled()
}

fn alt_speed_on(coordinator: &QbittorrentDataCoordinator) -> CommandFuture<'_> {
    Box::pin(coordinator.set_alt_speed_enabled(true))
}

fn alt_speed_off(coordinator: &QbittorrentDataCoordinator) -> CommandFuture<'_> {
    Box::pin(coordinator.set_alt_speed_enabled(false))
}

fn alt_speed_toggle(coordinator: &QbittorrentDataCoordinator) -> CommandFuture<'_> {
    Box::pin(coordinator.toggle_alt_speed_enabled())
}

pub static SWITCH_TYPES: &[QbittorrentSwitchDescription] = &[QbittorrentSwitchDescription {
    key: "alternative_speed_limits",
    translation_key: "alternative_speed_limits",
    is_on_fn: alt_speed_is_on,
    on_fn: alt_speed_on,
    off_fn: alt_speed_off,
    toggle_fn: Some(alt_speed_toggle),
}];

/// Representation of a qBittorrent switch
pub struct QbittorrentSwitch {
    entry_id: String,
    entity_id: String,
    coordinator: Arc<QbittorrentDataCoordinator>,
    description: &'static QbittorrentSwitchDescription,
}

impl QbittorrentSwitch {
    pub fn new(
        entry_id: &str,
        coordinator: Arc<QbittorrentDataCoordinator>,
        description: &'static QbittorrentSwitchDescription,
    ) -> Self {
        Self {
            entry_id: entry_id.to_string(),
            entity_id: format!("switch.{}_{}", entry_id, description.key),
            coordinator,
            description,
        }
    }

    /// Run a command, then refresh so `is_on` reflects it
    ///
    /// A failed command skips the refresh. A failed refresh is left to the
    /// coordinator's status and does not fail the command.
    async fn run_command(&self, command: CommandFn) -> Result<(), EntityError> {
        command(self.coordinator.as_ref()).await?;

        if let Err(e) = self.coordinator.refresh().await {
            warn!(
                "[{}] Refresh after {} command failed: {}",
                self.entry_id, self.description.key, e
            );
        }
        Ok(())
    }
}

impl Entity for QbittorrentSwitch {
    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn unique_id(&self) -> String {
        format!("{}-{}", self.entry_id, self.description.key)
    }

    fn platform(&self) -> &'static str {
        "switch"
    }

    fn translation_key(&self) -> Option<&str> {
        Some(self.description.translation_key)
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        Some(DeviceInfo {
            entry_type: Some(DeviceEntryType::Service),
            identifiers: vec![(DOMAIN.to_string(), self.entry_id.clone())],
            name: Some(self.entry_id.clone()),
            manufacturer: Some(MANUFACTURER.to_string()),
            model: None,
        })
    }
}

#[async_trait]
impl SwitchEntity for QbittorrentSwitch {
    fn is_on(&self) -> bool {
        (self.description.is_on_fn)(self.coordinator.as_ref())
    }

    async fn turn_on(&self) -> Result<(), EntityError> {
        info!("[{}] Turning on {}", self.entry_id, self.description.key);
        self.run_command(self.description.on_fn).await
    }

    async fn turn_off(&self) -> Result<(), EntityError> {
        info!("[{}] Turning off {}", self.entry_id, self.description.key);
        self.run_command(self.description.off_fn).await
    }

    async fn toggle(&self) -> Result<(), EntityError> {
        info!("[{}] Toggling {}", self.entry_id, self.description.key);
        match self.description.toggle_fn {
            Some(toggle_fn) => self.run_command(toggle_fn).await,
            None if self.is_on() => self.run_command(self.description.off_fn).await,
            None => self.run_command(self.description.on_fn).await,
        }
    }
}
