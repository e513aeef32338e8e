use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use super::coordinator::CoordinatorStatus;
use super::device::Device;

/// State of a switch entity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SwitchState {
    /// Whether the switch is on.
    pub on: bool,
}

/// Registry record for a discovered entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityEntry {
    /// Stable id that survives renames, unique within the platform.
    pub unique_id: String,
    pub platform: String,
    pub integration: String,
    pub translation_key: Option<String>,
    pub device_id: Option<String>,
}

/// Health of an integration's data coordinator, as last reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrationState {
    pub status: CoordinatorStatus,

    /// Message of the last failed refresh, cleared on success.
    pub last_error: Option<String>,
}

/// Centralized snapshot of the entire engine state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub entities: HashMap<String, EntityEntry>,
    pub switches: HashMap<String, SwitchState>,
    pub devices: HashMap<String, Device>,
    pub integrations: HashMap<String, IntegrationState>,
}
