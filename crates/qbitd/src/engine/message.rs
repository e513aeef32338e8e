//! Type-safe message system for qbitd
//!
//! Messages are split by direction to enforce correct usage at compile time:
//! - `FromIntegrationMessage`: Events from integrations to the engine
//! - `ToIntegrationMessage`: Commands from the engine to integrations

use tokio::sync::oneshot;

use super::coordinator::CoordinatorStatus;
use super::device::DeviceInfo;
use super::entity::Entity;
use super::entity::SwitchAction;

/// Messages FROM integrations TO the engine (events/state updates)
#[derive(Debug, Clone)]
pub enum FromIntegrationMessage {
    /// An entity was discovered and registered
    EntityDiscovered {
        entity_id: String,
        unique_id: String,
        platform: String,
        translation_key: Option<String>,
        integration_name: String,
        device: Option<DeviceInfo>,
    },

    /// An entity was removed (integration unloaded, etc.)
    EntityRemoved { entity_id: String },

    /// A switch's state changed (or was re-reported after a refresh)
    SwitchStateChanged { entity_id: String, on: bool },

    /// An integration's data coordinator completed a refresh
    CoordinatorStatusChanged {
        integration_name: String,
        status: CoordinatorStatus,
        last_error: Option<String>,
    },
}

impl FromIntegrationMessage {
    /// Discovery message registering `entity` under `integration_name`
    pub fn discovered(entity: &dyn Entity, integration_name: &str) -> Self {
        FromIntegrationMessage::EntityDiscovered {
            entity_id: entity.entity_id().to_string(),
            unique_id: entity.unique_id(),
            platform: entity.platform().to_string(),
            translation_key: entity.translation_key().map(str::to_string),
            integration_name: integration_name.to_string(),
            device: entity.device_info(),
        }
    }
}

/// Reply channel for a command; carries the command's error message on failure
pub type CommandReply = oneshot::Sender<Result<(), String>>;

/// Messages FROM the engine TO integrations (commands)
#[derive(Debug)]
pub enum ToIntegrationMessage {
    /// Command to change a switch's state
    SwitchCommand {
        entity_id: String,
        action: SwitchAction,
        reply: CommandReply,
    },
}

impl ToIntegrationMessage {
    /// Entity the message is addressed to, used for routing
    pub fn entity_id(&self) -> &str {
        match self {
            ToIntegrationMessage::SwitchCommand { entity_id, .. } => entity_id,
        }
    }

    /// Answer the command with an error without executing it
    pub fn reject(self, reason: &str) {
        match self {
            ToIntegrationMessage::SwitchCommand { reply, .. } => {
                let _ = reply.send(Err(reason.to_string()));
            }
        }
    }
}
