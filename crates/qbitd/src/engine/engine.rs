use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::device::Device;
use super::entity::SwitchAction;
use super::integration::FromIntegrationReceiver;
use super::integration::FromIntegrationSender;
use super::integration::Integration;
use super::integration::SetupError;
use super::integration::ToIntegrationSender;
use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use super::state::EntityEntry;
use super::state::IntegrationState;
use super::state::State;
use super::state::SwitchState;
use crate::engine::IntegrationContext;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no integration found for entity: {0}")]
    UnknownEntity(String),

    #[error("integration '{0}' is not running")]
    IntegrationUnavailable(String),

    #[error("command failed: {0}")]
    Command(String),
}

/// qbitd engine
///
/// This structure runs integrations, routes commands to the integration that owns an
/// entity, and maintains a view of the world with State.
pub struct Engine {
    /// Centralized state snapshot (readers load the Arc, writer stores a new one)
    state: ArcSwap<State>,

    /// Map of entity_id -> integration name for routing messages
    entity_integration_map: std::sync::Mutex<HashMap<String, String>>,

    /// Communication channels to integrations (for commands)
    integration_channels: std::sync::Mutex<HashMap<String, ToIntegrationSender>>,

    /// Receive messages from integrations (events)
    message_rx: Mutex<FromIntegrationReceiver>,

    /// Sender for integrations to report events back to the engine
    message_tx: FromIntegrationSender,

    /// Handles for integration tasks
    integration_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Capacity for the integration→engine message channel
/// Provides backpressure when integrations send faster than the engine can process
const FROM_INTEGRATION_CHANNEL_SIZE: usize = 1024;

impl Engine {
    /// Create a new Engine instance
    pub fn new() -> Self {
        let (message_tx, message_rx) = mpsc::channel(FROM_INTEGRATION_CHANNEL_SIZE);
        Self {
            state: ArcSwap::new(Arc::default()),
            entity_integration_map: std::sync::Mutex::new(HashMap::new()),
            integration_channels: std::sync::Mutex::new(HashMap::new()),
            message_rx: Mutex::new(message_rx),
            message_tx,
            integration_handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register integrations from configuration
    ///
    /// Runs every registered integration factory against the config and registers
    /// whatever they produce.
    pub fn register_integrations_from_config(&self, cfg: &crate::config::Config) {
        let ctx = IntegrationContext { config: cfg };
        for constr in super::integration::REGISTRY {
            let integrations = match constr(&ctx) {
                Ok(i) => i,
                Err(e) => {
                    error!("failed to setup integration: {:#}", e);
                    continue;
                }
            };
            for integration in integrations {
                let name = integration.name().to_string();
                self.register_integration(name, integration);
            }
        }
    }

    /// Register an integration with the engine
    ///
    /// This spawns the integration in a background task, wires up channels,
    /// and starts its setup process.
    pub fn register_integration(&self, name: String, mut integration: Box<dyn Integration>) {
        let (to_integration_tx, mut to_integration_rx) = mpsc::unbounded_channel();
        let from_integration_tx = self.message_tx.clone();

        self.integration_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), to_integration_tx);

        // Spawn integration task
        let handle = tokio::spawn(async move {
            // Setup integration (gives it the sender for events)
            loop {
                let retry_after = match integration.setup(from_integration_tx.clone()).await {
                    Ok(()) => break,
                    Err(SetupError::Failed(e)) => {
                        error!("Integration '{}' setup failed: {}", name, e);
                        return;
                    }
                    Err(SetupError::NotReady { error, retry_after }) => {
                        warn!(
                            "Integration '{}' not ready, retrying in {:?}: {}",
                            name, retry_after, error
                        );
                        retry_after
                    }
                };

                // Wait out the delay, but stop if the engine shuts down meanwhile
                let retry = tokio::time::sleep(retry_after);
                tokio::pin!(retry);
                loop {
                    tokio::select! {
                        _ = &mut retry => break,
                        msg = to_integration_rx.recv() => match msg {
                            Some(msg) => msg.reject("integration is not ready"),
                            None => {
                                info!("Integration '{}' stopped before setup completed", name);
                                return;
                            }
                        },
                    }
                }
            }

            // Process commands from engine
            while let Some(msg) = to_integration_rx.recv().await {
                if let Err(e) = integration.handle_message(msg).await {
                    warn!("Integration '{}' failed to handle message: {}", name, e);
                }
            }

            if let Err(e) = integration.shutdown().await {
                warn!("Integration '{}' shutdown failed: {}", name, e);
            }
        });

        self.integration_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Send a command to an integration
    ///
    /// Routes the command to the appropriate integration based on entity_id.
    pub fn send_command(&self, msg: ToIntegrationMessage) -> Result<(), EngineError> {
        let entity_id = msg.entity_id();

        let integration_name = self
            .entity_integration_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownEntity(entity_id.to_string()))?;

        let channels = self
            .integration_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tx = channels
            .get(&integration_name)
            .ok_or_else(|| EngineError::IntegrationUnavailable(integration_name.clone()))?;

        tx.send(msg)
            .map_err(|_| EngineError::IntegrationUnavailable(integration_name))
    }

    /// Send a switch command and wait until the owning integration has executed it
    pub async fn switch_command(
        &self,
        entity_id: &str,
        action: SwitchAction,
    ) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(ToIntegrationMessage::SwitchCommand {
            entity_id: entity_id.to_string(),
            action,
            reply,
        })?;

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(EngineError::Command(message)),
            // Integration task dropped the reply without answering
            Err(_) => Err(EngineError::IntegrationUnavailable(entity_id.to_string())),
        }
    }

    /// Run the engine's main event loop
    ///
    /// Processes incoming events from integrations and updates state.
    pub async fn run(&self) {
        info!("Engine starting");

        // Main event loop - only receives FromIntegration messages
        let mut rx = self.message_rx.lock().await;
        while let Some(msg) = rx.recv().await {
            self.handle_event(msg);
        }

        info!("Engine shutting down");
    }

    /// Close every integration's command channel and wait for them to shut down
    pub async fn shutdown(&self) {
        let channels = std::mem::take(
            &mut *self
                .integration_channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        drop(channels);

        let handles = std::mem::take(
            &mut *self
                .integration_handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Integration task ended abnormally: {}", e);
            }
        }
    }

    /// Get a snapshot of the current engine state.
    ///
    /// Clones the `Arc` (atomic refcount bump), essentially free.
    pub fn state_snapshot(&self) -> Arc<State> {
        self.state.load_full()
    }

    /// Apply a change to a copy of the current state and publish it
    fn update_state(&self, f: impl FnOnce(&mut State)) {
        let mut state = State::clone(&self.state.load());
        f(&mut state);
        self.state.store(Arc::new(state));
    }

    /// Handle an event from an integration
    fn handle_event(&self, msg: FromIntegrationMessage) {
        match msg {
            FromIntegrationMessage::EntityDiscovered {
                entity_id,
                unique_id,
                platform,
                translation_key,
                integration_name,
                device,
            } => {
                info!(
                    "Entity discovered: {} (unique_id {}, from {})",
                    entity_id, unique_id, integration_name
                );

                let device = device.and_then(|info| match info.device_id() {
                    Some(device_id) => Some((device_id, info)),
                    None => {
                        warn!("Device for {} has no identifiers, ignoring", entity_id);
                        None
                    }
                });

                let entry = EntityEntry {
                    unique_id,
                    platform,
                    integration: integration_name.clone(),
                    translation_key,
                    device_id: device.as_ref().map(|(device_id, _)| device_id.clone()),
                };
                self.update_state(|state| {
                    if let Some((device_id, info)) = device {
                        state
                            .devices
                            .entry(device_id.clone())
                            .or_insert_with(|| Device::new(device_id, info))
                            .add_entity(entity_id.clone());
                    }
                    state.entities.insert(entity_id.clone(), entry);
                });

                // Record which integration owns this entity for command routing.
                // Switch state is not populated until the first state-change message arrives.
                self.entity_integration_map
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(entity_id, integration_name);
            }
            FromIntegrationMessage::EntityRemoved { entity_id } => {
                info!("Entity removed: {}", entity_id);

                self.update_state(|state| {
                    state.entities.remove(&entity_id);
                    state.switches.remove(&entity_id);
                    for device in state.devices.values_mut() {
                        device.remove_entity(&entity_id);
                    }
                    state.devices.retain(|_, d| !d.entity_ids.is_empty());
                });

                // Remove from routing map
                self.entity_integration_map
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&entity_id);
            }
            FromIntegrationMessage::SwitchStateChanged { entity_id, on } => {
                let previous = self.state.load().switches.get(&entity_id).cloned();
                if previous.as_ref().map(|s| s.on) == Some(on) {
                    debug!("Switch state unchanged: {} -> on={}", entity_id, on);
                    return;
                }

                info!("Switch state changed: {} -> on={}", entity_id, on);
                self.update_state(|state| {
                    state.switches.insert(entity_id, SwitchState { on });
                });
            }
            FromIntegrationMessage::CoordinatorStatusChanged {
                integration_name,
                status,
                last_error,
            } => {
                let previous = self
                    .state
                    .load()
                    .integrations
                    .get(&integration_name)
                    .map(|s| s.status);
                if previous != Some(status) {
                    info!("Integration {} is now {}", integration_name, status);
                }

                self.update_state(|state| {
                    state.integrations.insert(
                        integration_name,
                        IntegrationState { status, last_error },
                    );
                });
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
