use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::QbittorrentConfig;
use super::client::ClientError;
use super::client::QbittorrentClient;
use super::coordinator::QbittorrentDataCoordinator;
use super::switch::QbittorrentSwitch;
use super::switch::SWITCH_TYPES;
use crate::engine::CoordinatorStatus;
use crate::engine::Entity;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::engine::Integration;
use crate::engine::SetupError;
use crate::engine::SwitchEntity;
use crate::engine::ToIntegrationMessage;
use crate::engine::coordinator::CoordinatorUpdate;

/// qBittorrent integration for one configured instance
///
/// Owns the instance's data coordinator and its switches. The coordinator polls in a
/// background task; a second task forwards every refresh to the engine.
pub struct QbittorrentIntegration {
    name: String,
    entry_id: String,
    config: QbittorrentConfig,
    client: Arc<dyn QbittorrentClient>,
    switches: Vec<Arc<QbittorrentSwitch>>,
    to_engine: Option<FromIntegrationSender>,
    poll_task: Option<JoinHandle<()>>,
    listener_task: Option<JoinHandle<()>>,
}

fn send_failed(e: impl Error + Send + 'static) -> SetupError {
    SetupError::Failed(Box::new(e))
}

impl QbittorrentIntegration {
    /// Create a new qBittorrent integration
    pub fn new(
        entry_id: String,
        config: QbittorrentConfig,
        client: Arc<dyn QbittorrentClient>,
    ) -> Self {
        Self {
            name: format!("{}.{}", super::DOMAIN, entry_id),
            entry_id,
            config,
            client,
            switches: Vec::new(),
            to_engine: None,
            poll_task: None,
            listener_task: None,
        }
    }

    /// Classify a failed setup step by the coordinator status it leads to
    ///
    /// Only rejected credentials are final; anything else is retried after one poll
    /// interval.
    fn setup_error(
        &self,
        status: CoordinatorStatus,
        e: impl Error + Send + 'static,
    ) -> SetupError {
        if status == CoordinatorStatus::Failed {
            SetupError::Failed(Box::new(e))
        } else {
            SetupError::NotReady {
                error: Box::new(e),
                retry_after: self.config.poll_interval(),
            }
        }
    }

    /// Send the coordinator status and every switch state to the engine
    async fn report(
        name: &str,
        switches: &[Arc<QbittorrentSwitch>],
        update: &CoordinatorUpdate,
        to_engine: &FromIntegrationSender,
    ) {
        let status = FromIntegrationMessage::CoordinatorStatusChanged {
            integration_name: name.to_string(),
            status: update.status,
            last_error: update.last_error.clone(),
        };
        if let Err(e) = to_engine.send(status).await {
            warn!("Failed to send CoordinatorStatusChanged message: {}", e);
        }

        for switch in switches {
            Self::report_switch_state(switch, to_engine).await;
        }
    }

    async fn report_switch_state(switch: &QbittorrentSwitch, to_engine: &FromIntegrationSender) {
        let msg = FromIntegrationMessage::SwitchStateChanged {
            entity_id: switch.entity_id().to_string(),
            on: switch.is_on(),
        };
        if let Err(e) = to_engine.send(msg).await {
            warn!("Failed to send SwitchStateChanged message: {}", e);
        }
    }

    /// Forward coordinator refreshes to the engine until the coordinator fails
    async fn forward_updates_task(
        name: String,
        mut updates: watch::Receiver<CoordinatorUpdate>,
        switches: Vec<Arc<QbittorrentSwitch>>,
        to_engine: FromIntegrationSender,
    ) {
        while updates.changed().await.is_ok() {
            let update = updates.borrow_and_update().clone();
            debug!(
                "[{}] Refresh #{} completed: {}",
                name, update.generation, update.status
            );
            Self::report(&name, &switches, &update, &to_engine).await;

            if update.status == CoordinatorStatus::Failed {
                error!(
                    "[{}] Integration disabled, fix the configuration and restart",
                    name
                );
                break;
            }
        }
    }
}

#[async_trait]
impl Integration for QbittorrentIntegration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), SetupError> {
        info!(
            "[{}] Connecting to qBittorrent at {}",
            self.entry_id, self.config.url
        );
        if let Err(e) = self.client.login().await {
            let status = match e {
                ClientError::LoginRequired => CoordinatorStatus::Failed,
                _ => CoordinatorStatus::Pending,
            };
            let update = CoordinatorUpdate {
                generation: 0,
                status,
                last_error: Some(e.to_string()),
            };
            Self::report(&self.name, &[], &update, &tx).await;
            return Err(self.setup_error(status, e));
        }

        let coordinator = Arc::new(QbittorrentDataCoordinator::new(
            self.name.clone(),
            self.client.clone(),
            self.config.poll_interval(),
            false,
        ));
        let status = match coordinator.first_refresh().await {
            Ok(status) => status,
            Err(e) => {
                let update = coordinator.last_update();
                Self::report(&self.name, &[], &update, &tx).await;
                return Err(self.setup_error(update.status, e));
            }
        };
        let torrents = status
            .main_data
            .get("torrents")
            .and_then(|t| t.as_object())
            .map_or(0, |t| t.len());
        info!(
            "[{}] Connected, {} torrents, alternative speed limits {}",
            self.entry_id,
            torrents,
            if status.alt_speed_enabled { "on" } else { "off" }
        );

        self.switches = SWITCH_TYPES
            .iter()
            .map(|description| {
                Arc::new(QbittorrentSwitch::new(
                    &self.entry_id,
                    coordinator.clone(),
                    description,
                ))
            })
            .collect();

        for switch in &self.switches {
            let msg = FromIntegrationMessage::discovered(&**switch, &self.name);
            tx.send(msg).await.map_err(send_failed)?;
            info!("[{}] Registered entity: {}", self.entry_id, switch.entity_id());
        }
        Self::report(&self.name, &self.switches, &coordinator.last_update(), &tx).await;

        self.poll_task = Some(coordinator.start());
        self.listener_task = Some(tokio::spawn(Self::forward_updates_task(
            self.name.clone(),
            coordinator.subscribe(),
            self.switches.clone(),
            tx.clone(),
        )));

        self.to_engine = Some(tx);

        info!("[{}] qBittorrent integration ready", self.entry_id);
        Ok(())
    }

    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>> {
        match msg {
            ToIntegrationMessage::SwitchCommand {
                entity_id,
                action,
                reply,
            } => {
                info!(
                    "[{}] Handling switch command for {}: {}",
                    self.entry_id, entity_id, action
                );

                let switch = self
                    .switches
                    .iter()
                    .find(|s| s.entity_id() == entity_id);
                let result = match switch {
                    Some(switch) => {
                        let result = switch.apply(action).await.map_err(|e| e.to_string());
                        if let Some(tx) = &self.to_engine {
                            Self::report_switch_state(switch, tx).await;
                        }
                        result
                    }
                    None => Err(format!("unknown entity: {}", entity_id)),
                };

                if let Err(e) = &result {
                    warn!(
                        "[{}] Switch command for {} failed: {}",
                        self.entry_id, entity_id, e
                    );
                }
                if reply.send(result).is_err() {
                    debug!("[{}] Command caller went away", self.entry_id);
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>> {
        info!("[{}] qBittorrent integration shutting down", self.entry_id);

        for task in [self.listener_task.take(), self.poll_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }

        if let Some(tx) = &self.to_engine {
            for switch in &self.switches {
                let msg = FromIntegrationMessage::EntityRemoved {
                    entity_id: switch.entity_id().to_string(),
                };
                if let Err(e) = tx.try_send(msg) {
                    debug!("Failed to send EntityRemoved message: {}", e);
                }
            }
        }

        self.switches.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::Engine;
    use crate::engine::EngineError;
    use crate::engine::State;
    use crate::engine::SwitchAction;
    use crate::integrations::qbittorrent::client::MockFailure;
    use crate::integrations::qbittorrent::client::MockQbittorrentClient;

    const ENTITY_ID: &str = "switch.seedbox_alternative_speed_limits";

    fn config() -> QbittorrentConfig {
        QbittorrentConfig {
            url: "http://localhost:8080".to_string(),
            username: "admin".to_string(),
            password: "adminadmin".to_string(),
            verify_ssl: true,
            poll_interval_seconds: 30,
            enabled: true,
        }
    }

    fn start(client: Arc<MockQbittorrentClient>) -> Arc<Engine> {
        let engine = Arc::new(Engine::new());
        let integration = QbittorrentIntegration::new("seedbox".to_string(), config(), client);
        engine.register_integration(integration.name().to_string(), Box::new(integration));
        let runner = engine.clone();
        tokio::spawn(async move { runner.run().await });
        engine
    }

    async fn wait_for(engine: &Engine, predicate: impl Fn(&State) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !predicate(&engine.state_snapshot()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for engine state");
    }

    #[tokio::test]
    async fn test_setup_registers_switch_and_device() {
        let client = Arc::new(MockQbittorrentClient::new(true));
        let engine = start(client.clone());
        wait_for(&engine, |s| s.switches.contains_key(ENTITY_ID)).await;

        let state = engine.state_snapshot();
        assert!(state.switches[ENTITY_ID].on);
        let device = &state.devices["qbittorrent.seedbox"];
        assert_eq!(device.entity_ids, vec![ENTITY_ID]);
        assert_eq!(device.info.manufacturer.as_deref(), Some("qBittorrent"));
        assert_eq!(
            state.integrations["qbittorrent.seedbox"].status,
            CoordinatorStatus::Fresh
        );
        assert_eq!(client.login_calls(), 1);

        let entity = &state.entities[ENTITY_ID];
        assert_eq!(entity.unique_id, "seedbox-alternative_speed_limits");
        assert_eq!(entity.platform, "switch");
        assert_eq!(entity.integration, "qbittorrent.seedbox");
    }

    #[tokio::test]
    async fn test_switch_command_toggles_and_refreshes() {
        let client = Arc::new(MockQbittorrentClient::new(false));
        let engine = start(client.clone());
        wait_for(&engine, |s| s.switches.contains_key(ENTITY_ID)).await;

        engine
            .switch_command(ENTITY_ID, SwitchAction::TurnOn)
            .await
            .unwrap();
        assert_eq!(client.toggle_calls(), 1);
        assert_eq!(client.sync_calls(), 2);
        wait_for(&engine, |s| s.switches[ENTITY_ID].on).await;

        engine
            .switch_command(ENTITY_ID, SwitchAction::TurnOn)
            .await
            .unwrap();
        assert_eq!(client.toggle_calls(), 1);

        engine
            .switch_command(ENTITY_ID, SwitchAction::Toggle)
            .await
            .unwrap();
        assert_eq!(client.toggle_calls(), 2);
        wait_for(&engine, |s| !s.switches[ENTITY_ID].on).await;
    }

    #[tokio::test]
    async fn test_failed_command_is_reported() {
        let client = Arc::new(MockQbittorrentClient::new(false));
        let engine = start(client.clone());
        wait_for(&engine, |s| s.switches.contains_key(ENTITY_ID)).await;

        client.fail_toggle_with(Some(MockFailure::Unreachable));
        let err = engine
            .switch_command(ENTITY_ID, SwitchAction::TurnOn)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Command(_)));
        assert_eq!(client.sync_calls(), 1);
        assert!(!engine.state_snapshot().switches[ENTITY_ID].on);
    }

    fn integration_status(state: &State) -> Option<CoordinatorStatus> {
        state.integrations.get("qbittorrent.seedbox").map(|i| i.status)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_login_is_not_retried() {
        let client = Arc::new(MockQbittorrentClient::new(false));
        client.fail_login_with(Some(MockFailure::LoginRequired));
        let engine = start(client.clone());
        wait_for(&engine, |s| integration_status(s) == Some(CoordinatorStatus::Failed)).await;

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(client.login_calls(), 1);
        assert_eq!(client.sync_calls(), 0);
        assert!(engine.state_snapshot().switches.is_empty());
        assert!(matches!(
            engine.switch_command(ENTITY_ID, SwitchAction::TurnOn).await,
            Err(EngineError::UnknownEntity(_))
        ));
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_login_is_retried() {
        let client = Arc::new(MockQbittorrentClient::new(false));
        client.fail_login_with(Some(MockFailure::Unreachable));
        let engine = start(client.clone());
        wait_for(&engine, |s| integration_status(s) == Some(CoordinatorStatus::Pending)).await;
        assert_eq!(client.sync_calls(), 0);

        client.fail_login_with(None);
        tokio::time::sleep(Duration::from_secs(31)).await;
        wait_for(&engine, |s| s.switches.contains_key(ENTITY_ID)).await;
        assert_eq!(client.login_calls(), 2);
        assert_eq!(
            integration_status(&engine.state_snapshot()),
            Some(CoordinatorStatus::Fresh)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_first_refresh_is_retried() {
        let client = Arc::new(MockQbittorrentClient::new(true));
        client.fail_sync_with(Some(MockFailure::Unreachable));
        let engine = start(client.clone());
        wait_for(&engine, |s| integration_status(s) == Some(CoordinatorStatus::Degraded)).await;
        assert!(engine.state_snapshot().switches.is_empty());

        client.fail_sync_with(None);
        tokio::time::sleep(Duration::from_secs(31)).await;
        wait_for(&engine, |s| s.switches.contains_key(ENTITY_ID)).await;
        assert!(engine.state_snapshot().switches[ENTITY_ID].on);
        assert_eq!(client.sync_calls(), 2);
        assert_eq!(client.login_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_first_refresh_is_not_retried() {
        let client = Arc::new(MockQbittorrentClient::new(false));
        client.fail_sync_with(Some(MockFailure::LoginRequired));
        let engine = start(client.clone());
        wait_for(&engine, |s| integration_status(s) == Some(CoordinatorStatus::Failed)).await;

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(client.sync_calls(), 1);
        assert!(engine.state_snapshot().switches.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_refresh_picks_up_remote_changes() {
        let client = Arc::new(MockQbittorrentClient::new(false));
        let engine = start(client.clone());
        wait_for(&engine, |s| s.switches.contains_key(ENTITY_ID)).await;

        client.set_remote_alt_speed(true);
        tokio::time::sleep(Duration::from_secs(31)).await;
        wait_for(&engine, |s| s.switches[ENTITY_ID].on).await;
        assert_eq!(client.sync_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_while_polling_disables_integration() {
        let client = Arc::new(MockQbittorrentClient::new(false));
        let engine = start(client.clone());
        wait_for(&engine, |s| s.switches.contains_key(ENTITY_ID)).await;

        client.fail_sync_with(Some(MockFailure::LoginRequired));
        tokio::time::sleep(Duration::from_secs(31)).await;
        wait_for(&engine, |s| {
            s.integrations["qbittorrent.seedbox"].status == CoordinatorStatus::Failed
        })
        .await;

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(client.sync_calls(), 2);

        // The cached state is still served
        assert!(!engine.state_snapshot().switches[ENTITY_ID].on);
    }

    #[tokio::test]
    async fn test_shutdown_removes_entities() {
        let client = Arc::new(MockQbittorrentClient::new(false));
        let engine = start(client);
        wait_for(&engine, |s| s.switches.contains_key(ENTITY_ID)).await;

        engine.shutdown().await;
        wait_for(&engine, |s| s.switches.is_empty() && s.devices.is_empty()).await;
    }
}
