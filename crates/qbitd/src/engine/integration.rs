use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use linkme::distributed_slice;
use tokio::sync::mpsc;

use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use crate::config::Config;

/// Channel types for messages FROM integrations TO the engine
/// These are bounded channels to provide backpressure
pub type FromIntegrationSender = mpsc::Sender<FromIntegrationMessage>;
pub type FromIntegrationReceiver = mpsc::Receiver<FromIntegrationMessage>;

/// Channel types for messages FROM the engine TO integrations (unbounded - engine must not block)
pub type ToIntegrationSender = mpsc::UnboundedSender<ToIntegrationMessage>;

/// Result type for integration factory functions
///
/// A factory may produce one integration per configured entry.
pub type IntegrationFactoryResult = anyhow::Result<Vec<Box<dyn Integration>>>;

/// Why an integration's setup did not complete
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// The integration cannot work with its current configuration; it is not retried
    #[error("{0}")]
    Failed(Box<dyn Error + Send>),

    /// A transient problem, e.g. the remote service is unreachable; setup is retried
    #[error("{error} (retrying in {retry_after:?})")]
    NotReady {
        error: Box<dyn Error + Send>,
        retry_after: Duration,
    },
}

pub struct IntegrationContext<'a> {
    pub config: &'a Config,
}

#[distributed_slice]
pub static REGISTRY: [fn(&IntegrationContext) -> IntegrationFactoryResult];

/// Integration trait that all integrations must implement
#[async_trait]
pub trait Integration: Send + Sync {
    /// Get the name/identifier of this integration
    fn name(&self) -> &str;

    /// Set up the integration - connect, fetch initial data, register entities, etc.
    ///
    /// The integration receives a sender to report events back to the engine
    /// (discovery, state changes, etc.). After `SetupError::NotReady` the engine calls
    /// `setup` again once the requested delay has passed.
    async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), SetupError>;

    /// Handle a command from the engine
    ///
    /// The integration should execute the requested action (e.g., turn on a switch)
    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>>;

    /// Shut down the integration gracefully
    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>>;
}
