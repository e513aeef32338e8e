//! Poll-and-cache data coordinator
//!
//! A `Coordinator` keeps the latest successful result of a [`RefreshableStatusSource`] and
//! refreshes it on a fixed interval or on demand. Entities read the cached data without
//! touching the network.
//!
//! Status transitions:
//! - any non-terminal status --success--> `Fresh`
//! - any non-terminal status --update error--> `Degraded` (previous data kept)
//! - any non-terminal status --auth error--> `Failed` (terminal, polling stops)

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Health of a coordinator's cached data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CoordinatorStatus {
    /// No refresh has completed yet
    Pending,
    /// Last refresh succeeded
    Fresh,
    /// Last refresh failed; data from an earlier refresh is still served
    Degraded,
    /// Authentication was rejected. Not polled again until reconfigured.
    Failed,
}

/// Underlying cause of a failed update, shared by every caller that waited on it.
pub type SourceError = Arc<dyn Error + Send + Sync>;

/// Error reported by a source while fetching data.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Credentials were rejected. Fatal for the coordinator.
    #[error("{0}")]
    Auth(String),

    /// Anything else (network, malformed payload, ...). The next poll may succeed.
    #[error(transparent)]
    Failed(SourceError),
}

impl UpdateError {
    pub fn failed(e: impl Error + Send + Sync + 'static) -> Self {
        UpdateError::Failed(Arc::new(e))
    }
}

/// Error returned to callers of a refresh.
///
/// Cloneable so that callers whose requests were collapsed into one refresh all see
/// the same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    #[error("invalid configuration: {0}")]
    ConfigEntry(String),

    #[error("update failed: {0}")]
    UpdateFailed(#[source] SourceError),

    #[error("coordinator has failed and is no longer refreshed")]
    Failed,
}

/// Published after every completed refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorUpdate {
    /// Number of completed refreshes
    pub generation: u64,
    pub status: CoordinatorStatus,
    pub last_error: Option<String>,
}

/// Something a coordinator can poll.
#[async_trait]
pub trait RefreshableStatusSource: Send + Sync + 'static {
    type Data: Send + Sync + 'static;

    /// Fetch a complete new value. Called by at most one task at a time per coordinator.
    async fn update(&self) -> Result<Self::Data, UpdateError>;
}

type RefreshOutcome<T> = Result<Arc<T>, RefreshError>;

pub struct Coordinator<S: RefreshableStatusSource> {
    name: String,
    source: S,
    interval: Duration,

    /// Latest successful data (readers load the Arc, the refresh stores a new one)
    data: ArcSwapOption<S::Data>,

    /// Number of refreshes that have started. Only incremented while `last` is locked.
    started: AtomicU64,

    /// Serializes refreshes and remembers the outcome of the most recent one
    last: Mutex<Option<RefreshOutcome<S::Data>>>,

    updates: watch::Sender<CoordinatorUpdate>,
}

impl<S: RefreshableStatusSource> Coordinator<S> {
    pub fn new(name: impl Into<String>, source: S, interval: Duration) -> Self {
        let (updates, _) = watch::channel(CoordinatorUpdate {
            generation: 0,
            status: CoordinatorStatus::Pending,
            last_error: None,
        });

        Self {
            name: name.into(),
            source,
            interval,
            data: ArcSwapOption::empty(),
            started: AtomicU64::new(0),
            last: Mutex::new(None),
            updates,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Latest successful data, if any refresh has succeeded yet. Never blocks.
    pub fn data(&self) -> Option<Arc<S::Data>> {
        self.data.load_full()
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.updates.borrow().status
    }

    pub fn last_update(&self) -> CoordinatorUpdate {
        self.updates.borrow().clone()
    }

    /// Receive a notification after every completed refresh
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorUpdate> {
        self.updates.subscribe()
    }

    /// Perform the initial refresh during setup.
    ///
    /// Unlike scheduled refreshes, a failure here is meant to abort setup.
    pub async fn first_refresh(&self) -> RefreshOutcome<S::Data> {
        info!("[{}] Fetching initial data", self.name);
        self.request_refresh().await
    }

    /// Refresh now and wait for the result.
    ///
    /// At most one refresh runs at a time. If another refresh started after this request
    /// was made and has completed by the time we get the lock, its outcome is reused
    /// instead of hitting the source again.
    pub async fn request_refresh(&self) -> RefreshOutcome<S::Data> {
        let requested = self.started.load(Ordering::Acquire);
        let mut last = self.last.lock().await;

        if self.started.load(Ordering::Acquire) > requested {
            if let Some(outcome) = last.as_ref() {
                debug!("[{}] Refresh request collapsed into a newer refresh", self.name);
                return outcome.clone();
            }
        }

        if self.status() == CoordinatorStatus::Failed {
            return Err(RefreshError::Failed);
        }

        self.started.fetch_add(1, Ordering::AcqRel);
        let outcome = self.run_update().await;
        *last = Some(outcome.clone());
        outcome
    }

    async fn run_update(&self) -> RefreshOutcome<S::Data> {
        debug!("[{}] Refreshing", self.name);

        let (status, outcome) = match self.source.update().await {
            Ok(data) => {
                let data = Arc::new(data);
                self.data.store(Some(Arc::clone(&data)));
                (CoordinatorStatus::Fresh, Ok(data))
            }
            Err(UpdateError::Auth(message)) => {
                error!(
                    "[{}] Authentication failed, refresh disabled until reconfigured: {}",
                    self.name, message
                );
                (
                    CoordinatorStatus::Failed,
                    Err(RefreshError::ConfigEntry(message)),
                )
            }
            Err(UpdateError::Failed(source)) => {
                warn!("[{}] Error fetching data: {}", self.name, source);
                (
                    CoordinatorStatus::Degraded,
                    Err(RefreshError::UpdateFailed(source)),
                )
            }
        };

        let generation = self.updates.borrow().generation + 1;
        self.updates.send_replace(CoordinatorUpdate {
            generation,
            status,
            last_error: outcome.as_ref().err().map(ToString::to_string),
        });

        outcome
    }

    /// Spawn the scheduled refresh task.
    ///
    /// The first tick fires one interval from now; call `first_refresh` for the initial
    /// data. The task exits once the coordinator reaches `Failed`.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the first immediate tick
            ticker.tick().await;

            info!(
                "[{}] Scheduled refresh every {:?}",
                self.name, self.interval
            );

            loop {
                ticker.tick().await;
                match self.request_refresh().await {
                    Ok(_) | Err(RefreshError::UpdateFailed(_)) => {}
                    Err(e) => {
                        info!("[{}] Scheduled refresh stopped: {}", self.name, e);
                        break;
                    }
                }
            }
        })
    }
}
