//! Background loop that turns fresh training data into retrain requests.
//!
//! With storage reachable, every poll compares the newest block blob of the
//! newest `complete*` container against a shared watermark. Without storage
//! the loop counts polls and asks for a retrain once the configured fallback
//! period has passed.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use prometheus_client::metrics::counter::Counter;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Settings, SettingsStore};
use crate::control::{ControlClient, Retrainer};
use crate::error::Result;
use crate::storage::{latest_block_blob_time, latest_container, AzureBlobStore, BlobStore};
use crate::trace::{TraceComponent, TraceLog};

pub const COMPLETE_CONTAINER_PREFIX: &str = "complete";

/// Newest blob modification time already acted upon.
///
/// Shared between the observer and the lifecycle manager, which rewinds it on
/// reset.
#[derive(Clone, Default)]
pub struct Watermark(Arc<RwLock<DateTime<Utc>>>);

impl Watermark {
    pub fn get(&self) -> DateTime<Utc> {
        *self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves the watermark forward if `candidate` is strictly newer.
    pub fn advance(&self, candidate: DateTime<Utc>) -> bool {
        let mut current = self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if candidate > *current {
            *current = candidate;
            true
        } else {
            false
        }
    }

    pub fn reset(&self) {
        *self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = DateTime::<Utc>::default();
    }
}

pub enum ObserverMode<S> {
    Watching(S),
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Unchanged,
    NewData,
    StorageError,
    Waiting,
    FallbackRetrain,
}

/// Resolves storage credentials through the control service.
///
/// Any failure leaves the observer in disconnected mode.
pub async fn connect(control: &ControlClient) -> ObserverMode<AzureBlobStore> {
    match try_connect(control).await {
        Ok(store) => {
            info!(endpoint = %store.endpoint(), "watching storage for new training data");
            ObserverMode::Watching(store)
        }
        Err(err) => {
            warn!(error = %err, "could not connect to training data storage");
            ObserverMode::Disconnected
        }
    }
}

async fn try_connect(control: &ControlClient) -> Result<AzureBlobStore> {
    let metadata = control.fetch_metadata().await?;
    let store =
        AzureBlobStore::from_connection_string(control.http_client().clone(), &metadata.connection_string)?;
    store.list_containers(COMPLETE_CONTAINER_PREFIX).await?;
    Ok(store)
}

pub struct StorageObserver<S, R> {
    mode: ObserverMode<S>,
    retrainer: R,
    settings_store: SettingsStore,
    settings: Settings,
    watermark: Watermark,
    trace: TraceLog,
    action_count: u32,
    wait_count: u64,
    polls: Counter,
}

impl<S: BlobStore, R: Retrainer> StorageObserver<S, R> {
    pub fn new(
        mode: ObserverMode<S>,
        retrainer: R,
        settings_store: SettingsStore,
        watermark: Watermark,
        trace: TraceLog,
        action_count: u32,
    ) -> Self {
        let settings = settings_store.load();
        if matches!(mode, ObserverMode::Disconnected) {
            warn!(
                period_ms = settings.retrain_fallback_interval_ms,
                "storage unavailable, retraining on a fixed period instead"
            );
        }
        Self {
            mode,
            retrainer,
            settings_store,
            settings,
            watermark,
            trace,
            action_count,
            wait_count: 0,
            polls: Counter::default(),
        }
    }

    pub fn with_poll_counter(mut self, polls: Counter) -> Self {
        self.polls = polls;
        self
    }

    pub fn is_watching(&self) -> bool {
        matches!(self.mode, ObserverMode::Watching(_))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Runs one observation step.
    pub async fn tick(&mut self) -> TickOutcome {
        self.polls.inc();
        if let ObserverMode::Watching(store) = &self.mode {
            return self.poll_storage(store).await;
        }

        self.wait_count += 1;
        let threshold = self.settings.retrain_fallback_interval_ms as f64
            / self.settings.poll_interval_ms as f64;
        if (self.wait_count as f64) < threshold {
            return TickOutcome::Waiting;
        }

        debug!(wait_count = self.wait_count, "fallback period elapsed");
        self.retrainer.trigger_retrain(self.action_count).await;
        self.wait_count = 0;
        self.settings = self.settings_store.load();
        TickOutcome::FallbackRetrain
    }

    async fn poll_storage(&self, store: &S) -> TickOutcome {
        let containers = match store.list_containers(COMPLETE_CONTAINER_PREFIX).await {
            Ok(containers) => containers,
            Err(err) => {
                warn!(error = %err, "listing data containers failed");
                return TickOutcome::StorageError;
            }
        };
        let Some(container) = latest_container(&containers) else {
            return TickOutcome::Unchanged;
        };

        let blobs = match store.list_blobs(&container.name).await {
            Ok(blobs) => blobs,
            Err(err) => {
                warn!(container = %container.name, error = %err, "listing blobs failed");
                return TickOutcome::StorageError;
            }
        };
        let Some(newest) = latest_block_blob_time(&blobs) else {
            return TickOutcome::Unchanged;
        };

        if !self.watermark.advance(newest) {
            return TickOutcome::Unchanged;
        }
        info!(container = %container.name, modified = %newest, "new training data");
        self.trace
            .append_from(TraceComponent::Server, "new data created.");
        self.retrainer.trigger_retrain(self.action_count).await;
        TickOutcome::NewData
    }

    /// Polls until `cancel` fires. Sleeps first, then observes.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(watching = self.is_watching(), "storage observer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.settings.poll_interval()) => {}
            }
            self.tick().await;
        }
        info!("storage observer stopped");
    }
}
