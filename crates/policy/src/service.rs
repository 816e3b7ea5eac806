//! Batching decision service.
//!
//! Interactions and rewards are queued on a bounded channel and collected by a
//! background batcher. A batch is handed to the upload worker once it holds
//! `max_event_count` events or `max_buffer_bytes` bytes, or once it has been
//! open for `max_duration`. The worker writes each batch as a JSONL file into
//! the configured output directory, where the trainer picks it up.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::explorer::{Decision, EpsilonGreedyExplorer, Policy};
use crate::utils::batch_file::{batch_file_name, write_batch};

const COMMAND_QUEUE_CAPACITY: usize = 10_000;
const UPLOAD_ATTEMPTS: u32 = 3;
const UPLOAD_RETRY_DELAY: Duration = Duration::from_millis(200);
const MIN_BATCH_DURATION: Duration = Duration::from_millis(1);

/// Callback receiving human-readable engine status lines (e.g. upload results).
pub type EventObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// What the upload worker does with a batch it failed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadRetryPolicy {
    /// Give up after the first failure.
    Drop,
    /// Retry a bounded number of times before giving up.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchingConfig {
    pub max_duration: Duration,
    pub max_buffer_bytes: usize,
    pub max_event_count: usize,
    pub max_upload_queue_capacity: usize,
    pub upload_retry_policy: UploadRetryPolicy,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(2),
            max_buffer_bytes: 1024,
            max_event_count: 100,
            max_upload_queue_capacity: 4,
            upload_retry_policy: UploadRetryPolicy::Retry,
        }
    }
}

pub struct DecisionServiceConfig<P> {
    pub app_token: String,
    pub explorer: EpsilonGreedyExplorer<P>,
    pub output_dir: PathBuf,
    pub batching: BatchingConfig,
    pub observer: Option<EventObserver>,
}

impl<P> DecisionServiceConfig<P> {
    pub fn new(
        app_token: impl Into<String>,
        explorer: EpsilonGreedyExplorer<P>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            app_token: app_token.into(),
            explorer,
            output_dir: output_dir.into(),
            batching: BatchingConfig::default(),
            observer: None,
        }
    }

    pub fn with_batching(mut self, batching: BatchingConfig) -> Self {
        self.batching = batching;
        self
    }

    pub fn with_observer(mut self, observer: EventObserver) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// One record written to a batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    Interaction {
        key: String,
        action: u32,
        probability: f32,
        context: String,
        ts: DateTime<Utc>,
    },
    Reward {
        key: String,
        reward: f32,
        ts: DateTime<Utc>,
    },
}

enum Command {
    Record(EngineEvent),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

struct UploadJob {
    lines: Vec<String>,
    done: Option<oneshot::Sender<()>>,
}

/// Decision engine handle: explores, records, and uploads.
///
/// Must be created inside a Tokio runtime; it spawns its worker on construction.
pub struct DecisionService<P> {
    app_token: String,
    explorer: EpsilonGreedyExplorer<P>,
    sender: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<P> DecisionService<P> {
    pub fn new(config: DecisionServiceConfig<P>) -> Self {
        let DecisionServiceConfig {
            app_token,
            explorer,
            output_dir,
            batching,
            observer,
        } = config;

        let (sender, receiver) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        info!(
            output_dir = %output_dir.display(),
            epsilon = explorer.epsilon(),
            actions = explorer.action_count(),
            "decision service started"
        );

        let uploader = Uploader {
            output_dir,
            retry_policy: batching.upload_retry_policy,
            observer,
            seq: 0,
        };
        let worker = tokio::spawn(run_batcher(receiver, batching, uploader));

        Self {
            app_token,
            explorer,
            sender,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn app_token(&self) -> &str {
        &self.app_token
    }

    pub fn explorer(&self) -> &EpsilonGreedyExplorer<P> {
        &self.explorer
    }

    /// Chooses an action for `ctx` and records the interaction under `unique_key`.
    pub fn choose_action<C>(&self, unique_key: &str, ctx: &C) -> Decision
    where
        P: Policy<C>,
        C: fmt::Display,
    {
        let decision = self.explorer.choose(ctx, &mut rand::thread_rng());
        self.record(EngineEvent::Interaction {
            key: unique_key.to_string(),
            action: decision.action,
            probability: decision.probability,
            context: ctx.to_string(),
            ts: Utc::now(),
        });
        decision
    }

    /// Records a reward for the interaction identified by `unique_key`.
    pub fn report_reward(&self, reward: f32, unique_key: &str) {
        self.record(EngineEvent::Reward {
            key: unique_key.to_string(),
            reward,
            ts: Utc::now(),
        });
    }

    /// Ships the open batch and waits until every queued batch has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Command::Flush(tx)).await.is_err() {
            debug!("decision service already stopped, nothing to flush");
            return;
        }
        if rx.await.is_err() {
            warn!("upload worker stopped before acknowledging flush");
        }
    }

    /// Stops the worker after it has written everything recorded so far.
    pub async fn dispose(&self) {
        let Some(handle) = self.worker.lock().await.take() else {
            return;
        };
        let _ = self.sender.send(Command::Shutdown).await;
        if let Err(err) = handle.await {
            error!(error = %err, "decision service worker panicked");
        }
        info!("decision service disposed");
    }

    fn record(&self, event: EngineEvent) {
        if let Err(err) = self.sender.try_send(Command::Record(event)) {
            warn!(error = %err, "decision event dropped");
        }
    }
}

#[derive(Default)]
struct Batch {
    lines: Vec<String>,
    bytes: usize,
}

impl Batch {
    fn push(&mut self, event: &EngineEvent) {
        match serde_json::to_string(event) {
            Ok(line) => {
                self.bytes += line.len();
                self.lines.push(line);
            }
            Err(err) => warn!(error = %err, "failed to serialize decision event"),
        }
    }

    fn is_full(&self, cfg: &BatchingConfig) -> bool {
        self.lines.len() >= cfg.max_event_count || self.bytes >= cfg.max_buffer_bytes
    }

    fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn take(&mut self) -> Vec<String> {
        self.bytes = 0;
        std::mem::take(&mut self.lines)
    }
}

async fn run_batcher(
    mut receiver: mpsc::Receiver<Command>,
    batching: BatchingConfig,
    uploader: Uploader,
) {
    let (upload_tx, upload_rx) = mpsc::channel(batching.max_upload_queue_capacity.max(1));
    let upload_task = tokio::spawn(uploader.run(upload_rx));

    let mut batch = Batch::default();
    let mut ticker = tokio::time::interval(batching.max_duration.max(MIN_BATCH_DURATION));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = receiver.recv() => match cmd {
                Some(Command::Record(event)) => {
                    batch.push(&event);
                    if batch.is_full(&batching) {
                        ship(&upload_tx, batch.take(), None).await;
                    }
                }
                Some(Command::Flush(ack)) => ship(&upload_tx, batch.take(), Some(ack)).await,
                Some(Command::Shutdown) | None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    ship(&upload_tx, batch.take(), None).await;
                }
            }
        }
    }

    if !batch.is_empty() {
        ship(&upload_tx, batch.take(), None).await;
    }
    drop(upload_tx);
    if let Err(err) = upload_task.await {
        error!(error = %err, "upload worker panicked");
    }
}

async fn ship(tx: &mpsc::Sender<UploadJob>, lines: Vec<String>, done: Option<oneshot::Sender<()>>) {
    let count = lines.len();
    if tx.send(UploadJob { lines, done }).await.is_err() {
        warn!(events = count, "upload worker gone, dropping batch");
    }
}

struct Uploader {
    output_dir: PathBuf,
    retry_policy: UploadRetryPolicy,
    observer: Option<EventObserver>,
    seq: u64,
}

impl Uploader {
    async fn run(mut self, mut rx: mpsc::Receiver<UploadJob>) {
        while let Some(job) = rx.recv().await {
            if !job.lines.is_empty() {
                self.upload(job.lines).await;
            }
            if let Some(done) = job.done {
                let _ = done.send(());
            }
        }
    }

    async fn upload(&mut self, lines: Vec<String>) {
        self.seq += 1;
        let file_name = batch_file_name(Utc::now(), self.seq);
        let attempts = match self.retry_policy {
            UploadRetryPolicy::Retry => UPLOAD_ATTEMPTS,
            UploadRetryPolicy::Drop => 1,
        };
        let count = lines.len();
        let lines = Arc::new(lines);

        for attempt in 1..=attempts {
            let dir = self.output_dir.clone();
            let name = file_name.clone();
            let batch = lines.clone();
            let result = tokio::task::spawn_blocking(move || write_batch(&dir, &name, &batch))
                .await
                .context("spawn_blocking join failed")
                .and_then(|res| res.context("write batch file"));

            match result {
                Ok(path) => {
                    info!(path = %path.display(), events = count, "uploaded decision batch");
                    if let Some(observer) = &self.observer {
                        observer(&format!("Successfully uploaded {count} events."));
                    }
                    return;
                }
                Err(err) if attempt < attempts => {
                    warn!(attempt, error = %format!("{err:#}"), "batch upload failed, retrying");
                    tokio::time::sleep(UPLOAD_RETRY_DELAY).await;
                }
                Err(err) => {
                    error!(
                        attempts,
                        events = count,
                        error = %format!("{err:#}"),
                        "batch upload failed, dropping events"
                    );
                }
            }
        }
    }
}
