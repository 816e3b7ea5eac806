//! Client for the remote control service that owns training and storage.
//!
//! Every call here is best-effort: failures are logged with the full response
//! detail and reported back as a plain outcome, never as an error the caller
//! has to handle.

use std::future::Future;

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use utoipa::ToSchema;

use crate::config::SettingsStore;
use crate::error::Result;
use crate::trace::{TraceComponent, TraceLog};

const METADATA_PATH: &str = "/Application/GetMetadata";
const RETRAIN_PATH: &str = "/Application/RetrainModel";
const RESET_PATH: &str = "/Application/Reset";

/// Application metadata handed out by the control service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ApplicationMetadata {
    #[serde(rename = "ApplicationID")]
    pub application_id: String,
    #[serde(rename = "ConnectionString")]
    pub connection_string: String,
    #[serde(rename = "ModelId", default)]
    pub model_id: Option<String>,
    #[serde(rename = "ExperimentalUnitDuration", default)]
    pub experimental_unit_duration: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RetrainOutcome {
    /// Auto-retrain is disabled in the current settings.
    Skipped,
    Requested,
    Failed,
}

impl RetrainOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrainOutcome::Skipped => "skipped",
            RetrainOutcome::Requested => "requested",
            RetrainOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RetrainLabels {
    outcome: String,
}

/// Anything that can ask for a model retrain.
pub trait Retrainer: Send + Sync {
    fn trigger_retrain(&self, action_count: u32) -> impl Future<Output = RetrainOutcome> + Send;
}

#[derive(Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    base_url: String,
    app_token: String,
    settings: SettingsStore,
    trace: TraceLog,
    retrain_requests: Family<RetrainLabels, Counter>,
}

impl ControlClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        app_token: impl Into<String>,
        settings: SettingsStore,
        trace: TraceLog,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            app_token: app_token.into(),
            settings,
            trace,
            retrain_requests: Family::default(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn retrain_requests(&self) -> Family<RetrainLabels, Counter> {
        self.retrain_requests.clone()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Fetches the application metadata (storage connection string, model id).
    pub async fn fetch_metadata(&self) -> Result<ApplicationMetadata> {
        let url = self.endpoint(METADATA_PATH);
        let metadata = self
            .http
            .get(&url)
            .query(&[("token", self.app_token.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json::<ApplicationMetadata>()
            .await?;
        debug!(application_id = %metadata.application_id, "fetched application metadata");
        Ok(metadata)
    }

    /// Asks the control service to retrain the model, if auto-retrain is enabled.
    pub async fn request_retrain(&self, action_count: u32) -> RetrainOutcome {
        let settings = self.settings.load();
        let outcome = if !settings.auto_retrain {
            debug!("auto-retrain disabled, skipping retrain request");
            RetrainOutcome::Skipped
        } else {
            let form = [
                ("token", self.app_token.clone()),
                ("numberOfActions", action_count.to_string()),
                ("useAfx", dotnet_bool(settings.use_afx).to_string()),
            ];
            if self.post_form(RETRAIN_PATH, &form, "request model retraining").await {
                info!(action_count, use_afx = settings.use_afx, "requested model retraining");
                self.trace
                    .append_from(TraceComponent::Trainer, "Requested model retraining.");
                RetrainOutcome::Requested
            } else {
                RetrainOutcome::Failed
            }
        };

        self.retrain_requests
            .get_or_create(&RetrainLabels {
                outcome: outcome.as_str().to_string(),
            })
            .inc();
        outcome
    }

    /// Asks the control service to reset its stored state. Returns `true` on success.
    pub async fn reset_remote(&self) -> bool {
        let form = [("token", self.app_token.clone())];
        let ok = self.post_form(RESET_PATH, &form, "reset application").await;
        if ok {
            info!("control service reset application state");
        }
        ok
    }

    async fn post_form(&self, path: &str, form: &[(&str, String)], what: &str) -> bool {
        let url = self.endpoint(path);
        match self.http.post(&url).form(form).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                let status = resp.status();
                let headers = format!("{:?}", resp.headers());
                let body = resp
                    .text()
                    .await
                    .unwrap_or_else(|err| format!("<unreadable body: {err}>"));
                error!(
                    %url,
                    status = status.as_u16(),
                    reason = status.canonical_reason().unwrap_or("unknown"),
                    headers = %headers,
                    body = %body,
                    "failed to {what}"
                );
                false
            }
            Err(err) => {
                error!(%url, error = %err, "failed to {what}");
                false
            }
        }
    }
}

impl Retrainer for ControlClient {
    fn trigger_retrain(&self, action_count: u32) -> impl Future<Output = RetrainOutcome> + Send {
        self.request_retrain(action_count)
    }
}

/// The trainer parses booleans in their .NET spelling.
fn dotnet_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}
