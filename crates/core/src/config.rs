use serde::{Deserialize, Serialize};
use std::{
    env, fmt, fs,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use utoipa::ToSchema;

use crate::error::Result;

pub const DEFAULT_CONTROL_URL: &str = "http://mwtds.azurewebsites.net";
pub const DEFAULT_TRACE_CAPACITY: usize = 1000;

const fn default_poll_interval_ms() -> i64 {
    1000
}

const fn default_retrain_fallback_interval_ms() -> i64 {
    60_000
}

const fn default_auto_retrain() -> bool {
    true
}

const fn default_use_afx() -> bool {
    false
}

const fn default_epsilon() -> f32 {
    0.2
}

/// Operator-editable runtime settings, stored as `settings.json`.
///
/// Values are taken as written: there is no range validation, a negative delay
/// simply behaves like a zero wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Settings {
    /// Delay between two storage polls in milliseconds.
    #[serde(rename = "ServerObserveDelay", default = "default_poll_interval_ms")]
    pub poll_interval_ms: i64,
    /// Retrain period used while storage is unreachable, in milliseconds.
    #[serde(
        rename = "ModelRetrainPeriodicDelay",
        default = "default_retrain_fallback_interval_ms"
    )]
    pub retrain_fallback_interval_ms: i64,
    /// Whether retrain requests are sent at all.
    #[serde(rename = "AutoRetrainModel", default = "default_auto_retrain")]
    pub auto_retrain: bool,
    /// Forwarded to the trainer as `useAfx`.
    #[serde(rename = "UseAfxForModelRetrain", default = "default_use_afx")]
    pub use_afx: bool,
    /// Exploration rate of the epsilon-greedy explorer.
    #[serde(rename = "Epsilon", default = "default_epsilon")]
    pub epsilon: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            retrain_fallback_interval_ms: default_retrain_fallback_interval_ms(),
            auto_retrain: default_auto_retrain(),
            use_afx: default_use_afx(),
            epsilon: default_epsilon(),
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(0) as u64)
    }
}

/// Loads and persists [`Settings`] at a fixed path.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the settings file, falling back to defaults on any failure.
    pub fn load(&self) -> Settings {
        let path = self.path.as_path();
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(settings) => settings,
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse settings JSON, falling back to defaults"
                    );
                    Settings::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "settings file missing, using defaults");
                Settings::default()
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read settings JSON, falling back to defaults"
                );
                Settings::default()
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    /// Seeds the file with defaults if it does not exist. Returns `true` when it was created.
    pub fn ensure_exists(&self) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        self.save(&Settings::default())?;
        tracing::info!(path = %self.path.display(), "seeded default settings");
        Ok(true)
    }
}

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub addr: SocketAddr,
    pub settings_path: PathBuf,
    pub control_url: String,
    pub app_token: String,
    pub model_output_dir: PathBuf,
    pub action_count: u32,
    pub fixed_action: u32,
    pub trace_capacity: usize,
    pub allowed_origin: String,
    pub http_timeout_ms: u64,
    pub http_concurrency: u64,
    pub expose_docs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            settings_path: PathBuf::from("./settings.json"),
            control_url: DEFAULT_CONTROL_URL.to_string(),
            app_token: String::new(),
            model_output_dir: PathBuf::from("./model-output"),
            action_count: 4,
            fixed_action: 1,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
            allowed_origin: "http://127.0.0.1:8080".to_string(),
            http_timeout_ms: 1500,
            http_concurrency: 512,
            expose_docs: false,
        }
    }
}

impl AppConfig {
    /// Reads `MART_*` variables; unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let cfg = Self {
            addr: env_parse("MART_ADDR", defaults.addr),
            settings_path: env_parse("MART_SETTINGS", defaults.settings_path),
            control_url: env_parse("MART_CONTROL_URL", defaults.control_url),
            app_token: env_parse("MART_APP_TOKEN", defaults.app_token),
            model_output_dir: env_parse("MART_MODEL_OUTPUT_DIR", defaults.model_output_dir),
            action_count: env_parse("MART_ACTION_COUNT", defaults.action_count),
            fixed_action: env_parse("MART_FIXED_ACTION", defaults.fixed_action),
            trace_capacity: env_parse("MART_TRACE_CAPACITY", defaults.trace_capacity),
            allowed_origin: env_parse("MART_ALLOWED_ORIGIN", defaults.allowed_origin),
            http_timeout_ms: env_parse("MART_HTTP_TIMEOUT_MS", defaults.http_timeout_ms),
            http_concurrency: env_parse("MART_HTTP_CONCURRENCY", defaults.http_concurrency),
            expose_docs: env_parse("MART_EXPOSE_DOCS", defaults.expose_docs),
        };
        if cfg.app_token.is_empty() {
            tracing::warn!("MART_APP_TOKEN not set, control service calls will be rejected");
        }
        cfg
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + fmt::Debug,
{
    match env::var(key) {
        Ok(v) => v.parse::<T>().unwrap_or_else(|_| {
            tracing::warn!("Invalid value for {key}='{v}' – falling back to {default:?}");
            default
        }),
        Err(_) => default,
    }
}
