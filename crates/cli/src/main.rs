use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mart_core::{config::DEFAULT_CONTROL_URL, ControlClient, RetrainOutcome, Settings, SettingsStore, TraceLog};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mart", version, about = "Decision service operator CLI")]
struct Cli {
    /// More log output
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Path of the runtime settings file
    #[arg(long, global = true, env = "MART_SETTINGS", default_value = "./settings.json")]
    settings: PathBuf,

    /// Base URL of the control service
    #[arg(long, global = true, env = "MART_CONTROL_URL", default_value = DEFAULT_CONTROL_URL)]
    control_url: String,

    /// Application token sent to the control service
    #[arg(long, global = true, env = "MART_APP_TOKEN", default_value = "", hide_env_values = true)]
    token: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect or edit the runtime settings file
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    /// Ask the control service for a model retrain (honours AutoRetrainModel)
    Retrain {
        /// Number of actions the model chooses from
        #[arg(long, env = "MART_ACTION_COUNT", default_value_t = 4)]
        actions: u32,
    },
    /// Reset the application state held by the control service
    Reset,
    /// Print the application metadata
    Metadata,
}

#[derive(Subcommand, Debug)]
enum SettingsCmd {
    /// Print the effective settings (defaults when the file is missing or broken)
    Show,
    /// Write the defaults if no settings file exists yet
    Init,
    /// Change individual values
    Set(SettingsPatch),
}

#[derive(Args, Debug, Default)]
struct SettingsPatch {
    #[arg(long)]
    poll_interval_ms: Option<i64>,
    #[arg(long)]
    retrain_fallback_interval_ms: Option<i64>,
    #[arg(long)]
    auto_retrain: Option<bool>,
    #[arg(long)]
    use_afx: Option<bool>,
    #[arg(long)]
    epsilon: Option<f32>,
}

impl SettingsPatch {
    fn apply(self, mut settings: Settings) -> Settings {
        if let Some(v) = self.poll_interval_ms {
            settings.poll_interval_ms = v;
        }
        if let Some(v) = self.retrain_fallback_interval_ms {
            settings.retrain_fallback_interval_ms = v;
        }
        if let Some(v) = self.auto_retrain {
            settings.auto_retrain = v;
        }
        if let Some(v) = self.use_afx {
            settings.use_afx = v;
        }
        if let Some(v) = self.epsilon {
            settings.epsilon = v;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let store = SettingsStore::new(&cli.settings);

    match cli.command {
        Commands::Settings { cmd } => match cmd {
            SettingsCmd::Show => print_json(&store.load())?,
            SettingsCmd::Init => {
                if store.ensure_exists()? {
                    println!("wrote defaults to {}", store.path().display());
                } else {
                    println!("{} already exists", store.path().display());
                }
            }
            SettingsCmd::Set(patch) => {
                let updated = patch.apply(store.load());
                store.save(&updated)?;
                print_json(&updated)?;
            }
        },
        Commands::Retrain { actions } => {
            let outcome = control_client(&cli.control_url, &cli.token, store)?
                .request_retrain(actions)
                .await;
            println!("{}", outcome.as_str());
            if outcome == RetrainOutcome::Failed {
                anyhow::bail!("retrain request failed");
            }
        }
        Commands::Reset => {
            if !control_client(&cli.control_url, &cli.token, store)?
                .reset_remote()
                .await
            {
                anyhow::bail!("reset request failed");
            }
            println!("reset");
        }
        Commands::Metadata => {
            let metadata = control_client(&cli.control_url, &cli.token, store)?
                .fetch_metadata()
                .await
                .context("fetching application metadata")?;
            print_json(&metadata)?;
        }
    }

    Ok(())
}

fn control_client(base_url: &str, token: &str, store: SettingsStore) -> anyhow::Result<ControlClient> {
    if token.is_empty() {
        tracing::warn!("no application token given, the control service will reject the call");
    }
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()
        .context("building http client")?;
    Ok(ControlClient::new(http, base_url, token, store, TraceLog::default()))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
