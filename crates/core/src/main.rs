use anyhow::Context;
use axum::http::HeaderValue;
use mart_core::{build_app_with_state, observer, AppConfig, StorageObserver};
use std::{future::IntoFuture, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "mart-decisiond.log";
/// Open trace streams never finish on their own; they get this long after a signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Console logging, plus a daily rolling file when `MART_LOG_DIR` is set.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match std::env::var("MART_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        _ => {
            registry.init();
            None
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = AppConfig::from_env();
    let allowed_origin = HeaderValue::from_str(&config.allowed_origin)
        .with_context(|| format!("invalid MART_ALLOWED_ORIGIN '{}'", config.allowed_origin))?;
    let (app, state) = build_app_with_state(config.clone(), allowed_origin);

    state
        .lifecycle()
        .create(config.action_count, &config.model_output_dir, config.fixed_action)
        .await;

    let cancel = CancellationToken::new();
    let mode = observer::connect(state.control()).await;
    let storage_observer = StorageObserver::new(
        mode,
        state.control().clone(),
        state.settings_store().clone(),
        state.watermark(),
        state.trace().clone(),
        config.action_count,
    )
    .with_poll_counter(state.observer_polls());
    let observer_task = tokio::spawn(storage_observer.run(cancel.child_token()));

    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    tracing::info!("listening on http://{}", config.addr);
    state.set_ready();

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .into_future();
    tokio::select! {
        res = server => res.context("server error")?,
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => tracing::warn!("connections still open after grace period, closing"),
    }

    cancel.cancel();
    if let Err(err) = observer_task.await {
        tracing::error!(error = %err, "storage observer task failed");
    }
    state.lifecycle().shutdown().await;
    Ok(())
}
