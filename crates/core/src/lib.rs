use axum::error_handling::HandleErrorLayer;
use axum::extract::FromRef;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tower::{limit::ConcurrencyLimitLayer, timeout::TimeoutLayer, BoxError, ServiceBuilder};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod admin_api;
pub mod config;
pub mod control;
mod decision_api;
pub mod error;
pub mod lifecycle;
pub mod observer;
pub mod storage;
pub mod trace;
mod trace_api;
#[cfg(test)]
mod test_support;

pub use config::{AppConfig, Settings, SettingsStore};
pub use control::{ApplicationMetadata, ControlClient, RetrainOutcome, Retrainer};
pub use error::{MartError, Result};
pub use lifecycle::{CachedRound, SelectionCache, ServiceLifecycle, TraceType};
pub use observer::{ObserverMode, StorageObserver, TickOutcome, Watermark};
pub use storage::{AzureBlobStore, BlobStore};
pub use trace::{TraceComponent, TraceLog, TraceMessage};
pub use trace_api::PUSH_EVENT_NAME;

const LATENCY_BUCKETS: [f64; 8] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];
const SERVICE_NAME: &str = "mart-decisiond";
const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(15);

type MetricsCallback = dyn Fn(Method, &'static str, StatusCode, Instant) + Send + Sync;

#[derive(OpenApi)]
#[openapi(
    paths(
        health, ready,
        trace_api::trace_list_handler, trace_api::trace_stream_handler,
        decision_api::choose_handler, decision_api::reward_handler,
        admin_api::settings_handler, admin_api::retrain_handler, admin_api::reset_handler
    ),
    components(
        schemas(
            trace::TraceMessage,
            config::Settings,
            control::RetrainOutcome,
            lifecycle::KeyReward,
            lifecycle::TraceType,
            decision_api::Candidate,
            decision_api::ChooseRequest,
            decision_api::ChooseResponse,
            decision_api::RewardRequest,
            decision_api::RewardResponse,
            decision_api::DecisionErrorResponse,
            admin_api::RetrainResponse,
            admin_api::ResetResponse
        )
    ),
    tags(
        (name = "core", description = "Health and metrics"),
        (name = "trace", description = "Trace log and live updates"),
        (name = "decision", description = "Choices and rewards"),
        (name = "admin", description = "Settings, retraining, reset")
    )
)]
pub struct ApiDoc;

/// Creates a latency histogram with predefined buckets.
fn create_latency_histogram() -> Histogram {
    Histogram::new(LATENCY_BUCKETS)
}

#[derive(Clone)]
pub struct AppState(Arc<AppStateInner>);

struct AppStateInner {
    config: AppConfig,
    settings: SettingsStore,
    trace: TraceLog,
    control: ControlClient,
    lifecycle: ServiceLifecycle,
    selections: SelectionCache,
    watermark: Watermark,
    metrics_recorder: Arc<MetricsCallback>,
    observer_polls: Counter,
    registry: Mutex<Registry>,
    http_client: reqwest::Client,
    ready: AtomicBool,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BuildInfoLabels {
    service: String,
    version: String,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpDurationLabels {
    method: String,
    path: String,
}

impl HttpDurationLabels {
    fn new(method: &Method, path: &'static str) -> Self {
        Self {
            method: method.as_str().to_string(),
            path: path.to_string(),
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    method: String,
    path: String,
    status: String,
}

impl HttpLabels {
    fn new(method: &Method, path: &'static str, status: StatusCode) -> Self {
        Self {
            method: method.as_str().to_string(),
            path: path.to_string(),
            status: status.as_str().to_string(),
        }
    }
}

impl AppState {
    fn new(config: AppConfig) -> Self {
        let mut registry = Registry::default();

        let build_info = Family::<BuildInfoLabels, Gauge>::default();
        build_info
            .get_or_create(&BuildInfoLabels {
                service: SERVICE_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
            .set(1);
        registry.register("build_info", "Build info per service", build_info);

        let http_requests: Family<HttpLabels, Counter<u64>> = Family::default();
        registry.register(
            "http_requests",
            "Total number of HTTP requests received",
            http_requests.clone(),
        );

        let http_latency: Family<HttpDurationLabels, Histogram> =
            Family::new_with_constructor(create_latency_histogram);
        registry.register(
            "http_request_duration_seconds",
            "HTTP request duration",
            http_latency.clone(),
        );

        let metrics_recorder: Arc<MetricsCallback> = Arc::new(move |method, path, status, started| {
            let elapsed = started.elapsed().as_secs_f64();
            http_requests
                .get_or_create(&HttpLabels::new(&method, path, status))
                .inc();
            http_latency
                .get_or_create(&HttpDurationLabels::new(&method, path))
                .observe(elapsed);
        });

        let http_client = reqwest::Client::builder()
            .timeout(OUTBOUND_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("failed to build http client, falling back to default: {}", e);
                reqwest::Client::new()
            });

        let settings = SettingsStore::new(config.settings_path.clone());
        let trace = TraceLog::new(config.trace_capacity);
        registry.register(
            "trace_messages",
            "Messages appended to the trace log",
            trace.appended_counter(),
        );

        let control = ControlClient::new(
            http_client.clone(),
            config.control_url.clone(),
            config.app_token.clone(),
            settings.clone(),
            trace.clone(),
        );
        registry.register(
            "retrain_requests",
            "Retrain requests by outcome",
            control.retrain_requests(),
        );

        let observer_polls = Counter::default();
        registry.register(
            "observer_polls",
            "Storage observer iterations",
            observer_polls.clone(),
        );

        let watermark = Watermark::default();
        let lifecycle = ServiceLifecycle::new(
            config.app_token.clone(),
            settings.clone(),
            trace.clone(),
            control.clone(),
            watermark.clone(),
        );

        Self(Arc::new(AppStateInner {
            config,
            settings,
            trace,
            control,
            lifecycle,
            selections: SelectionCache::default(),
            watermark,
            metrics_recorder,
            observer_polls,
            registry: Mutex::new(registry),
            http_client,
            ready: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &AppConfig {
        &self.0.config
    }

    pub fn settings_store(&self) -> &SettingsStore {
        &self.0.settings
    }

    pub fn trace(&self) -> &TraceLog {
        &self.0.trace
    }

    pub fn control(&self) -> &ControlClient {
        &self.0.control
    }

    pub fn lifecycle(&self) -> &ServiceLifecycle {
        &self.0.lifecycle
    }

    pub fn selection_cache(&self) -> &SelectionCache {
        &self.0.selections
    }

    pub fn watermark(&self) -> Watermark {
        self.0.watermark.clone()
    }

    pub fn observer_polls(&self) -> Counter {
        self.0.observer_polls.clone()
    }

    fn encode_metrics(&self) -> std::result::Result<String, std::fmt::Error> {
        let mut body = String::new();
        let registry = self.0.registry.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(error = "lock poisoned", "metrics registry recovering lock");
            poisoned.into_inner()
        });
        encode(&mut body, &registry)?;
        Ok(body)
    }

    pub fn record_http_observation(
        &self,
        method: Method,
        path: &'static str,
        status: StatusCode,
        started: Instant,
    ) {
        (self.0.metrics_recorder)(method, path, status, started);
    }

    pub fn set_ready(&self) {
        self.0.ready.store(true, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.0.ready.load(Ordering::Acquire)
    }

    pub fn http_client(&self) -> reqwest::Client {
        self.0.http_client.clone()
    }
}

impl FromRef<AppState> for reqwest::Client {
    fn from_ref(state: &AppState) -> Self {
        state.http_client()
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service healthy")),
    tag = "core"
)]
async fn health(State(state): State<AppState>) -> &'static str {
    let started = Instant::now();
    let status = StatusCode::OK;
    state.record_http_observation(Method::GET, "/health", status, started);
    "ok"
}

#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, description = "Service ready"),
        (status = 503, description = "Service starting")
    ),
    tag = "core"
)]
async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let started = Instant::now();
    let (status, body) = if state.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    };
    state.record_http_observation(Method::GET, "/ready", status, started);
    (status, body)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    let encoded_metrics = state.encode_metrics();
    let status = if encoded_metrics.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    state.record_http_observation(Method::GET, "/metrics", status, started);

    match encoded_metrics {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            "Internal server error".to_string(),
        )
            .into_response(),
    }
}

pub fn build_app(config: AppConfig, allowed_origin: HeaderValue) -> Router {
    build_app_with_state(config, allowed_origin).0
}

/// Builds the router and its shared state. The engine is not started here;
/// call [`ServiceLifecycle::create`] once a runtime is available.
pub fn build_app_with_state(config: AppConfig, allowed_origin: HeaderValue) -> (Router, AppState) {
    let timeout_ms = config.http_timeout_ms;
    let concurrency = config.http_concurrency;
    let expose_docs = config.expose_docs;
    let state = AppState::new(config);
    let allowed_origin = Arc::new(allowed_origin);

    let mut app = Router::new()
        .merge(core_routes())
        .merge(decision_routes())
        .merge(admin_routes());

    if expose_docs {
        // Swagger UI under /docs, OpenAPI document under /api-docs/openapi.json
        let swagger = SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi());
        app = app.merge(swagger);
    }

    let timeout_layer = if timeout_ms > 0 {
        Some(TimeoutLayer::new(Duration::from_millis(timeout_ms)))
    } else {
        tracing::info!("MART_HTTP_TIMEOUT_MS=0 → request timeout disabled");
        None
    };
    let concurrency_layer = if concurrency > 0 {
        let c = std::cmp::min(concurrency, usize::MAX as u64) as usize;
        Some(ConcurrencyLimitLayer::new(c))
    } else {
        tracing::info!("MART_HTTP_CONCURRENCY=0 → concurrency limit disabled");
        None
    };

    let request_guards = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(|err: BoxError| async move {
            if err.is::<tower::timeout::error::Elapsed>() {
                (StatusCode::REQUEST_TIMEOUT, "request timed out")
            } else {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "service temporarily unavailable",
                )
            }
        }))
        .option_layer(timeout_layer)
        .option_layer(concurrency_layer)
        // `option_layer`'s `Either` service needs both branches to share an
        // error type, so the router's infallible error becomes a BoxError.
        .layer(tower::util::MapErrLayer::new(
            |e: std::convert::Infallible| -> BoxError { match e {} },
        ));

    // The live trace stream stays open indefinitely and must not hit the timeout.
    let app = app
        .with_state(state.clone())
        .layer(request_guards)
        .merge(stream_routes().with_state(state.clone()))
        .layer(from_fn_with_state(allowed_origin, cors_middleware));

    (app, state)
}

fn core_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/trace", get(trace_api::trace_list_handler))
}

fn stream_routes() -> Router<AppState> {
    Router::new().route("/trace/stream", get(trace_api::trace_stream_handler))
}

fn decision_routes() -> Router<AppState> {
    Router::new()
        .route("/decision/choose", post(decision_api::choose_handler))
        .route("/decision/reward", post(decision_api::reward_handler))
}

fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/settings", get(admin_api::settings_handler))
        .route("/admin/retrain", post(admin_api::retrain_handler))
        .route("/admin/reset", post(admin_api::reset_handler))
}

type CorsState = Arc<HeaderValue>;

async fn cors_middleware(
    State(allowed_origin): State<CorsState>,
    req: Request<Body>,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let origin = req.headers().get(header::ORIGIN).cloned();
    let origin_allowed = origin.as_ref() == Some(allowed_origin.as_ref());

    if req.method() == Method::OPTIONS {
        if !origin_allowed {
            return Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(Body::empty())
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR);
        }

        return Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                allowed_origin.as_ref().clone(),
            )
            .header(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                "GET, HEAD, POST, OPTIONS",
            )
            .header(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type, Authorization"),
            )
            .header(
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from_static("600"),
            )
            .header(header::VARY, HeaderValue::from_static("Origin"))
            .body(Body::empty())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR);
    }

    let mut response = next.run(req).await;
    if origin_allowed {
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            allowed_origin.as_ref().clone(),
        );
        response
            .headers_mut()
            .append(header::VARY, HeaderValue::from_static("Origin"));
    }

    Ok(response)
}
