//! In-process stand-in for the remote control service.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    extract::State,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub path: String,
    pub params: HashMap<String, String>,
}

#[derive(Clone)]
struct MockState {
    status: StatusCode,
    metadata: Option<serde_json::Value>,
    delay: Duration,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

pub struct MockControl {
    pub base_url: String,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockControl {
    /// Answers every form post with `status`; metadata requests get `metadata` or 404.
    pub async fn start(status: StatusCode, metadata: Option<serde_json::Value>) -> Self {
        Self::start_with_delay(status, metadata, Duration::ZERO).await
    }

    /// Like [`MockControl::start`], but every answer waits `delay` first.
    pub async fn start_with_delay(
        status: StatusCode,
        metadata: Option<serde_json::Value>,
        delay: Duration,
    ) -> Self {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            status,
            metadata,
            delay,
            calls: calls.clone(),
        };
        let app = Router::new().fallback(record).with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            calls,
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls().iter().filter(|c| c.path == path).count()
    }
}

async fn record(State(state): State<MockState>, method: Method, uri: Uri, body: String) -> Response {
    let mut params: HashMap<String, String> = HashMap::new();
    if let Some(query) = uri.query() {
        params.extend(url::form_urlencoded::parse(query.as_bytes()).into_owned());
    }
    params.extend(url::form_urlencoded::parse(body.as_bytes()).into_owned());

    state.calls.lock().unwrap().push(RecordedCall {
        method: method.to_string(),
        path: uri.path().to_string(),
        params,
    });

    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }

    if uri.path().ends_with("/GetMetadata") {
        return match state.metadata {
            Some(metadata) => Json(metadata).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }
    state.status.into_response()
}
