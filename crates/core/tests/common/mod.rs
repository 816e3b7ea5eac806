#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use axum::{
    extract::State,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use tokio::net::TcpListener;

pub type Calls = Arc<Mutex<Vec<(String, String, HashMap<String, String>)>>>;

fn params(uri: &Uri, body: &str) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();
    if let Some(query) = uri.query() {
        out.extend(url::form_urlencoded::parse(query.as_bytes()).into_owned());
    }
    out.extend(url::form_urlencoded::parse(body.as_bytes()).into_owned());
    out
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[derive(Clone)]
struct ControlState {
    connection_string: String,
    calls: Calls,
}

/// Control service that hands out `connection_string` and accepts every post.
pub async fn start_control(connection_string: String) -> (String, Calls) {
    let calls: Calls = Arc::default();
    let state = ControlState {
        connection_string,
        calls: calls.clone(),
    };
    let app = Router::new()
        .fallback(
            |State(state): State<ControlState>, method: Method, uri: Uri, body: String| async move {
                state
                    .calls
                    .lock()
                    .unwrap()
                    .push((method.to_string(), uri.path().to_string(), params(&uri, &body)));
                if uri.path() == "/Application/GetMetadata" {
                    Json(serde_json::json!({
                        "ApplicationID": "app",
                        "ConnectionString": state.connection_string,
                        "ModelId": null,
                        "ExperimentalUnitDuration": 10
                    }))
                    .into_response()
                } else {
                    StatusCode::OK.into_response()
                }
            },
        )
        .with_state(state);
    (serve(app).await, calls)
}

#[derive(Clone, Default)]
pub struct StorageListing {
    /// Container name and RFC 1123 modification time.
    pub containers: Arc<Mutex<Vec<(String, String)>>>,
    /// Container name to (blob name, modification time, blob type).
    pub blobs: Arc<Mutex<HashMap<String, Vec<(String, String, String)>>>>,
}

impl StorageListing {
    pub fn container(&self, name: &str, modified: &str) {
        self.containers
            .lock()
            .unwrap()
            .push((name.into(), modified.into()));
    }

    pub fn blob(&self, container: &str, name: &str, modified: &str, kind: &str) {
        self.blobs
            .lock()
            .unwrap()
            .entry(container.into())
            .or_default()
            .push((name.into(), modified.into(), kind.into()));
    }
}

async fn storage_handler(State(listing): State<StorageListing>, uri: Uri) -> Response {
    let query = params(&uri, "");
    if query.get("sig").map(String::as_str) != Some("test") {
        return StatusCode::FORBIDDEN.into_response();
    }

    let body = if query.get("restype").map(String::as_str) == Some("container") {
        let container = uri.path().trim_start_matches('/');
        let blobs = listing.blobs.lock().unwrap();
        let items: String = blobs
            .get(container)
            .into_iter()
            .flatten()
            .map(|(name, modified, kind)| {
                format!(
                    "<Blob><Name>{name}</Name><Properties><Last-Modified>{modified}</Last-Modified><BlobType>{kind}</BlobType></Properties></Blob>"
                )
            })
            .collect();
        format!("<?xml version=\"1.0\"?><EnumerationResults><Blobs>{items}</Blobs><NextMarker /></EnumerationResults>")
    } else {
        let prefix = query.get("prefix").cloned().unwrap_or_default();
        let containers = listing.containers.lock().unwrap();
        let items: String = containers
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, modified)| {
                format!(
                    "<Container><Name>{name}</Name><Properties><Last-Modified>{modified}</Last-Modified></Properties></Container>"
                )
            })
            .collect();
        format!("<?xml version=\"1.0\"?><EnumerationResults><Containers>{items}</Containers><NextMarker /></EnumerationResults>")
    };
    ([(axum::http::header::CONTENT_TYPE, "application/xml")], body).into_response()
}

/// Blob listing endpoint accepting the SAS `sig=test`.
pub async fn start_storage(listing: StorageListing) -> String {
    let app = Router::new().fallback(storage_handler).with_state(listing);
    serve(app).await
}
