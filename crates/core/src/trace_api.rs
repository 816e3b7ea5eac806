use std::{convert::Infallible, time::Instant};

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    Stream, StreamExt,
};

use crate::trace::TraceMessage;
use crate::AppState;

/// SSE event name the trace page listens for.
pub const PUSH_EVENT_NAME: &str = "addNewMessageToPage";

#[utoipa::path(
    get,
    path = "/trace",
    responses((status = 200, description = "Current trace messages, oldest first", body = [TraceMessage])),
    tag = "trace"
)]
pub async fn trace_list_handler(State(state): State<AppState>) -> Json<Vec<TraceMessage>> {
    let started = Instant::now();
    let messages = state.trace().snapshot();
    state.record_http_observation(Method::GET, "/trace", StatusCode::OK, started);
    Json(messages)
}

/// Streams every trace append as it happens. History is served by `/trace`.
#[utoipa::path(
    get,
    path = "/trace/stream",
    responses((status = 200, description = "Server-sent trace events", content_type = "text/event-stream")),
    tag = "trace"
)]
pub async fn trace_stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let started = Instant::now();
    let receiver = state.trace().subscribe();
    state.record_http_observation(Method::GET, "/trace/stream", StatusCode::OK, started);

    let stream = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(message) => match Event::default().event(PUSH_EVENT_NAME).json_data(&message) {
            Ok(event) => Some(Ok(event)),
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode trace event");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "trace subscriber lagged, messages skipped");
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
