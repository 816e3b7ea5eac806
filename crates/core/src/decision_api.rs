use std::time::Instant;

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use mart_policy::MartContext;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::lifecycle::{KeyReward, TraceType};
use crate::AppState;
// Used by utoipa's #[schema(example = json!(...))] attribute macros
#[allow(unused_imports)]
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Candidate {
    pub image_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "session_id": "b7f1c2",
    "context": "category=shoes",
    "candidates": [{"image_url": "/img/1.png"}, {"image_url": "/img/2.png"}]
}))]
pub struct ChooseRequest {
    pub session_id: String,
    /// Free-form features forwarded to the decision engine.
    #[serde(default)]
    pub context: String,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChooseResponse {
    pub index: usize,
    pub action: u32,
    pub probability: f32,
    pub join_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RewardRequest {
    pub session_id: String,
    /// Index of the join key whose product was picked; absent when nothing was picked.
    #[serde(default)]
    pub chosen_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RewardResponse {
    pub reported: bool,
    pub rewards: Vec<KeyReward>,
    pub trace_type: Option<TraceType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DecisionErrorResponse {
    pub error: String,
}

#[utoipa::path(
    post,
    path = "/decision/choose",
    request_body = ChooseRequest,
    responses(
        (status = 200, description = "Candidate chosen", body = ChooseResponse),
        (status = 400, description = "No candidates", body = DecisionErrorResponse),
        (status = 503, description = "Decision engine not running", body = DecisionErrorResponse)
    ),
    tag = "decision"
)]
pub async fn choose_handler(
    State(state): State<AppState>,
    Json(request): Json<ChooseRequest>,
) -> Response {
    let started = Instant::now();
    let ChooseRequest {
        session_id,
        context,
        candidates,
    } = request;

    let (status, response) = if candidates.is_empty() {
        let body = DecisionErrorResponse {
            error: "no candidates".into(),
        };
        (StatusCode::BAD_REQUEST, Json(body).into_response())
    } else {
        let urls: Vec<String> = candidates.into_iter().map(|c| c.image_url).collect();
        match state
            .lifecycle()
            .choose(
                state.selection_cache(),
                &session_id,
                &MartContext::new(context),
                &urls,
            )
            .await
        {
            Ok(outcome) => {
                let body = ChooseResponse {
                    index: outcome.index,
                    action: outcome.action,
                    probability: outcome.probability,
                    join_key: outcome.join_key,
                };
                (StatusCode::OK, Json(body).into_response())
            }
            Err(err) => {
                tracing::warn!(session = %session_id, error = %err, "choose failed");
                let body = DecisionErrorResponse {
                    error: err.to_string(),
                };
                (StatusCode::SERVICE_UNAVAILABLE, Json(body).into_response())
            }
        }
    };

    state.record_http_observation(Method::POST, "/decision/choose", status, started);
    (status, response).into_response()
}

#[utoipa::path(
    post,
    path = "/decision/reward",
    request_body = RewardRequest,
    responses((status = 200, description = "Rewards reported for the session", body = RewardResponse)),
    tag = "decision"
)]
pub async fn reward_handler(
    State(state): State<AppState>,
    Json(request): Json<RewardRequest>,
) -> Json<RewardResponse> {
    let started = Instant::now();
    let report = state
        .lifecycle()
        .report_reward_for_cached_selections(
            state.selection_cache(),
            &request.session_id,
            request.chosen_index,
        )
        .await;

    let response = match report {
        Some(report) => RewardResponse {
            reported: true,
            rewards: report.rewards,
            trace_type: Some(report.trace_type),
        },
        None => RewardResponse {
            reported: false,
            rewards: Vec::new(),
            trace_type: state.selection_cache().trace_type(&request.session_id),
        },
    };
    state.record_http_observation(Method::POST, "/decision/reward", StatusCode::OK, started);
    Json(response)
}
