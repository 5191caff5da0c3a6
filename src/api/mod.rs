//! HTTP create/check endpoint: `POST /workflows` with `{ "requestId": ... }`
//! runs one submit-or-check round and answers with either the workflow
//! output or a status snapshot.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::client::{Client, SubmitOptions, SubmitOutcome};

/// Shared state for the endpoint: the client, the orchestration to start for
/// fresh request ids, and the wait-protocol tuning.
#[derive(Clone)]
pub struct ApiState {
    client: Client,
    orchestration: String,
    options: SubmitOptions,
}

impl ApiState {
    pub fn new(client: Client, orchestration: impl Into<String>, options: SubmitOptions) -> Self {
        Self {
            client,
            orchestration: orchestration.into(),
            options,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
}

async fn create_workflow(State(state): State<ApiState>, Json(req): Json<CreateWorkflowRequest>) -> Response {
    let request_id = match req.request_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "requestId is required" }))).into_response();
        }
    };

    // Fresh instances are seeded with the request id; activities receive and
    // carry it back alongside their result.
    let input = json!({ "id": request_id }).to_string();
    match state
        .client
        .submit_or_check(&request_id, &state.orchestration, input, &state.options)
        .await
    {
        Ok(SubmitOutcome::Completed(output)) => match serde_json::from_str::<serde_json::Value>(&output) {
            Ok(value) => Json(value).into_response(),
            Err(_) => Json(serde_json::Value::String(output)).into_response(),
        },
        Ok(SubmitOutcome::Pending(snapshot)) => Json(snapshot).into_response(),
        Err(e) => {
            error!(instance = %request_id, error = %e, "submit_or_check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// Build the endpoint router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/workflows", post(create_workflow))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
