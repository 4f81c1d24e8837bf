//! HTTP surface served to the central provisioning service.
//!
//! Four routes: agent status, command list, command-by-id, and command
//! execution. Every error leaves as the structured JSON error body with its
//! taxonomy status code.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use ingot_proto::{AgentStatus, CommandResult, RestError};

use crate::agent::Agent;

pub fn router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/v1/status", get(get_status))
        .route("/v1/commands", get(list_commands).post(post_command))
        .route("/v1/commands/:id", get(get_command))
        .with_state(agent)
}

/// Wrapper so taxonomy errors can be axum responses.
struct ErrorResponse(RestError);

impl From<RestError> for ErrorResponse {
    fn from(err: RestError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let body = self.0.to_body();
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    name: String,
    #[serde(default = "empty_params")]
    params: Value,
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

async fn get_status(State(agent): State<Arc<Agent>>) -> Json<AgentStatus> {
    Json(agent.get_status())
}

async fn list_commands(State(agent): State<Arc<Agent>>) -> Json<Value> {
    Json(json!({ "commands": agent.list_command_results() }))
}

async fn get_command(
    State(agent): State<Arc<Agent>>,
    Path(id): Path<String>,
) -> Result<Json<CommandResult>, ErrorResponse> {
    let parsed =
        Uuid::parse_str(&id).map_err(|_| RestError::not_found("Command Result", &id))?;
    Ok(Json(agent.get_command_result(parsed)?))
}

async fn post_command(
    State(agent): State<Arc<Agent>>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<CommandResult>, ErrorResponse> {
    let Json(request) = payload.map_err(|rejection| RestError::InvalidContent {
        details: rejection.body_text(),
    })?;
    let record = agent.execute_command(&request.name, request.params).await?;
    Ok(Json(record))
}
