use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::correlator::CommandError;
use crate::registry::{AgentHandle, SessionState};
use crate::session::GatewayState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    agents_online: usize,
    pending_commands: usize,
}

/// GET /health
pub async fn health_check(State(state): State<GatewayState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        agents_online: state.registry.len(),
        pending_commands: state.correlator.pending_total(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusEntry {
    pub agent_id: String,
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub pending_commands: usize,
}

async fn status_entry(state: &GatewayState, handle: &AgentHandle) -> AgentStatusEntry {
    let age = handle.heartbeat_age().await;
    let last_heartbeat_at = Utc::now()
        - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
    AgentStatusEntry {
        agent_id: handle.agent_id.clone(),
        state: handle.state(),
        connected_at: handle.connected_at,
        last_heartbeat_at,
        pending_commands: state.correlator.pending_for(&handle.agent_id),
    }
}

/// GET /agents - which nodes are online right now.
pub async fn list_agents(State(state): State<GatewayState>) -> Json<Vec<AgentStatusEntry>> {
    let mut entries = Vec::new();
    for handle in state.registry.list_active() {
        entries.push(status_entry(&state, &handle).await);
    }
    entries.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    Json(entries)
}

/// GET /agents/:id
pub async fn get_agent(
    State(state): State<GatewayState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentStatusEntry>, StatusCode> {
    match state.registry.lookup(&agent_id) {
        Some(handle) => Ok(Json(status_entry(&state, &handle).await)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Debug, Serialize)]
pub struct CommandSuccess {
    success: bool,
    data: Value,
}

#[derive(Debug, Serialize)]
pub struct CommandFailure {
    success: bool,
    error: CommandFailureBody,
}

#[derive(Debug, Serialize)]
pub struct CommandFailureBody {
    code: String,
    message: String,
}

pub struct CommandResponse(Result<Value, CommandError>);

impl IntoResponse for CommandResponse {
    fn into_response(self) -> Response {
        match self.0 {
            Ok(data) => Json(CommandSuccess {
                success: true,
                data,
            })
            .into_response(),
            Err(err) => {
                let status = command_error_status(&err);
                let body = CommandFailure {
                    success: false,
                    error: CommandFailureBody {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    },
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

/// Map command outcomes onto HTTP statuses: "the agent is gone" is 503,
/// "the agent did not answer in time" is 504, remote rejections map by code.
fn command_error_status(err: &CommandError) -> StatusCode {
    match err {
        CommandError::UnknownServer(_) => StatusCode::NOT_FOUND,
        CommandError::AgentOffline(_) | CommandError::Disconnected(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CommandError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CommandError::Remote { code, .. } => match code.as_str() {
            "CONTAINER_NOT_FOUND" => StatusCode::NOT_FOUND,
            "PERMISSION_DENIED" => StatusCode::FORBIDDEN,
            "AUTH_FAILED" => StatusCode::UNAUTHORIZED,
            "UNKNOWN_ACTION" => StatusCode::BAD_REQUEST,
            "CONFIG_INVALID" => StatusCode::UNPROCESSABLE_ENTITY,
            "PORT_CONFLICT" => StatusCode::CONFLICT,
            _ => StatusCode::BAD_GATEWAY,
        },
    }
}

/// POST /servers/:id/start
pub async fn start_server(
    State(state): State<GatewayState>,
    Path(server_id): Path<String>,
) -> CommandResponse {
    debug!(server = %server_id, "start requested");
    CommandResponse(state.facade.start_server(&server_id).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopServerRequest {
    #[serde(default = "default_signal")]
    pub signal: String,
    #[serde(default = "default_stop_timeout")]
    pub timeout_seconds: u64,
}

fn default_signal() -> String {
    "SIGTERM".to_string()
}

fn default_stop_timeout() -> u64 {
    30
}

impl Default for StopServerRequest {
    fn default() -> Self {
        Self {
            signal: default_signal(),
            timeout_seconds: default_stop_timeout(),
        }
    }
}

/// POST /servers/:id/stop
pub async fn stop_server(
    State(state): State<GatewayState>,
    Path(server_id): Path<String>,
    payload: Option<Json<StopServerRequest>>,
) -> CommandResponse {
    let Json(request) = payload.unwrap_or_default();
    debug!(server = %server_id, signal = %request.signal, "stop requested");
    CommandResponse(
        state
            .facade
            .stop_server(&server_id, &request.signal, request.timeout_seconds)
            .await,
    )
}

/// POST /servers/:id/restart
pub async fn restart_server(
    State(state): State<GatewayState>,
    Path(server_id): Path<String>,
) -> CommandResponse {
    debug!(server = %server_id, "restart requested");
    CommandResponse(state.facade.restart_server(&server_id).await)
}

/// GET /servers/:id/status
pub async fn server_status(
    State(state): State<GatewayState>,
    Path(server_id): Path<String>,
) -> CommandResponse {
    CommandResponse(state.facade.get_status(&server_id).await)
}

#[derive(Debug, Deserialize)]
pub struct ConsoleRequest {
    pub command: String,
}

/// POST /servers/:id/console
pub async fn send_console_command(
    State(state): State<GatewayState>,
    Path(server_id): Path<String>,
    Json(request): Json<ConsoleRequest>,
) -> CommandResponse {
    CommandResponse(state.facade.send_command(&server_id, &request.command).await)
}

#[derive(Debug, Deserialize)]
pub struct ReadFileQuery {
    pub path: String,
}

/// GET /servers/:id/files?path=...
pub async fn read_file(
    State(state): State<GatewayState>,
    Path(server_id): Path<String>,
    Query(query): Query<ReadFileQuery>,
) -> CommandResponse {
    CommandResponse(state.facade.read_file(&server_id, &query.path).await)
}

#[derive(Debug, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
}

/// PUT /servers/:id/files
pub async fn write_file(
    State(state): State<GatewayState>,
    Path(server_id): Path<String>,
    Json(request): Json<WriteFileRequest>,
) -> CommandResponse {
    CommandResponse(
        state
            .facade
            .write_file(&server_id, &request.path, &request.content)
            .await,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn error_statuses_distinguish_gone_from_slow_from_rejected() {
        assert_eq!(
            command_error_status(&CommandError::AgentOffline("node-1".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            command_error_status(&CommandError::Disconnected("heartbeat timeout".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            command_error_status(&CommandError::Timeout(Duration::from_secs(30))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            command_error_status(&CommandError::UnknownServer("srv-9".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn remote_codes_map_to_http_statuses() {
        let err = |code: &str| CommandError::Remote {
            code: code.to_string(),
            message: "detail".to_string(),
        };
        assert_eq!(command_error_status(&err("CONTAINER_NOT_FOUND")), StatusCode::NOT_FOUND);
        assert_eq!(command_error_status(&err("PERMISSION_DENIED")), StatusCode::FORBIDDEN);
        assert_eq!(command_error_status(&err("PORT_CONFLICT")), StatusCode::CONFLICT);
        assert_eq!(command_error_status(&err("DOCKER_ERROR")), StatusCode::BAD_GATEWAY);
    }
}
