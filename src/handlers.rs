use crate::island::{IslandCommand, IslandError, IslandReply, IslandWorker};
use axum::{extract::Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorResponse {
    pub error: String,
}

pub type SharedWorker = Arc<Mutex<IslandWorker>>;

fn status_for(error: &IslandError) -> StatusCode {
    match error {
        IslandError::NotConfigured => StatusCode::CONFLICT,
        IslandError::Evolution(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, error: impl ToString) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

pub async fn handle_command(
    State(worker): State<SharedWorker>,
    Json(command): Json<IslandCommand>,
) -> Result<Json<IslandReply>, (StatusCode, Json<ErrorResponse>)> {
    let name = command.name();
    let result = tokio::task::spawn_blocking(move || {
        let mut worker = worker
            .lock()
            .map_err(|_| IslandError::Transport("island worker poisoned".into()))?;
        worker.handle(command)
    })
    .await
    .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    match result {
        Ok(reply) => Ok(Json(reply)),
        Err(e) => {
            warn!("{} failed: {}", name, e);
            Err(error_response(status_for(&e), e))
        }
    }
}

pub async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
