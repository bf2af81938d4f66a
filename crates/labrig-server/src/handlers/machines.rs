//! Machine registration handler.

use axum::extract::State;
use axum::Json;

use crate::error::ApiError;
use crate::schema::machines::{AddMachineRequest, AddMachineResponse};
use crate::state::AppState;

/// `POST /add`
pub async fn add_machine(
    State(state): State<AppState>,
    Json(req): Json<AddMachineRequest>,
) -> Result<Json<AddMachineResponse>, ApiError> {
    let registration = state.service.register(req)?;
    Ok(Json(AddMachineResponse {
        outcome: registration.outcome,
        machine: registration.record,
    }))
}
