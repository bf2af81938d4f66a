//! Lock management handlers.

use axum::extract::{Path, Query, State};
use axum::Json;

use labrig_core::{MachineRecord, MachineUpdate};

use crate::error::ApiError;
use crate::schema::locks::{
    ListLocksQuery, ListLocksResponse, LockManyRequest, LockManyResponse, SetLockRequest,
};
use crate::state::AppState;

/// `POST /lock`
pub async fn lock_many(
    State(state): State<AppState>,
    Json(req): Json<LockManyRequest>,
) -> Result<Json<LockManyResponse>, ApiError> {
    let response = state.service.lock_many(req)?;
    Ok(Json(response))
}

/// `GET /lock`
pub async fn list_locks(
    State(state): State<AppState>,
    Query(query): Query<ListLocksQuery>,
) -> Result<Json<ListLocksResponse>, ApiError> {
    let machines = state.service.list(query)?;
    Ok(Json(ListLocksResponse { machines }))
}

/// `GET /lock/{name}`
pub async fn get_lock(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<MachineRecord>, ApiError> {
    let record = state.service.get(&name)?;
    Ok(Json(record))
}

/// `POST /lock/{name}`
pub async fn set_lock(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SetLockRequest>,
) -> Result<Json<MachineRecord>, ApiError> {
    let record = state.service.set_lock(&name, req)?;
    Ok(Json(record))
}

/// `PUT /lock/{name}`
pub async fn update_lock(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<MachineUpdate>,
) -> Result<Json<MachineRecord>, ApiError> {
    let record = state.service.update(&name, update)?;
    Ok(Json(record))
}
