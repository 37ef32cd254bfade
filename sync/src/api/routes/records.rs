//! Store and payment routes.
//!
//! Every mutation answers as soon as the operation is queued. `202 Accepted`
//! reflects that the remote has not seen it yet.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch, post, put},
    Json, Router,
};
use serde::Deserialize;
use tally_engine::{MergedView, PaymentDraft, PaymentRecord, StoreDraft, StoreRecord};

use super::record_id;
use crate::api::{AppError, AppState, Result};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/view", get(view_handler))
        .route("/stores", post(create_store))
        .route("/stores/{id}", patch(update_store).delete(delete_store))
        .route("/payments", post(record_payment))
        .route("/payments/{id}", put(edit_payment).delete(delete_payment))
}

/// Fields a store edit may change.
#[derive(Debug, Deserialize)]
struct StoreUpdate {
    name: Option<String>,
    location: Option<String>,
}

/// GET /view - the reconciled stores and payments.
async fn view_handler(State(state): State<AppState>) -> Result<Json<MergedView>> {
    Ok(Json(state.tally.view()?))
}

/// POST /stores
async fn create_store(
    State(state): State<AppState>,
    Json(draft): Json<StoreDraft>,
) -> Result<(StatusCode, Json<StoreRecord>)> {
    let record = state.tally.create_store(draft)?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

/// PATCH /stores/{id}
async fn update_store(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<StoreUpdate>,
) -> Result<StatusCode> {
    let id = record_id(&id)?;
    if update.name.is_none() && update.location.is_none() {
        return Err(AppError::BadRequest("nothing to update".to_string()));
    }

    if let Some(name) = &update.name {
        state.tally.rename_store(&id, name)?;
    }
    if let Some(location) = &update.location {
        state.tally.relocate_store(&id, location)?;
    }
    Ok(StatusCode::ACCEPTED)
}

/// DELETE /stores/{id}
async fn delete_store(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.tally.delete_store(&record_id(&id)?)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /payments
async fn record_payment(
    State(state): State<AppState>,
    Json(draft): Json<PaymentDraft>,
) -> Result<(StatusCode, Json<PaymentRecord>)> {
    let record = state.tally.record_payment(draft)?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

/// PUT /payments/{id}
async fn edit_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(draft): Json<PaymentDraft>,
) -> Result<(StatusCode, Json<PaymentRecord>)> {
    let record = state.tally.edit_payment(&record_id(&id)?, draft)?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

/// DELETE /payments/{id}
async fn delete_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.tally.delete_payment(&record_id(&id)?)?;
    Ok(StatusCode::ACCEPTED)
}
