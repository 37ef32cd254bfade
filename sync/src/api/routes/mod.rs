//! HTTP route definitions.

mod events;
mod records;
mod session;

use super::AppState;
use axum::Router;
use tally_engine::RecordId;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(session::routes())
        .merge(records::routes())
        .merge(events::routes())
}

fn record_id(raw: &str) -> super::Result<RecordId> {
    Ok(RecordId::parse(raw)?)
}
