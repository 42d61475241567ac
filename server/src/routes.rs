use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::status;
use crate::ws;

/// Build the axum Router: the meeting socket plus the status endpoint.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/ws/meeting/{meeting_id}/{token}/{first_message}",
            get(ws::handler::ws_upgrade),
        )
        .route("/__meetingstatus", get(status::meeting_status))
        .with_state(state)
}
