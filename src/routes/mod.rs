use axum::Router;

use crate::state::SharedState;

pub mod docs;
/// Liveness endpoint.
pub mod health;
/// Session REST endpoints.
pub mod session;
/// Session event streams.
pub mod sse;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    let api_router = health::router()
        .merge(sse::router())
        .merge(session::router());

    api_router.merge(docs::router()).with_state(state)
}
