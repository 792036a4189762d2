use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::session::{
        CastVoteRequest, JoinSessionRequest, LeaveSessionRequest, SessionSnapshot, VoteAck,
    },
    error::AppError,
    services::session_service::{self, VoteOutcome},
    state::SharedState,
};

/// Routes of the participant-facing session API.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/sessions/join", post(join_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/votes", post(cast_vote))
        .route("/sessions/{id}/restart", post(restart_session))
        .route("/sessions/{id}/leave", post(leave_session))
        .route("/sessions/{id}/complete", post(complete_session))
}

/// Join the active session of a region, creating it when none exists.
#[utoipa::path(
    post,
    path = "/sessions/join",
    tag = "sessions",
    request_body = JoinSessionRequest,
    responses(
        (status = 200, description = "Joined session snapshot", body = SessionSnapshot),
        (status = 400, description = "Unknown region or invalid user id"),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn join_session(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<JoinSessionRequest>>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let snapshot = session_service::join_session(&state, payload).await?;
    Ok(Json(snapshot))
}

/// Fetch the authoritative snapshot of a session.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    tag = "sessions",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Session snapshot", body = SessionSnapshot),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let snapshot = session_service::get_session(&state, id).await?;
    Ok(Json(snapshot))
}

/// Vote for one option of the open round.
#[utoipa::path(
    post,
    path = "/sessions/{id}/votes",
    tag = "sessions",
    params(("id" = Uuid, Path, description = "Session identifier")),
    request_body = CastVoteRequest,
    responses(
        (status = 200, description = "Vote recorded", body = VoteAck),
        (status = 409, description = "Vote rejected; `reason` tells why")
    )
)]
pub async fn cast_vote(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<CastVoteRequest>>,
) -> Result<Json<VoteAck>, AppError> {
    match session_service::cast_vote(&state, id, payload).await? {
        VoteOutcome::Accepted(ack) => Ok(Json(ack)),
        VoteOutcome::Rejected(reason) => Err(AppError::VoteRejected(reason)),
    }
}

/// Restart the story from a fresh opening.
#[utoipa::path(
    post,
    path = "/sessions/{id}/restart",
    tag = "sessions",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Restarted session snapshot", body = SessionSnapshot),
        (status = 409, description = "Session is completed")
    )
)]
pub async fn restart_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let snapshot = session_service::restart_session(&state, id).await?;
    Ok(Json(snapshot))
}

/// Leave a session.
#[utoipa::path(
    post,
    path = "/sessions/{id}/leave",
    tag = "sessions",
    params(("id" = Uuid, Path, description = "Session identifier")),
    request_body = LeaveSessionRequest,
    responses((status = 200, description = "Session snapshot after leaving", body = SessionSnapshot))
)]
pub async fn leave_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<LeaveSessionRequest>>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let snapshot = session_service::leave_session(&state, id, payload).await?;
    Ok(Json(snapshot))
}

/// Mark a session completed.
#[utoipa::path(
    post,
    path = "/sessions/{id}/complete",
    tag = "sessions",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses((status = 200, description = "Completed session snapshot", body = SessionSnapshot))
)]
pub async fn complete_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let snapshot = session_service::complete_session(&state, id).await?;
    Ok(Json(snapshot))
}
