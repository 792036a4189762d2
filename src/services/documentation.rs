use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Story Session Back.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::session::join_session,
        crate::routes::session::get_session,
        crate::routes::session::cast_vote,
        crate::routes::session::restart_session,
        crate::routes::session::leave_session,
        crate::routes::session::complete_session,
        crate::routes::sse::session_stream,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::session::JoinSessionRequest,
            crate::dto::session::CastVoteRequest,
            crate::dto::session::LeaveSessionRequest,
            crate::dto::session::SessionSnapshot,
            crate::dto::session::VoteAck,
            crate::dto::session::VoteRejection,
            crate::dto::sse::Handshake,
            crate::dto::sse::SystemStatus,
            crate::dto::sse::SegmentPublishedEvent,
            crate::dto::sse::VoteTallyUpdatedEvent,
            crate::dto::sse::SessionRestartedEvent,
            crate::dto::sse::SessionCompletedEvent,
            crate::state::tally::TallyTrigger,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sessions", description = "Story session participation"),
        (name = "sse", description = "Server-sent events streams"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_every_session_route() {
        let doc = ApiDoc::openapi();
        for path in [
            "/sessions/join",
            "/sessions/{id}",
            "/sessions/{id}/votes",
            "/sessions/{id}/events",
            "/healthcheck",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
