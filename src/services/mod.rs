/// Deadline timers of open vote rounds.
pub mod deadline_service;
/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Event payloads published on session topics.
pub mod session_events;
/// Join, vote, restart, leave and completion of story sessions.
pub mod session_service;
/// Server-Sent Events subscription service.
pub mod sse_service;
/// Storage connection supervisor toggling degraded mode.
pub mod storage_supervisor;
/// Claimed, exactly-once tallies and segment publication.
pub mod tally_service;
