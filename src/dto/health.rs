use serde::Serialize;
use utoipa::ToSchema;

/// Simple health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Sessions with an armed deadline timer on this instance.
    pub armed_timers: usize,
}

impl HealthResponse {
    /// Create a health response indicating the system is operational.
    pub fn ok(armed_timers: usize) -> Self {
        Self {
            status: "ok".to_string(),
            armed_timers,
        }
    }

    /// Create a health response indicating the system is in degraded mode.
    pub fn degraded(armed_timers: usize) -> Self {
        Self {
            status: "degraded".to_string(),
            armed_timers,
        }
    }
}
