use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Respond with the degraded flag and timer count while logging connectivity issues.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.require_session_store().await {
        Ok(store) => {
            if let Err(err) = store.health_check().await {
                warn!(error = %err, "storage health check failed");
            }
        }
        Err(_) => warn!("storage unavailable (degraded mode)"),
    }

    let armed_timers = state.timers().len();
    if state.is_degraded() {
        HealthResponse::degraded(armed_timers)
    } else {
        HealthResponse::ok(armed_timers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;

    #[tokio::test]
    async fn reports_degraded_mode() {
        let harness = Harness::new().await;
        assert_eq!(health_status(&harness.state).await.status, "ok");

        harness.state.clear_session_store().await;
        assert_eq!(health_status(&harness.state).await.status, "degraded");
    }
}
