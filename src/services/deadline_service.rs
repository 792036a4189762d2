use std::time::Duration;

use dashmap::mapref::entry::Entry;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::ServiceError,
    services::tally_service::{self, TallyOutcome},
    state::{RoundTimer, SharedState, session::StorySession, tally::TallyTrigger},
};

const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
const MAX_TIMER_ATTEMPTS: u32 = 8;

/// Arm the deadline timer of the session's open round, unless this instance already
/// has one for that round. Sessions without an open round are ignored.
///
/// Every coordinator instance arms its own timer; the tally claim makes sure only one
/// of them generates.
pub fn arm_timer(state: &SharedState, session: &StorySession) {
    let Some(round) = session.current_vote_round.as_ref() else {
        return;
    };
    if session.is_completed() {
        return;
    }

    let session_id = session.id;
    let round_id = round.id;
    let arm = || {
        let wait = round
            .deadline
            .duration_since(state.now())
            .unwrap_or_default()
            + jitter(state.config().timer_jitter);
        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            sleep(wait).await;
            fire(&task_state, session_id, round_id).await;
            task_state
                .timers()
                .remove_if(&session_id, |_, timer| timer.round_id == round_id);
        });
        debug!(%session_id, %round_id, wait_ms = wait.as_millis() as u64, "deadline timer armed");
        RoundTimer {
            round_id,
            handle: handle.abort_handle(),
        }
    };

    // A timer of an earlier round is replaced but left running: it may be the task
    // publishing this very round, and it finds its own round closed anyway.
    match state.timers().entry(session_id) {
        Entry::Occupied(existing) if existing.get().round_id == round_id => {}
        entry => {
            entry.insert(arm());
        }
    }
}

/// Abort the deadline timer of a session, if one is armed.
pub fn cancel_timer(state: &SharedState, session_id: Uuid) {
    if let Some((_, timer)) = state.timers().remove(&session_id) {
        timer.handle.abort();
        debug!(%session_id, round_id = %timer.round_id, "deadline timer cancelled");
    }
}

/// Re-arm timers for every active session and finish openings that never landed.
pub async fn resume_active_sessions(state: &SharedState) -> Result<usize, ServiceError> {
    let store = state.require_session_store().await?;
    let sessions = store.list_active_sessions().await?;
    let count = sessions.len();

    for entity in sessions {
        let session = StorySession::from(entity);
        if session.history.is_empty() {
            let task_state = state.clone();
            let session_id = session.id;
            tokio::spawn(async move {
                if let Err(err) = tally_service::run_opening(&task_state, session_id).await {
                    warn!(%session_id, error = %err, "failed to resume session opening");
                }
            });
        } else {
            arm_timer(state, &session);
        }
    }

    info!(sessions = count, "active sessions resumed");
    Ok(count)
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = max.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(0..=millis))
}

/// Request the deadline tally, retrying with backoff while the store misbehaves.
async fn fire(state: &SharedState, session_id: Uuid, round_id: Uuid) {
    let mut delay = RETRY_INITIAL_DELAY;

    for attempt in 1..=MAX_TIMER_ATTEMPTS {
        match tally_service::request_tally(state, session_id, round_id, TallyTrigger::Deadline)
            .await
        {
            Ok(TallyOutcome::NotDue { session }) => {
                // Our clock is behind the one that set the deadline.
                let remaining = session
                    .current_vote_round
                    .as_ref()
                    .and_then(|round| round.deadline.duration_since(state.now()).ok())
                    .unwrap_or(delay);
                debug!(%session_id, %round_id, attempt, "deadline not reached yet");
                sleep(remaining.max(RETRY_INITIAL_DELAY)).await;
            }
            Ok(outcome) => {
                debug!(%session_id, %round_id, outcome = ?outcome_name(&outcome), "deadline handled");
                return;
            }
            Err(ServiceError::NotFound(_)) => return,
            Err(err) => {
                warn!(%session_id, %round_id, attempt, error = %err, "deadline tally failed; retrying");
                sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
            }
        }
    }

    warn!(%session_id, %round_id, "giving up on deadline tally until the next resume");
}

fn outcome_name(outcome: &TallyOutcome) -> &'static str {
    match outcome {
        TallyOutcome::Published { .. } => "published",
        TallyOutcome::Observed { .. } => "observed",
        TallyOutcome::AlreadyClosed { .. } => "already_closed",
        TallyOutcome::NotDue { .. } => "not_due",
        TallyOutcome::Discarded { .. } => "discarded",
    }
}
