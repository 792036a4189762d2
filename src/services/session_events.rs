use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::{
    dto::{
        session::{SegmentView, SessionSnapshot, VoteRoundView, option_counts},
        sse::{
            ServerEvent, SessionCompletedEvent, SessionRestartedEvent, SegmentPublishedEvent,
            SystemStatus, VoteTallyUpdatedEvent,
        },
    },
    state::{
        SharedState,
        channel::session_topic,
        session::{StorySession, VoteRound},
    },
};

/// First event of every stream.
pub const EVENT_HANDSHAKE: &str = "handshake";
/// A segment was appended.
pub const EVENT_SEGMENT_PUBLISHED: &str = "segment_published";
/// Live counts of the open round changed.
pub const EVENT_VOTE_TALLY_UPDATED: &str = "vote_tally_updated";
/// The session restarted from scratch.
pub const EVENT_SESSION_RESTARTED: &str = "session_restarted";
/// The session was completed.
pub const EVENT_SESSION_COMPLETED: &str = "session_completed";
/// Degraded mode was entered or left.
pub const EVENT_SYSTEM_STATUS: &str = "system_status";

/// Broadcast the newest segment of `session` together with the round it opened.
pub fn broadcast_segment_published(state: &SharedState, session: &StorySession) {
    let Some(segment) = session.current_segment() else {
        return;
    };
    let payload = SegmentPublishedEvent {
        session_id: session.id,
        epoch: session.epoch,
        segment: SegmentView::new(session.history.len() - 1, segment),
        vote_round: session.current_vote_round.as_ref().map(VoteRoundView::from),
    };
    send_session_event(state, session.id, EVENT_SEGMENT_PUBLISHED, &payload);
}

/// Broadcast the live counts of `round`.
pub fn broadcast_vote_tally(state: &SharedState, session_id: Uuid, round: &VoteRound) {
    let (counts, total_votes) = option_counts(round);
    let payload = VoteTallyUpdatedEvent {
        session_id,
        round_id: round.id,
        counts,
        total_votes,
    };
    send_session_event(state, session_id, EVENT_VOTE_TALLY_UPDATED, &payload);
}

/// Tell subscribers to drop their cached history.
pub fn broadcast_session_restarted(state: &SharedState, session: &StorySession) {
    let payload = SessionRestartedEvent {
        session: SessionSnapshot::from(session),
    };
    send_session_event(state, session.id, EVENT_SESSION_RESTARTED, &payload);
}

/// Tell subscribers that `session_id` will not continue.
pub fn broadcast_session_completed(state: &SharedState, session_id: Uuid) {
    let payload = SessionCompletedEvent { session_id };
    send_session_event(state, session_id, EVENT_SESSION_COMPLETED, &payload);
}

/// Build the `system_status` event sent when the degraded flag flips.
pub fn system_status_event(degraded: bool) -> Option<ServerEvent> {
    match ServerEvent::json(Some(EVENT_SYSTEM_STATUS.to_string()), &SystemStatus { degraded }) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(error = %err, "failed to serialize system status payload");
            None
        }
    }
}

fn send_session_event(state: &SharedState, session_id: Uuid, event: &str, payload: &impl Serialize) {
    match ServerEvent::json(Some(event.to_string()), payload) {
        Ok(message) => state.channel().publish(&session_topic(session_id), message),
        Err(err) => warn!(event, %session_id, error = %err, "failed to serialize session event"),
    }
}
