use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::{format_system_time, validation::validate_user_id},
    state::{
        session::{SessionStatus, StorySegment, StorySession, VoteRound},
        tally::tally,
    },
};

/// Payload used to join (or create) the active session of a region.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct JoinSessionRequest {
    /// Region whose active session to join.
    #[validate(length(min = 1, max = 64))]
    pub region: String,
    /// Caller-chosen participant id.
    #[validate(custom(function = "validate_user_id"))]
    pub user_id: String,
}

/// Payload used to vote in the open round.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CastVoteRequest {
    /// Voting participant.
    #[validate(custom(function = "validate_user_id"))]
    pub user_id: String,
    /// One of the open round's options.
    #[validate(length(min = 1, max = 256))]
    pub choice: String,
    /// Round the client believes is open; stale ids are rejected.
    #[serde(default)]
    pub round_id: Option<Uuid>,
}

/// Payload used to leave a session.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct LeaveSessionRequest {
    /// Participant leaving the session.
    #[validate(custom(function = "validate_user_id"))]
    pub user_id: String,
}

/// Lifecycle status exposed to clients.
#[derive(Debug, Clone, Copy, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatusDto {
    /// Accepting votes and segments.
    Active,
    /// Finished; no further rounds open.
    Completed,
}

impl From<SessionStatus> for SessionStatusDto {
    fn from(value: SessionStatus) -> Self {
        match value {
            SessionStatus::Active => SessionStatusDto::Active,
            SessionStatus::Completed => SessionStatusDto::Completed,
        }
    }
}

/// Full authoritative view of a session, used for join and resync.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub session_id: Uuid,
    /// Region the session belongs to.
    pub region: String,
    /// Whether the session is still running.
    pub status: SessionStatusDto,
    /// Bumped on every restart.
    pub epoch: u64,
    /// Optimistic concurrency version of the stored session.
    pub version: u64,
    /// Every segment so far, oldest first.
    pub history: Vec<SegmentView>,
    /// Newest segment, if any.
    pub current_segment: Option<SegmentView>,
    /// The open round, if any.
    pub vote_round: Option<VoteRoundView>,
    /// Participants in join order.
    pub participants: Vec<ParticipantView>,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 time of the last write.
    pub updated_at: String,
}

/// One narrated segment.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SegmentView {
    /// Position in the history, starting at 0.
    pub index: usize,
    /// Narrative text.
    pub text: String,
    /// Option that led here, or `<start>` for the opening.
    pub chosen_action: String,
    /// Options offered after this segment; empty for an ending.
    pub options: Vec<String>,
    /// RFC 3339 creation time.
    pub created_at: String,
}

/// The open round with its live counts.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VoteRoundView {
    /// Id to send back with a vote.
    pub round_id: Uuid,
    /// Index of the segment the round votes on.
    pub segment_index: usize,
    /// Choices, in display order.
    pub options: Vec<String>,
    /// RFC 3339 opening time.
    pub opened_at: String,
    /// RFC 3339 time the round closes.
    pub deadline: String,
    /// Live votes per option.
    pub counts: Vec<OptionCount>,
    /// Votes that named one of the options.
    pub total_votes: u32,
    /// Participants who have a vote recorded for this round.
    pub voters: Vec<String>,
}

/// Live vote count of one option.
#[derive(Debug, Clone, Serialize, ToSchema, PartialEq, Eq)]
pub struct OptionCount {
    /// Option text.
    pub option: String,
    /// Votes for it so far.
    pub votes: u32,
}

/// A joined participant.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ParticipantView {
    /// Participant id.
    pub user_id: String,
    /// RFC 3339 join time.
    pub joined_at: String,
}

/// Acknowledgement of an accepted vote.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VoteAck {
    /// Session voted in.
    pub session_id: Uuid,
    /// Round the vote was recorded for.
    pub round_id: Uuid,
    /// Voting participant.
    pub user_id: String,
    /// Option the vote was recorded for.
    pub choice: String,
    /// Live counts including this vote.
    pub counts: Vec<OptionCount>,
    /// Votes that named one of the options.
    pub total_votes: u32,
}

/// Why a vote was refused. Reported to the voter only.
#[derive(Debug, Clone, Copy, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoteRejection {
    /// The session was completed.
    SessionCompleted,
    /// No round is open, its deadline passed, or its tally already started.
    RoundClosed,
    /// The request named a round that is no longer the open one.
    StaleRound,
    /// The choice is not one of the round's options.
    InvalidChoice,
    /// The user never joined the session.
    NotParticipant,
}

impl VoteRejection {
    /// Human-readable reason sent alongside the rejection code.
    pub fn describe(&self) -> &'static str {
        match self {
            VoteRejection::SessionCompleted => "session is completed",
            VoteRejection::RoundClosed => "voting round is closed",
            VoteRejection::StaleRound => "voting round is no longer open",
            VoteRejection::InvalidChoice => "choice is not one of the round options",
            VoteRejection::NotParticipant => "user has not joined this session",
        }
    }
}

/// Counts per option, ordered like the round's options.
pub fn option_counts(round: &VoteRound) -> (Vec<OptionCount>, u32) {
    match tally(round.votes.values().map(String::as_str), &round.options) {
        Some(result) => (
            result
                .counts
                .into_iter()
                .map(|(option, votes)| OptionCount { option, votes })
                .collect(),
            result.total_votes,
        ),
        None => (Vec::new(), 0),
    }
}

impl SegmentView {
    /// View of `segment`, which sits at `index` in the history.
    pub fn new(index: usize, segment: &StorySegment) -> Self {
        Self {
            index,
            text: segment.text.clone(),
            chosen_action: segment.chosen_action.clone(),
            options: segment.options.clone(),
            created_at: format_system_time(segment.created_at),
        }
    }
}

impl From<&VoteRound> for VoteRoundView {
    fn from(round: &VoteRound) -> Self {
        let (counts, total_votes) = option_counts(round);
        Self {
            round_id: round.id,
            segment_index: round.segment_index,
            options: round.options.clone(),
            opened_at: format_system_time(round.opened_at),
            deadline: format_system_time(round.deadline),
            counts,
            total_votes,
            voters: round.votes.keys().cloned().collect(),
        }
    }
}

impl From<&StorySession> for SessionSnapshot {
    fn from(session: &StorySession) -> Self {
        let history: Vec<SegmentView> = session
            .history
            .iter()
            .enumerate()
            .map(|(index, segment)| SegmentView::new(index, segment))
            .collect();
        Self {
            session_id: session.id,
            region: session.region.clone(),
            status: session.status.into(),
            epoch: session.epoch,
            version: session.version,
            current_segment: history.last().cloned(),
            history,
            vote_round: session.current_vote_round.as_ref().map(Into::into),
            participants: session
                .participants
                .values()
                .map(|p| ParticipantView {
                    user_id: p.user_id.clone(),
                    joined_at: format_system_time(p.joined_at),
                })
                .collect(),
            created_at: format_system_time(session.created_at),
            updated_at: format_system_time(session.updated_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::state::session::START_ACTION;

    #[test]
    fn snapshot_exposes_live_counts() {
        let now = SystemTime::now();
        let mut session = StorySession::new("forest", now);
        session.add_participant("ana", now);
        session.add_participant("ben", now);
        session.append_segment(
            "Once".into(),
            START_ACTION.into(),
            vec!["A".into(), "B".into(), "C".into()],
            now,
            Duration::from_secs(30),
        );
        if let Some(round) = session.current_vote_round.as_mut() {
            round.votes.insert("ana".into(), "B".into());
            round.votes.insert("ben".into(), "B".into());
        }

        let snapshot = SessionSnapshot::from(&session);
        let round = snapshot.vote_round.unwrap();
        assert_eq!(round.total_votes, 2);
        assert_eq!(
            round.counts[1],
            OptionCount {
                option: "B".into(),
                votes: 2
            }
        );
        assert_eq!(snapshot.current_segment.unwrap().chosen_action, START_ACTION);
        assert_eq!(snapshot.participants.len(), 2);
    }

    #[test]
    fn join_request_validation() {
        let ok = JoinSessionRequest {
            region: "forest".into(),
            user_id: "ana".into(),
        };
        assert!(ok.validate().is_ok());

        let blank = JoinSessionRequest {
            region: "".into(),
            user_id: " ".into(),
        };
        let errors = blank.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("region"));
        assert!(errors.field_errors().contains_key("user_id"));
    }
}
