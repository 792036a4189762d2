use std::time::{Duration, SystemTime};

use indexmap::IndexMap;
use uuid::Uuid;

use crate::{
    dao::models::{
        ParticipantEntity, SegmentEntity, SessionEntity, SessionStatusEntity, VoteEntity,
        VoteRoundEntity,
    },
    state::state_machine::SessionPhase,
};

/// Action recorded on the first segment of every epoch.
pub const START_ACTION: &str = "<start>";

/// Smallest step between two consecutive segment timestamps.
const TIMESTAMP_STEP: Duration = Duration::from_micros(1);

/// Whether the session still runs rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Accepting votes.
    Active,
    /// Final; only reads remain possible.
    Completed,
}

/// Authoritative in-memory view of a story session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorySession {
    /// Session identifier.
    pub id: Uuid,
    /// Region the session belongs to.
    pub region: String,
    /// Whether rounds still open.
    pub status: SessionStatus,
    /// Bumped on every restart.
    pub epoch: u64,
    /// Stored version, the compare-and-swap token.
    pub version: u64,
    /// Segments, oldest first.
    pub history: Vec<StorySegment>,
    /// Round open for the newest segment.
    pub current_vote_round: Option<VoteRound>,
    /// Keyed by user id, in join order.
    pub participants: IndexMap<String, Participant>,
    /// Creation time.
    pub created_at: SystemTime,
    /// Time of the last mutation.
    pub updated_at: SystemTime,
}

/// One narrated step of the story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorySegment {
    /// Narrative text.
    pub text: String,
    /// Option whose win produced this segment, or the start marker.
    pub chosen_action: String,
    /// Options for the next round; empty for an ending.
    pub options: Vec<String>,
    /// Strictly increasing within a session.
    pub created_at: SystemTime,
}

/// Open vote round. `votes` is only populated when loaded from the vote records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRound {
    /// Fresh id per opening; votes name it.
    pub id: Uuid,
    /// Index of the segment being voted on.
    pub segment_index: usize,
    /// Choices of the round, copied from the segment.
    pub options: Vec<String>,
    /// Opening time.
    pub opened_at: SystemTime,
    /// Votes are refused from this instant.
    pub deadline: SystemTime,
    /// Participant id to chosen option.
    pub votes: IndexMap<String, String>,
}

/// A user who joined the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Participant id.
    pub user_id: String,
    /// Join time.
    pub joined_at: SystemTime,
}

impl StorySession {
    /// A fresh, empty session for `region`; not stored yet.
    pub fn new(region: impl Into<String>, now: SystemTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            region: region.into(),
            status: SessionStatus::Active,
            epoch: 0,
            version: 0,
            history: Vec::new(),
            current_vote_round: None,
            participants: IndexMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Phase derived from the stored fields.
    ///
    /// `Tallying` is never derived: it only exists between a won claim and its commit.
    pub fn phase(&self) -> SessionPhase {
        match (self.status, &self.current_vote_round) {
            (SessionStatus::Completed, _) => SessionPhase::Completed,
            (SessionStatus::Active, Some(_)) => SessionPhase::Voting,
            (SessionStatus::Active, None) => SessionPhase::Opening,
        }
    }

    /// Whether the session was completed.
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    /// Whether `user_id` joined and has not left.
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participants.contains_key(user_id)
    }

    /// Add a participant; returns `false` when they had already joined.
    pub fn add_participant(&mut self, user_id: &str, now: SystemTime) -> bool {
        if self.is_participant(user_id) {
            return false;
        }
        self.participants.insert(
            user_id.to_owned(),
            Participant {
                user_id: user_id.to_owned(),
                joined_at: now,
            },
        );
        true
    }

    /// Remove a participant; their cast vote is left in place.
    pub fn remove_participant(&mut self, user_id: &str) -> bool {
        self.participants.shift_remove(user_id).is_some()
    }

    /// Newest segment, if any.
    pub fn current_segment(&self) -> Option<&StorySegment> {
        self.history.last()
    }

    /// Whether `round_id` names the currently open round.
    pub fn is_round_open(&self, round_id: Uuid) -> bool {
        self.current_vote_round
            .as_ref()
            .is_some_and(|round| round.id == round_id)
    }

    /// Append a segment and, in the same mutation, replace the open round with one
    /// over the new segment's options. No round opens for an options-less ending.
    pub fn append_segment(
        &mut self,
        text: String,
        chosen_action: String,
        options: Vec<String>,
        now: SystemTime,
        voting_window: Duration,
    ) {
        let created_at = match self.history.last() {
            Some(previous) if previous.created_at >= now => previous.created_at + TIMESTAMP_STEP,
            _ => now,
        };

        self.current_vote_round = (!options.is_empty()).then(|| VoteRound {
            id: Uuid::new_v4(),
            segment_index: self.history.len(),
            options: options.clone(),
            opened_at: created_at,
            deadline: created_at + voting_window,
            votes: IndexMap::new(),
        });
        self.history.push(StorySegment {
            text,
            chosen_action,
            options,
            created_at,
        });
        self.updated_at = now;
    }

    /// Clear history and the open round under a new epoch.
    pub fn restart(&mut self, now: SystemTime) {
        self.epoch += 1;
        self.history.clear();
        self.current_vote_round = None;
        self.updated_at = now;
    }

    /// Mark completed and drop the open round. Idempotent.
    pub fn complete(&mut self, now: SystemTime) {
        self.status = SessionStatus::Completed;
        self.current_vote_round = None;
        self.updated_at = now;
    }
}

impl VoteRound {
    /// Replace the vote map with the stored records belonging to this round.
    pub fn with_votes(mut self, votes: impl IntoIterator<Item = VoteEntity>) -> Self {
        self.votes = votes
            .into_iter()
            .filter(|vote| vote.round_id == self.id)
            .map(|vote| (vote.user_id, vote.choice))
            .collect();
        self
    }
}

impl From<SessionStatusEntity> for SessionStatus {
    fn from(value: SessionStatusEntity) -> Self {
        match value {
            SessionStatusEntity::Active => SessionStatus::Active,
            SessionStatusEntity::Completed => SessionStatus::Completed,
        }
    }
}

impl From<SessionStatus> for SessionStatusEntity {
    fn from(value: SessionStatus) -> Self {
        match value {
            SessionStatus::Active => SessionStatusEntity::Active,
            SessionStatus::Completed => SessionStatusEntity::Completed,
        }
    }
}

impl From<SessionEntity> for StorySession {
    fn from(value: SessionEntity) -> Self {
        Self {
            id: value.id,
            region: value.region,
            status: value.status.into(),
            epoch: value.epoch,
            version: value.version,
            history: value.history.into_iter().map(Into::into).collect(),
            current_vote_round: value.current_vote_round.map(Into::into),
            participants: value
                .participants
                .into_iter()
                .map(|p| {
                    (
                        p.user_id.clone(),
                        Participant {
                            user_id: p.user_id,
                            joined_at: p.joined_at,
                        },
                    )
                })
                .collect(),
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

impl From<StorySession> for SessionEntity {
    fn from(value: StorySession) -> Self {
        Self {
            id: value.id,
            region: value.region,
            status: value.status.into(),
            epoch: value.epoch,
            version: value.version,
            history: value.history.into_iter().map(Into::into).collect(),
            current_vote_round: value.current_vote_round.map(Into::into),
            participants: value
                .participants
                .into_values()
                .map(|p| ParticipantEntity {
                    user_id: p.user_id,
                    joined_at: p.joined_at,
                })
                .collect(),
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

impl From<SegmentEntity> for StorySegment {
    fn from(value: SegmentEntity) -> Self {
        Self {
            text: value.text,
            chosen_action: value.chosen_action,
            options: value.options,
            created_at: value.created_at,
        }
    }
}

impl From<StorySegment> for SegmentEntity {
    fn from(value: StorySegment) -> Self {
        Self {
            text: value.text,
            chosen_action: value.chosen_action,
            options: value.options,
            created_at: value.created_at,
        }
    }
}

impl From<VoteRoundEntity> for VoteRound {
    fn from(value: VoteRoundEntity) -> Self {
        Self {
            id: value.id,
            segment_index: value.segment_index,
            options: value.options,
            opened_at: value.opened_at,
            deadline: value.deadline,
            votes: IndexMap::new(),
        }
    }
}

impl From<VoteRound> for VoteRoundEntity {
    fn from(value: VoteRound) -> Self {
        Self {
            id: value.id,
            segment_index: value.segment_index,
            options: value.options,
            opened_at: value.opened_at,
            deadline: value.deadline,
        }
    }
}
