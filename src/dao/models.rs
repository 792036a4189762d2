use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};
use uuid::Uuid;

/// Persisted lifecycle status of a story session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatusEntity {
    /// Accepting participants and votes.
    Active,
    /// Finished for good; the region may start a new session.
    Completed,
}

/// Story session as stored by every backend.
///
/// Votes and tally claims live in their own records so that casting a vote never
/// contends with the session document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEntity {
    /// Stable identifier for the session.
    pub id: Uuid,
    /// Thematic region selecting the narration flavor.
    pub region: String,
    /// Lifecycle status.
    pub status: SessionStatusEntity,
    /// Incremented on every restart so stale claims can be recognised.
    pub epoch: u64,
    /// Compare-and-swap token incremented on every write.
    pub version: u64,
    /// Narrated segments in canonical order.
    pub history: Vec<SegmentEntity>,
    /// Open vote round, present exactly when the session awaits votes.
    pub current_vote_round: Option<VoteRoundEntity>,
    /// Participants in join order.
    pub participants: Vec<ParticipantEntity>,
    /// Creation time.
    pub created_at: SystemTime,
    /// Time of the last write.
    pub updated_at: SystemTime,
}

/// One narrated beat of the story.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentEntity {
    /// Narration shown to participants.
    pub text: String,
    /// Option that led here, or the start action for an opening.
    pub chosen_action: String,
    /// Options offered for the next round; empty for an ending.
    pub options: Vec<String>,
    /// Publication time.
    pub created_at: SystemTime,
}

/// Metadata of the currently open vote round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteRoundEntity {
    /// Round identifier, distinct across restarts.
    pub id: Uuid,
    /// History index whose options are being voted on.
    pub segment_index: usize,
    /// Options open for voting.
    pub options: Vec<String>,
    /// Time the round opened.
    pub opened_at: SystemTime,
    /// Time after which the round may be tallied.
    pub deadline: SystemTime,
}

/// Participant membership record embedded in the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantEntity {
    /// Client-provided identifier.
    pub user_id: String,
    /// Time of the first join.
    pub joined_at: SystemTime,
}

/// Ballot of one participant for one round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteEntity {
    /// Session the round belongs to.
    pub session_id: Uuid,
    /// Epoch in which the vote was cast.
    pub epoch: u64,
    /// History index whose options were voted on.
    pub segment_index: usize,
    /// Round identifier, distinct across restarts.
    pub round_id: Uuid,
    /// Voting participant.
    pub user_id: String,
    /// Selected option, verbatim.
    pub choice: String,
    /// Time the coordinator accepted the vote.
    pub cast_at: SystemTime,
}

/// Every vote of one round, stored as a single record.
///
/// Accepting a vote and sealing the ballot are conditional writes on the same record,
/// so a vote is either recorded before the seal (and counted) or rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BallotEntity {
    /// Session the round belongs to.
    pub session_id: Uuid,
    /// Epoch of the round.
    pub epoch: u64,
    /// History index whose options are being voted on.
    pub segment_index: usize,
    /// Set once a tally holder closed the round; no vote is accepted afterwards.
    pub sealed: bool,
    /// One vote per participant, in first-vote order.
    pub votes: Vec<VoteEntity>,
}

impl BallotEntity {
    /// Empty, unsealed ballot for a round.
    pub fn open(session_id: Uuid, epoch: u64, segment_index: usize) -> Self {
        Self {
            session_id,
            epoch,
            segment_index,
            sealed: false,
            votes: Vec::new(),
        }
    }

    /// Storage key shared by every backend.
    pub fn key(&self) -> String {
        ballot_key(self.session_id, self.epoch, self.segment_index)
    }

    /// Record `vote`, replacing the participant's previous one, unless the ballot is sealed.
    pub fn record(&mut self, vote: VoteEntity) -> VoteWrite {
        if self.sealed {
            return VoteWrite::Closed;
        }
        match self
            .votes
            .iter_mut()
            .find(|existing| existing.user_id == vote.user_id)
        {
            Some(existing) => *existing = vote,
            None => self.votes.push(vote),
        }
        VoteWrite::Recorded
    }

    /// Close the ballot. Returns `false` when it was already sealed.
    pub fn seal(&mut self) -> bool {
        !std::mem::replace(&mut self.sealed, true)
    }
}

/// Key of the ballot holding the votes of one round.
pub fn ballot_key(session_id: Uuid, epoch: u64, segment_index: usize) -> String {
    format!("{session_id}::{epoch}::{segment_index}")
}

/// Result of a conditional vote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteWrite {
    /// The vote is stored and will be part of the tally.
    Recorded,
    /// The ballot was sealed first; the vote was not stored.
    Closed,
}

/// Identifies the single piece of generation work a claim protects.
///
/// `next_index` is the history index the claim holder will produce: `0` for the
/// opening segment and `i + 1` for the round voting on segment `i`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ClaimKey {
    /// Session being advanced.
    pub session_id: Uuid,
    /// Epoch the work belongs to.
    pub epoch: u64,
    /// History index the holder will append.
    pub next_index: usize,
}

impl ClaimKey {
    /// Key guarding the opening segment of an epoch.
    pub fn opening(session_id: Uuid, epoch: u64) -> Self {
        Self {
            session_id,
            epoch,
            next_index: 0,
        }
    }

    /// Key guarding the tally of the round voting on `segment_index`.
    pub fn round(session_id: Uuid, epoch: u64, segment_index: usize) -> Self {
        Self {
            session_id,
            epoch,
            next_index: segment_index + 1,
        }
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.session_id, self.epoch, self.next_index)
    }
}

/// Progress of a tally claim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatusEntity {
    /// Holder is generating; may be taken over once expired.
    Held,
    /// Segment was appended; the claim is permanent.
    Completed,
}

/// Exclusive right to perform one tally (or opening) and its generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TallyClaimEntity {
    /// Work guarded by the claim.
    pub key: ClaimKey,
    /// Identifier of this particular attempt; changes on takeover.
    pub claim_id: Uuid,
    /// Coordinator instance that holds the claim.
    pub holder: String,
    /// Time the claim was written.
    pub claimed_at: SystemTime,
    /// Time after which a held claim may be taken over.
    pub expires_at: SystemTime,
    /// Progress of the guarded work.
    pub status: ClaimStatusEntity,
}

impl TallyClaimEntity {
    /// Whether another attempt may take the claim over at `now`.
    pub fn is_takeover_allowed(&self, now: SystemTime) -> bool {
        self.status == ClaimStatusEntity::Held && self.expires_at <= now
    }
}

/// Result of a conditional claim write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimAttempt {
    /// The conditional write succeeded; the caller owns the claim.
    Acquired,
    /// Someone else holds (or completed) the claim.
    Held(TallyClaimEntity),
}
