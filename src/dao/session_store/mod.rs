//! Storage seam of the coordinator and its backends.

#[cfg(test)]
pub(crate) mod conformance;
#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use std::time::SystemTime;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::dao::models::{
    ClaimAttempt, ClaimKey, SessionEntity, TallyClaimEntity, VoteEntity, VoteWrite,
};
use crate::dao::storage::StorageResult;

/// Abstraction over the durable store backing story sessions, votes and tally claims.
///
/// Every backend must provide three conditional writes: [`SessionStore::replace_session`]
/// (compare-and-swap on the session version), [`SessionStore::try_claim`]
/// (create-if-absent, or take over an expired held claim) and the ballot pair
/// [`SessionStore::record_vote`] / [`SessionStore::seal_votes`].
pub trait SessionStore: Send + Sync {
    /// Load a session by id.
    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Return the active session of `region`, if any.
    fn find_active_session(
        &self,
        region: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Every session that is not completed.
    fn list_active_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<SessionEntity>>>;
    /// Insert `session` unless its region already has an active session.
    ///
    /// Returns whichever session is the region's active one afterwards.
    fn create_session(
        &self,
        session: SessionEntity,
    ) -> BoxFuture<'static, StorageResult<SessionEntity>>;
    /// Replace the stored session only if its version still equals `expected_version`.
    fn replace_session(
        &self,
        session: SessionEntity,
        expected_version: u64,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Insert or overwrite the vote of one participant, unless the round's ballot
    /// was sealed. Checking the seal and writing the vote is one atomic step.
    fn record_vote(&self, vote: VoteEntity) -> BoxFuture<'static, StorageResult<VoteWrite>>;
    /// Votes of one round, sealed or not.
    fn list_votes(
        &self,
        session_id: Uuid,
        epoch: u64,
        segment_index: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<VoteEntity>>>;
    /// Seal the ballot of one round and return its votes. Sealing twice returns the
    /// same votes.
    fn seal_votes(
        &self,
        session_id: Uuid,
        epoch: u64,
        segment_index: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<VoteEntity>>>;
    /// Conditionally write `claim`; see [`ClaimAttempt`].
    fn try_claim(
        &self,
        claim: TallyClaimEntity,
        now: SystemTime,
    ) -> BoxFuture<'static, StorageResult<ClaimAttempt>>;
    /// Current claim for `key`, if any.
    fn find_claim(&self, key: ClaimKey)
    -> BoxFuture<'static, StorageResult<Option<TallyClaimEntity>>>;
    /// Mark the claim completed if `claim_id` still owns it.
    fn complete_claim(&self, key: ClaimKey, claim_id: Uuid)
    -> BoxFuture<'static, StorageResult<bool>>;
    /// Delete the claim if `claim_id` still owns it, letting another trigger retry.
    fn release_claim(&self, key: ClaimKey, claim_id: Uuid)
    -> BoxFuture<'static, StorageResult<bool>>;
    /// Cheap round-trip proving the backend answers.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Re-establish the connection after a failed health check.
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}
