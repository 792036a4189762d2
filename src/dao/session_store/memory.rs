//! Process-local [`SessionStore`] used by default and by the test-suite.
//!
//! A single mutex guards sessions, ballots and claims so every conditional write is
//! trivially atomic. It only coordinates coordinators living in the same process.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::SystemTime,
};

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::dao::{
    models::{
        BallotEntity, ClaimAttempt, ClaimKey, ClaimStatusEntity, SessionEntity,
        SessionStatusEntity, TallyClaimEntity, VoteEntity, VoteWrite, ballot_key,
    },
    session_store::SessionStore,
    storage::{StorageError, StorageResult},
};

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<Uuid, SessionEntity>,
    ballots: HashMap<String, BallotEntity>,
    claims: HashMap<ClaimKey, TallyClaimEntity>,
}

/// In-memory store; cheap to clone, all clones share the same data.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    state: Arc<Mutex<MemoryState>>,
    offline: Arc<AtomicBool>,
}

impl MemorySessionStore {
    /// Empty, online store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with [`StorageError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(
                "in-memory store is offline".into(),
                io::Error::from(io::ErrorKind::NotConnected),
            ));
        }
        Ok(())
    }

    fn run<T, F>(&self, op: F) -> BoxFuture<'static, StorageResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut MemoryState) -> StorageResult<T> + Send + 'static,
    {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_online()?;
            let mut guard = store.state.lock().await;
            op(&mut guard)
        })
    }
}

fn active_in_region<'a>(state: &'a MemoryState, region: &str) -> Option<&'a SessionEntity> {
    state
        .sessions
        .values()
        .filter(|session| {
            session.region == region && session.status == SessionStatusEntity::Active
        })
        .min_by_key(|session| session.created_at)
}

impl SessionStore for MemorySessionStore {
    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        self.run(move |state| Ok(state.sessions.get(&id).cloned()))
    }

    fn find_active_session(
        &self,
        region: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        self.run(move |state| Ok(active_in_region(state, &region).cloned()))
    }

    fn list_active_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<SessionEntity>>> {
        self.run(|state| {
            Ok(state
                .sessions
                .values()
                .filter(|session| session.status == SessionStatusEntity::Active)
                .cloned()
                .collect())
        })
    }

    fn create_session(
        &self,
        session: SessionEntity,
    ) -> BoxFuture<'static, StorageResult<SessionEntity>> {
        self.run(move |state| {
            if let Some(existing) = active_in_region(state, &session.region) {
                return Ok(existing.clone());
            }
            state.sessions.insert(session.id, session.clone());
            Ok(session)
        })
    }

    fn replace_session(
        &self,
        session: SessionEntity,
        expected_version: u64,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.run(move |state| match state.sessions.get_mut(&session.id) {
            Some(current) if current.version == expected_version => {
                *current = session;
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    fn record_vote(&self, vote: VoteEntity) -> BoxFuture<'static, StorageResult<VoteWrite>> {
        self.run(move |state| {
            let ballot = state
                .ballots
                .entry(ballot_key(vote.session_id, vote.epoch, vote.segment_index))
                .or_insert_with(|| {
                    BallotEntity::open(vote.session_id, vote.epoch, vote.segment_index)
                });
            Ok(ballot.record(vote))
        })
    }

    fn list_votes(
        &self,
        session_id: Uuid,
        epoch: u64,
        segment_index: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<VoteEntity>>> {
        self.run(move |state| {
            Ok(state
                .ballots
                .get(&ballot_key(session_id, epoch, segment_index))
                .map(|ballot| ballot.votes.clone())
                .unwrap_or_default())
        })
    }

    fn seal_votes(
        &self,
        session_id: Uuid,
        epoch: u64,
        segment_index: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<VoteEntity>>> {
        self.run(move |state| {
            let ballot = state
                .ballots
                .entry(ballot_key(session_id, epoch, segment_index))
                .or_insert_with(|| BallotEntity::open(session_id, epoch, segment_index));
            ballot.seal();
            Ok(ballot.votes.clone())
        })
    }

    fn try_claim(
        &self,
        claim: TallyClaimEntity,
        now: SystemTime,
    ) -> BoxFuture<'static, StorageResult<ClaimAttempt>> {
        self.run(move |state| match state.claims.get(&claim.key) {
            Some(existing) if !existing.is_takeover_allowed(now) => {
                Ok(ClaimAttempt::Held(existing.clone()))
            }
            _ => {
                state.claims.insert(claim.key, claim);
                Ok(ClaimAttempt::Acquired)
            }
        })
    }

    fn find_claim(
        &self,
        key: ClaimKey,
    ) -> BoxFuture<'static, StorageResult<Option<TallyClaimEntity>>> {
        self.run(move |state| Ok(state.claims.get(&key).cloned()))
    }

    fn complete_claim(
        &self,
        key: ClaimKey,
        claim_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.run(move |state| match state.claims.get_mut(&key) {
            Some(claim) if claim.claim_id == claim_id => {
                claim.status = ClaimStatusEntity::Completed;
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    fn release_claim(
        &self,
        key: ClaimKey,
        claim_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.run(move |state| {
            let owned = state
                .claims
                .get(&key)
                .is_some_and(|claim| claim.claim_id == claim_id);
            if owned {
                state.claims.remove(&key);
            }
            Ok(owned)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_online() })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.health_check()
    }
}
