//! Behaviour every [`SessionStore`] backend must share, run against each of them.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use uuid::Uuid;

use super::SessionStore;
use crate::dao::models::{
    ClaimAttempt, ClaimKey, ClaimStatusEntity, SessionEntity, SessionStatusEntity,
    TallyClaimEntity, VoteEntity, VoteWrite,
};

fn session(region: &str) -> SessionEntity {
    let now = SystemTime::now();
    SessionEntity {
        id: Uuid::new_v4(),
        region: region.into(),
        status: SessionStatusEntity::Active,
        epoch: 0,
        version: 1,
        history: Vec::new(),
        current_vote_round: None,
        participants: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

fn claim(key: ClaimKey, now: SystemTime, ttl: Duration) -> TallyClaimEntity {
    TallyClaimEntity {
        key,
        claim_id: Uuid::new_v4(),
        holder: "conformance".into(),
        claimed_at: now,
        expires_at: now + ttl,
        status: ClaimStatusEntity::Held,
    }
}

/// Region names are unique per run so a shared database can be reused.
fn region(name: &str) -> String {
    format!("{name}-{}", Uuid::new_v4().simple())
}

/// Creating twice yields one active session; completing it frees the region.
pub async fn region_pointer_moves_to_the_next_session(store: Arc<dyn SessionStore>) {
    let region = region("forest");
    let first = store.create_session(session(&region)).await.unwrap();
    let second = store.create_session(session(&region)).await.unwrap();
    assert_eq!(first.id, second.id);

    let mut done = first.clone();
    done.status = SessionStatusEntity::Completed;
    done.version = 2;
    assert!(store.replace_session(done, 1).await.unwrap());
    assert!(store.find_active_session(region.clone()).await.unwrap().is_none());

    let next = store.create_session(session(&region)).await.unwrap();
    assert_ne!(next.id, first.id);
    let active = store.find_active_session(region).await.unwrap().unwrap();
    assert_eq!(active.id, next.id);
}

/// A writer holding an old version loses.
pub async fn replace_requires_the_expected_version(store: Arc<dyn SessionStore>) {
    let created = store.create_session(session(&region("desert"))).await.unwrap();

    let mut next = created.clone();
    next.version = 2;
    assert!(store.replace_session(next.clone(), 1).await.unwrap());
    assert!(!store.replace_session(next, 1).await.unwrap());
    assert_eq!(
        store.find_session(created.id).await.unwrap().unwrap().version,
        2
    );
}

/// Held claims are exclusive until they expire; completed claims are final.
pub async fn claims_are_taken_over_only_after_expiry(store: Arc<dyn SessionStore>) {
    let now = SystemTime::now();
    let ttl = Duration::from_secs(10);
    let key = ClaimKey::round(Uuid::new_v4(), 0, 0);

    let first = claim(key, now, ttl);
    assert_eq!(
        store.try_claim(first.clone(), now).await.unwrap(),
        ClaimAttempt::Acquired
    );
    assert!(matches!(
        store.try_claim(claim(key, now, ttl), now).await.unwrap(),
        ClaimAttempt::Held(held) if held.claim_id == first.claim_id
    ));

    let later = now + ttl;
    let takeover = claim(key, later, ttl);
    assert_eq!(
        store.try_claim(takeover.clone(), later).await.unwrap(),
        ClaimAttempt::Acquired
    );
    assert!(!store.release_claim(key, first.claim_id).await.unwrap());
    assert!(store.complete_claim(key, takeover.claim_id).await.unwrap());
    assert!(matches!(
        store.try_claim(claim(key, later, ttl), later + ttl * 3).await.unwrap(),
        ClaimAttempt::Held(held) if held.status == ClaimStatusEntity::Completed
    ));
}

/// Votes recorded before the seal are returned by it; later ones are refused.
pub async fn sealed_ballots_refuse_votes(store: Arc<dyn SessionStore>) {
    let session_id = Uuid::new_v4();
    let vote = |user: &str, choice: &str| VoteEntity {
        session_id,
        epoch: 0,
        segment_index: 0,
        round_id: Uuid::nil(),
        user_id: user.into(),
        choice: choice.into(),
        cast_at: SystemTime::now(),
    };

    assert_eq!(
        store.record_vote(vote("ana", "A")).await.unwrap(),
        VoteWrite::Recorded
    );
    assert_eq!(
        store.record_vote(vote("ana", "B")).await.unwrap(),
        VoteWrite::Recorded
    );
    let sealed = store.seal_votes(session_id, 0, 0).await.unwrap();
    assert_eq!(sealed.len(), 1);
    assert_eq!(sealed[0].choice, "B");

    assert_eq!(
        store.record_vote(vote("ben", "C")).await.unwrap(),
        VoteWrite::Closed
    );
    assert_eq!(store.list_votes(session_id, 0, 0).await.unwrap(), sealed);
}

/// Run every check against `store`.
pub async fn run_all(store: Arc<dyn SessionStore>) {
    region_pointer_moves_to_the_next_session(store.clone()).await;
    replace_requires_the_expected_version(store.clone()).await;
    claims_are_taken_over_only_after_expiry(store.clone()).await;
    sealed_ballots_refuse_votes(store).await;
}
