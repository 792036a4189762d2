//! Closing vote rounds and publishing story segments.
//!
//! Any number of triggers (deadline timers on any instance, the last vote of a round,
//! a participant leaving) may ask for the same tally. A conditional claim record in the
//! session store elects exactly one of them to call the narrator; the others wait for
//! the winner's segment to appear and report it as observed.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::broadcast::error::RecvError,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        models::{ClaimAttempt, ClaimKey, ClaimStatusEntity, TallyClaimEntity},
        session_store::SessionStore,
    },
    error::ServiceError,
    services::{deadline_service, session_events},
    state::{
        LifecycleEvent, SharedState,
        channel::session_topic,
        session::{START_ACTION, StorySession},
        tally::{TallyTrigger, tally},
        transitions::{Decision, commit_transition, load_session},
    },
};

/// Claim attempts per trigger; a held claim is only retried once it expires.
const MAX_CLAIM_ATTEMPTS: u32 = 3;
/// Poll interval of a trigger waiting for another holder's segment.
const OBSERVE_POLL: Duration = Duration::from_millis(500);
const MIN_OBSERVE_WAIT: Duration = Duration::from_millis(10);

/// How a tally request ended.
#[derive(Debug)]
pub enum TallyOutcome {
    /// This call won the claim and committed the next segment.
    Published {
        /// Session including the new segment.
        session: StorySession,
        /// Winning option, or the start action for an opening.
        action: String,
    },
    /// Another trigger published the segment.
    Observed {
        /// Session including the published segment.
        session: StorySession,
    },
    /// The round was no longer open when the request arrived.
    AlreadyClosed {
        /// Session as loaded.
        session: StorySession,
    },
    /// The trigger's condition does not hold yet.
    NotDue {
        /// Session as loaded.
        session: StorySession,
    },
    /// The session moved on (restart, completion) while generating; nothing written.
    Discarded {
        /// Session that won the race.
        session: StorySession,
    },
}

impl TallyOutcome {
    /// Latest session state seen by the request.
    pub fn session(&self) -> &StorySession {
        match self {
            TallyOutcome::Published { session, .. }
            | TallyOutcome::Observed { session }
            | TallyOutcome::AlreadyClosed { session }
            | TallyOutcome::NotDue { session }
            | TallyOutcome::Discarded { session } => session,
        }
    }

    /// Consume the outcome, keeping the session.
    pub fn into_session(self) -> StorySession {
        match self {
            TallyOutcome::Published { session, .. }
            | TallyOutcome::Observed { session }
            | TallyOutcome::AlreadyClosed { session }
            | TallyOutcome::NotDue { session }
            | TallyOutcome::Discarded { session } => session,
        }
    }
}

/// Segment-producing work guarded by one claim.
#[derive(Debug, Clone, Copy)]
enum Job {
    Opening { epoch: u64 },
    Round { epoch: u64, round_id: Uuid, segment_index: usize },
}

impl Job {
    fn key(&self, session_id: Uuid) -> ClaimKey {
        match *self {
            Job::Opening { epoch } => ClaimKey::opening(session_id, epoch),
            Job::Round {
                epoch,
                segment_index,
                ..
            } => ClaimKey::round(session_id, epoch, segment_index),
        }
    }

    /// Whether `session` still waits for this job's segment.
    fn is_pending(&self, session: &StorySession) -> bool {
        if session.is_completed() {
            return false;
        }
        match *self {
            Job::Opening { epoch } => session.epoch == epoch && session.history.is_empty(),
            Job::Round {
                epoch, round_id, ..
            } => session.epoch == epoch && session.is_round_open(round_id),
        }
    }
}

/// Close round `round_id` if `trigger` holds, generating and publishing the next
/// segment exactly once across all concurrent callers.
pub async fn request_tally(
    state: &SharedState,
    session_id: Uuid,
    round_id: Uuid,
    trigger: TallyTrigger,
) -> Result<TallyOutcome, ServiceError> {
    let store = state.require_session_store().await?;
    let session = load_session(&store, session_id).await?;

    let round = match &session.current_vote_round {
        Some(round) if round.id == round_id && !session.is_completed() => round.clone(),
        _ => return Ok(TallyOutcome::AlreadyClosed { session }),
    };
    let votes = store
        .list_votes(session_id, session.epoch, round.segment_index)
        .await?;
    let round = round.with_votes(votes);
    if !trigger.is_satisfied(session.participants.keys(), &round, state.now()) {
        return Ok(TallyOutcome::NotDue { session });
    }

    debug!(%session_id, %round_id, ?trigger, "tally requested");
    let job = Job::Round {
        epoch: session.epoch,
        round_id,
        segment_index: round.segment_index,
    };
    run_claimed(state, &store, session, job).await
}

/// Generate the first segment of the session's current epoch unless it exists.
pub async fn run_opening(
    state: &SharedState,
    session_id: Uuid,
) -> Result<TallyOutcome, ServiceError> {
    let store = state.require_session_store().await?;
    let session = load_session(&store, session_id).await?;

    let job = Job::Opening {
        epoch: session.epoch,
    };
    if !job.is_pending(&session) {
        return Ok(TallyOutcome::AlreadyClosed { session });
    }
    run_claimed(state, &store, session, job).await
}

async fn run_claimed(
    state: &SharedState,
    store: &Arc<dyn SessionStore>,
    session: StorySession,
    job: Job,
) -> Result<TallyOutcome, ServiceError> {
    let session_id = session.id;
    let key = job.key(session_id);

    for attempt in 1..=MAX_CLAIM_ATTEMPTS {
        let now = state.now();
        let claim = TallyClaimEntity {
            key,
            claim_id: Uuid::new_v4(),
            holder: state.instance_id().to_owned(),
            claimed_at: now,
            expires_at: now + state.config().claim_ttl,
            status: ClaimStatusEntity::Held,
        };

        match store.try_claim(claim.clone(), now).await? {
            ClaimAttempt::Acquired => {
                debug!(%session_id, %key, attempt, "tally claim acquired");
                return execute(state, store, session, claim, job).await;
            }
            ClaimAttempt::Held(holder) => {
                debug!(
                    %session_id,
                    %key,
                    holder = %holder.holder,
                    "tally already claimed; waiting for its segment"
                );
                if let Some(session) = observe(state, store, session_id, job, holder).await? {
                    // The holder's instance may die before the next deadline.
                    deadline_service::arm_timer(state, &session);
                    return Ok(TallyOutcome::Observed { session });
                }
            }
        }
    }

    warn!(%session_id, %key, "tally claim still contended after retries");
    Err(ServiceError::Contention(session_id))
}

/// Wait until the holder's segment lands. Returns `None` when the claim expired or
/// was released, meaning the caller should try to claim again.
async fn observe(
    state: &SharedState,
    store: &Arc<dyn SessionStore>,
    session_id: Uuid,
    job: Job,
    mut holder: TallyClaimEntity,
) -> Result<Option<StorySession>, ServiceError> {
    let mut events = state.channel().subscribe(&session_topic(session_id));

    loop {
        let current = load_session(store, session_id).await?;
        if !job.is_pending(&current) {
            return Ok(Some(current));
        }

        match store.find_claim(holder.key).await? {
            None => return Ok(None),
            Some(claim) => holder = claim,
        }
        let remaining = holder
            .expires_at
            .duration_since(state.now())
            .unwrap_or_default();
        if holder.status == ClaimStatusEntity::Held && remaining.is_zero() {
            return Ok(None);
        }

        // Any event on the topic is a hint to re-read the store.
        let wait = OBSERVE_POLL.min(remaining).max(MIN_OBSERVE_WAIT);
        if let Ok(Err(RecvError::Closed)) = timeout(wait, events.recv()).await {
            sleep(wait).await;
        }
    }
}

async fn execute(
    state: &SharedState,
    store: &Arc<dyn SessionStore>,
    session: StorySession,
    claim: TallyClaimEntity,
    job: Job,
) -> Result<TallyOutcome, ServiceError> {
    let session_id = session.id;
    match generate_and_commit(state, store, session, job).await {
        Ok(TallyOutcome::Published { session, action }) => {
            match store.complete_claim(claim.key, claim.claim_id).await {
                Ok(true) => {}
                Ok(false) => warn!(%session_id, key = %claim.key, "tally claim was taken over before completion"),
                Err(err) => warn!(%session_id, key = %claim.key, error = %err, "failed to mark tally claim completed"),
            }
            info!(
                %session_id,
                epoch = session.epoch,
                segments = session.history.len(),
                action = %action,
                "segment published"
            );
            session_events::broadcast_segment_published(state, &session);
            deadline_service::arm_timer(state, &session);
            Ok(TallyOutcome::Published { session, action })
        }
        Ok(outcome) => {
            release(store, &claim).await;
            Ok(outcome)
        }
        Err(err) => {
            release(store, &claim).await;
            Err(err)
        }
    }
}

async fn release(store: &Arc<dyn SessionStore>, claim: &TallyClaimEntity) {
    if let Err(err) = store.release_claim(claim.key, claim.claim_id).await {
        warn!(key = %claim.key, error = %err, "failed to release tally claim");
    }
}

async fn generate_and_commit(
    state: &SharedState,
    store: &Arc<dyn SessionStore>,
    session: StorySession,
    job: Job,
) -> Result<TallyOutcome, ServiceError> {
    let action = match job {
        Job::Opening { .. } => START_ACTION.to_owned(),
        Job::Round {
            epoch,
            round_id,
            segment_index,
        } => {
            let options = session
                .current_vote_round
                .as_ref()
                .map(|round| round.options.clone())
                .unwrap_or_default();
            // Every vote recorded before the seal counts; none can be recorded after it.
            let votes = store.seal_votes(session.id, epoch, segment_index).await?;
            let counted: Vec<_> = votes
                .iter()
                .filter(|vote| vote.round_id == round_id)
                .map(|vote| vote.choice.as_str())
                .collect();
            let result = tally(counted, &options).ok_or_else(|| {
                ServiceError::InvalidState(format!("round `{round_id}` has no options"))
            })?;
            info!(
                session_id = %session.id,
                %round_id,
                winner = %result.winner,
                total_votes = result.total_votes,
                "round tallied"
            );
            result.winner
        }
    };

    let beat = state
        .narrator()
        .narrate(&session.region, &session.history, &action)
        .await;

    let voting_window = state.config().voting_window;
    let committed = commit_transition(store, session.id, |current, machine| {
        if !job.is_pending(current) {
            return Ok(Decision::Keep(()));
        }
        match job {
            Job::Opening { .. } => {
                machine.fire(LifecycleEvent::PublishOpening)?;
            }
            Job::Round { .. } => {
                machine.fire(LifecycleEvent::ClaimTally)?;
                machine.fire(LifecycleEvent::AppendSegment)?;
            }
        }
        current.append_segment(
            beat.text.clone(),
            action.clone(),
            beat.options.clone(),
            state.now(),
            voting_window,
        );
        Ok(Decision::Commit(()))
    })
    .await?;

    if committed.written {
        Ok(TallyOutcome::Published {
            session: committed.session,
            action,
        })
    } else {
        debug!(session_id = %session.id, "session moved on during generation; segment discarded");
        Ok(TallyOutcome::Discarded {
            session: committed.session,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        dao::models::{VoteEntity, VoteWrite},
        state::{AppState, session::StorySession},
        test_support::{Harness, ScriptedGenerator, test_config},
    };

    /// Store a session with `users` joined and its opening published.
    async fn voting_session(harness: &Harness, users: &[&str]) -> StorySession {
        let now = harness.state.now();
        let mut session = StorySession::new("forest", now);
        session.version = 1;
        for user in users {
            session.add_participant(user, now);
        }
        harness
            .store()
            .create_session(session.clone().into())
            .await
            .unwrap();
        run_opening(&harness.state, session.id)
            .await
            .unwrap()
            .into_session()
    }

    async fn vote(harness: &Harness, session: &StorySession, user: &str, choice: &str) {
        let round = session.current_vote_round.as_ref().unwrap();
        let recorded = harness
            .store()
            .record_vote(VoteEntity {
                session_id: session.id,
                epoch: session.epoch,
                segment_index: round.segment_index,
                round_id: round.id,
                user_id: user.into(),
                choice: choice.into(),
                cast_at: harness.state.now(),
            })
            .await
            .unwrap();
        assert_eq!(recorded, VoteWrite::Recorded);
    }

    fn round_id(session: &StorySession) -> Uuid {
        session.current_vote_round.as_ref().unwrap().id
    }

    #[tokio::test]
    async fn opening_opens_a_round_with_three_options() {
        let harness = Harness::new().await;
        let session = voting_session(&harness, &["ana"]).await;

        assert_eq!(session.history.len(), 1);
        assert_eq!(session.history[0].chosen_action, START_ACTION);
        let round = session.current_vote_round.unwrap();
        assert_eq!(round.options, vec!["A", "B", "C"]);
        assert_eq!(round.segment_index, 0);
        assert_eq!(session.version, 2);
    }

    #[tokio::test]
    async fn majority_wins_once_everyone_voted() {
        let harness = Harness::new().await;
        let session = voting_session(&harness, &["ana", "ben", "cy"]).await;
        let round = round_id(&session);

        vote(&harness, &session, "ana", "A").await;
        vote(&harness, &session, "ben", "A").await;
        let early = request_tally(&harness.state, session.id, round, TallyTrigger::AllVoted)
            .await
            .unwrap();
        assert!(matches!(early, TallyOutcome::NotDue { .. }));

        vote(&harness, &session, "cy", "B").await;
        let outcome = request_tally(&harness.state, session.id, round, TallyTrigger::AllVoted)
            .await
            .unwrap();
        let TallyOutcome::Published { session, action } = outcome else {
            panic!("expected a published segment");
        };
        assert_eq!(action, "A");
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[1].chosen_action, "A");
        assert_ne!(round_id(&session), round);
    }

    #[tokio::test]
    async fn single_vote_wins_at_the_deadline() {
        let harness = Harness::new().await;
        let session = voting_session(&harness, &["ana", "ben"]).await;
        let round = round_id(&session);
        vote(&harness, &session, "ben", "B").await;

        let early = request_tally(&harness.state, session.id, round, TallyTrigger::Deadline)
            .await
            .unwrap();
        assert!(matches!(early, TallyOutcome::NotDue { .. }));

        harness.clock.advance(Duration::from_secs(31));
        let outcome = request_tally(&harness.state, session.id, round, TallyTrigger::Deadline)
            .await
            .unwrap();
        assert!(matches!(outcome, TallyOutcome::Published { ref action, .. } if action == "B"));
    }

    #[tokio::test]
    async fn empty_round_at_the_deadline_takes_the_first_option() {
        let harness = Harness::new().await;
        let session = voting_session(&harness, &["ana"]).await;
        harness.clock.advance(Duration::from_secs(31));

        let outcome = request_tally(&harness.state, session.id, round_id(&session), TallyTrigger::Deadline)
            .await
            .unwrap();
        assert!(matches!(outcome, TallyOutcome::Published { ref action, .. } if action == "A"));
    }

    #[tokio::test]
    async fn concurrent_triggers_generate_once() {
        let generator = ScriptedGenerator::new().with_delay(Duration::from_millis(50));
        let harness = Harness::with(test_config(), generator).await;
        let session = voting_session(&harness, &["ana"]).await;
        let round = round_id(&session);
        harness.clock.advance(Duration::from_secs(31));
        let calls_before = harness.generator.calls();

        let attempts = (0..8).map(|_| {
            let state = harness.state.clone();
            tokio::spawn(async move {
                request_tally(&state, session.id, round, TallyTrigger::Deadline).await
            })
        });
        let outcomes = futures::future::join_all(attempts).await;

        let mut published = 0;
        let mut segments = Vec::new();
        for outcome in outcomes {
            let outcome = outcome.unwrap().unwrap();
            if matches!(outcome, TallyOutcome::Published { .. }) {
                published += 1;
            }
            segments.push(outcome.into_session().history.len());
        }
        assert_eq!(published, 1);
        assert!(segments.iter().all(|len| *len == 2));
        assert_eq!(harness.generator.calls() - calls_before, 1);
        assert_eq!(harness.session(session.id).await.history.len(), 2);
    }

    #[tokio::test]
    async fn closed_rounds_are_not_tallied_again() {
        let harness = Harness::new().await;
        let session = voting_session(&harness, &["ana"]).await;
        let round = round_id(&session);
        harness.clock.advance(Duration::from_secs(31));
        request_tally(&harness.state, session.id, round, TallyTrigger::Deadline)
            .await
            .unwrap();

        let again = request_tally(&harness.state, session.id, round, TallyTrigger::Deadline)
            .await
            .unwrap();
        assert!(matches!(again, TallyOutcome::AlreadyClosed { .. }));
        assert_eq!(harness.session(session.id).await.history.len(), 2);
    }

    #[tokio::test]
    async fn expired_claims_are_taken_over() {
        let harness = Harness::new().await;
        let session = voting_session(&harness, &["ana"]).await;
        let round = session.current_vote_round.clone().unwrap();
        harness.clock.advance(Duration::from_secs(31));

        // A crashed holder left a claim that has already expired.
        let now = harness.state.now();
        let stale = TallyClaimEntity {
            key: ClaimKey::round(session.id, session.epoch, round.segment_index),
            claim_id: Uuid::new_v4(),
            holder: "crashed".into(),
            claimed_at: now - Duration::from_secs(200),
            expires_at: now - Duration::from_secs(110),
            status: ClaimStatusEntity::Held,
        };
        let store = harness.store();
        store.try_claim(stale.clone(), stale.claimed_at).await.unwrap();

        let outcome = request_tally(&harness.state, session.id, round.id, TallyTrigger::Deadline)
            .await
            .unwrap();
        assert!(matches!(outcome, TallyOutcome::Published { .. }));
        let claim = store.find_claim(stale.key).await.unwrap().unwrap();
        assert_ne!(claim.claim_id, stale.claim_id);
        assert_eq!(claim.status, ClaimStatusEntity::Completed);
    }

    #[tokio::test]
    async fn restart_during_generation_discards_the_segment() {
        let generator = ScriptedGenerator::new().with_delay(Duration::from_millis(100));
        let harness = Harness::with(test_config(), generator).await;
        let session = voting_session(&harness, &["ana"]).await;
        let round = round_id(&session);
        harness.clock.advance(Duration::from_secs(31));

        let tally = tokio::spawn({
            let state = harness.state.clone();
            let session_id = session.id;
            async move { request_tally(&state, session_id, round, TallyTrigger::Deadline).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Bump the epoch behind the tally's back, as a restart would.
        let mut restarted = harness.session(session.id).await;
        let expected = restarted.version;
        restarted.restart(harness.state.now());
        restarted.version += 1;
        assert!(
            harness
                .store()
                .replace_session(restarted.into(), expected)
                .await
                .unwrap()
        );

        let outcome = tally.await.unwrap().unwrap();
        assert!(matches!(outcome, TallyOutcome::Discarded { .. }));
        let stored = harness.session(session.id).await;
        assert_eq!(stored.epoch, 1);
        assert!(stored.history.is_empty());
        // The claim was released.
        let key = ClaimKey::round(session.id, 0, 0);
        assert!(harness.store().find_claim(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn the_tally_seals_the_ballot() {
        let harness = Harness::new().await;
        let session = voting_session(&harness, &["ana", "ben"]).await;
        let round = session.current_vote_round.clone().unwrap();
        vote(&harness, &session, "ana", "C").await;
        harness.clock.advance(Duration::from_secs(31));

        let outcome = request_tally(&harness.state, session.id, round.id, TallyTrigger::Deadline)
            .await
            .unwrap();
        assert!(matches!(outcome, TallyOutcome::Published { ref action, .. } if action == "C"));

        // Ben arrives once the round is tallied: nothing is stored for him.
        let late = harness
            .store()
            .record_vote(VoteEntity {
                session_id: session.id,
                epoch: session.epoch,
                segment_index: round.segment_index,
                round_id: round.id,
                user_id: "ben".into(),
                choice: "B".into(),
                cast_at: harness.state.now(),
            })
            .await
            .unwrap();
        assert_eq!(late, VoteWrite::Closed);
        let stored = harness
            .store()
            .list_votes(session.id, session.epoch, round.segment_index)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn observers_arm_the_next_round() {
        let generator = ScriptedGenerator::new().with_delay(Duration::from_millis(80));
        let harness = Harness::with(test_config(), generator.clone()).await;
        let session = voting_session(&harness, &["ana"]).await;
        let round = round_id(&session);
        harness.clock.advance(Duration::from_secs(31));

        // A second coordinator sharing the store and the clock.
        let peer = AppState::with_clock(
            test_config(),
            Arc::new(generator),
            harness.clock.clone(),
        );
        peer.install_session_store(harness.store()).await;

        let winner = tokio::spawn({
            let state = harness.state.clone();
            let session_id = session.id;
            async move { request_tally(&state, session_id, round, TallyTrigger::Deadline).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let observed = request_tally(&peer, session.id, round, TallyTrigger::Deadline)
            .await
            .unwrap();
        assert!(matches!(observed, TallyOutcome::Observed { .. }));
        let published = winner.await.unwrap().unwrap();
        assert!(matches!(published, TallyOutcome::Published { .. }));

        let next = harness.session(session.id).await;
        let next_round = next.current_vote_round.unwrap().id;
        assert_eq!(next.history.len(), 2);
        assert_ne!(next_round, round);
        for state in [&harness.state, &peer] {
            let armed = state.timers().get(&session.id).map(|timer| timer.round_id);
            assert_eq!(armed, Some(next_round));
        }
        assert_eq!(harness.generator.calls(), 2);
    }
}
