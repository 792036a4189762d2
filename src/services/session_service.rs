use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        models::{VoteEntity, VoteWrite},
        session_store::SessionStore,
    },
    dto::session::{
        CastVoteRequest, JoinSessionRequest, LeaveSessionRequest, SessionSnapshot, VoteAck,
        VoteRejection, option_counts,
    },
    error::ServiceError,
    services::{deadline_service, session_events, tally_service},
    state::{
        LifecycleEvent, SharedState,
        session::StorySession,
        state_machine::SessionStateMachine,
        tally::{TallyTrigger, all_voted, deadline_elapsed},
        transitions::{Decision, commit_transition, load_session},
    },
};

/// Result of [`cast_vote`]: rejections are reported to the voter, not raised.
#[derive(Debug)]
pub enum VoteOutcome {
    /// The vote is stored and will be counted.
    Accepted(VoteAck),
    /// The vote was not stored.
    Rejected(VoteRejection),
}

/// Join the active session of a region, creating it (and its opening) when needed.
pub async fn join_session(
    state: &SharedState,
    request: JoinSessionRequest,
) -> Result<SessionSnapshot, ServiceError> {
    let JoinSessionRequest { region, user_id } = request;
    if state.config().region_flavor(&region).is_none() {
        return Err(ServiceError::InvalidInput(format!("unknown region `{region}`")));
    }
    let store = state.require_session_store().await?;
    let now = state.now();

    let mut fresh = StorySession::new(region.as_str(), now);
    let mut machine = SessionStateMachine::new();
    machine.fire(LifecycleEvent::Create)?;
    fresh.version = machine.version();
    let fresh_id = fresh.id;

    let active = StorySession::from(store.create_session(fresh.into()).await?);
    if active.id == fresh_id {
        info!(session_id = %active.id, region = %region, "session created");
    }

    let committed = commit_transition(&store, active.id, |session, machine| {
        if session.is_participant(&user_id) {
            return Ok(Decision::Keep(()));
        }
        machine.fire(LifecycleEvent::Join)?;
        session.add_participant(&user_id, now);
        session.updated_at = now;
        Ok(Decision::Commit(()))
    })
    .await?;
    if committed.written {
        info!(session_id = %active.id, user_id = %user_id, "participant joined");
    }

    let mut session = committed.session;
    if session.history.is_empty() {
        session = tally_service::run_opening(state, session.id)
            .await?
            .into_session();
    }
    deadline_service::arm_timer(state, &session);

    snapshot_with_votes(&store, session).await
}

/// Authoritative snapshot used by clients to resync.
pub async fn get_session(
    state: &SharedState,
    session_id: Uuid,
) -> Result<SessionSnapshot, ServiceError> {
    let store = state.require_session_store().await?;
    let session = load_session(&store, session_id).await?;
    snapshot_with_votes(&store, session).await
}

/// Record a vote in the open round.
pub async fn cast_vote(
    state: &SharedState,
    session_id: Uuid,
    request: CastVoteRequest,
) -> Result<VoteOutcome, ServiceError> {
    let store = state.require_session_store().await?;
    let session = load_session(&store, session_id).await?;
    let CastVoteRequest {
        user_id,
        choice,
        round_id,
    } = request;

    let reject = |reason: VoteRejection| {
        debug!(%session_id, user_id = %user_id, ?reason, "vote rejected");
        Ok(VoteOutcome::Rejected(reason))
    };

    if session.is_completed() {
        return reject(VoteRejection::SessionCompleted);
    }
    let Some(round) = session.current_vote_round.clone() else {
        return reject(VoteRejection::RoundClosed);
    };
    if round_id.is_some_and(|requested| requested != round.id) {
        return reject(VoteRejection::StaleRound);
    }
    if !session.is_participant(&user_id) {
        return reject(VoteRejection::NotParticipant);
    }
    if !round.options.contains(&choice) {
        return reject(VoteRejection::InvalidChoice);
    }
    let now = state.now();
    if deadline_elapsed(&round, now) {
        return reject(VoteRejection::RoundClosed);
    }
    // Another instance may have opened this round; its deadline must fire here too.
    deadline_service::arm_timer(state, &session);

    let write = store
        .record_vote(VoteEntity {
            session_id,
            epoch: session.epoch,
            segment_index: round.segment_index,
            round_id: round.id,
            user_id: user_id.clone(),
            choice: choice.clone(),
            cast_at: now,
        })
        .await?;
    if write == VoteWrite::Closed {
        return reject(VoteRejection::RoundClosed);
    }

    let votes = store
        .list_votes(session_id, session.epoch, round.segment_index)
        .await?;
    let round = round.with_votes(votes);
    session_events::broadcast_vote_tally(state, session_id, &round);
    debug!(%session_id, round_id = %round.id, user_id = %user_id, choice = %choice, "vote recorded");

    if all_voted(session.participants.keys(), &round) {
        spawn_tally(state, session_id, round.id, TallyTrigger::AllVoted);
    }

    let (counts, total_votes) = option_counts(&round);
    Ok(VoteOutcome::Accepted(VoteAck {
        session_id,
        round_id: round.id,
        user_id,
        choice,
        counts,
        total_votes,
    }))
}

/// Start the story over under a new epoch.
pub async fn restart_session(
    state: &SharedState,
    session_id: Uuid,
) -> Result<SessionSnapshot, ServiceError> {
    let store = state.require_session_store().await?;
    let now = state.now();

    let committed = commit_transition(&store, session_id, |session, machine| {
        machine.fire(LifecycleEvent::Restart)?;
        session.restart(now);
        Ok(Decision::Commit(()))
    })
    .await?;

    deadline_service::cancel_timer(state, session_id);
    session_events::broadcast_session_restarted(state, &committed.session);
    info!(%session_id, epoch = committed.session.epoch, "session restarted");

    let session = tally_service::run_opening(state, session_id)
        .await?
        .into_session();
    deadline_service::arm_timer(state, &session);
    snapshot_with_votes(&store, session).await
}

/// Remove a participant. Their vote stays, and the remaining participants may now
/// all have voted.
pub async fn leave_session(
    state: &SharedState,
    session_id: Uuid,
    request: LeaveSessionRequest,
) -> Result<SessionSnapshot, ServiceError> {
    let store = state.require_session_store().await?;
    let now = state.now();
    let user_id = request.user_id;

    let committed = commit_transition(&store, session_id, |session, machine| {
        if !session.is_participant(&user_id) {
            return Ok(Decision::Keep(()));
        }
        machine.fire(LifecycleEvent::Leave)?;
        session.remove_participant(&user_id);
        session.updated_at = now;
        Ok(Decision::Commit(()))
    })
    .await?;
    if committed.written {
        info!(%session_id, user_id = %user_id, "participant left");
    }

    let session = with_round_votes(&store, committed.session).await?;
    if let Some(round) = &session.current_vote_round
        && all_voted(session.participants.keys(), round)
    {
        spawn_tally(state, session_id, round.id, TallyTrigger::AllVoted);
    }
    Ok(SessionSnapshot::from(&session))
}

/// Mark the session completed. Completing twice is a no-op.
pub async fn complete_session(
    state: &SharedState,
    session_id: Uuid,
) -> Result<SessionSnapshot, ServiceError> {
    let store = state.require_session_store().await?;
    let now = state.now();

    let committed = commit_transition(&store, session_id, |session, machine| {
        if session.is_completed() {
            return Ok(Decision::Keep(()));
        }
        machine.fire(LifecycleEvent::Complete)?;
        session.complete(now);
        Ok(Decision::Commit(()))
    })
    .await?;

    if committed.written {
        deadline_service::cancel_timer(state, session_id);
        session_events::broadcast_session_completed(state, session_id);
        info!(%session_id, segments = committed.session.history.len(), "session completed");
    }
    Ok(SessionSnapshot::from(&committed.session))
}

fn spawn_tally(state: &SharedState, session_id: Uuid, round_id: Uuid, trigger: TallyTrigger) {
    let state = state.clone();
    tokio::spawn(async move {
        match tally_service::request_tally(&state, session_id, round_id, trigger).await {
            Ok(outcome) => debug!(%session_id, %round_id, ?trigger, published = matches!(outcome, tally_service::TallyOutcome::Published { .. }), "early tally finished"),
            Err(err) => warn!(%session_id, %round_id, ?trigger, error = %err, "early tally failed"),
        }
    });
}

async fn with_round_votes(
    store: &Arc<dyn SessionStore>,
    mut session: StorySession,
) -> Result<StorySession, ServiceError> {
    if let Some(round) = session.current_vote_round.take() {
        let votes = store
            .list_votes(session.id, session.epoch, round.segment_index)
            .await?;
        session.current_vote_round = Some(round.with_votes(votes));
    }
    Ok(session)
}

async fn snapshot_with_votes(
    store: &Arc<dyn SessionStore>,
    session: StorySession,
) -> Result<SessionSnapshot, ServiceError> {
    let session = with_round_votes(store, session).await?;
    Ok(SessionSnapshot::from(&session))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::{Duration, SystemTime},
    };

    use futures::future::BoxFuture;

    use super::*;
    use crate::{
        dao::{
            models::{ClaimAttempt, ClaimKey, SessionEntity, TallyClaimEntity},
            session_store::memory::MemorySessionStore,
            storage::StorageResult,
        },
        dto::session::SessionStatusDto,
        services::{
            session_events::{EVENT_SEGMENT_PUBLISHED, EVENT_SESSION_RESTARTED},
            tally_service::TallyOutcome,
        },
        state::{AppState, channel::session_topic, session::START_ACTION},
        test_support::{Harness, ManualClock, ScriptedGenerator, test_config},
    };

    /// Memory store that lets a deadline tally run to completion right before the
    /// next vote write reaches the store.
    #[derive(Clone)]
    struct TallyBeforeVote {
        inner: MemorySessionStore,
        clock: Arc<ManualClock>,
        state: Arc<Mutex<Option<SharedState>>>,
        tallied: Arc<Mutex<Option<TallyOutcome>>>,
    }

    impl SessionStore for TallyBeforeVote {
        fn find_session(
            &self,
            id: Uuid,
        ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
            self.inner.find_session(id)
        }

        fn find_active_session(
            &self,
            region: String,
        ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
            self.inner.find_active_session(region)
        }

        fn list_active_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<SessionEntity>>> {
            self.inner.list_active_sessions()
        }

        fn create_session(
            &self,
            session: SessionEntity,
        ) -> BoxFuture<'static, StorageResult<SessionEntity>> {
            self.inner.create_session(session)
        }

        fn replace_session(
            &self,
            session: SessionEntity,
            expected_version: u64,
        ) -> BoxFuture<'static, StorageResult<bool>> {
            self.inner.replace_session(session, expected_version)
        }

        fn record_vote(&self, vote: VoteEntity) -> BoxFuture<'static, StorageResult<VoteWrite>> {
            let store = self.clone();
            Box::pin(async move {
                let state = store.state.lock().unwrap().take();
                if let Some(state) = state {
                    store.clock.advance(Duration::from_secs(2));
                    let outcome = tally_service::request_tally(
                        &state,
                        vote.session_id,
                        vote.round_id,
                        TallyTrigger::Deadline,
                    )
                    .await
                    .unwrap();
                    *store.tallied.lock().unwrap() = Some(outcome);
                }
                store.inner.record_vote(vote).await
            })
        }

        fn list_votes(
            &self,
            session_id: Uuid,
            epoch: u64,
            segment_index: usize,
        ) -> BoxFuture<'static, StorageResult<Vec<VoteEntity>>> {
            self.inner.list_votes(session_id, epoch, segment_index)
        }

        fn seal_votes(
            &self,
            session_id: Uuid,
            epoch: u64,
            segment_index: usize,
        ) -> BoxFuture<'static, StorageResult<Vec<VoteEntity>>> {
            self.inner.seal_votes(session_id, epoch, segment_index)
        }

        fn try_claim(
            &self,
            claim: TallyClaimEntity,
            now: SystemTime,
        ) -> BoxFuture<'static, StorageResult<ClaimAttempt>> {
            self.inner.try_claim(claim, now)
        }

        fn find_claim(
            &self,
            key: ClaimKey,
        ) -> BoxFuture<'static, StorageResult<Option<TallyClaimEntity>>> {
            self.inner.find_claim(key)
        }

        fn complete_claim(
            &self,
            key: ClaimKey,
            claim_id: Uuid,
        ) -> BoxFuture<'static, StorageResult<bool>> {
            self.inner.complete_claim(key, claim_id)
        }

        fn release_claim(
            &self,
            key: ClaimKey,
            claim_id: Uuid,
        ) -> BoxFuture<'static, StorageResult<bool>> {
            self.inner.release_claim(key, claim_id)
        }

        fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
            self.inner.health_check()
        }

        fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
            self.inner.try_reconnect()
        }
    }

    fn join(region: &str, user: &str) -> JoinSessionRequest {
        JoinSessionRequest {
            region: region.into(),
            user_id: user.into(),
        }
    }

    fn ballot(user: &str, choice: &str, round_id: Option<Uuid>) -> CastVoteRequest {
        CastVoteRequest {
            user_id: user.into(),
            choice: choice.into(),
            round_id,
        }
    }

    async fn accepted(harness: &Harness, session_id: Uuid, user: &str, choice: &str) -> VoteAck {
        match cast_vote(&harness.state, session_id, ballot(user, choice, None))
            .await
            .unwrap()
        {
            VoteOutcome::Accepted(ack) => ack,
            VoteOutcome::Rejected(reason) => panic!("vote rejected: {reason:?}"),
        }
    }

    async fn rejection(
        harness: &Harness,
        session_id: Uuid,
        request: CastVoteRequest,
    ) -> VoteRejection {
        match cast_vote(&harness.state, session_id, request).await.unwrap() {
            VoteOutcome::Rejected(reason) => reason,
            VoteOutcome::Accepted(ack) => panic!("vote accepted: {ack:?}"),
        }
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let harness = Harness::new().await;
        let first = join_session(&harness.state, join("forest", "ana")).await.unwrap();
        let again = join_session(&harness.state, join("forest", "ana")).await.unwrap();

        assert_eq!(first.session_id, again.session_id);
        assert_eq!(again.participants.len(), 1);
        assert_eq!(again.history.len(), 1);
        assert_eq!(again.history[0].chosen_action, START_ACTION);
        assert_eq!(again.vote_round.unwrap().options, vec!["A", "B", "C"]);
        assert_eq!(harness.generator.calls(), 1);
    }

    #[tokio::test]
    async fn regions_get_their_own_sessions() {
        let harness = Harness::new().await;
        let forest = join_session(&harness.state, join("forest", "ana")).await.unwrap();
        let desert = join_session(&harness.state, join("desert", "ana")).await.unwrap();
        assert_ne!(forest.session_id, desert.session_id);

        let result = join_session(&harness.state, join("atlantis", "ana")).await;
        assert!(matches!(result, Err(ServiceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn concurrent_joins_share_one_session() {
        let harness = Harness::new().await;
        let joins = ["ana", "ben", "cy", "dee"].map(|user| {
            let state = harness.state.clone();
            tokio::spawn(async move { join_session(&state, join("harbor", user)).await })
        });
        let snapshots: Vec<_> = futures::future::join_all(joins)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let session_id = snapshots[0].session_id;
        assert!(snapshots.iter().all(|s| s.session_id == session_id));
        let session = harness.session(session_id).await;
        assert_eq!(session.participants.len(), 4);
        assert_eq!(session.history.len(), 1);
        assert_eq!(harness.generator.calls(), 1);
    }

    #[tokio::test]
    async fn majority_of_three_votes_wins() {
        let harness = Harness::new().await;
        let snapshot = join_session(&harness.state, join("forest", "ana")).await.unwrap();
        join_session(&harness.state, join("forest", "ben")).await.unwrap();
        join_session(&harness.state, join("forest", "cy")).await.unwrap();
        let id = snapshot.session_id;

        accepted(&harness, id, "ana", "A").await;
        accepted(&harness, id, "ben", "A").await;
        let ack = accepted(&harness, id, "cy", "B").await;
        assert_eq!(ack.total_votes, 3);
        assert_eq!(ack.counts[0].votes, 2);

        let session = harness.wait_for(id, |s| s.history.len() == 2).await;
        assert_eq!(session.history[1].chosen_action, "A");
        assert_eq!(session.current_vote_round.unwrap().segment_index, 1);
    }

    #[tokio::test]
    async fn changing_a_vote_keeps_one_ballot() {
        let harness = Harness::new().await;
        let snapshot = join_session(&harness.state, join("forest", "ana")).await.unwrap();
        join_session(&harness.state, join("forest", "ben")).await.unwrap();

        accepted(&harness, snapshot.session_id, "ana", "A").await;
        let ack = accepted(&harness, snapshot.session_id, "ana", "C").await;
        assert_eq!(ack.total_votes, 1);
        assert_eq!(ack.counts[2].votes, 1);
    }

    #[tokio::test]
    async fn invalid_votes_are_rejected() {
        let harness = Harness::new().await;
        let snapshot = join_session(&harness.state, join("forest", "ana")).await.unwrap();
        let id = snapshot.session_id;

        assert_eq!(
            rejection(&harness, id, ballot("ana", "Z", None)).await,
            VoteRejection::InvalidChoice
        );
        assert_eq!(
            rejection(&harness, id, ballot("zed", "A", None)).await,
            VoteRejection::NotParticipant
        );
        assert_eq!(
            rejection(&harness, id, ballot("ana", "A", Some(Uuid::new_v4()))).await,
            VoteRejection::StaleRound
        );

        harness.clock.advance(Duration::from_secs(31));
        assert_eq!(
            rejection(&harness, id, ballot("ana", "A", None)).await,
            VoteRejection::RoundClosed
        );
    }

    #[tokio::test]
    async fn restart_rejects_votes_for_the_old_round() {
        let harness = Harness::new().await;
        let before = join_session(&harness.state, join("forest", "ana")).await.unwrap();
        join_session(&harness.state, join("forest", "ben")).await.unwrap();
        let old_round = before.vote_round.unwrap().round_id;
        accepted(&harness, before.session_id, "ana", "B").await;

        let mut events = harness
            .state
            .channel()
            .subscribe(&session_topic(before.session_id));
        let after = restart_session(&harness.state, before.session_id)
            .await
            .unwrap();

        assert_eq!(after.epoch, 1);
        assert_eq!(after.history.len(), 1);
        let round = after.vote_round.unwrap();
        assert_ne!(round.round_id, old_round);
        assert_eq!(round.options.len(), 3);
        assert_eq!(round.total_votes, 0);

        let restarted = events.recv().await.unwrap();
        assert!(restarted.is(EVENT_SESSION_RESTARTED));
        assert!(restarted.data.contains(r#""history":[]"#));
        assert!(events.recv().await.unwrap().is(EVENT_SEGMENT_PUBLISHED));

        assert_eq!(
            rejection(&harness, before.session_id, ballot("ana", "A", Some(old_round))).await,
            VoteRejection::StaleRound
        );
    }

    #[tokio::test]
    async fn leaving_can_complete_the_ballot() {
        let harness = Harness::new().await;
        let snapshot = join_session(&harness.state, join("forest", "ana")).await.unwrap();
        join_session(&harness.state, join("forest", "ben")).await.unwrap();
        accepted(&harness, snapshot.session_id, "ana", "C").await;

        let left = leave_session(
            &harness.state,
            snapshot.session_id,
            LeaveSessionRequest {
                user_id: "ben".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(left.participants.len(), 1);

        let session = harness
            .wait_for(snapshot.session_id, |s| s.history.len() == 2)
            .await;
        assert_eq!(session.history[1].chosen_action, "C");
    }

    #[tokio::test]
    async fn completion_is_idempotent_and_final() {
        let harness = Harness::new().await;
        let snapshot = join_session(&harness.state, join("forest", "ana")).await.unwrap();
        let id = snapshot.session_id;

        let done = complete_session(&harness.state, id).await.unwrap();
        assert_eq!(done.status, SessionStatusDto::Completed);
        assert!(done.vote_round.is_none());
        let version = done.version;
        let again = complete_session(&harness.state, id).await.unwrap();
        assert_eq!(again.version, version);
        assert!(harness.state.timers().is_empty());

        assert_eq!(
            rejection(&harness, id, ballot("ana", "A", None)).await,
            VoteRejection::SessionCompleted
        );
        assert!(matches!(
            restart_session(&harness.state, id).await,
            Err(ServiceError::InvalidState(_))
        ));

        // The region gets a fresh session.
        let next = join_session(&harness.state, join("forest", "ana")).await.unwrap();
        assert_ne!(next.session_id, id);
    }

    #[tokio::test]
    async fn votes_racing_the_tally_are_rejected_not_lost() {
        let clock = Arc::new(ManualClock::new(SystemTime::now()));
        let store = TallyBeforeVote {
            inner: MemorySessionStore::new(),
            clock: clock.clone(),
            state: Arc::new(Mutex::new(None)),
            tallied: Arc::new(Mutex::new(None)),
        };
        let state = AppState::with_clock(
            test_config(),
            Arc::new(ScriptedGenerator::new()),
            clock.clone(),
        );
        state.install_session_store(Arc::new(store.clone())).await;

        let snapshot = join_session(&state, join("forest", "ana")).await.unwrap();
        join_session(&state, join("forest", "ben")).await.unwrap();
        let round = snapshot.vote_round.unwrap().round_id;

        // Ben passes every check one second before the deadline; the deadline tally
        // then closes the round before his write lands.
        clock.advance(Duration::from_secs(29));
        *store.state.lock().unwrap() = Some(state.clone());

        let outcome = cast_vote(&state, snapshot.session_id, ballot("ben", "B", Some(round)))
            .await
            .unwrap();

        let tallied = store.tallied.lock().unwrap().take();
        assert!(matches!(tallied, Some(TallyOutcome::Published { ref action, .. }) if action == "A"));
        assert!(matches!(
            outcome,
            VoteOutcome::Rejected(VoteRejection::RoundClosed)
        ));
        let stored = store
            .inner
            .list_votes(snapshot.session_id, 0, 0)
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn votes_arm_the_round_timer() {
        let harness = Harness::new().await;
        let snapshot = join_session(&harness.state, join("forest", "ana")).await.unwrap();
        join_session(&harness.state, join("forest", "ben")).await.unwrap();
        // Another instance opened the round; this one never saw it.
        harness.state.timers().clear();

        accepted(&harness, snapshot.session_id, "ana", "A").await;
        let armed = harness
            .state
            .timers()
            .get(&snapshot.session_id)
            .map(|timer| timer.round_id);
        assert_eq!(armed, snapshot.vote_round.map(|round| round.round_id));
    }

    #[tokio::test]
    async fn degraded_mode_fails_closed() {
        let harness = Harness::new().await;
        harness.state.clear_session_store().await;
        let result = join_session(&harness.state, join("forest", "ana")).await;
        assert!(matches!(result, Err(ServiceError::Degraded)));
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_unavailable() {
        let harness = Harness::new().await;
        let snapshot = join_session(&harness.state, join("forest", "ana")).await.unwrap();
        harness.store.set_offline(true);

        let result = get_session(&harness.state, snapshot.session_id).await;
        assert!(matches!(result, Err(ServiceError::Unavailable(_))));
    }
}
