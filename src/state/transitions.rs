use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::{
    dao::session_store::SessionStore,
    error::ServiceError,
    state::{session::StorySession, state_machine::SessionStateMachine},
};

/// Bound on optimistic retries before a write is reported as contended.
const MAX_CAS_ATTEMPTS: u32 = 8;

/// What a mutation decided after inspecting the freshest session.
pub enum Decision<T> {
    /// Write the mutated session back.
    Commit(T),
    /// Leave the stored session untouched.
    Keep(T),
}

/// Result of [`commit_transition`].
pub struct Committed<T> {
    /// The session as stored after the call.
    pub session: StorySession,
    /// What `mutate` returned on its last run.
    pub value: T,
    /// Whether this call wrote the session.
    pub written: bool,
}

/// Load the session, let `mutate` validate its events against the state machine and
/// change the session, then compare-and-swap it back. Lost races reload and retry.
///
/// `mutate` may run several times and must not mutate when it returns
/// [`Decision::Keep`].
pub async fn commit_transition<T, F>(
    store: &Arc<dyn SessionStore>,
    session_id: Uuid,
    mut mutate: F,
) -> Result<Committed<T>, ServiceError>
where
    F: FnMut(&mut StorySession, &mut SessionStateMachine) -> Result<Decision<T>, ServiceError>,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let mut session = load_session(store, session_id).await?;
        let mut machine = SessionStateMachine::resume(session.phase(), session.version);

        let value = match mutate(&mut session, &mut machine)? {
            Decision::Keep(value) => {
                return Ok(Committed {
                    session,
                    value,
                    written: false,
                });
            }
            Decision::Commit(value) => value,
        };

        if !machine.is_dirty() {
            return Err(ServiceError::InvalidState(
                "session write without a lifecycle event".into(),
            ));
        }

        session.version = machine.version();
        if store
            .replace_session(session.clone().into(), machine.expected_version())
            .await?
        {
            return Ok(Committed {
                session,
                value,
                written: true,
            });
        }
        debug!(%session_id, attempt, "session write lost a race; reloading");
    }

    Err(ServiceError::Contention(session_id))
}

/// Load a session or fail with [`ServiceError::NotFound`].
pub async fn load_session(
    store: &Arc<dyn SessionStore>,
    session_id: Uuid,
) -> Result<StorySession, ServiceError> {
    store
        .find_session(session_id)
        .await?
        .map(StorySession::from)
        .ok_or_else(|| ServiceError::NotFound(format!("session `{session_id}` not found")))
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::{
        dao::session_store::memory::MemorySessionStore, state::state_machine::LifecycleEvent,
    };

    async fn stored_session(store: &Arc<dyn SessionStore>) -> StorySession {
        let mut session = StorySession::new("forest", SystemTime::now());
        session.version = 1;
        store.create_session(session.clone().into()).await.unwrap();
        session
    }

    #[tokio::test]
    async fn committed_writes_bump_the_version() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let session = stored_session(&store).await;

        let committed = commit_transition(&store, session.id, |session, machine| {
            machine.fire(LifecycleEvent::Join)?;
            session.add_participant("ana", SystemTime::now());
            Ok(Decision::Commit(()))
        })
        .await
        .unwrap();

        assert!(committed.written);
        assert_eq!(committed.session.version, 2);
        let stored = load_session(&store, session.id).await.unwrap();
        assert!(stored.is_participant("ana"));
    }

    #[tokio::test]
    async fn concurrent_writers_both_land() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let session_id = stored_session(&store).await.id;

        let join = |user: &'static str| {
            let store = store.clone();
            async move {
                commit_transition(&store, session_id, |session, machine| {
                    machine.fire(LifecycleEvent::Join)?;
                    session.add_participant(user, SystemTime::now());
                    Ok(Decision::Commit(()))
                })
                .await
            }
        };
        let (a, b) = tokio::join!(join("ana"), join("ben"));
        a.unwrap();
        b.unwrap();

        let stored = load_session(&store, session_id).await.unwrap();
        assert_eq!(stored.participants.len(), 2);
        assert_eq!(stored.version, 3);
    }

    #[tokio::test]
    async fn invalid_events_abort_without_writing() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let session = stored_session(&store).await;

        let result = commit_transition(&store, session.id, |_, machine| {
            machine.fire(LifecycleEvent::ClaimTally)?;
            Ok(Decision::Commit(()))
        })
        .await;

        assert!(matches!(result, Err(ServiceError::InvalidState(_))));
        assert_eq!(load_session(&store, session.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn missing_sessions_are_not_found() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let result = commit_transition(&store, Uuid::new_v4(), |_, _| Ok(Decision::Keep(()))).await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }
}
