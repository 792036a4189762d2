use std::{sync::Arc, time::SystemTime};

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{Collection, Database, IndexModel, bson::doc, options::IndexOptions};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult, is_duplicate_key},
    models::{
        MongoBallotDocument, MongoClaimDocument, MongoRegionDocument, MongoSessionDocument,
        claim_filter, doc_id, version_field,
    },
};
use crate::dao::{
    models::{
        BallotEntity, ClaimAttempt, ClaimKey, SessionEntity, TallyClaimEntity, VoteEntity,
        VoteWrite, ballot_key,
    },
    session_store::SessionStore,
    storage::StorageResult,
};

const SESSION_COLLECTION: &str = "sessions";
const REGION_COLLECTION: &str = "regions";
const BALLOT_COLLECTION: &str = "ballots";
const CLAIM_COLLECTION: &str = "tally_claims";
const MAX_REGION_ATTEMPTS: u32 = 5;
/// Every voter of a round writes the same ballot document.
const MAX_BALLOT_ATTEMPTS: u32 = 32;

/// [`SessionStore`] backed by MongoDB. Conditional writes rely on filtered
/// replaces and on the uniqueness of `_id`.
#[derive(Clone)]
pub struct MongoSessionStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    database: RwLock<Database>,
    config: MongoConfig,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = self.database.read().await.clone();
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (_, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        *self.database.write().await = database;
        Ok(())
    }
}

impl MongoSessionStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (_, database) = establish_connection(&config.options, &config.database_name).await?;
        let store = Self {
            inner: Arc::new(MongoInner {
                database: RwLock::new(database),
                config,
            }),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let index = IndexModel::builder()
            .keys(doc! { "active": 1 })
            .options(
                IndexOptions::builder()
                    .name(Some("session_active_idx".to_owned()))
                    .build(),
            )
            .build();
        self.sessions()
            .await
            .create_index(index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: SESSION_COLLECTION,
                index: "active",
                source,
            })?;
        Ok(())
    }

    async fn database(&self) -> Database {
        self.inner.database.read().await.clone()
    }

    async fn sessions(&self) -> Collection<MongoSessionDocument> {
        self.database().await.collection(SESSION_COLLECTION)
    }

    async fn regions(&self) -> Collection<MongoRegionDocument> {
        self.database().await.collection(REGION_COLLECTION)
    }

    async fn ballots(&self) -> Collection<MongoBallotDocument> {
        self.database().await.collection(BALLOT_COLLECTION)
    }

    async fn claims(&self) -> Collection<MongoClaimDocument> {
        self.database().await.collection(CLAIM_COLLECTION)
    }

    async fn find_session(&self, id: Uuid) -> MongoResult<Option<SessionEntity>> {
        let document = self
            .sessions()
            .await
            .find_one(doc_id(id))
            .await
            .map_err(MongoDaoError::operation(SESSION_COLLECTION, "find"))?;
        Ok(document.map(|document| document.session))
    }

    async fn find_active_session(&self, region: &str) -> MongoResult<Option<SessionEntity>> {
        let pointer = self
            .regions()
            .await
            .find_one(doc_id(region))
            .await
            .map_err(MongoDaoError::operation(REGION_COLLECTION, "find"))?;
        let Some(pointer) = pointer else {
            return Ok(None);
        };
        let document = self
            .sessions()
            .await
            .find_one(doc! { "_id": pointer.session_id, "active": true })
            .await
            .map_err(MongoDaoError::operation(SESSION_COLLECTION, "find"))?;
        Ok(document.map(|document| document.session))
    }

    async fn list_active_sessions(&self) -> MongoResult<Vec<SessionEntity>> {
        let cursor = self
            .sessions()
            .await
            .find(doc! { "active": true })
            .await
            .map_err(MongoDaoError::operation(SESSION_COLLECTION, "find"))?;
        let documents: Vec<MongoSessionDocument> = cursor
            .try_collect()
            .await
            .map_err(MongoDaoError::operation(SESSION_COLLECTION, "find"))?;
        Ok(documents.into_iter().map(|document| document.session).collect())
    }

    /// Insert the session, then claim the region pointer: insert when absent, or
    /// swing it with a filter on the previous (no longer active) session id.
    async fn create_session(&self, session: SessionEntity) -> MongoResult<SessionEntity> {
        let regions = self.regions().await;
        let sessions = self.sessions().await;
        let session_id = session.id.to_string();
        let mut session_written = false;

        for _ in 0..MAX_REGION_ATTEMPTS {
            if let Some(existing) = self.find_active_session(&session.region).await? {
                if session_written {
                    if let Err(err) = sessions.delete_one(doc_id(&session_id)).await {
                        warn!(session_id = %session_id, error = %err, "failed to delete orphaned session");
                    }
                }
                return Ok(existing);
            }

            if !session_written {
                sessions
                    .insert_one(MongoSessionDocument::from(session.clone()))
                    .await
                    .map_err(MongoDaoError::operation(SESSION_COLLECTION, "insert"))?;
                session_written = true;
            }

            let pointer = regions
                .find_one(doc_id(&session.region))
                .await
                .map_err(MongoDaoError::operation(REGION_COLLECTION, "find"))?;

            let swung = match pointer {
                None => match regions
                    .insert_one(MongoRegionDocument {
                        region: session.region.clone(),
                        session_id: session_id.clone(),
                    })
                    .await
                {
                    Ok(_) => true,
                    Err(err) if is_duplicate_key(&err) => false,
                    Err(err) => return Err(MongoDaoError::operation(REGION_COLLECTION, "insert")(err)),
                },
                Some(previous) => {
                    let still_active = sessions
                        .find_one(doc! { "_id": &previous.session_id, "active": true })
                        .await
                        .map_err(MongoDaoError::operation(SESSION_COLLECTION, "find"))?
                        .is_some();
                    if still_active {
                        continue;
                    }
                    let result = regions
                        .update_one(
                            doc! { "_id": &session.region, "session_id": previous.session_id },
                            doc! { "$set": { "session_id": &session_id } },
                        )
                        .await
                        .map_err(MongoDaoError::operation(REGION_COLLECTION, "update"))?;
                    result.modified_count == 1
                }
            };

            if swung {
                return Ok(session);
            }
        }

        Err(MongoDaoError::RegionContention {
            region: session.region,
            attempts: MAX_REGION_ATTEMPTS,
        })
    }

    async fn replace_session(
        &self,
        session: SessionEntity,
        expected_version: u64,
    ) -> MongoResult<bool> {
        let filter = doc! {
            "_id": session.id.to_string(),
            "version": version_field(expected_version),
        };
        let result = self
            .sessions()
            .await
            .replace_one(filter, MongoSessionDocument::from(session))
            .await
            .map_err(MongoDaoError::operation(SESSION_COLLECTION, "replace"))?;
        Ok(result.matched_count == 1)
    }

    /// Read-modify-write the ballot of one round: insert it when absent, otherwise
    /// replace it filtered on the revision we read. `change` reports whether the
    /// ballot needs writing.
    async fn update_ballot<T, F>(
        &self,
        session_id: Uuid,
        epoch: u64,
        segment_index: usize,
        mut change: F,
    ) -> MongoResult<T>
    where
        F: FnMut(&mut BallotEntity) -> (T, bool),
    {
        let ballots = self.ballots().await;
        let key = ballot_key(session_id, epoch, segment_index);

        for _ in 0..MAX_BALLOT_ATTEMPTS {
            let current = ballots
                .find_one(doc_id(&key))
                .await
                .map_err(MongoDaoError::operation(BALLOT_COLLECTION, "find"))?;

            match current {
                None => {
                    let mut ballot = BallotEntity::open(session_id, epoch, segment_index);
                    let (result, dirty) = change(&mut ballot);
                    if !dirty {
                        return Ok(result);
                    }
                    match ballots.insert_one(MongoBallotDocument::first(ballot)).await {
                        Ok(_) => return Ok(result),
                        Err(err) if is_duplicate_key(&err) => continue,
                        Err(err) => {
                            return Err(MongoDaoError::operation(BALLOT_COLLECTION, "insert")(err));
                        }
                    }
                }
                Some(mut document) => {
                    let (result, dirty) = change(&mut document.ballot);
                    if !dirty {
                        return Ok(result);
                    }
                    let filter = document.revision_filter();
                    let outcome = ballots
                        .replace_one(filter, document.next_revision())
                        .await
                        .map_err(MongoDaoError::operation(BALLOT_COLLECTION, "replace"))?;
                    if outcome.matched_count == 1 {
                        return Ok(result);
                    }
                }
            }
        }

        Err(MongoDaoError::BallotContention {
            key,
            attempts: MAX_BALLOT_ATTEMPTS,
        })
    }

    async fn record_vote(&self, vote: VoteEntity) -> MongoResult<VoteWrite> {
        let (session_id, epoch, segment_index) = (vote.session_id, vote.epoch, vote.segment_index);
        self.update_ballot(session_id, epoch, segment_index, |ballot| {
            let outcome = ballot.record(vote.clone());
            (outcome, outcome == VoteWrite::Recorded)
        })
        .await
    }

    async fn list_votes(
        &self,
        session_id: Uuid,
        epoch: u64,
        segment_index: usize,
    ) -> MongoResult<Vec<VoteEntity>> {
        let document = self
            .ballots()
            .await
            .find_one(doc_id(ballot_key(session_id, epoch, segment_index)))
            .await
            .map_err(MongoDaoError::operation(BALLOT_COLLECTION, "find"))?;
        Ok(document
            .map(|document| document.ballot.votes)
            .unwrap_or_default())
    }

    async fn seal_votes(
        &self,
        session_id: Uuid,
        epoch: u64,
        segment_index: usize,
    ) -> MongoResult<Vec<VoteEntity>> {
        self.update_ballot(session_id, epoch, segment_index, |ballot| {
            let dirty = ballot.seal();
            (ballot.votes.clone(), dirty)
        })
        .await
    }

    async fn try_claim(&self, claim: TallyClaimEntity, now: SystemTime) -> MongoResult<ClaimAttempt> {
        let claims = self.claims().await;
        let key = claim.key;

        match claims.insert_one(MongoClaimDocument::from(claim.clone())).await {
            Ok(_) => return Ok(ClaimAttempt::Acquired),
            Err(err) if is_duplicate_key(&err) => {}
            Err(err) => return Err(MongoDaoError::operation(CLAIM_COLLECTION, "insert")(err)),
        }

        let Some(existing) = self.find_claim(key).await? else {
            // Released between our insert and read; the next trigger will retry.
            return Ok(ClaimAttempt::Held(claim));
        };
        if !existing.is_takeover_allowed(now) {
            return Ok(ClaimAttempt::Held(existing));
        }

        let mut filter = claim_filter(key, existing.claim_id);
        filter.insert("completed", false);
        let result = claims
            .replace_one(filter, MongoClaimDocument::from(claim))
            .await
            .map_err(MongoDaoError::operation(CLAIM_COLLECTION, "replace"))?;
        if result.matched_count == 1 {
            return Ok(ClaimAttempt::Acquired);
        }

        match self.find_claim(key).await? {
            Some(winner) => Ok(ClaimAttempt::Held(winner)),
            None => Ok(ClaimAttempt::Held(existing)),
        }
    }

    async fn find_claim(&self, key: ClaimKey) -> MongoResult<Option<TallyClaimEntity>> {
        let document = self
            .claims()
            .await
            .find_one(doc_id(key))
            .await
            .map_err(MongoDaoError::operation(CLAIM_COLLECTION, "find"))?;
        Ok(document.map(|document| document.claim))
    }

    async fn complete_claim(&self, key: ClaimKey, claim_id: Uuid) -> MongoResult<bool> {
        let result = self
            .claims()
            .await
            .update_one(
                claim_filter(key, claim_id),
                doc! { "$set": { "completed": true, "claim.status": "completed" } },
            )
            .await
            .map_err(MongoDaoError::operation(CLAIM_COLLECTION, "update"))?;
        Ok(result.matched_count == 1)
    }

    async fn release_claim(&self, key: ClaimKey, claim_id: Uuid) -> MongoResult<bool> {
        let result = self
            .claims()
            .await
            .delete_one(claim_filter(key, claim_id))
            .await
            .map_err(MongoDaoError::operation(CLAIM_COLLECTION, "delete"))?;
        Ok(result.deleted_count == 1)
    }
}

impl SessionStore for MongoSessionStore {
    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_session(id).await.map_err(Into::into) })
    }

    fn find_active_session(
        &self,
        region: String,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_active_session(&region).await.map_err(Into::into) })
    }

    fn list_active_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list_active_sessions().await.map_err(Into::into) })
    }

    fn create_session(
        &self,
        session: SessionEntity,
    ) -> BoxFuture<'static, StorageResult<SessionEntity>> {
        let store = self.clone();
        Box::pin(async move { store.create_session(session).await.map_err(Into::into) })
    }

    fn replace_session(
        &self,
        session: SessionEntity,
        expected_version: u64,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .replace_session(session, expected_version)
                .await
                .map_err(Into::into)
        })
    }

    fn record_vote(&self, vote: VoteEntity) -> BoxFuture<'static, StorageResult<VoteWrite>> {
        let store = self.clone();
        Box::pin(async move { store.record_vote(vote).await.map_err(Into::into) })
    }

    fn list_votes(
        &self,
        session_id: Uuid,
        epoch: u64,
        segment_index: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<VoteEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .list_votes(session_id, epoch, segment_index)
                .await
                .map_err(Into::into)
        })
    }

    fn seal_votes(
        &self,
        session_id: Uuid,
        epoch: u64,
        segment_index: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<VoteEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .seal_votes(session_id, epoch, segment_index)
                .await
                .map_err(Into::into)
        })
    }

    fn try_claim(
        &self,
        claim: TallyClaimEntity,
        now: SystemTime,
    ) -> BoxFuture<'static, StorageResult<ClaimAttempt>> {
        let store = self.clone();
        Box::pin(async move { store.try_claim(claim, now).await.map_err(Into::into) })
    }

    fn find_claim(
        &self,
        key: ClaimKey,
    ) -> BoxFuture<'static, StorageResult<Option<TallyClaimEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_claim(key).await.map_err(Into::into) })
    }

    fn complete_claim(
        &self,
        key: ClaimKey,
        claim_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.complete_claim(key, claim_id).await.map_err(Into::into) })
    }

    fn release_claim(
        &self,
        key: ClaimKey,
        claim_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.release_claim(key, claim_id).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.reconnect().await.map_err(Into::into) })
    }
}
