use std::{sync::Arc, time::SystemTime};

use futures::future::BoxFuture;
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, from_value};
use tracing::warn;
use uuid::Uuid;

use crate::dao::{
    models::{
        BallotEntity, ClaimAttempt, ClaimKey, ClaimStatusEntity, SessionEntity,
        SessionStatusEntity, TallyClaimEntity, VoteEntity, VoteWrite, ballot_key,
    },
    session_store::SessionStore,
    storage::StorageResult,
};

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
    models::{
        AllDocsResponse, CouchDocument, END_SUFFIX, REGION_PREFIX, RegionPointer, ballot_doc_id,
        claim_doc_id, region_doc_id, session_doc_id,
    },
};

const MAX_CONFLICT_RETRIES: u32 = 5;
/// Every voter of a round writes the same ballot document.
const MAX_BALLOT_RETRIES: u32 = 32;

/// Outcome of a revision-checked write.
enum WriteOutcome {
    Written,
    /// CouchDB answered `409 Conflict`: the `_rev` we sent is no longer current.
    Conflict,
}

/// [`SessionStore`] backed by CouchDB, using document revisions for every conditional write.
#[derive(Clone)]
pub struct CouchSessionStore {
    client: Client,
    base_url: Arc<Url>,
    database: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
}

impl CouchSessionStore {
    /// Establish a connection to CouchDB and ensure the database exists.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| CouchDaoError::ClientBuilder { source })?;

        let base_url = config.parsed_base_url()?;
        let database = Arc::<str>::from(config.database);
        let auth = config
            .username
            .zip(config.password)
            .map(|(u, p)| (Arc::<str>::from(u), Arc::<str>::from(p)));

        let store = Self {
            client,
            base_url: Arc::new(base_url),
            database,
            auth,
        };

        store.ensure_database().await?;
        Ok(store)
    }

    /// Build `{base}/{database}/{segments..}` with every segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = (*self.base_url).clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(&self.database);
            for segment in segments {
                path.push(segment);
            }
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(segments));
        if let Some((ref user, ref pass)) = self.auth {
            builder.basic_auth(user.as_ref(), Some(pass.as_ref()))
        } else {
            builder
        }
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let response = self
            .request(Method::GET, &[])
            .send()
            .await
            .map_err(|source| CouchDaoError::DatabaseQuery {
                database: database.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let create = self.request(Method::PUT, &[]).send().await.map_err(|source| {
                    CouchDaoError::DatabaseCreate {
                        database: database.clone(),
                        source,
                    }
                })?;
                // 412: another instance created it between our GET and PUT.
                if create.status().is_success() || create.status() == StatusCode::PRECONDITION_FAILED
                {
                    Ok(())
                } else {
                    Err(CouchDaoError::DatabaseStatus {
                        database,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchDaoError::DatabaseStatus {
                database,
                status: other,
            }),
        }
    }

    async fn get_document<T>(&self, doc_id: &str) -> CouchResult<Option<CouchDocument<T>>>
    where
        T: DeserializeOwned,
    {
        let response = self
            .request(Method::GET, &[doc_id])
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<CouchDocument<T>>()
                .await
                .map(Some)
                .map_err(|source| CouchDaoError::DecodeResponse {
                    path: doc_id.to_string(),
                    source,
                }),
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    /// PUT a document; the write only succeeds when `document.rev` is the current revision
    /// (or absent for a document that does not exist yet).
    async fn put_document<T>(&self, document: &CouchDocument<T>) -> CouchResult<WriteOutcome>
    where
        T: Serialize,
    {
        let response = self
            .request(Method::PUT, &[document.id.as_str()])
            .json(document)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: document.id.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::CONFLICT => Ok(WriteOutcome::Conflict),
            status if status.is_success() => Ok(WriteOutcome::Written),
            other => Err(CouchDaoError::RequestStatus {
                path: document.id.clone(),
                status: other,
            }),
        }
    }

    async fn delete_document(&self, doc_id: &str, rev: &str) -> CouchResult<WriteOutcome> {
        let response = self
            .request(Method::DELETE, &[doc_id])
            .query(&[("rev", rev)])
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::CONFLICT | StatusCode::NOT_FOUND => Ok(WriteOutcome::Conflict),
            status if status.is_success() => Ok(WriteOutcome::Written),
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn list_documents<T>(&self, prefix: &str) -> CouchResult<Vec<CouchDocument<T>>>
    where
        T: DeserializeOwned,
    {
        const ALL_DOCS: &str = "_all_docs";
        let query = [
            ("include_docs", "true".to_string()),
            ("startkey", format!("\"{}\"", prefix)),
            ("endkey", format!("\"{}{}\"", prefix, END_SUFFIX)),
        ];

        let response = self
            .request(Method::GET, &[ALL_DOCS])
            .query(&query)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: ALL_DOCS.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: ALL_DOCS.to_string(),
                status: response.status(),
            });
        }

        let payload = response.json::<AllDocsResponse>().await.map_err(|source| {
            CouchDaoError::DecodeResponse {
                path: ALL_DOCS.to_string(),
                source,
            }
        })?;

        payload
            .rows
            .into_iter()
            .filter_map(|row| row.doc)
            .map(|doc| {
                from_value(doc).map_err(|source| CouchDaoError::DeserializeValue {
                    path: ALL_DOCS.to_string(),
                    source,
                })
            })
            .collect()
    }

    async fn find_session(&self, id: Uuid) -> CouchResult<Option<SessionEntity>> {
        let doc = self
            .get_document::<SessionEntity>(&session_doc_id(id))
            .await?;
        Ok(doc.map(|doc| doc.body))
    }

    async fn find_active_session(&self, region: &str) -> CouchResult<Option<SessionEntity>> {
        let Some(pointer) = self
            .get_document::<RegionPointer>(&region_doc_id(region))
            .await?
        else {
            return Ok(None);
        };
        let session = self.find_session(pointer.body.session_id).await?;
        Ok(session.filter(|session| session.status == SessionStatusEntity::Active))
    }

    async fn list_active_sessions(&self) -> CouchResult<Vec<SessionEntity>> {
        let pointers = self.list_documents::<RegionPointer>(REGION_PREFIX).await?;
        let mut sessions = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            if let Some(session) = self.find_session(pointer.body.session_id).await?
                && session.status == SessionStatusEntity::Active
            {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// Write the session document first, then swing the region pointer with a
    /// revision-checked PUT so the pointer never references a missing document.
    async fn create_session(&self, session: SessionEntity) -> CouchResult<SessionEntity> {
        let region_id = region_doc_id(&session.region);
        let session_id = session_doc_id(session.id);
        let mut session_written = false;

        for _ in 0..MAX_CONFLICT_RETRIES {
            let pointer_rev = match self.get_document::<RegionPointer>(&region_id).await? {
                Some(pointer) => {
                    if let Some(existing) = self.find_session(pointer.body.session_id).await?
                        && existing.status == SessionStatusEntity::Active
                    {
                        if session_written {
                            self.discard_document(&session_id).await;
                        }
                        return Ok(existing);
                    }
                    pointer.rev
                }
                None => None,
            };

            if !session_written {
                let document = CouchDocument::new(session_id.clone(), None, &session);
                if let WriteOutcome::Conflict = self.put_document(&document).await? {
                    return Err(CouchDaoError::ConflictRetriesExhausted {
                        doc_id: session_id,
                        attempts: 1,
                    });
                }
                session_written = true;
            }

            let pointer = CouchDocument::new(
                region_id.clone(),
                pointer_rev,
                RegionPointer {
                    session_id: session.id,
                },
            );
            if let WriteOutcome::Written = self.put_document(&pointer).await? {
                return Ok(session);
            }
        }

        Err(CouchDaoError::ConflictRetriesExhausted {
            doc_id: region_id,
            attempts: MAX_CONFLICT_RETRIES,
        })
    }

    /// Best-effort removal of a session document that lost the region race.
    async fn discard_document(&self, doc_id: &str) {
        let rev = match self.get_document::<Value>(doc_id).await {
            Ok(Some(doc)) => doc.rev,
            Ok(None) => return,
            Err(err) => {
                warn!(doc_id, error = %err, "failed to load orphaned document");
                return;
            }
        };
        if let Some(rev) = rev
            && let Err(err) = self.delete_document(doc_id, &rev).await
        {
            warn!(doc_id, error = %err, "failed to delete orphaned document");
        }
    }

    async fn replace_session(
        &self,
        session: SessionEntity,
        expected_version: u64,
    ) -> CouchResult<bool> {
        let doc_id = session_doc_id(session.id);
        let Some(current) = self.get_document::<SessionEntity>(&doc_id).await? else {
            return Ok(false);
        };
        if current.body.version != expected_version {
            return Ok(false);
        }
        let document = CouchDocument::new(doc_id, current.rev, &session);
        Ok(matches!(
            self.put_document(&document).await?,
            WriteOutcome::Written
        ))
    }

    /// Read-modify-write the ballot of one round until the revision-checked PUT lands.
    /// `change` returns `None` when nothing needs writing.
    async fn update_ballot<T, F>(
        &self,
        session_id: Uuid,
        epoch: u64,
        segment_index: usize,
        mut change: F,
    ) -> CouchResult<T>
    where
        F: FnMut(&mut BallotEntity) -> (T, bool),
    {
        let doc_id = ballot_doc_id(&ballot_key(session_id, epoch, segment_index));
        for _ in 0..MAX_BALLOT_RETRIES {
            let mut document = self
                .get_document::<BallotEntity>(&doc_id)
                .await?
                .unwrap_or_else(|| {
                    CouchDocument::new(
                        doc_id.clone(),
                        None,
                        BallotEntity::open(session_id, epoch, segment_index),
                    )
                });
            let (result, dirty) = change(&mut document.body);
            if !dirty {
                return Ok(result);
            }
            if let WriteOutcome::Written = self.put_document(&document).await? {
                return Ok(result);
            }
        }
        Err(CouchDaoError::ConflictRetriesExhausted {
            doc_id,
            attempts: MAX_BALLOT_RETRIES,
        })
    }

    async fn record_vote(&self, vote: VoteEntity) -> CouchResult<VoteWrite> {
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
    ) -> CouchResult<Vec<VoteEntity>> {
        let doc_id = ballot_doc_id(&ballot_key(session_id, epoch, segment_index));
        let ballot = self.get_document::<BallotEntity>(&doc_id).await?;
        Ok(ballot.map(|doc| doc.body.votes).unwrap_or_default())
    }

    async fn seal_votes(
        &self,
        session_id: Uuid,
        epoch: u64,
        segment_index: usize,
    ) -> CouchResult<Vec<VoteEntity>> {
        self.update_ballot(session_id, epoch, segment_index, |ballot| {
            let dirty = ballot.seal();
            (ballot.votes.clone(), dirty)
        })
        .await
    }

    async fn try_claim(
        &self,
        claim: TallyClaimEntity,
        now: SystemTime,
    ) -> CouchResult<ClaimAttempt> {
        let doc_id = claim_doc_id(claim.key);
        let rev = match self.get_document::<TallyClaimEntity>(&doc_id).await? {
            Some(existing) if !existing.body.is_takeover_allowed(now) => {
                return Ok(ClaimAttempt::Held(existing.body));
            }
            Some(expired) => expired.rev,
            None => None,
        };

        let document = CouchDocument::new(doc_id.clone(), rev, &claim);
        match self.put_document(&document).await? {
            WriteOutcome::Written => Ok(ClaimAttempt::Acquired),
            WriteOutcome::Conflict => match self.get_document::<TallyClaimEntity>(&doc_id).await? {
                Some(winner) => Ok(ClaimAttempt::Held(winner.body)),
                None => Err(CouchDaoError::ConflictRetriesExhausted {
                    doc_id,
                    attempts: 1,
                }),
            },
        }
    }

    async fn find_claim(&self, key: ClaimKey) -> CouchResult<Option<TallyClaimEntity>> {
        let doc = self
            .get_document::<TallyClaimEntity>(&claim_doc_id(key))
            .await?;
        Ok(doc.map(|doc| doc.body))
    }

    async fn complete_claim(&self, key: ClaimKey, claim_id: Uuid) -> CouchResult<bool> {
        let doc_id = claim_doc_id(key);
        let Some(mut document) = self.get_document::<TallyClaimEntity>(&doc_id).await? else {
            return Ok(false);
        };
        if document.body.claim_id != claim_id {
            return Ok(false);
        }
        document.body.status = ClaimStatusEntity::Completed;
        Ok(matches!(
            self.put_document(&document).await?,
            WriteOutcome::Written
        ))
    }

    async fn release_claim(&self, key: ClaimKey, claim_id: Uuid) -> CouchResult<bool> {
        let doc_id = claim_doc_id(key);
        let Some(document) = self.get_document::<TallyClaimEntity>(&doc_id).await? else {
            return Ok(false);
        };
        let (true, Some(rev)) = (document.body.claim_id == claim_id, document.rev) else {
            return Ok(false);
        };
        Ok(matches!(
            self.delete_document(&doc_id, &rev).await?,
            WriteOutcome::Written
        ))
    }

    async fn health_check(&self) -> CouchResult<()> {
        let url = self.url(&[]).to_string();
        let response = self
            .request(Method::GET, &[])
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: url.clone(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CouchDaoError::RequestStatus {
                path: url,
                status: response.status(),
            })
        }
    }
}

impl SessionStore for CouchSessionStore {
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
        let store = self.clone();
        Box::pin(async move { store.health_check().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_database().await.map_err(Into::into) })
    }
}
