//! Collection documents wrapping the shared entities.
//!
//! Identifiers are stored as strings and the fields used in filters are lifted
//! to the top level so queries never depend on how the entity itself encodes.

use mongodb::bson::{Document, doc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dao::models::{
    BallotEntity, ClaimKey, ClaimStatusEntity, SessionEntity, SessionStatusEntity,
    TallyClaimEntity,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSessionDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub active: bool,
    pub version: i64,
    pub session: SessionEntity,
}

impl From<SessionEntity> for MongoSessionDocument {
    fn from(session: SessionEntity) -> Self {
        Self {
            id: session.id.to_string(),
            active: session.status == SessionStatusEntity::Active,
            version: version_field(session.version),
            session,
        }
    }
}

/// Pointer from a region to its active session; `_id` is the region name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoRegionDocument {
    #[serde(rename = "_id")]
    pub region: String,
    pub session_id: String,
}

/// Ballot of one round; `revision` is bumped on every write and used as the
/// compare-and-swap token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoBallotDocument {
    #[serde(rename = "_id")]
    pub key: String,
    pub revision: i64,
    pub ballot: BallotEntity,
}

impl MongoBallotDocument {
    pub fn first(ballot: BallotEntity) -> Self {
        Self {
            key: ballot.key(),
            revision: 1,
            ballot,
        }
    }

    /// Filter matching this document only while nobody else wrote it.
    pub fn revision_filter(&self) -> Document {
        doc! { "_id": &self.key, "revision": self.revision }
    }

    pub fn next_revision(mut self) -> Self {
        self.revision += 1;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoClaimDocument {
    #[serde(rename = "_id")]
    pub key: String,
    pub claim_id: String,
    pub completed: bool,
    pub claim: TallyClaimEntity,
}

impl From<TallyClaimEntity> for MongoClaimDocument {
    fn from(claim: TallyClaimEntity) -> Self {
        Self {
            key: claim.key.to_string(),
            claim_id: claim.claim_id.to_string(),
            completed: claim.status == ClaimStatusEntity::Completed,
            claim,
        }
    }
}

pub fn version_field(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

pub fn doc_id(id: impl ToString) -> Document {
    doc! { "_id": id.to_string() }
}

pub fn claim_filter(key: ClaimKey, claim_id: Uuid) -> Document {
    doc! { "_id": key.to_string(), "claim_id": claim_id.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_field_saturates() {
        assert_eq!(version_field(7), 7);
        assert_eq!(version_field(u64::MAX), i64::MAX);
    }

    #[test]
    fn claim_filter_pins_the_attempt() {
        let key = ClaimKey::opening(Uuid::nil(), 3);
        let claim_id = Uuid::new_v4();
        let filter = claim_filter(key, claim_id);
        assert_eq!(filter.get_str("_id").unwrap(), key.to_string());
        assert_eq!(filter.get_str("claim_id").unwrap(), claim_id.to_string());
    }

    #[test]
    fn ballot_revisions_guard_each_write() {
        let first = MongoBallotDocument::first(BallotEntity::open(Uuid::nil(), 0, 4));
        assert_eq!(first.key, format!("{}::0::4", Uuid::nil()));
        assert_eq!(first.revision_filter().get_i64("revision").unwrap(), 1);

        let next = first.next_revision();
        assert_eq!(next.revision, 2);
        assert_eq!(next.revision_filter().get_str("_id").unwrap(), next.key);
    }

    #[test]
    fn session_documents_lift_filter_fields() {
        let now = std::time::SystemTime::now();
        let session = SessionEntity {
            id: Uuid::new_v4(),
            region: "forest".into(),
            status: SessionStatusEntity::Completed,
            epoch: 0,
            version: 9,
            history: Vec::new(),
            current_vote_round: None,
            participants: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let document = MongoSessionDocument::from(session.clone());
        assert_eq!(document.id, session.id.to_string());
        assert!(!document.active);
        assert_eq!(document.version, 9);
    }
}
