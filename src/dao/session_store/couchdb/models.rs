use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dao::models::ClaimKey;

pub const SESSION_PREFIX: &str = "session::";
pub const REGION_PREFIX: &str = "region::";
pub const BALLOT_PREFIX: &str = "ballot::";
pub const CLAIM_PREFIX: &str = "claim::";
pub const END_SUFFIX: &str = "\u{ffff}";

#[derive(Debug, Deserialize)]
pub struct AllDocsResponse {
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
pub struct AllDocsRow {
    #[allow(dead_code)]
    pub id: String,
    #[serde(default)]
    pub doc: Option<Value>,
}

/// Any CouchDB document: the `_id`/`_rev` envelope around a flattened body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchDocument<T> {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub body: T,
}

impl<T> CouchDocument<T> {
    pub fn new(id: String, rev: Option<String>, body: T) -> Self {
        Self { id, rev, body }
    }
}

/// Pointer from a region to its single active session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionPointer {
    pub session_id: Uuid,
}

pub fn session_doc_id(id: Uuid) -> String {
    format!("{SESSION_PREFIX}{id}")
}

pub fn region_doc_id(region: &str) -> String {
    format!("{REGION_PREFIX}{region}")
}

pub fn ballot_doc_id(ballot_key: &str) -> String {
    format!("{BALLOT_PREFIX}{ballot_key}")
}

pub fn claim_doc_id(key: ClaimKey) -> String {
    format!("{CLAIM_PREFIX}{key}")
}
