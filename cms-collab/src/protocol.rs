//! Wire types exchanged with the mutation endpoint and the data fetch.
//!
//! Request/response bodies are JSON: operation payloads are schemaless
//! document values, so the encoding has to be self-describing.
//!
//! ```text
//! MutationRequest { document, user, items: [ { key, base, transactions } ] }
//!        │
//!        ▼
//! MutationResponse { results: [ Accepted { version, missed } | Stale { current } ] }
//! ```
//!
//! `results[i]` answers `items[i]`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::ops::Transaction;

/// Identifier of a logical entity: a document id, or a global list such as
/// `"folders"` / `"documents"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-key version record.
///
/// `count` is monotonically increasing and orders versions. `hash` is opaque
/// and only ever compared for equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub count: u64,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub user: Option<Uuid>,
}

impl Version {
    /// Version of a key nobody has written to.
    pub fn initial() -> Self {
        Self::default()
    }

    pub fn new(count: u64, hash: impl Into<String>, user: Uuid) -> Self {
        Self {
            count,
            hash: Some(hash.into()),
            user: Some(user),
        }
    }

    /// Same position in the same log. The author is not part of identity.
    pub fn same_as(&self, other: &Version) -> bool {
        self.count == other.count && self.hash == other.hash
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hash {
            Some(hash) => write!(f, "{}@{hash}", self.count),
            None => write!(f, "{}", self.count),
        }
    }
}

/// One server-confirmed step of a key's log. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub transactions: Vec<Transaction>,
    pub user: Uuid,
    pub prev_version: u64,
    #[serde(default)]
    pub metadata: Value,
}

/// Confirmed state of one key as supplied by the data fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeySnapshot {
    pub version: Version,
    pub history: Vec<TimelineEntry>,
}

/// Everything needed to (re)initialize a timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineSnapshot {
    pub document: EntityId,
    pub keys: BTreeMap<String, KeySnapshot>,
}

impl TimelineSnapshot {
    pub fn empty(document: impl Into<EntityId>) -> Self {
        Self {
            document: document.into(),
            keys: BTreeMap::new(),
        }
    }

    /// Builder: add one key.
    pub fn with_key(
        mut self,
        key: impl Into<String>,
        version: Version,
        history: Vec<TimelineEntry>,
    ) -> Self {
        self.keys.insert(key.into(), KeySnapshot { version, history });
        self
    }
}

/// Pending transactions of one queue, sent against the version they were
/// built on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationItem {
    pub key: String,
    pub base: Version,
    pub transactions: Vec<Transaction>,
}

/// One request per document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub document: EntityId,
    pub user: Uuid,
    pub items: Vec<MutationItem>,
}

/// Server verdict for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MutationOutcome {
    /// Applied. `missed` holds entries other clients appended after `base`,
    /// in log order, preceding the entry created for this item.
    Accepted {
        version: Version,
        #[serde(default)]
        missed: Vec<TimelineEntry>,
    },
    /// The item's base is not part of the server's log.
    Stale { current: Version },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
    pub results: Vec<MutationOutcome>,
}

impl MutationRequest {
    pub fn transaction_count(&self) -> usize {
        self.items.iter().map(|i| i.transactions.len()).sum()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl MutationResponse {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Check that the response answers exactly `request`'s items.
    pub fn check_against(&self, request: &MutationRequest) -> Result<(), ProtocolError> {
        if self.results.len() != request.items.len() {
            return Err(ProtocolError::MismatchedResults {
                expected: request.items.len(),
                got: self.results.len(),
            });
        }
        Ok(())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("response carries {got} results for {expected} items")]
    MismatchedResults { expected: usize, got: usize },
}
