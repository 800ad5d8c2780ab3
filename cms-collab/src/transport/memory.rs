//! In-process authoritative server.
//!
//! Keeps one append-only log per (document, key), answers mutation requests
//! through the same JSON wire codec a network transport would use, and
//! serves snapshots for the data-fetch side. Used by the integration tests
//! and the simulator; it also documents the server contract the engine
//! expects:
//!
//! - an item is accepted only if its `base` is a version of the key's log;
//! - [`ServerPolicy::Strict`] additionally requires `base` to be the head;
//! - [`ServerPolicy::Rebase`] appends after the head and returns the entries
//!   the client had not seen as `missed`.

use futures_util::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use super::{Transport, TransportError};
use crate::listeners::lock;
use crate::ops::Transaction;
use crate::protocol::{
    EntityId, KeySnapshot, MutationOutcome, MutationRequest, MutationResponse, ProtocolError,
    TimelineEntry, TimelineSnapshot, Version,
};

/// How the server treats items built on an older version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerPolicy {
    /// Only the head version is accepted; anything else is stale.
    #[default]
    Strict,
    /// Any version of the log is accepted; unseen entries are reported back.
    Rebase,
}

struct KeyLog {
    /// `versions[i]` is the version after `i` entries.
    versions: Vec<Version>,
    entries: Vec<TimelineEntry>,
}

impl KeyLog {
    fn new() -> Self {
        Self {
            versions: vec![Version::initial()],
            entries: Vec::new(),
        }
    }

    fn head(&self) -> &Version {
        // versions is never empty
        &self.versions[self.versions.len() - 1]
    }

    fn contains(&self, version: &Version) -> bool {
        usize::try_from(version.count)
            .ok()
            .and_then(|i| self.versions.get(i))
            .is_some_and(|v| v.same_as(version))
    }

    fn append(&mut self, user: Uuid, transactions: Vec<Transaction>) -> Version {
        let prev_version = self.head().count;
        self.entries.push(TimelineEntry {
            transactions,
            user,
            prev_version,
            metadata: serde_json::Value::Null,
        });
        let version = Version::new(prev_version + 1, Uuid::new_v4().simple().to_string(), user);
        self.versions.push(version.clone());
        version
    }
}

#[derive(Default)]
struct ServerState {
    documents: HashMap<EntityId, BTreeMap<String, KeyLog>>,
    policy: ServerPolicy,
    offline: bool,
    latency: Duration,
    requests: u64,
}

/// Shared handle to the in-memory server.
#[derive(Clone, Default)]
pub struct MemoryServer {
    inner: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    /// Server with [`ServerPolicy::Strict`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: ServerPolicy) -> Self {
        let server = Self::default();
        lock(&server.inner).policy = policy;
        server
    }

    /// While offline every request fails with [`TransportError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        lock(&self.inner).offline = offline;
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.inner).latency = latency;
    }

    /// Number of mutation requests received, including failed ones.
    pub fn request_count(&self) -> u64 {
        lock(&self.inner).requests
    }

    /// Current head version of a key.
    pub fn version(&self, document: &EntityId, key: &str) -> Version {
        lock(&self.inner)
            .documents
            .get(document)
            .and_then(|keys| keys.get(key))
            .map_or_else(Version::initial, |log| log.head().clone())
    }

    /// Everything confirmed for `document`, for (re)initializing a timeline.
    pub fn fetch(&self, document: &EntityId) -> TimelineSnapshot {
        let state = lock(&self.inner);
        let keys = state
            .documents
            .get(document)
            .map(|keys| {
                keys.iter()
                    .map(|(key, log)| {
                        (
                            key.clone(),
                            KeySnapshot {
                                version: log.head().clone(),
                                history: log.entries.clone(),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        TimelineSnapshot {
            document: document.clone(),
            keys,
        }
    }

    /// Append directly, as another client's accepted write would.
    pub fn append(
        &self,
        document: &EntityId,
        key: &str,
        user: Uuid,
        transactions: Vec<Transaction>,
    ) -> Version {
        let mut state = lock(&self.inner);
        state
            .documents
            .entry(document.clone())
            .or_default()
            .entry(key.to_string())
            .or_insert_with(KeyLog::new)
            .append(user, transactions)
    }

    /// Apply a decoded request.
    pub fn handle(&self, request: MutationRequest) -> MutationResponse {
        let mut state = lock(&self.inner);
        let policy = state.policy;
        let keys = state.documents.entry(request.document.clone()).or_default();

        let results = request
            .items
            .into_iter()
            .map(|item| {
                let log = keys.entry(item.key.clone()).or_insert_with(KeyLog::new);
                let at_head = log.head().same_as(&item.base);
                let accepted = match policy {
                    ServerPolicy::Strict => at_head,
                    ServerPolicy::Rebase => log.contains(&item.base),
                };
                if !accepted {
                    log::debug!(
                        "Rejecting {}/{}: base {} not acceptable at head {}",
                        request.document,
                        item.key,
                        item.base,
                        log.head()
                    );
                    return MutationOutcome::Stale {
                        current: log.head().clone(),
                    };
                }

                let seen = usize::try_from(item.base.count)
                    .unwrap_or(usize::MAX)
                    .min(log.entries.len());
                let missed = log.entries[seen..].to_vec();
                let version = log.append(request.user, item.transactions);
                log::debug!(
                    "Accepted {}/{} at {} ({} missed)",
                    request.document,
                    item.key,
                    version,
                    missed.len()
                );
                MutationOutcome::Accepted { version, missed }
            })
            .collect();

        MutationResponse { results }
    }

    /// Decode, apply and encode: the body-level contract of the endpoint.
    pub fn handle_encoded(&self, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let request = MutationRequest::decode(body)?;
        self.handle(request).encode()
    }
}

impl Transport for MemoryServer {
    fn mutate(
        &self,
        request: MutationRequest,
    ) -> BoxFuture<'_, Result<MutationResponse, TransportError>> {
        Box::pin(async move {
            let latency = {
                let mut state = lock(&self.inner);
                state.requests += 1;
                state.latency
            };
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if lock(&self.inner).offline {
                return Err(TransportError::Unavailable("memory server is offline".into()));
            }

            let body = request.encode()?;
            let reply = self.handle_encoded(&body)?;
            let response = MutationResponse::decode(&reply)?;
            response.check_against(&request)?;
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Operation;
    use crate::protocol::MutationItem;
    use serde_json::json;

    fn doc() -> EntityId {
        EntityId::from("doc")
    }

    fn request(base: Version) -> MutationRequest {
        MutationRequest {
            document: doc(),
            user: Uuid::new_v4(),
            items: vec![MutationItem {
                key: "config".into(),
                base,
                transactions: vec![Transaction::single("", Operation::insert(0, vec![json!(1)]))],
            }],
        }
    }

    #[tokio::test]
    async fn test_accepts_at_head() {
        let server = MemoryServer::new();
        let response = server.mutate(request(Version::initial())).await.unwrap();
        match &response.results[0] {
            MutationOutcome::Accepted { version, missed } => {
                assert_eq!(version.count, 1);
                assert!(missed.is_empty());
            }
            other => panic!("expected Accepted, got {other:?}"),
        }
        assert_eq!(server.version(&doc(), "config").count, 1);
        assert_eq!(server.request_count(), 1);
    }

    #[tokio::test]
    async fn test_strict_rejects_behind_head() {
        let server = MemoryServer::with_policy(ServerPolicy::Strict);
        server.append(&doc(), "config", Uuid::new_v4(), vec![]);
        let response = server.mutate(request(Version::initial())).await.unwrap();
        assert!(matches!(
            response.results[0],
            MutationOutcome::Stale { ref current } if current.count == 1
        ));
    }

    #[tokio::test]
    async fn test_rebase_reports_missed_entries() {
        let server = MemoryServer::with_policy(ServerPolicy::Rebase);
        server.append(&doc(), "config", Uuid::new_v4(), vec![]);
        server.append(&doc(), "config", Uuid::new_v4(), vec![]);
        let response = server.mutate(request(Version::initial())).await.unwrap();
        match &response.results[0] {
            MutationOutcome::Accepted { version, missed } => {
                assert_eq!(version.count, 3);
                assert_eq!(missed.len(), 2);
            }
            other => panic!("expected Accepted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rebase_rejects_foreign_hash() {
        let server = MemoryServer::with_policy(ServerPolicy::Rebase);
        server.append(&doc(), "config", Uuid::new_v4(), vec![]);
        let forged = Version::new(1, "not-ours", Uuid::new_v4());
        let response = server.mutate(request(forged)).await.unwrap();
        assert!(matches!(response.results[0], MutationOutcome::Stale { .. }));
    }

    #[tokio::test]
    async fn test_offline_fails() {
        let server = MemoryServer::new();
        server.set_offline(true);
        let result = server.mutate(request(Version::initial())).await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
        assert_eq!(server.version(&doc(), "config").count, 0);
    }

    #[test]
    fn test_fetch_returns_history() {
        let server = MemoryServer::new();
        let user = Uuid::new_v4();
        let txn = Transaction::single("", Operation::toggle("a", 1));
        let v = server.append(&doc(), "config", user, vec![txn]);
        let snapshot = server.fetch(&doc());
        let key = &snapshot.keys["config"];
        assert_eq!(key.version, v);
        assert_eq!(key.history.len(), 1);
        assert_eq!(key.history[0].user, user);
        assert!(server.fetch(&EntityId::from("none")).keys.is_empty());
    }

    #[test]
    fn test_handle_encoded_rejects_garbage() {
        let server = MemoryServer::new();
        assert!(server.handle_encoded(b"{not json").is_err());
    }
}
