//! In-process reservation store

use super::{LockGrant, NonceLockStore, ReservationRecord, ReservationState, Settlement};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

struct Entry {
    nonce: u64,
    state: ReservationState,
    holder: Option<Uuid>,
    updated_at: DateTime<Utc>,
    /// Claim sequence, used to prefer the least recently claimed record
    last_claim: u64,
}

impl Entry {
    fn record(&self, key: &str) -> ReservationRecord {
        ReservationRecord {
            key: key.to_string(),
            nonce: self.nonce,
            state: self.state,
            holder: self.holder,
            updated_at: self.updated_at,
        }
    }
}

/// Reservation store for single-process deployments and tests
pub struct MemoryLockStore {
    entries: DashMap<(String, String), Entry>,
    claims: AtomicU64,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            claims: AtomicU64::new(0),
        }
    }

    fn id(namespace: &str, key: &str) -> (String, String) {
        (namespace.to_string(), key.to_string())
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NonceLockStore for MemoryLockStore {
    async fn insert_if_absent(&self, namespace: &str, key: &str, nonce: u64) -> RelayerResult<bool> {
        let mut created = false;
        self.entries.entry(Self::id(namespace, key)).or_insert_with(|| {
            created = true;
            Entry {
                nonce,
                state: ReservationState::Free,
                holder: None,
                updated_at: Utc::now(),
                last_claim: 0,
            }
        });
        Ok(created)
    }

    async fn existing_keys(&self, namespace: &str, keys: &[String]) -> RelayerResult<Vec<String>> {
        Ok(keys
            .iter()
            .filter(|key| self.entries.contains_key(&Self::id(namespace, key)))
            .cloned()
            .collect())
    }

    async fn try_lock(
        &self,
        namespace: &str,
        keys: &[String],
        holder: Uuid,
    ) -> RelayerResult<Option<LockGrant>> {
        let mut candidates: Vec<(u64, &String)> = keys
            .iter()
            .filter_map(|key| {
                self.entries
                    .get(&Self::id(namespace, key))
                    .filter(|e| e.state.is_available())
                    .map(|e| (e.last_claim, key))
            })
            .collect();
        candidates.sort_by_key(|(last_claim, _)| *last_claim);

        for (_, key) in candidates {
            let Some(mut entry) = self.entries.get_mut(&Self::id(namespace, key)) else {
                continue;
            };
            // Re-check under the entry lock; another caller may have won the race
            if !entry.state.is_available() {
                continue;
            }
            entry.state = ReservationState::Locked;
            entry.holder = Some(holder);
            entry.updated_at = Utc::now();
            entry.last_claim = self.claims.fetch_add(1, Ordering::SeqCst) + 1;

            return Ok(Some(LockGrant {
                key: key.clone(),
                nonce: entry.nonce,
                holder,
            }));
        }

        Ok(None)
    }

    async fn settle(
        &self,
        namespace: &str,
        key: &str,
        holder: Uuid,
        settlement: Settlement,
    ) -> RelayerResult<bool> {
        let Some(mut entry) = self.entries.get_mut(&Self::id(namespace, key)) else {
            return Ok(false);
        };
        if entry.holder != Some(holder) {
            debug!("Ignoring settlement of {} by a holder that lost it", key);
            return Ok(false);
        }

        entry.holder = None;
        entry.updated_at = Utc::now();
        match settlement {
            Settlement::Release => {
                entry.nonce += 1;
                entry.state = ReservationState::Free;
            }
            Settlement::Fail => {
                entry.state = ReservationState::Failed;
            }
        }
        Ok(true)
    }

    async fn renew(&self, namespace: &str, key: &str, holder: Uuid) -> RelayerResult<bool> {
        match self.entries.get_mut(&Self::id(namespace, key)) {
            Some(mut entry)
                if entry.holder == Some(holder) && entry.state == ReservationState::Locked =>
            {
                entry.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unlock(&self, namespace: &str, key: &str, new_nonce: Option<u64>) -> RelayerResult<()> {
        let mut entry = self
            .entries
            .get_mut(&Self::id(namespace, key))
            .ok_or_else(|| RelayerError::LockStore(format!("No reservation for {}", key)))?;

        if let Some(nonce) = new_nonce {
            entry.nonce = nonce;
        }
        entry.state = ReservationState::Free;
        entry.holder = None;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> RelayerResult<Option<ReservationRecord>> {
        Ok(self
            .entries
            .get(&Self::id(namespace, key))
            .map(|e| e.record(key)))
    }

    async fn list(&self, namespace: &str) -> RelayerResult<Vec<ReservationRecord>> {
        let mut records: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.value().record(&e.key().1))
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = MemoryLockStore::new();
        assert!(store.insert_if_absent("wallet", "a", 5).await.unwrap());
        assert!(!store.insert_if_absent("wallet", "a", 9).await.unwrap());

        let record = store.get("wallet", "a").await.unwrap().unwrap();
        assert_eq!(record.nonce, 5);
        assert_eq!(record.state, ReservationState::Free);

        let existing = store.existing_keys("wallet", &keys(&["a", "b"])).await.unwrap();
        assert_eq!(existing, keys(&["a"]));
    }

    #[tokio::test]
    async fn test_lock_claims_each_key_once() {
        let store = MemoryLockStore::new();
        store.insert_if_absent("wallet", "a", 0).await.unwrap();
        store.insert_if_absent("wallet", "b", 0).await.unwrap();
        let candidates = keys(&["a", "b"]);

        let first = store.try_lock("wallet", &candidates, Uuid::new_v4()).await.unwrap().unwrap();
        let second = store.try_lock("wallet", &candidates, Uuid::new_v4()).await.unwrap().unwrap();
        assert_ne!(first.key, second.key);

        assert!(store.try_lock("wallet", &candidates, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_advances_and_fail_keeps_nonce() {
        let store = MemoryLockStore::new();
        store.insert_if_absent("wallet", "a", 3).await.unwrap();
        let candidates = keys(&["a"]);

        let grant = store.try_lock("wallet", &candidates, Uuid::new_v4()).await.unwrap().unwrap();
        assert!(store.settle("wallet", "a", grant.holder, Settlement::Release).await.unwrap());
        // Second settlement by the same holder is a no-op
        assert!(!store.settle("wallet", "a", grant.holder, Settlement::Release).await.unwrap());
        assert_eq!(store.get("wallet", "a").await.unwrap().unwrap().nonce, 4);

        let grant = store.try_lock("wallet", &candidates, Uuid::new_v4()).await.unwrap().unwrap();
        assert_eq!(grant.nonce, 4);
        assert!(store.settle("wallet", "a", grant.holder, Settlement::Fail).await.unwrap());
        let record = store.get("wallet", "a").await.unwrap().unwrap();
        assert_eq!(record.nonce, 4);
        assert_eq!(record.state, ReservationState::Failed);

        // A failed record is claimable again
        assert!(store.try_lock("wallet", &candidates, Uuid::new_v4()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unlock_overrides_holder() {
        let store = MemoryLockStore::new();
        store.insert_if_absent("wallet", "a", 1).await.unwrap();

        let grant = store.try_lock("wallet", &keys(&["a"]), Uuid::new_v4()).await.unwrap().unwrap();
        store.unlock("wallet", "a", Some(10)).await.unwrap();

        // The evicted holder can no longer move the nonce
        assert!(!store.settle("wallet", "a", grant.holder, Settlement::Release).await.unwrap());
        let record = store.get("wallet", "a").await.unwrap().unwrap();
        assert_eq!(record.nonce, 10);
        assert_eq!(record.state, ReservationState::Free);

        assert!(store.unlock("wallet", "missing", None).await.is_err());
    }

    #[tokio::test]
    async fn test_renew_stops_after_eviction() {
        let store = MemoryLockStore::new();
        store.insert_if_absent("tasks", "topPoolAccounts", 0).await.unwrap();

        let grant = store
            .try_lock("tasks", &keys(&["topPoolAccounts"]), Uuid::new_v4())
            .await
            .unwrap()
            .unwrap();
        assert!(store.renew("tasks", "topPoolAccounts", grant.holder).await.unwrap());
        assert!(!store.renew("tasks", "topPoolAccounts", Uuid::new_v4()).await.unwrap());

        store.unlock("tasks", "topPoolAccounts", None).await.unwrap();
        assert!(!store.renew("tasks", "topPoolAccounts", grant.holder).await.unwrap());
        assert!(!store.renew("tasks", "missing", grant.holder).await.unwrap());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = MemoryLockStore::new();
        store.insert_if_absent("wallet", "a", 0).await.unwrap();
        store.insert_if_absent("tasks", "a", 0).await.unwrap();

        store.try_lock("wallet", &keys(&["a"]), Uuid::new_v4()).await.unwrap().unwrap();
        assert!(store.try_lock("tasks", &keys(&["a"]), Uuid::new_v4()).await.unwrap().is_some());
        assert_eq!(store.list("wallet").await.unwrap().len(), 1);
    }
}
