//! Reservation storage for nonce and task locks
//!
//! Handles:
//! - One reservation record per (namespace, key)
//! - Atomic claim of a free record among candidates
//! - Release (advance nonce), fail (keep nonce) and forced unlock
//!
//! Two backends: an in-process map and PostgreSQL for processes sharing a pool.

mod memory;
mod postgres;

pub use memory::MemoryLockStore;
pub use postgres::PgLockStore;

use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// State of a reservation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Free,
    Locked,
    /// Free again, but the last holder failed and the nonce was not advanced
    Failed,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Free => "free",
            ReservationState::Locked => "locked",
            ReservationState::Failed => "failed",
        }
    }

    /// Whether a new holder may claim the record
    pub fn is_available(&self) -> bool {
        !matches!(self, ReservationState::Locked)
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationState {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(ReservationState::Free),
            "locked" => Ok(ReservationState::Locked),
            "failed" => Ok(ReservationState::Failed),
            other => Err(RelayerError::LockStore(format!(
                "Unknown reservation state: {}",
                other
            ))),
        }
    }
}

/// How a holder gives a reservation back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The nonce was consumed; advance it by one
    Release,
    /// The nonce was not consumed
    Fail,
}

/// Snapshot of one stored record
#[derive(Debug, Clone, Serialize)]
pub struct ReservationRecord {
    pub key: String,
    pub nonce: u64,
    pub state: ReservationState,
    pub holder: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

/// A successful claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub key: String,
    pub nonce: u64,
    pub holder: Uuid,
}

/// Persistent reservation backend.
///
/// Every method is atomic with respect to concurrent callers, including
/// callers in other processes for shared backends.
#[async_trait]
pub trait NonceLockStore: Send + Sync {
    /// Create a free record seeded with `nonce` unless one exists. Returns whether it was created.
    async fn insert_if_absent(&self, namespace: &str, key: &str, nonce: u64) -> RelayerResult<bool>;

    /// Subset of `keys` that already have a record
    async fn existing_keys(&self, namespace: &str, keys: &[String]) -> RelayerResult<Vec<String>>;

    /// Claim one available record among `keys` for `holder`, or `None` if all are held.
    async fn try_lock(
        &self,
        namespace: &str,
        keys: &[String],
        holder: Uuid,
    ) -> RelayerResult<Option<LockGrant>>;

    /// Give a record back. Only applies while `holder` still owns it; returns whether it applied.
    async fn settle(
        &self,
        namespace: &str,
        key: &str,
        holder: Uuid,
        settlement: Settlement,
    ) -> RelayerResult<bool>;

    /// Extend a held lock's lease. Returns false once `holder` no longer owns the record.
    async fn renew(&self, namespace: &str, key: &str, holder: Uuid) -> RelayerResult<bool>;

    /// Free a record regardless of holder, optionally overwriting its nonce
    async fn unlock(&self, namespace: &str, key: &str, new_nonce: Option<u64>) -> RelayerResult<()>;

    async fn get(&self, namespace: &str, key: &str) -> RelayerResult<Option<ReservationRecord>>;

    async fn list(&self, namespace: &str) -> RelayerResult<Vec<ReservationRecord>>;

    async fn health_check(&self) -> RelayerResult<()>;
}
