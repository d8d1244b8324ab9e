//! Nonce reservations for pooled signer accounts
//!
//! Handles:
//! - Exclusive claim of one free account among candidates, with its next nonce
//! - Release (nonce consumed) and fail (nonce unused), both idempotent
//! - Forced resync of an account's nonce from the chain
//! - Named locks for scheduled tasks on the same store

use crate::chain::NetworkClient;
use crate::config::LockConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::state::{NonceLockStore, ReservationRecord, Settlement};

use ethers::types::Address;
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Namespace holding one reservation per pool address
pub const WALLET_NAMESPACE: &str = "wallet";
/// Namespace holding one lock per scheduled task
pub const TASKS_NAMESPACE: &str = "tasks";

/// Store key for an address
pub fn address_key(address: &Address) -> String {
    format!("{:?}", address)
}

struct LockShared {
    store: Arc<dyn NonceLockStore>,
    namespace: String,
    /// Woken whenever a record in this namespace may have become free
    freed: Notify,
}

impl LockShared {
    async fn settle(&self, key: &str, holder: Uuid, settlement: Settlement) -> RelayerResult<bool> {
        let applied = self.store.settle(&self.namespace, key, holder, settlement).await?;
        self.freed.notify_waiters();
        Ok(applied)
    }
}

/// Coordinates exclusive use of store records within one namespace
pub struct NonceLock {
    shared: Arc<LockShared>,
    /// Upper bound on how long a waiter sleeps before re-checking the store.
    /// Covers records freed by other processes, which never wake our `Notify`.
    poll_interval: Duration,
    /// How often a kept-alive reservation renews its lease
    lease_renewal: Duration,
}

impl NonceLock {
    pub fn new(store: Arc<dyn NonceLockStore>, namespace: &str, config: &LockConfig) -> Self {
        Self {
            shared: Arc::new(LockShared {
                store,
                namespace: namespace.to_string(),
                freed: Notify::new(),
            }),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            lease_renewal: (Duration::from_secs(config.lock_ttl_secs) / 3)
                .max(Duration::from_secs(1)),
        }
    }

    pub fn with_lease_renewal(mut self, every: Duration) -> Self {
        self.lease_renewal = every;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    /// Create a reservation for every address that has none, seeded with its on-chain transaction count
    pub async fn create_list_if_not_exists(
        &self,
        addresses: &[Address],
        client: &dyn NetworkClient,
    ) -> RelayerResult<()> {
        let keys: Vec<String> = addresses.iter().map(address_key).collect();
        let existing: HashSet<String> = self
            .shared
            .store
            .existing_keys(&self.shared.namespace, &keys)
            .await?
            .into_iter()
            .collect();

        for (address, key) in addresses.iter().zip(keys) {
            if existing.contains(&key) {
                continue;
            }
            let nonce = client.get_transaction_count(*address).await?;
            if self
                .shared
                .store
                .insert_if_absent(&self.shared.namespace, &key, nonce)
                .await?
            {
                info!("Created nonce reservation for {:?} at nonce {}", address, nonce);
            }
        }

        Ok(())
    }

    /// Claim one of `candidates`, waiting until one is free.
    ///
    /// Fails with `PoolExhausted` only when `candidates` is empty.
    pub async fn lock(&self, candidates: &[Address]) -> RelayerResult<NonceReservation> {
        if candidates.is_empty() {
            return Err(RelayerError::PoolExhausted(
                "no candidate addresses to lock".to_string(),
            ));
        }

        let by_key: HashMap<String, Address> =
            candidates.iter().map(|a| (address_key(a), *a)).collect();
        let keys: Vec<String> = candidates.iter().map(address_key).collect();

        let reservation = self.acquire(&keys).await?;
        let address = *by_key.get(reservation.key()).ok_or_else(|| {
            RelayerError::InvariantViolation(format!(
                "store granted {} which was not a candidate",
                reservation.key()
            ))
        })?;

        debug!("Locked {:?} at nonce {}", address, reservation.nonce());
        Ok(NonceReservation {
            address,
            reservation,
        })
    }

    /// Claim the lock named `name`, creating it on first use
    pub async fn lock_named(&self, name: &str) -> RelayerResult<Reservation> {
        self.shared
            .store
            .insert_if_absent(&self.shared.namespace, name, 0)
            .await?;
        self.acquire(&[name.to_string()]).await
    }

    async fn acquire(&self, keys: &[String]) -> RelayerResult<Reservation> {
        let started = Instant::now();
        loop {
            // Register interest before checking so a release between the check and the wait is not lost
            let freed = self.shared.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            let holder = Uuid::new_v4();
            if let Some(grant) = self
                .shared
                .store
                .try_lock(&self.shared.namespace, keys, holder)
                .await?
            {
                crate::metrics::record_lock_wait(
                    &self.shared.namespace,
                    started.elapsed().as_secs_f64(),
                );
                return Ok(Reservation {
                    shared: self.shared.clone(),
                    key: grant.key,
                    nonce: grant.nonce,
                    holder: grant.holder,
                    lease_renewal: self.lease_renewal,
                    settled: AtomicBool::new(false),
                });
            }

            let _ = tokio::time::timeout(self.poll_interval, freed).await;
        }
    }

    /// Free `address` regardless of holder, optionally overwriting its nonce
    pub async fn unlock(&self, address: Address, new_nonce: Option<u64>) -> RelayerResult<()> {
        self.shared
            .store
            .unlock(&self.shared.namespace, &address_key(&address), new_nonce)
            .await?;
        self.shared.freed.notify_waiters();
        info!("Unlocked {:?} (nonce override: {:?})", address, new_nonce);
        Ok(())
    }

    pub async fn reservation(&self, address: Address) -> RelayerResult<Option<ReservationRecord>> {
        self.shared
            .store
            .get(&self.shared.namespace, &address_key(&address))
            .await
    }

    pub async fn reservations(&self) -> RelayerResult<Vec<ReservationRecord>> {
        self.shared.store.list(&self.shared.namespace).await
    }
}

/// An exclusive claim on one store record.
///
/// Settle it with `release` or `fail`. A reservation dropped unsettled is
/// failed in the background so the record never stays locked.
pub struct Reservation {
    shared: Arc<LockShared>,
    key: String,
    nonce: u64,
    holder: Uuid,
    lease_renewal: Duration,
    settled: AtomicBool,
}

impl Reservation {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Nonce stored for the record when it was claimed
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Free the record and advance its nonce. Later calls are no-ops.
    pub async fn release(&self) -> RelayerResult<()> {
        self.settle(Settlement::Release).await
    }

    /// Free the record without advancing its nonce. Later calls are no-ops.
    pub async fn fail(&self) -> RelayerResult<()> {
        self.settle(Settlement::Fail).await
    }

    /// Renew the lease in the background until the returned guard is dropped.
    ///
    /// Stores that reclaim abandoned locks after a TTL would otherwise hand the
    /// record to another holder while a long run still uses it.
    pub fn keep_alive(&self) -> LeaseRenewal {
        let shared = self.shared.clone();
        let key = self.key.clone();
        let holder = self.holder;
        let every = self.lease_renewal;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match shared.store.renew(&shared.namespace, &key, holder).await {
                    Ok(true) => debug!("Renewed lease on {}", key),
                    Ok(false) => {
                        warn!("Lease on {} was lost, no longer renewing", key);
                        break;
                    }
                    Err(e) => warn!("Failed to renew lease on {}: {}", key, e),
                }
            }
        });

        LeaseRenewal { handle }
    }

    /// Mark as settled without touching the store, after an `unlock` override
    pub(crate) fn disarm(&self) {
        self.settled.store(true, Ordering::SeqCst);
    }

    async fn settle(&self, settlement: Settlement) -> RelayerResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.shared.settle(&self.key, self.holder, settlement).await {
            Ok(true) => {
                debug!("{:?} {} at nonce {}", settlement, self.key, self.nonce);
                Ok(())
            }
            Ok(false) => {
                warn!(
                    "{:?} of {} ignored: reservation was taken over before settlement",
                    settlement, self.key
                );
                Ok(())
            }
            Err(e) => {
                // Leave it armed so the drop guard retries
                self.settled.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!("Reservation {} dropped unsettled, failing it", self.key);
        let shared = self.shared.clone();
        let key = std::mem::take(&mut self.key);
        let holder = self.holder;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = shared.settle(&key, holder, Settlement::Fail).await {
                        error!("Failed to free dropped reservation {}: {}", key, e);
                    }
                });
            }
            Err(_) => {
                error!(
                    "Invariant violation: reservation {} dropped outside a runtime and stays locked",
                    key
                );
            }
        }
    }
}

/// Stops lease renewal when dropped
pub struct LeaseRenewal {
    handle: JoinHandle<()>,
}

impl Drop for LeaseRenewal {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A reservation on a pool address
pub struct NonceReservation {
    address: Address,
    reservation: Reservation,
}

impl NonceReservation {
    pub fn address(&self) -> Address {
        self.address
    }
}

impl Deref for NonceReservation {
    type Target = Reservation;

    fn deref(&self) -> &Reservation {
        &self.reservation
    }
}
