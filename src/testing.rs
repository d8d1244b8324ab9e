//! In-memory chain and wiring shared by unit tests

use crate::chain::{ConfirmationWatcher, NetworkClient, SignedTransaction};
use crate::config::{GasConfig, LockConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::state::{
    LockGrant, MemoryLockStore, NonceLockStore, ReservationRecord, Settlement,
};
use crate::tx::{GasEstimator, NonceLock, TransactionSender, WALLET_NAMESPACE};
use crate::wallet::{AccountPool, SignerAccount};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionReceipt, H256, U256, U64};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const TEST_CHAIN_ID: u64 = 122;

#[derive(Default)]
struct ChainState {
    counts: HashMap<Address, u64>,
    /// Next nonce including transactions waiting in the node's pool, when ahead of `counts`
    pending: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    estimate: Option<U256>,
    send_errors: VecDeque<String>,
    send_delay: Duration,
    revert_next: bool,
    block: u64,
    receipts: HashMap<H256, TransactionReceipt>,
    accepted: Vec<(Address, u64, U256)>,
    transfers: Vec<(Address, Address, U256)>,
    in_flight: Vec<Address>,
    max_in_flight: usize,
    duplicate_in_flight: bool,
}

impl ChainState {
    fn check_nonce(&self, address: Address, nonce: u64) -> RelayerResult<()> {
        let expected = self.pending_count(address);
        if nonce < expected {
            Err(RelayerError::from_broadcast(
                address,
                nonce,
                format!("nonce too low: next nonce {}, tx nonce {}", expected, nonce),
            ))
        } else if nonce > expected {
            Err(RelayerError::from_broadcast(
                address,
                nonce,
                format!("nonce too high: next nonce {}, tx nonce {}", expected, nonce),
            ))
        } else {
            Ok(())
        }
    }

    fn pending_count(&self, address: Address) -> u64 {
        let mined = self.counts.get(&address).copied().unwrap_or(0);
        self.pending.get(&address).copied().unwrap_or(0).max(mined)
    }

    fn accept(&mut self, signed: &SignedTransaction) -> RelayerResult<H256> {
        if let Some(message) = self.send_errors.pop_front() {
            return Err(RelayerError::from_broadcast(signed.from, signed.nonce, message));
        }
        self.check_nonce(signed.from, signed.nonce)?;

        let tx = &signed.tx;
        let hash = tx.hash(&signed.signature);
        let gas = tx.gas().copied().unwrap_or_default();
        let value = tx.value().copied().unwrap_or_default();
        let to = tx.to_addr().copied().unwrap_or_default();
        let is_transfer = tx.data().map(|d| d.is_empty()).unwrap_or(true);

        // Pool transactions below this nonce are treated as mined with it
        self.counts.insert(signed.from, signed.nonce + 1);
        self.pending.remove(&signed.from);
        self.block += 1;
        self.accepted.push((signed.from, signed.nonce, gas));

        if is_transfer {
            let from_balance = self.balances.entry(signed.from).or_default();
            *from_balance = from_balance.saturating_sub(value);
            *self.balances.entry(to).or_default() += value;
            self.transfers.push((signed.from, to, value));
        }

        let status = if std::mem::take(&mut self.revert_next) { 0u64 } else { 1 };
        let receipt = TransactionReceipt {
            transaction_hash: hash,
            block_number: Some(U64::from(self.block)),
            from: signed.from,
            to: Some(to),
            gas_used: Some(gas),
            status: Some(U64::from(status)),
            ..Default::default()
        };
        self.receipts.insert(hash, receipt);

        Ok(hash)
    }
}

/// A single-node chain that mines every accepted transaction into its own block
pub struct FakeChain {
    chain_id: u64,
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(ChainState {
                estimate: Some(U256::from(50_000)),
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    pub fn set_transaction_count(&self, address: Address, count: u64) {
        self.state().counts.insert(address, count);
    }

    /// Pretend transactions up to `count` are waiting in the node's pool
    pub fn set_pending_transaction_count(&self, address: Address, count: u64) {
        self.state().pending.insert(address, count);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state().balances.insert(address, balance);
    }

    /// Hold every broadcast this long before the node answers
    pub fn set_send_delay(&self, delay: Duration) {
        self.state().send_delay = delay;
    }

    /// `None` makes gas estimation fail
    pub fn set_estimate(&self, estimate: Option<U256>) {
        self.state().estimate = estimate;
    }

    /// Queue a node error for the next broadcast
    pub fn push_send_error(&self, message: &str) {
        self.state().send_errors.push_back(message.to_string());
    }

    pub fn pending_send_errors(&self) -> usize {
        self.state().send_errors.len()
    }

    /// The next accepted transaction gets a failed receipt
    pub fn revert_next(&self) {
        self.state().revert_next = true;
    }

    /// (from, nonce, gas limit) of every accepted transaction, in order
    pub fn accepted(&self) -> Vec<(Address, u64, U256)> {
        self.state().accepted.clone()
    }

    /// (from, to, value) of every accepted plain transfer
    pub fn transfers(&self) -> Vec<(Address, Address, U256)> {
        self.state().transfers.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    /// Whether one address ever had two broadcasts outstanding at once
    pub fn saw_duplicate_in_flight(&self) -> bool {
        self.state().duplicate_in_flight
    }

    pub fn check_nonce(&self, address: Address, nonce: u64) -> RelayerResult<()> {
        self.state().check_nonce(address, nonce)
    }
}

#[async_trait]
impl NetworkClient for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> RelayerResult<U256> {
        self.state()
            .estimate
            .ok_or_else(|| RelayerError::GasEstimation("execution reverted".to_string()))
    }

    async fn get_transaction_count(&self, address: Address) -> RelayerResult<u64> {
        Ok(self.state().counts.get(&address).copied().unwrap_or(0))
    }

    async fn get_pending_transaction_count(&self, address: Address) -> RelayerResult<u64> {
        Ok(self.state().pending_count(address))
    }

    async fn get_balance(&self, address: Address) -> RelayerResult<U256> {
        Ok(self.state().balances.get(&address).copied().unwrap_or_default())
    }

    async fn send_transaction(&self, tx: &SignedTransaction) -> RelayerResult<H256> {
        let delay = {
            let mut state = self.state();
            if state.in_flight.contains(&tx.from) {
                state.duplicate_in_flight = true;
            }
            state.in_flight.push(tx.from);
            state.max_in_flight = state.max_in_flight.max(state.in_flight.len());
            state.send_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(pos) = state.in_flight.iter().position(|a| *a == tx.from) {
            state.in_flight.remove(pos);
        }
        state.accept(tx)
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<TransactionReceipt>> {
        Ok(self.state().receipts.get(&tx_hash).cloned())
    }

    async fn get_block_number(&self) -> RelayerResult<u64> {
        Ok(self.state().block)
    }
}

/// In-memory store that counts lease renewals and can fail settlements on demand
#[derive(Default)]
pub struct TestStore {
    inner: MemoryLockStore,
    renewals: AtomicUsize,
    refused_renewals: AtomicUsize,
    failing_settles: AtomicUsize,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    pub fn refused_renewals(&self) -> usize {
        self.refused_renewals.load(Ordering::SeqCst)
    }

    /// The next `n` settlements fail with a store error without applying
    pub fn fail_next_settles(&self, n: usize) {
        self.failing_settles.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl NonceLockStore for TestStore {
    async fn insert_if_absent(&self, namespace: &str, key: &str, nonce: u64) -> RelayerResult<bool> {
        self.inner.insert_if_absent(namespace, key, nonce).await
    }

    async fn existing_keys(&self, namespace: &str, keys: &[String]) -> RelayerResult<Vec<String>> {
        self.inner.existing_keys(namespace, keys).await
    }

    async fn try_lock(
        &self,
        namespace: &str,
        keys: &[String],
        holder: Uuid,
    ) -> RelayerResult<Option<LockGrant>> {
        self.inner.try_lock(namespace, keys, holder).await
    }

    async fn settle(
        &self,
        namespace: &str,
        key: &str,
        holder: Uuid,
        settlement: Settlement,
    ) -> RelayerResult<bool> {
        let failing = self
            .failing_settles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RelayerError::LockStore("connection reset".to_string()));
        }
        self.inner.settle(namespace, key, holder, settlement).await
    }

    async fn renew(&self, namespace: &str, key: &str, holder: Uuid) -> RelayerResult<bool> {
        let renewed = self.inner.renew(namespace, key, holder).await?;
        if renewed {
            self.renewals.fetch_add(1, Ordering::SeqCst);
        } else {
            self.refused_renewals.fetch_add(1, Ordering::SeqCst);
        }
        Ok(renewed)
    }

    async fn unlock(&self, namespace: &str, key: &str, new_nonce: Option<u64>) -> RelayerResult<()> {
        self.inner.unlock(namespace, key, new_nonce).await
    }

    async fn get(&self, namespace: &str, key: &str) -> RelayerResult<Option<ReservationRecord>> {
        self.inner.get(namespace, key).await
    }

    async fn list(&self, namespace: &str) -> RelayerResult<Vec<ReservationRecord>> {
        self.inner.list(namespace).await
    }

    async fn health_check(&self) -> RelayerResult<()> {
        self.inner.health_check().await
    }
}

/// Accounts for private keys 1..=n
pub fn test_accounts(n: usize, chain_id: u64) -> Vec<SignerAccount> {
    (0..n)
        .map(|i| SignerAccount::from_private_key(&format!("{:064x}", i + 1), chain_id).unwrap())
        .collect()
}

pub fn test_lock_config() -> LockConfig {
    LockConfig {
        poll_interval_ms: 20,
        lock_ttl_secs: 300,
    }
}

pub struct Harness {
    pub chain: Arc<FakeChain>,
    pub store: Arc<TestStore>,
    pub lock: Arc<NonceLock>,
    pub pool: Arc<AccountPool>,
    pub sender: TransactionSender,
}

/// A sender over a fresh fake chain with `pool_size` accounts, the first `funded` of them funded
pub async fn harness(pool_size: usize, funded: usize) -> Harness {
    let chain = Arc::new(FakeChain::new(TEST_CHAIN_ID));
    let accounts = test_accounts(pool_size, TEST_CHAIN_ID);
    for account in accounts.iter().take(funded) {
        chain.set_balance(account.address(), U256::exp10(24));
    }

    let store = Arc::new(TestStore::new());
    let lock = Arc::new(NonceLock::new(
        store.clone(),
        WALLET_NAMESPACE,
        &test_lock_config(),
    ));
    let pool = Arc::new(
        AccountPool::init(accounts, chain.clone(), &lock, U256::zero())
            .await
            .unwrap(),
    );

    let watcher = ConfirmationWatcher::new(
        chain.clone(),
        1,
        Duration::from_millis(10),
        Duration::from_secs(5),
    );
    let sender = TransactionSender::new(
        chain.clone(),
        pool.clone(),
        lock.clone(),
        GasEstimator::new(&GasConfig::default()),
        watcher,
    );

    Harness {
        chain,
        store,
        lock,
        pool,
        sender,
    }
}
