//! Transaction sender: pooled signers, one resync retry on nonce conflicts

use super::gas::{GasEstimator, GasOverrides};
use super::intent::TransactionIntent;
use super::nonce::{NonceLock, NonceReservation};
use crate::chain::{ConfirmationWatcher, NetworkClient, SignedTransaction};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{TxEvent, TxObserver};
use crate::wallet::AccountPool;

use ethers::signers::Signer;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionReceipt, TransactionRequest, H256, U256, U64};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const RELEASE_ATTEMPTS: u32 = 3;
const RELEASE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Submits transactions from the account pool.
///
/// Every submission holds a reservation on exactly one pool address from just
/// before signing until the node returns a hash, so two in-flight transactions
/// never share an (address, nonce) pair.
pub struct TransactionSender {
    client: Arc<dyn NetworkClient>,
    pool: Arc<AccountPool>,
    nonce_lock: Arc<NonceLock>,
    gas_estimator: GasEstimator,
    watcher: ConfirmationWatcher,
}

impl TransactionSender {
    /// Create a new transaction sender
    pub fn new(
        client: Arc<dyn NetworkClient>,
        pool: Arc<AccountPool>,
        nonce_lock: Arc<NonceLock>,
        gas_estimator: GasEstimator,
        watcher: ConfirmationWatcher,
    ) -> Self {
        info!(
            "Transaction sender initialized with {} funded of {} pool accounts",
            pool.funded_addresses().len(),
            pool.addresses().len()
        );

        Self {
            client,
            pool,
            nonce_lock,
            gas_estimator,
            watcher,
        }
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    /// Submit `intent` and wait for its receipt.
    ///
    /// `observer` receives the lifecycle notifications, ending with exactly one
    /// `Receipt` or `Error`.
    pub async fn submit(
        &self,
        intent: TransactionIntent,
        observer: &dyn TxObserver,
        overrides: GasOverrides,
    ) -> RelayerResult<TransactionReceipt> {
        let result = self.submit_with_resync(&intent, observer, &overrides).await;

        match &result {
            Ok(receipt) => {
                crate::metrics::record_tx_confirmed(self.client.chain_id());
                observer.notify(&TxEvent::Receipt(receipt.clone()));
            }
            Err(e) => {
                crate::metrics::record_tx_failed(self.client.chain_id());
                if e.should_alert() {
                    error!(
                        alert = true,
                        "Transaction to {:?} failed, operator action needed: {}",
                        intent.to,
                        e
                    );
                } else if e.is_retryable() {
                    warn!("Transaction to {:?} failed, safe to resubmit: {}", intent.to, e);
                } else {
                    error!("Transaction to {:?} failed: {}", intent.to, e);
                }
                observer.notify(&TxEvent::Error(e.to_string()));
            }
        }

        result
    }

    /// Send native currency, from `from` when given or any funded account otherwise
    pub async fn send_native(
        &self,
        from: Option<Address>,
        to: Address,
        value: U256,
        observer: &dyn TxObserver,
        overrides: GasOverrides,
    ) -> RelayerResult<TransactionReceipt> {
        let intent = match from {
            Some(address) => TransactionIntent::native(to, value).with_signer(address),
            None => TransactionIntent::native(to, value),
        };
        self.submit(intent, observer, overrides).await
    }

    /// Balance of `address`, or of the primary pool address
    pub async fn get_balance(&self, address: Option<Address>) -> RelayerResult<U256> {
        self.pool.get_balance(address).await
    }

    async fn submit_with_resync(
        &self,
        intent: &TransactionIntent,
        observer: &dyn TxObserver,
        overrides: &GasOverrides,
    ) -> RelayerResult<TransactionReceipt> {
        let signers = match intent.from {
            Some(address) => {
                if self.pool.account(&address).is_none() {
                    return Err(RelayerError::Wallet(format!(
                        "{:?} is not a pool account",
                        address
                    )));
                }
                vec![address]
            }
            None => self.pool.funded_addresses().to_vec(),
        };
        let estimate_from = signers.first().copied().unwrap_or_else(|| self.pool.primary_address());

        let gas_limit = self
            .gas_estimator
            .resolve_gas_limit(self.client.as_ref(), intent, estimate_from, overrides)
            .await;
        let gas_price = self.gas_estimator.resolve_gas_price(overrides);

        let mut candidates = signers;
        let mut resynced = false;

        loop {
            let reservation = self.nonce_lock.lock(&candidates).await?;
            let address = reservation.address();
            let nonce = reservation.nonce();
            debug!(
                "Sending tx from {:?} | nonce {} | gas {} | max cost {}",
                address,
                nonce,
                gas_limit,
                GasEstimator::calculate_cost(gas_limit, gas_price)
            );

            match self.broadcast(intent, &reservation, gas_limit, gas_price).await {
                Ok(tx_hash) => {
                    // The node holds the transaction, so its nonce is consumed
                    self.release_reservation(&reservation).await;
                    drop(reservation);

                    info!("Transaction sent: {:?} from {:?} nonce {}", tx_hash, address, nonce);
                    crate::metrics::record_tx_submitted(self.client.chain_id());
                    observer.notify(&TxEvent::Hash(tx_hash));

                    return self.await_receipt(tx_hash, observer).await;
                }
                Err(e) if e.is_nonce_conflict() => {
                    // Pending count, so transactions still in the node's pool are not reused
                    let fresh = match self.client.get_pending_transaction_count(address).await {
                        Ok(count) => count,
                        Err(count_err) => {
                            self.fail_reservation(&reservation).await;
                            return Err(count_err);
                        }
                    };

                    warn!(
                        "Nonce conflict for {:?}: local {} chain {} ({}), resyncing",
                        address, nonce, fresh, e
                    );
                    crate::metrics::record_nonce_resync(self.client.chain_id());

                    self.nonce_lock.unlock(address, Some(fresh)).await?;
                    reservation.disarm();

                    if resynced {
                        return Err(RelayerError::SubmissionFailed(format!(
                            "nonce conflict persisted after resync for {:?}: {}",
                            address, e
                        )));
                    }
                    resynced = true;
                    // Retry on the same account so the corrected nonce is the one used
                    candidates = vec![address];
                }
                Err(e) => {
                    self.fail_reservation(&reservation).await;
                    return Err(e);
                }
            }
        }
    }

    /// Advance the reservation's nonce, retrying store errors.
    ///
    /// If every attempt fails the drop guard frees the record without
    /// advancing, and the next use of the account resyncs on the conflict.
    async fn release_reservation(&self, reservation: &NonceReservation) {
        for attempt in 1..=RELEASE_ATTEMPTS {
            match reservation.release().await {
                Ok(()) => return,
                Err(e) if attempt < RELEASE_ATTEMPTS => {
                    warn!(
                        "Release of {:?} failed (attempt {}/{}): {}",
                        reservation.address(),
                        attempt,
                        RELEASE_ATTEMPTS,
                        e
                    );
                    tokio::time::sleep(RELEASE_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    error!(
                        "Failed to release {:?} after broadcast: {}",
                        reservation.address(),
                        e
                    );
                }
            }
        }
    }

    async fn fail_reservation(&self, reservation: &NonceReservation) {
        if let Err(e) = reservation.fail().await {
            error!("Failed to free {:?}: {}", reservation.address(), e);
        }
    }

    /// Sign and broadcast with the reserved nonce
    async fn broadcast(
        &self,
        intent: &TransactionIntent,
        reservation: &NonceReservation,
        gas_limit: U256,
        gas_price: U256,
    ) -> RelayerResult<H256> {
        let address = reservation.address();
        let account = self.pool.account(&address).ok_or_else(|| {
            RelayerError::InvariantViolation(format!("reserved {:?} is not a pool account", address))
        })?;

        let tx: TypedTransaction = TransactionRequest::new()
            .from(address)
            .to(intent.to)
            .value(intent.value)
            .data(intent.data.clone())
            .nonce(reservation.nonce())
            .gas(gas_limit)
            .gas_price(gas_price)
            .chain_id(U64::from(self.client.chain_id()))
            .into();

        let signature = account
            .wallet()
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;

        let signed = SignedTransaction {
            tx,
            signature,
            from: address,
            nonce: reservation.nonce(),
        };

        timeout(SEND_TIMEOUT, self.client.send_transaction(&signed))
            .await
            .map_err(|_| RelayerError::Timeout {
                operation: "send transaction".to_string(),
            })?
    }

    async fn await_receipt(
        &self,
        tx_hash: H256,
        observer: &dyn TxObserver,
    ) -> RelayerResult<TransactionReceipt> {
        let receipt = self
            .watcher
            .wait(tx_hash, |confirmations| {
                observer.notify(&TxEvent::Confirmation {
                    tx_hash,
                    confirmations,
                })
            })
            .await?;

        if receipt.status == Some(U64::zero()) {
            return Err(RelayerError::Reverted {
                tx_hash: format!("{:?}", tx_hash),
            });
        }

        Ok(receipt)
    }
}
