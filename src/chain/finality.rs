//! Confirmation tracking for broadcast transactions
//!
//! After a node acknowledges a transaction the sender keeps polling for its
//! receipt and for the chain head, reporting each new confirmation depth until
//! the configured depth is reached.

use super::NetworkClient;
use crate::config::ChainConfig;
use crate::error::{RelayerError, RelayerResult};

use ethers::types::{TransactionReceipt, H256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Waits for a transaction to be included and confirmed
pub struct ConfirmationWatcher {
    client: Arc<dyn NetworkClient>,
    /// Required confirmation blocks (the inclusion block counts as one)
    confirmation_blocks: u64,
    poll_interval: Duration,
    timeout: Duration,
}

impl ConfirmationWatcher {
    pub fn new(
        client: Arc<dyn NetworkClient>,
        confirmation_blocks: u64,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            confirmation_blocks: confirmation_blocks.max(1),
            poll_interval,
            timeout,
        }
    }

    pub fn from_config(client: Arc<dyn NetworkClient>, config: &ChainConfig) -> Self {
        Self::new(
            client,
            config.confirmation_blocks,
            Duration::from_millis(config.receipt_poll_interval_ms),
            Duration::from_secs(config.receipt_timeout_secs),
        )
    }

    /// Wait until `tx_hash` reaches the required depth.
    ///
    /// `on_confirmation` is invoked once per newly observed depth, in increasing order.
    pub async fn wait<F>(&self, tx_hash: H256, mut on_confirmation: F) -> RelayerResult<TransactionReceipt>
    where
        F: FnMut(u64) + Send,
    {
        let watch = async {
            let mut reported = 0u64;
            loop {
                match self.poll(tx_hash).await {
                    Ok(Some((receipt, confirmations))) => {
                        if confirmations > reported {
                            for depth in (reported + 1)..=confirmations {
                                on_confirmation(depth);
                            }
                            reported = confirmations;
                        }
                        if confirmations >= self.confirmation_blocks {
                            info!(
                                "Transaction {:?} confirmed ({} confirmations)",
                                tx_hash, confirmations
                            );
                            return receipt;
                        }
                        debug!(
                            "Transaction {:?} has {} / {} confirmations",
                            tx_hash, confirmations, self.confirmation_blocks
                        );
                    }
                    Ok(None) => {
                        debug!("Receipt for {:?} not available yet", tx_hash);
                    }
                    Err(e) => {
                        warn!("Failed to poll receipt for {:?}: {}", tx_hash, e);
                    }
                }

                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(self.timeout, watch)
            .await
            .map_err(|_| RelayerError::Timeout {
                operation: format!("receipt of {:?}", tx_hash),
            })
    }

    async fn poll(&self, tx_hash: H256) -> RelayerResult<Option<(TransactionReceipt, u64)>> {
        let receipt = match self.client.get_transaction_receipt(tx_hash).await? {
            Some(receipt) => receipt,
            None => return Ok(None),
        };

        let tx_block = match receipt.block_number {
            Some(block) => block.as_u64(),
            None => return Ok(None),
        };

        let current_block = self.client.get_block_number().await?;
        let confirmations = current_block.saturating_sub(tx_block) + 1;

        Ok(Some((receipt, confirmations)))
    }
}
