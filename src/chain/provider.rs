//! Chain provider with multi-RPC support and automatic failover

use super::{NetworkClient, SignedTransaction};
use crate::config::ChainConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub async fn new(config: ChainConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::Network(format!(
                "No valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        // Signing for the wrong chain would make every broadcast fail
        match http_providers[0].get_chainid().await {
            Ok(id) if id.as_u64() != config.chain_id => {
                return Err(RelayerError::Config(format!(
                    "RPC reports chain {} but chain {} is configured",
                    id, config.chain_id
                )));
            }
            Ok(_) => {}
            Err(e) => warn!("Could not verify chain id of {}: {}", config.name, e),
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    async fn transaction_count(&self, address: Address, block: Option<BlockId>) -> RelayerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_count(address, block).await {
                Ok(count) => return Ok(count.as_u64()),
                Err(e) => {
                    warn!("Failed to get transaction count for {:?}: {}", address, e);
                    self.failover();
                }
            }
        }

        Err(RelayerError::Network(format!(
            "All providers failed to get transaction count for {:?}",
            address
        )))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}

#[async_trait]
impl NetworkClient for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| RelayerError::GasEstimation(e.to_string()))
    }

    async fn get_transaction_count(&self, address: Address) -> RelayerResult<u64> {
        self.transaction_count(address, None).await
    }

    async fn get_pending_transaction_count(&self, address: Address) -> RelayerResult<u64> {
        self.transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
    }

    async fn get_balance(&self, address: Address) -> RelayerResult<U256> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_balance(address, None).await {
                Ok(balance) => return Ok(balance),
                Err(e) => {
                    warn!("Failed to get balance for {:?}: {}", address, e);
                    self.failover();
                }
            }
        }

        Err(RelayerError::Network(format!(
            "All providers failed to get balance for {:?}",
            address
        )))
    }

    async fn send_transaction(&self, tx: &SignedTransaction) -> RelayerResult<H256> {
        // No failover here: a second node may already have the transaction in its pool
        match self.http().send_raw_transaction(tx.rlp()).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) => Err(RelayerError::from_broadcast(tx.from, tx.nonce, e.to_string())),
        }
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| RelayerError::Network(e.to_string()))
    }

    async fn get_block_number(&self) -> RelayerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(RelayerError::Network(format!(
            "All providers failed on chain {}",
            self.config.chain_id
        )))
    }
}
