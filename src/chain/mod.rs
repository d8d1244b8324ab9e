//! Chain module - the network client the relayer submits through
//!
//! This module provides:
//! - The `NetworkClient` seam used by the pool, the lock and the sender
//! - An HTTP provider with multi-RPC failover
//! - Confirmation watching for broadcast transactions

pub mod finality;
pub mod provider;

pub use finality::ConfirmationWatcher;
pub use provider::ChainProvider;

use crate::error::RelayerResult;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Signature, TransactionReceipt, H256, U256};

/// A transaction signed by a pool account, ready for broadcast
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub tx: TypedTransaction,
    pub signature: Signature,
    pub from: Address,
    pub nonce: u64,
}

impl SignedTransaction {
    /// RLP encoding suitable for `eth_sendRawTransaction`
    pub fn rlp(&self) -> Bytes {
        self.tx.rlp_signed(&self.signature)
    }
}

/// Operations the relayer needs from a chain node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Chain ID transactions are signed for
    fn chain_id(&self) -> u64;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256>;

    /// Number of transactions the chain has accepted from `address`
    async fn get_transaction_count(&self, address: Address) -> RelayerResult<u64>;

    /// Like `get_transaction_count`, but also counting transactions still in the node's pool
    async fn get_pending_transaction_count(&self, address: Address) -> RelayerResult<u64>;

    async fn get_balance(&self, address: Address) -> RelayerResult<U256>;

    /// Broadcast a signed transaction, returning its hash once the node accepts it
    async fn send_transaction(&self, tx: &SignedTransaction) -> RelayerResult<H256>;

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<TransactionReceipt>>;

    async fn get_block_number(&self) -> RelayerResult<u64>;
}
