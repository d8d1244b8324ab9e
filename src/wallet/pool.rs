//! Pool of signer accounts

use crate::chain::NetworkClient;
use crate::config::WalletConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::tx::NonceLock;

use ethers::signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer};
use ethers::types::{Address, U256};
use std::sync::Arc;
use tracing::{error, info};

/// One signer: its address, key and derivation index
#[derive(Debug, Clone)]
pub struct SignerAccount {
    address: Address,
    wallet: LocalWallet,
    derivation_index: u32,
}

impl SignerAccount {
    pub fn new(wallet: LocalWallet, derivation_index: u32) -> Self {
        Self {
            address: wallet.address(),
            wallet,
            derivation_index,
        }
    }

    /// Derive account `index` on the path `m/44'/60'/0'/0/{index}`
    pub fn from_mnemonic(phrase: &str, index: u32, chain_id: u64) -> RelayerResult<Self> {
        let wallet = MnemonicBuilder::<English>::default()
            .phrase(phrase)
            .derivation_path(&format!("m/44'/60'/0'/0/{}", index))
            .map_err(|e| RelayerError::Wallet(format!("Invalid derivation path: {}", e)))?
            .build()
            .map_err(|e| RelayerError::Wallet(format!("Invalid mnemonic: {}", e)))?;

        Ok(Self::new(wallet.with_chain_id(chain_id), index))
    }

    pub fn from_private_key(key: &str, chain_id: u64) -> RelayerResult<Self> {
        let key = key.trim();
        let wallet = key
            .strip_prefix("0x")
            .unwrap_or(key)
            .parse::<LocalWallet>()
            .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))?;

        Ok(Self::new(wallet.with_chain_id(chain_id), 0))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }

    pub fn derivation_index(&self) -> u32 {
        self.derivation_index
    }
}

/// Signer accounts and the subset funded well enough to pay for gas.
///
/// The funded subset is computed once by `init`; it always contains at least one address.
pub struct AccountPool {
    accounts: Vec<SignerAccount>,
    funded: Vec<Address>,
    client: Arc<dyn NetworkClient>,
}

impl AccountPool {
    /// Load accounts from the environment variables named in `config`.
    ///
    /// A private key takes precedence and yields a pool of one.
    pub fn load_accounts(config: &WalletConfig, chain_id: u64) -> RelayerResult<Vec<SignerAccount>> {
        if let Some(var) = &config.private_key_env {
            if let Ok(key) = std::env::var(var) {
                let account = SignerAccount::from_private_key(&key, chain_id)?;
                info!("Initialized by private key: {:?}", account.address());
                return Ok(vec![account]);
            }
        }

        if let Some(var) = &config.mnemonic_env {
            if let Ok(phrase) = std::env::var(var) {
                let accounts = (0..config.number_of_accounts)
                    .map(|i| SignerAccount::from_mnemonic(phrase.trim(), i, chain_id))
                    .collect::<RelayerResult<Vec<_>>>()?;
                info!(
                    "Initialized by mnemonic: {:?}",
                    accounts.iter().map(|a| a.address()).collect::<Vec<_>>()
                );
                return Ok(accounts);
            }
        }

        Err(RelayerError::Wallet(
            "No wallet configured. Set the mnemonic or private key environment variable".to_string(),
        ))
    }

    /// Register nonce reservations for every account and snapshot which are funded.
    ///
    /// Fails with `PoolExhausted` when no account holds more than `min_balance`.
    pub async fn init(
        accounts: Vec<SignerAccount>,
        client: Arc<dyn NetworkClient>,
        nonce_lock: &NonceLock,
        min_balance: U256,
    ) -> RelayerResult<Self> {
        let addresses: Vec<Address> = accounts.iter().map(|a| a.address()).collect();
        nonce_lock
            .create_list_if_not_exists(&addresses, client.as_ref())
            .await?;

        let mut funded = Vec::new();
        for address in &addresses {
            let balance = client.get_balance(*address).await?;
            info!("Admin wallet {:?} balance {}", address, balance);
            crate::metrics::record_account_balance(address, balance);
            if balance > min_balance {
                funded.push(*address);
            }
        }

        if funded.is_empty() {
            error!("No admin wallet with funds");
            return Err(RelayerError::PoolExhausted(format!(
                "none of {} pool accounts holds more than {} wei",
                addresses.len(),
                min_balance
            )));
        }

        crate::metrics::record_pool_size(addresses.len(), funded.len());
        info!(
            "Account pool ready: {} of {} accounts funded, primary {:?}",
            funded.len(),
            addresses.len(),
            funded[0]
        );

        Ok(Self {
            accounts,
            funded,
            client,
        })
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.accounts.iter().map(|a| a.address()).collect()
    }

    pub fn funded_addresses(&self) -> &[Address] {
        &self.funded
    }

    /// First funded address; the source of top-ups
    pub fn primary_address(&self) -> Address {
        self.funded[0]
    }

    pub fn account(&self, address: &Address) -> Option<&SignerAccount> {
        self.accounts.iter().find(|a| a.address() == *address)
    }

    pub fn is_funded(&self, address: &Address) -> bool {
        self.funded.contains(address)
    }

    /// Current on-chain balance of `address`, or of the primary address
    pub async fn get_balance(&self, address: Option<Address>) -> RelayerResult<U256> {
        let address = address.unwrap_or_else(|| self.primary_address());
        self.client.get_balance(address).await
    }
}
