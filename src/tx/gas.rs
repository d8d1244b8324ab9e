//! Gas limit and gas price resolution

use super::TransactionIntent;
use crate::chain::NetworkClient;
use crate::config::GasConfig;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionRequest, U256};
use tracing::{debug, warn};

/// Caller-supplied gas values that bypass estimation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GasOverrides {
    pub gas: Option<U256>,
    pub gas_price: Option<U256>,
}

/// Gas estimator for transactions
pub struct GasEstimator {
    default_gas: U256,
    default_gas_price: U256,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new(config: &GasConfig) -> Self {
        Self {
            default_gas: U256::from(config.default_gas),
            default_gas_price: config.default_gas_price_wei(),
        }
    }

    /// Gas limit: override, else a network estimate, else the default.
    ///
    /// Estimation failures degrade to the default rather than aborting the submission.
    pub async fn resolve_gas_limit(
        &self,
        client: &dyn NetworkClient,
        intent: &TransactionIntent,
        from: Address,
        overrides: &GasOverrides,
    ) -> U256 {
        if let Some(gas) = overrides.gas {
            return gas;
        }
        if intent.is_native() {
            return self.default_gas;
        }

        let tx: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(intent.to)
            .value(intent.value)
            .data(intent.data.clone())
            .into();

        match client.estimate_gas(&tx).await {
            Ok(gas) => {
                debug!("Estimated gas for call to {:?}: {}", intent.to, gas);
                gas
            }
            Err(e) => {
                warn!("Failed to estimate gas for tx to {:?}: {}", intent.to, e);
                crate::metrics::record_gas_estimation_fallback(client.chain_id());
                self.default_gas
            }
        }
    }

    pub fn resolve_gas_price(&self, overrides: &GasOverrides) -> U256 {
        overrides.gas_price.unwrap_or(self.default_gas_price)
    }

    /// Calculate total cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: U256) -> U256 {
        gas_limit * gas_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockNetworkClient;
    use crate::error::RelayerError;

    fn estimator() -> GasEstimator {
        GasEstimator::new(&GasConfig {
            default_gas: 200_000,
            default_gas_price_gwei: 1,
        })
    }

    fn call() -> TransactionIntent {
        TransactionIntent::call(Address::repeat_byte(9), vec![0xde, 0xad])
    }

    #[tokio::test]
    async fn test_uses_estimate_for_calls() {
        let mut client = MockNetworkClient::new();
        client
            .expect_estimate_gas()
            .times(1)
            .returning(|_| Ok(U256::from(54_321)));

        let gas = estimator()
            .resolve_gas_limit(&client, &call(), Address::zero(), &GasOverrides::default())
            .await;
        assert_eq!(gas, U256::from(54_321));
    }

    #[tokio::test]
    async fn test_falls_back_to_default_when_estimation_fails() {
        let mut client = MockNetworkClient::new();
        client
            .expect_estimate_gas()
            .returning(|_| Err(RelayerError::GasEstimation("execution reverted".to_string())));
        client.expect_chain_id().return_const(122u64);

        let gas = estimator()
            .resolve_gas_limit(&client, &call(), Address::zero(), &GasOverrides::default())
            .await;
        assert_eq!(gas, U256::from(200_000));
    }

    #[tokio::test]
    async fn test_overrides_and_native_skip_estimation() {
        let mut client = MockNetworkClient::new();
        client.expect_estimate_gas().never();

        let overrides = GasOverrides {
            gas: Some(U256::from(21_000)),
            gas_price: Some(U256::from(7)),
        };
        let estimator = estimator();

        let gas = estimator
            .resolve_gas_limit(&client, &call(), Address::zero(), &overrides)
            .await;
        assert_eq!(gas, U256::from(21_000));
        assert_eq!(estimator.resolve_gas_price(&overrides), U256::from(7));

        let native = TransactionIntent::native(Address::repeat_byte(1), U256::from(5));
        let gas = estimator
            .resolve_gas_limit(&client, &native, Address::zero(), &GasOverrides::default())
            .await;
        assert_eq!(gas, U256::from(200_000));
        assert_eq!(
            estimator.resolve_gas_price(&GasOverrides::default()),
            U256::from(1_000_000_000u64)
        );
    }
}
