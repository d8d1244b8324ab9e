//! Native-currency top-ups from the primary pool account

use crate::config::ToppingConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::NoopObserver;
use crate::tx::{GasOverrides, TransactionSender};

use chrono::{DateTime, Duration, Utc};
use ethers::types::{Address, TransactionReceipt, U256};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a top-up request
#[derive(Debug, Clone)]
pub enum TopUpOutcome {
    /// Balance close enough to the maximum; nothing sent
    NotNeeded { balance: U256 },
    ToppedUp {
        amount: U256,
        receipt: TransactionReceipt,
    },
}

/// Amount to send so that `balance` reaches `max`, if a top-up is warranted.
///
/// Unforced top-ups only happen once the shortfall is at least
/// `min_shortfall_percent` of `max`, which keeps small top-ups from piling up.
pub fn top_up_amount(balance: U256, max: U256, min_shortfall_percent: u64, force: bool) -> Option<U256> {
    if balance >= max {
        return None;
    }
    let shortfall = max - balance;
    if force || shortfall * U256::from(100) >= max * U256::from(min_shortfall_percent) {
        Some(shortfall)
    } else {
        None
    }
}

/// Keeps addresses supplied with gas money
pub struct BalanceMaintainer {
    sender: Arc<TransactionSender>,
    config: ToppingConfig,
    /// Skip the minimum interval check (development deployments)
    permissive: bool,
}

impl BalanceMaintainer {
    pub fn new(sender: Arc<TransactionSender>, config: ToppingConfig, permissive: bool) -> Self {
        Self {
            sender,
            config,
            permissive,
        }
    }

    /// Top `address` up to the configured maximum.
    ///
    /// Refused with `DailyLimitReached` when `last_topped_up` is more recent than
    /// the minimum interval, unless `force` is set or the deployment is permissive.
    pub async fn top_up(
        &self,
        address: Address,
        last_topped_up: Option<DateTime<Utc>>,
        force: bool,
    ) -> RelayerResult<TopUpOutcome> {
        if !force && !self.permissive {
            if let Some(last) = last_topped_up {
                if Utc::now() - last < Duration::hours(self.config.min_interval_hours) {
                    return Err(RelayerError::DailyLimitReached { address });
                }
            }
        }

        let balance = self.sender.get_balance(Some(address)).await?;
        let max = self.config.max_top_wei();
        debug!("Top up {:?}: balance {} max {}", address, balance, max);

        let amount = match top_up_amount(balance, max, self.config.min_shortfall_percent, force) {
            Some(amount) => amount,
            None => {
                debug!("{:?} doesn't need topping", address);
                return Ok(TopUpOutcome::NotNeeded { balance });
            }
        };

        let from = self.sender.pool().primary_address();
        let receipt = self
            .sender
            .send_native(Some(from), address, amount, &NoopObserver, GasOverrides::default())
            .await?;

        info!(
            "Topped up {:?} with {} wei from {:?} (tx {:?})",
            address, amount, from, receipt.transaction_hash
        );
        Ok(TopUpOutcome::ToppedUp { amount, receipt })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::harness;

    const GWEI: u64 = 1_000_000_000;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::from(GWEI)
    }

    fn topping() -> ToppingConfig {
        ToppingConfig {
            max_top_gwei: 1_000_000,
            min_shortfall_percent: 75,
            min_interval_hours: 24,
        }
    }

    #[test]
    fn test_amount_gating() {
        let max = U256::from(1_000_000);

        assert_eq!(top_up_amount(U256::from(800_000), max, 75, false), None);
        assert_eq!(
            top_up_amount(U256::from(800_000), max, 75, true),
            Some(U256::from(200_000))
        );
        assert_eq!(
            top_up_amount(U256::from(250_000), max, 75, false),
            Some(U256::from(750_000))
        );
        assert_eq!(top_up_amount(U256::from(1_000_000), max, 75, true), None);
        assert_eq!(top_up_amount(U256::from(2_000_000), max, 75, true), None);
    }

    #[tokio::test]
    async fn test_recent_top_up_hits_daily_limit() {
        let h = harness(1, 1).await;
        let maintainer = BalanceMaintainer::new(Arc::new(h.sender), topping(), false);
        let user = Address::repeat_byte(0x42);

        let result = maintainer
            .top_up(user, Some(Utc::now() - Duration::hours(12)), false)
            .await;
        assert!(matches!(result, Err(RelayerError::DailyLimitReached { .. })));
        assert!(h.chain.transfers().is_empty());
    }

    #[tokio::test]
    async fn test_permissive_environment_skips_interval() {
        let h = harness(1, 1).await;
        let maintainer = BalanceMaintainer::new(Arc::new(h.sender), topping(), true);
        let user = Address::repeat_byte(0x43);

        let outcome = maintainer
            .top_up(user, Some(Utc::now() - Duration::hours(12)), false)
            .await
            .unwrap();
        assert!(matches!(outcome, TopUpOutcome::ToppedUp { .. }));
    }

    #[tokio::test]
    async fn test_small_shortfall_needs_force() {
        let h = harness(1, 1).await;
        let primary = h.pool.primary_address();
        let user = Address::repeat_byte(0x44);
        h.chain.set_balance(user, gwei(800_000));
        let maintainer = BalanceMaintainer::new(Arc::new(h.sender), topping(), false);

        let outcome = maintainer.top_up(user, None, false).await.unwrap();
        assert!(matches!(outcome, TopUpOutcome::NotNeeded { .. }));
        assert!(h.chain.transfers().is_empty());

        let outcome = maintainer
            .top_up(user, Some(Utc::now() - Duration::hours(12)), true)
            .await
            .unwrap();
        match outcome {
            TopUpOutcome::ToppedUp { amount, .. } => assert_eq!(amount, gwei(200_000)),
            other => panic!("expected a top-up, got {:?}", other),
        }
        assert_eq!(h.chain.transfers(), vec![(primary, user, gwei(200_000))]);
    }
}
