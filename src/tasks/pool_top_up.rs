//! Keeps secondary pool accounts supplied from the primary account

use super::{Schedule, Task, TaskContext};
use crate::error::{RelayerError, RelayerResult};
use crate::wallet::{AccountPool, BalanceMaintainer, TopUpOutcome};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct PoolTopUpTask {
    maintainer: Arc<BalanceMaintainer>,
    pool: Arc<AccountPool>,
    schedule: Schedule,
    /// Last successful top-up per address, for the minimum interval check
    last_topped_up: DashMap<Address, DateTime<Utc>>,
}

impl PoolTopUpTask {
    pub fn new(maintainer: Arc<BalanceMaintainer>, pool: Arc<AccountPool>, schedule: Schedule) -> Self {
        Self {
            maintainer,
            pool,
            schedule,
            last_topped_up: DashMap::new(),
        }
    }

    pub fn last_topped_up(&self, address: &Address) -> Option<DateTime<Utc>> {
        self.last_topped_up.get(address).map(|t| *t)
    }
}

#[async_trait]
impl Task for PoolTopUpTask {
    fn name(&self) -> &str {
        "topPoolAccounts"
    }

    fn schedule(&self) -> Schedule {
        self.schedule.clone()
    }

    async fn execute(&self, _ctx: &TaskContext) -> RelayerResult<String> {
        let primary = self.pool.primary_address();
        let (mut topped, mut skipped, mut failed) = (0, 0, 0);

        for address in self.pool.addresses().into_iter().filter(|a| *a != primary) {
            match self
                .maintainer
                .top_up(address, self.last_topped_up(&address), false)
                .await
            {
                Ok(TopUpOutcome::ToppedUp { .. }) => {
                    self.last_topped_up.insert(address, Utc::now());
                    topped += 1;
                }
                Ok(TopUpOutcome::NotNeeded { .. }) => {}
                Err(RelayerError::DailyLimitReached { .. }) => {
                    debug!("{:?} was topped up recently", address);
                    skipped += 1;
                }
                Err(e) if e.should_alert() => {
                    // The primary account cannot fund anyone else this run
                    error!(alert = true, "Stopping top-ups at {:?}: {}", address, e);
                    failed += 1;
                    break;
                }
                Err(e) => {
                    warn!("Failed to top up {:?}: {}", address, e);
                    failed += 1;
                }
            }
        }

        let summary = format!("topped up {}, skipped {}, failed {}", topped, skipped, failed);
        if failed > 0 {
            return Err(RelayerError::Task(summary));
        }
        Ok(summary)
    }
}
