//! Sponsor Relayer - sponsor-paid transaction submission from a pool of signer accounts
//!
//! Pool accounts are claimed through nonce reservations held in a shared lock
//! store, so any number of workers can submit concurrently without two
//! in-flight transactions ever sharing an (address, nonce) pair.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod state;
pub mod tasks;
pub mod tx;
pub mod wallet;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{RelayerError, RelayerResult};
