//! Signer accounts and their balances
//!
//! - `AccountPool`: accounts derived from the admin mnemonic (or one private key)
//!   and the funded subset usable for sponsoring transactions
//! - `BalanceMaintainer`: tops up addresses from the primary pool account

mod pool;
mod topup;

pub use pool::{AccountPool, SignerAccount};
pub use topup::{top_up_amount, BalanceMaintainer, TopUpOutcome};
