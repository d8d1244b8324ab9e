//! Transaction submission module with pooled signers and nonce reservations

mod gas;
mod intent;
mod nonce;
mod sender;

pub use gas::{GasEstimator, GasOverrides};
pub use intent::TransactionIntent;
pub use nonce::{address_key, NonceLock, NonceReservation, Reservation, TASKS_NAMESPACE, WALLET_NAMESPACE};
pub use sender::TransactionSender;
