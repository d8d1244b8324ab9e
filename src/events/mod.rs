//! Transaction lifecycle notifications
//!
//! A submission produces, in order: at most one `Hash`, zero or more
//! `Confirmation`, then exactly one terminal `Receipt` or `Error`.

use ethers::types::{TransactionReceipt, H256};
use tokio::sync::mpsc;

/// One step of a submission's lifecycle
#[derive(Debug, Clone)]
pub enum TxEvent {
    /// The node accepted the transaction
    Hash(H256),
    /// The transaction reached a new confirmation depth
    Confirmation { tx_hash: H256, confirmations: u64 },
    /// Terminal: included and confirmed
    Receipt(TransactionReceipt),
    /// Terminal: the submission failed
    Error(String),
}

impl TxEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TxEvent::Hash(_) => "hash",
            TxEvent::Confirmation { .. } => "confirmation",
            TxEvent::Receipt(_) => "receipt",
            TxEvent::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxEvent::Receipt(_) | TxEvent::Error(_))
    }
}

/// Sink for lifecycle notifications
pub trait TxObserver: Send + Sync {
    fn notify(&self, event: &TxEvent);
}

/// Observer that ignores every notification
pub struct NoopObserver;

impl TxObserver for NoopObserver {
    fn notify(&self, _event: &TxEvent) {}
}

impl TxObserver for mpsc::UnboundedSender<TxEvent> {
    fn notify(&self, event: &TxEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.send(event.clone());
    }
}

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Per-event callbacks, for callers that prefer hooks over a channel
#[derive(Default)]
pub struct TxCallbacks {
    on_transaction_hash: Option<Callback<H256>>,
    on_confirmation: Option<Callback<u64>>,
    on_receipt: Option<Callback<TransactionReceipt>>,
    on_error: Option<Callback<String>>,
}

impl TxCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_transaction_hash(mut self, f: impl Fn(&H256) + Send + Sync + 'static) -> Self {
        self.on_transaction_hash = Some(Box::new(f));
        self
    }

    pub fn on_confirmation(mut self, f: impl Fn(&u64) + Send + Sync + 'static) -> Self {
        self.on_confirmation = Some(Box::new(f));
        self
    }

    pub fn on_receipt(mut self, f: impl Fn(&TransactionReceipt) + Send + Sync + 'static) -> Self {
        self.on_receipt = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&String) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl TxObserver for TxCallbacks {
    fn notify(&self, event: &TxEvent) {
        match event {
            TxEvent::Hash(hash) => {
                if let Some(f) = &self.on_transaction_hash {
                    f(hash)
                }
            }
            TxEvent::Confirmation { confirmations, .. } => {
                if let Some(f) = &self.on_confirmation {
                    f(confirmations)
                }
            }
            TxEvent::Receipt(receipt) => {
                if let Some(f) = &self.on_receipt {
                    f(receipt)
                }
            }
            TxEvent::Error(message) => {
                if let Some(f) = &self.on_error {
                    f(message)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_callbacks_dispatch_by_event() {
        let hashes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let callbacks = TxCallbacks::new()
            .on_transaction_hash({
                let hashes = hashes.clone();
                move |_| {
                    hashes.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_error({
                let errors = errors.clone();
                move |_| {
                    errors.fetch_add(1, Ordering::SeqCst);
                }
            });

        callbacks.notify(&TxEvent::Hash(H256::zero()));
        callbacks.notify(&TxEvent::Confirmation {
            tx_hash: H256::zero(),
            confirmations: 1,
        });
        callbacks.notify(&TxEvent::Error("boom".to_string()));

        assert_eq!(hashes.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_observer_forwards_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.notify(&TxEvent::Hash(H256::repeat_byte(1)));
        tx.notify(&TxEvent::Error("boom".to_string()));

        let first = tokio_test::block_on(rx.recv()).unwrap();
        let second = tokio_test::block_on(rx.recv()).unwrap();
        assert_eq!(first.name(), "hash");
        assert!(!first.is_terminal());
        assert!(second.is_terminal());
    }

    #[test]
    fn test_channel_observer_survives_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        tx.notify(&TxEvent::Error("ignored".to_string()));
        assert!(TxEvent::Error(String::new()).is_terminal());
    }
}
