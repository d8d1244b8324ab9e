use ethers::types::{Address, Bytes, U256};

/// What a caller wants sent, before a signer, nonce and gas are chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionIntent {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    /// Sign from this pool address instead of any funded one
    pub from: Option<Address>,
}

impl TransactionIntent {
    /// A contract call paid for by any funded pool account
    pub fn call(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            to,
            data: data.into(),
            value: U256::zero(),
            from: None,
        }
    }

    /// A plain native-currency transfer
    pub fn native(to: Address, value: U256) -> Self {
        Self {
            to,
            data: Bytes::default(),
            value,
            from: None,
        }
    }

    pub fn with_signer(mut self, address: Address) -> Self {
        self.from = Some(address);
        self
    }

    /// Native transfers skip gas estimation
    pub fn is_native(&self) -> bool {
        self.data.is_empty()
    }
}
