//! Lightning boundary. The coordinator only ever needs two calls: create an
//! invoice and pay one. Hodl invoices are forbidden by this protocol; a
//! payment either settles (revealing the preimage) or fails.

pub mod node;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInvoice {
    pub bolt11: String,
    pub payment_hash_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentOutcome {
    pub preimage_hex: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LightningError {
    #[error("unknown invoice")]
    UnknownInvoice,
    #[error("invoice already settled")]
    AlreadySettled,
    #[error("insufficient outbound liquidity")]
    InsufficientLiquidity,
    #[error("rpc failure: {0}")]
    Rpc(String),
}

#[async_trait]
pub trait LightningRpc: Send + Sync {
    async fn invoice(
        &self,
        amount_msat: u64,
        label: &str,
        description: &str,
    ) -> Result<CreatedInvoice, LightningError>;

    /// Pays a bolt11 invoice. Returns only once the payment has settled and
    /// the preimage is known.
    async fn pay(&self, bolt11: &str) -> Result<PaymentOutcome, LightningError>;
}
