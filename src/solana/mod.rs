//! Chain boundary for the Solana-like side of a swap: the consumed RPC
//! surface, account views, and deterministic address derivation shared by the
//! escrow program, the pre-pay verifier, and the tests.

pub mod chain;
pub mod escrow;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use escrow::EscrowIx;

/// Seed tag of escrow state accounts.
pub const ESCROW_SEED: &[u8] = b"escrow";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountView {
    pub owner: String,
    pub data: Vec<u8>,
    pub lamports: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAccountView {
    pub mint: String,
    pub owner: String,
    pub amount: u64,
}

/// A transaction submitted to the escrow program. The ledger checks that
/// `signer` authorized it; signature transport belongs to the RPC layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowTx {
    pub program_id: String,
    pub signer: String,
    pub ix: EscrowIx,
}

impl EscrowTx {
    /// Borsh instruction data, tag-prefixed.
    pub fn data(&self) -> Vec<u8> {
        borsh::to_vec(&self.ix).expect("escrow instruction encoding must not fail")
    }

    /// Deterministic transaction signature: hash of program, signer and data.
    pub fn sig(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"tx");
        hasher.update(self.program_id.as_bytes());
        hasher.update(self.signer.as_bytes());
        hasher.update(self.data());
        bs58::encode(hasher.finalize()).into_string()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("rpc failure: {0}")]
    Rpc(String),
    #[error("rpc timeout")]
    Timeout,
    #[error("rpc disconnected")]
    Disconnected,
    #[error("transaction rejected: {0}")]
    TxRejected(String),
    #[error("unknown transaction signature {0}")]
    UnknownSignature(String),
}

/// The consumed chain RPC surface.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_account(&self, address: &str) -> Result<Option<AccountView>, ChainError>;
    async fn get_token_account(&self, address: &str)
    -> Result<Option<TokenAccountView>, ChainError>;
    async fn send_tx(&self, tx: &EscrowTx) -> Result<String, ChainError>;
    async fn confirm(&self, sig: &str) -> Result<(), ChainError>;
}

/// Program-derived address of the escrow state account for `payment_hash`:
/// `derive(program_id, ["escrow", payment_hash])`.
pub fn derive_escrow_pda(program_id: &str, payment_hash: &[u8; 32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"pda");
    hasher.update(program_id.as_bytes());
    hasher.update(ESCROW_SEED);
    hasher.update(payment_hash);
    bs58::encode(hasher.finalize()).into_string()
}

/// Associated token account of `owner` for `mint`.
pub fn derive_ata(owner: &str, mint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"ata");
    hasher.update(owner.as_bytes());
    hasher.update(mint.as_bytes());
    bs58::encode(hasher.finalize()).into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pda_derivation_is_deterministic() {
        let hash = [7u8; 32];
        let a = derive_escrow_pda("EscrowProg1", &hash);
        let b = derive_escrow_pda("EscrowProg1", &hash);
        assert_eq!(a, b);
        assert_ne!(a, derive_escrow_pda("EscrowProg2", &hash));
        assert_ne!(a, derive_escrow_pda("EscrowProg1", &[8u8; 32]));
    }

    #[test]
    fn ata_depends_on_owner_and_mint() {
        assert_ne!(derive_ata("alice", "usdt"), derive_ata("bob", "usdt"));
        assert_ne!(derive_ata("alice", "usdt"), derive_ata("alice", "other"));
    }
}
