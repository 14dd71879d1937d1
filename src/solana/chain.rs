//! Deterministic in-process chain: a ledger plus an explicit clock, executing
//! escrow program transactions. Stands in for the external RPC node in the
//! simulator binary and the integration tests.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::escrow::{self, EscrowState, Ledger};
use super::{AccountView, ChainError, ChainRpc, EscrowTx, TokenAccountView};

#[derive(Clone)]
pub struct MemoryChain {
    inner: Arc<Mutex<ChainInner>>,
}

struct ChainInner {
    ledger: Ledger,
    confirmed: BTreeSet<String>,
}

impl MemoryChain {
    pub fn new(clock_unix: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChainInner {
                ledger: Ledger::new(clock_unix),
                confirmed: BTreeSet::new(),
            })),
        }
    }

    pub fn clock_unix(&self) -> i64 {
        self.lock().ledger.clock_unix
    }

    pub fn set_clock(&self, clock_unix: i64) {
        self.lock().ledger.clock_unix = clock_unix;
    }

    pub fn advance_clock(&self, secs: i64) {
        self.lock().ledger.clock_unix += secs;
    }

    /// Creates (if needed) and credits the associated token account of
    /// `owner` for `mint`; returns its address.
    pub fn mint_to(&self, owner: &str, mint: &str, amount: u64) -> String {
        let mut inner = self.lock();
        let ata = inner.ledger.ensure_token_account(owner, mint);
        inner
            .ledger
            .token_accounts
            .get_mut(&ata)
            .expect("token account just ensured")
            .amount += amount;
        ata
    }

    pub fn token_balance(&self, address: &str) -> u64 {
        self.lock().ledger.token_balance(address)
    }

    pub fn escrow_state(&self, program_id: &str, pda: &str) -> Option<EscrowState> {
        let inner = self.lock();
        let account = inner.ledger.accounts.get(pda)?;
        if account.owner != program_id {
            return None;
        }
        EscrowState::try_from_account(account).ok()
    }

    /// Corrupts a funded escrow's vault down to `amount`. Test hook for the
    /// under-funded-vault verifier check.
    pub fn drain_vault_to(&self, vault: &str, amount: u64) {
        let mut inner = self.lock();
        if let Some(t) = inner.ledger.token_accounts.get_mut(vault) {
            t.amount = amount;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainInner> {
        self.inner.lock().expect("chain mutex poisoned")
    }
}

#[async_trait]
impl ChainRpc for MemoryChain {
    async fn get_account(&self, address: &str) -> Result<Option<AccountView>, ChainError> {
        Ok(self.lock().ledger.accounts.get(address).cloned())
    }

    async fn get_token_account(
        &self,
        address: &str,
    ) -> Result<Option<TokenAccountView>, ChainError> {
        Ok(self.lock().ledger.token_accounts.get(address).cloned())
    }

    async fn send_tx(&self, tx: &EscrowTx) -> Result<String, ChainError> {
        let mut inner = self.lock();
        escrow::process(&mut inner.ledger, &tx.program_id, &tx.signer, &tx.ix)
            .map_err(|e| ChainError::TxRejected(e.to_string()))?;
        let sig = tx.sig();
        inner.confirmed.insert(sig.clone());
        Ok(sig)
    }

    async fn confirm(&self, sig: &str) -> Result<(), ChainError> {
        if self.lock().confirmed.contains(sig) {
            Ok(())
        } else {
            Err(ChainError::UnknownSignature(sig.to_string()))
        }
    }
}
