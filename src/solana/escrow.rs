//! On-chain escrow program semantics. An escrow holds `amount` of `mint` in
//! a vault owned by a PDA keyed by the Lightning `payment_hash`; it pays out
//! to `recipient` on preimage reveal and back to `refund` once the deadline
//! has passed. The chain clock, never the wall clock, decides refundability.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use super::{AccountView, TokenAccountView, derive_ata, derive_escrow_pda};

#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum EscrowStatus {
    Funded,
    Claimed,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct EscrowState {
    pub v: u8,
    pub status: EscrowStatus,
    pub payment_hash: [u8; 32],
    pub recipient: String,
    pub refund: String,
    pub refund_after_unix: i64,
    pub mint: String,
    pub amount: u64,
    pub vault: String,
}

impl EscrowState {
    pub const V1: u8 = 1;

    pub fn try_from_account(account: &AccountView) -> Result<Self, EscrowError> {
        Self::try_from_slice(&account.data).map_err(|_| EscrowError::InvalidStateData)
    }
}

/// Escrow instructions, tag-prefixed binary encoding (borsh). Claim and
/// Refund address their escrow account through its `payment_hash` seed.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum EscrowIx {
    Create {
        payment_hash: [u8; 32],
        recipient: String,
        refund: String,
        refund_after_unix: i64,
        mint: String,
        amount: u64,
    },
    Claim {
        payment_hash: [u8; 32],
        preimage: [u8; 32],
    },
    Refund {
        payment_hash: [u8; 32],
    },
}

impl EscrowIx {
    pub fn parse(data: &[u8]) -> Result<Self, EscrowError> {
        Self::try_from_slice(data).map_err(|_| EscrowError::InvalidInstruction)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EscrowError {
    #[error("invalid instruction data")]
    InvalidInstruction,
    #[error("escrow state data is invalid")]
    InvalidStateData,
    #[error("escrow already initialized")]
    AlreadyInitialized,
    #[error("escrow account missing")]
    EscrowMissing,
    #[error("account is not owned by the escrow program")]
    WrongOwner,
    #[error("signer not authorized")]
    InvalidSigner,
    #[error("preimage does not match payment hash")]
    InvalidPreimage,
    #[error("escrow is not funded")]
    NotFunded,
    #[error("refund deadline not reached")]
    TooEarly,
    #[error("token account missing or mismatched")]
    InvalidTokenAccount,
    #[error("insufficient token balance")]
    InsufficientBalance,
    #[error("amount must be greater than zero")]
    ZeroAmount,
}

/// Account and token state visible to the program, plus the chain clock.
#[derive(Debug, Default)]
pub struct Ledger {
    pub clock_unix: i64,
    pub accounts: BTreeMap<String, AccountView>,
    pub token_accounts: BTreeMap<String, TokenAccountView>,
}

impl Ledger {
    pub fn new(clock_unix: i64) -> Self {
        Self {
            clock_unix,
            accounts: BTreeMap::new(),
            token_accounts: BTreeMap::new(),
        }
    }

    /// Ensures the associated token account of `owner` for `mint` exists and
    /// returns its address.
    pub fn ensure_token_account(&mut self, owner: &str, mint: &str) -> String {
        let address = derive_ata(owner, mint);
        self.token_accounts
            .entry(address.clone())
            .or_insert_with(|| TokenAccountView {
                mint: mint.to_string(),
                owner: owner.to_string(),
                amount: 0,
            });
        address
    }

    pub fn token_balance(&self, address: &str) -> u64 {
        self.token_accounts.get(address).map_or(0, |t| t.amount)
    }

    fn debit(&mut self, address: &str, amount: u64) -> Result<(), EscrowError> {
        let account = self
            .token_accounts
            .get_mut(address)
            .ok_or(EscrowError::InvalidTokenAccount)?;
        if account.amount < amount {
            return Err(EscrowError::InsufficientBalance);
        }
        account.amount -= amount;
        Ok(())
    }

    fn credit(&mut self, address: &str, amount: u64) -> Result<(), EscrowError> {
        let account = self
            .token_accounts
            .get_mut(address)
            .ok_or(EscrowError::InvalidTokenAccount)?;
        account.amount = account
            .amount
            .checked_add(amount)
            .ok_or(EscrowError::InvalidTokenAccount)?;
        Ok(())
    }
}

/// Executes one escrow instruction against the ledger on behalf of `signer`.
pub fn process(
    ledger: &mut Ledger,
    program_id: &str,
    signer: &str,
    ix: &EscrowIx,
) -> Result<(), EscrowError> {
    match ix {
        EscrowIx::Create {
            payment_hash,
            recipient,
            refund,
            refund_after_unix,
            mint,
            amount,
        } => process_create(
            ledger,
            program_id,
            signer,
            payment_hash,
            recipient,
            refund,
            *refund_after_unix,
            mint,
            *amount,
        ),
        EscrowIx::Claim {
            payment_hash,
            preimage,
        } => process_claim(ledger, program_id, signer, payment_hash, preimage),
        EscrowIx::Refund { payment_hash } => {
            process_refund(ledger, program_id, signer, payment_hash)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn process_create(
    ledger: &mut Ledger,
    program_id: &str,
    payer: &str,
    payment_hash: &[u8; 32],
    recipient: &str,
    refund: &str,
    refund_after_unix: i64,
    mint: &str,
    amount: u64,
) -> Result<(), EscrowError> {
    if amount == 0 {
        return Err(EscrowError::ZeroAmount);
    }

    let pda = derive_escrow_pda(program_id, payment_hash);
    // Re-funding an existing PDA is forbidden: payment_hash stays unique.
    if ledger.accounts.contains_key(&pda) {
        return Err(EscrowError::AlreadyInitialized);
    }

    let payer_token = derive_ata(payer, mint);
    {
        let source = ledger
            .token_accounts
            .get(&payer_token)
            .ok_or(EscrowError::InvalidTokenAccount)?;
        if source.mint != mint || source.owner != payer {
            return Err(EscrowError::InvalidTokenAccount);
        }
        if source.amount < amount {
            return Err(EscrowError::InsufficientBalance);
        }
    }

    let vault = ledger.ensure_token_account(&pda, mint);
    ledger.debit(&payer_token, amount)?;
    ledger.credit(&vault, amount)?;

    let state = EscrowState {
        v: EscrowState::V1,
        status: EscrowStatus::Funded,
        payment_hash: *payment_hash,
        recipient: recipient.to_string(),
        refund: refund.to_string(),
        refund_after_unix,
        mint: mint.to_string(),
        amount,
        vault,
    };
    ledger.accounts.insert(
        pda,
        AccountView {
            owner: program_id.to_string(),
            data: borsh::to_vec(&state).map_err(|_| EscrowError::InvalidStateData)?,
            lamports: 1,
        },
    );
    Ok(())
}

fn process_claim(
    ledger: &mut Ledger,
    program_id: &str,
    signer: &str,
    payment_hash: &[u8; 32],
    preimage: &[u8; 32],
) -> Result<(), EscrowError> {
    let pda = derive_escrow_pda(program_id, payment_hash);
    let mut state = load_state(ledger, program_id, &pda)?;
    if state.status != EscrowStatus::Funded {
        return Err(EscrowError::NotFunded);
    }

    let preimage_hash: [u8; 32] = Sha256::digest(preimage).into();
    if preimage_hash != state.payment_hash {
        return Err(EscrowError::InvalidPreimage);
    }
    if signer != state.recipient {
        return Err(EscrowError::InvalidSigner);
    }

    let recipient_token = ledger.ensure_token_account(&state.recipient, &state.mint);
    let paid = ledger.token_balance(&state.vault);
    ledger.debit(&state.vault, paid)?;
    ledger.credit(&recipient_token, paid)?;

    state.status = EscrowStatus::Claimed;
    state.amount = 0;
    store_state(ledger, &pda, &state)
}

fn process_refund(
    ledger: &mut Ledger,
    program_id: &str,
    signer: &str,
    payment_hash: &[u8; 32],
) -> Result<(), EscrowError> {
    let pda = derive_escrow_pda(program_id, payment_hash);
    let mut state = load_state(ledger, program_id, &pda)?;
    if state.status != EscrowStatus::Funded {
        return Err(EscrowError::NotFunded);
    }
    // Refund is restricted to the stored refund authority.
    if signer != state.refund {
        return Err(EscrowError::InvalidSigner);
    }
    if ledger.clock_unix < state.refund_after_unix {
        return Err(EscrowError::TooEarly);
    }

    let refund_token = ledger.ensure_token_account(&state.refund, &state.mint);
    let repaid = ledger.token_balance(&state.vault);
    ledger.debit(&state.vault, repaid)?;
    ledger.credit(&refund_token, repaid)?;

    state.status = EscrowStatus::Refunded;
    state.amount = 0;
    store_state(ledger, &pda, &state)
}

fn load_state(ledger: &Ledger, program_id: &str, pda: &str) -> Result<EscrowState, EscrowError> {
    let account = ledger
        .accounts
        .get(pda)
        .ok_or(EscrowError::EscrowMissing)?;
    if account.owner != program_id {
        return Err(EscrowError::WrongOwner);
    }
    EscrowState::try_from_account(account)
}

fn store_state(ledger: &mut Ledger, pda: &str, state: &EscrowState) -> Result<(), EscrowError> {
    let account = ledger
        .accounts
        .get_mut(pda)
        .ok_or(EscrowError::EscrowMissing)?;
    account.data = borsh::to_vec(state).map_err(|_| EscrowError::InvalidStateData)?;
    Ok(())
}
