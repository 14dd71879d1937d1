//! The pre-pay verifier: before broadcasting a Lightning payment the client
//! independently proves, against the chain, that the escrow exists and
//! exactly satisfies the negotiated terms. Any failed check means the client
//! must refuse to pay.

use thiserror::Error;

use crate::envelope::{LnInvoiceBody, SolEscrowCreatedBody, TermsBody};
use crate::solana::escrow::{EscrowState, EscrowStatus};
use crate::solana::{ChainError, ChainRpc, derive_ata, derive_escrow_pda};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("invoice payment_hash {invoice} does not match escrow {escrow}")]
    PayHashMismatch { invoice: String, escrow: String },
    #[error("payment_hash is not 32 hex bytes: {0}")]
    BadPaymentHash(String),
    #[error("escrow pda {got} does not match derived {expected}")]
    PdaMismatch { expected: String, got: String },
    #[error("escrow account {0} does not exist")]
    EscrowMissing(String),
    #[error("escrow account owned by {got}, expected {expected}")]
    EscrowWrongOwner { expected: String, got: String },
    #[error("escrow state does not parse")]
    EscrowStateInvalid,
    #[error("escrow is not funded")]
    EscrowNotFunded,
    #[error("escrow amount {got} does not match terms {expected}")]
    EscrowAmountMismatch { expected: String, got: u64 },
    #[error("escrow {field} {got} does not match terms {expected}")]
    EscrowFieldMismatch {
        field: &'static str,
        expected: String,
        got: String,
    },
    #[error(
        "refund deadline {refund_after_unix} leaves no room: now {now_unix} + margin {safety_margin_secs}"
    )]
    EscrowTimeTooTight {
        refund_after_unix: i64,
        now_unix: i64,
        safety_margin_secs: i64,
    },
    #[error("vault token account {0} does not exist")]
    VaultMissing(String),
    #[error("vault {field} mismatch")]
    VaultMismatch { field: &'static str },
    #[error("vault holds {available}, escrow requires {required}")]
    VaultUnderfunded { required: u64, available: u64 },
    #[error("invoice amount {got_msat} msat does not match terms {expected_msat} msat")]
    InvoiceAmountMismatch { expected_msat: u128, got_msat: u128 },
    #[error("terms amount {0} does not fit the chain's integer width")]
    AmountOverflow(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Runs all pre-pay checks. Only a fully clean result permits `pay(bolt11)`.
pub async fn verify_prepay(
    terms: &TermsBody,
    invoice: &LnInvoiceBody,
    escrow: &SolEscrowCreatedBody,
    chain: &dyn ChainRpc,
    now_unix: i64,
    safety_margin_secs: i64,
) -> Result<(), VerifyError> {
    // 1. The invoice and the escrow must be locked to the same hash.
    if invoice.payment_hash_hex != escrow.payment_hash_hex {
        return Err(VerifyError::PayHashMismatch {
            invoice: invoice.payment_hash_hex.clone(),
            escrow: escrow.payment_hash_hex.clone(),
        });
    }

    // 2. The announced PDA must be the one the program would derive.
    let payment_hash = parse_payment_hash(&escrow.payment_hash_hex)?;
    let expected_pda = derive_escrow_pda(&escrow.program_id, &payment_hash);
    if expected_pda != escrow.escrow_pda {
        return Err(VerifyError::PdaMismatch {
            expected: expected_pda,
            got: escrow.escrow_pda.clone(),
        });
    }

    // 3. The on-chain state must exist, belong to the program, and mirror the
    //    negotiated terms field by field.
    let account = chain
        .get_account(&escrow.escrow_pda)
        .await?
        .ok_or_else(|| VerifyError::EscrowMissing(escrow.escrow_pda.clone()))?;
    if account.owner != escrow.program_id {
        return Err(VerifyError::EscrowWrongOwner {
            expected: escrow.program_id.clone(),
            got: account.owner,
        });
    }
    let state =
        EscrowState::try_from_account(&account).map_err(|_| VerifyError::EscrowStateInvalid)?;
    if state.status != EscrowStatus::Funded {
        return Err(VerifyError::EscrowNotFunded);
    }
    if state.payment_hash != payment_hash {
        return Err(VerifyError::EscrowFieldMismatch {
            field: "payment_hash",
            expected: escrow.payment_hash_hex.clone(),
            got: hex::encode(state.payment_hash),
        });
    }
    let expected_amount: u64 = terms
        .usdt_amount
        .parse()
        .map_err(|_| VerifyError::AmountOverflow(terms.usdt_amount.clone()))?;
    if state.amount != expected_amount {
        return Err(VerifyError::EscrowAmountMismatch {
            expected: terms.usdt_amount.clone(),
            got: state.amount,
        });
    }
    check_field("mint", &state.mint, &terms.sol_mint)?;
    check_field("recipient", &state.recipient, &terms.sol_recipient)?;
    check_field("refund", &state.refund, &terms.sol_refund)?;
    if state.refund_after_unix != terms.sol_refund_after_unix {
        return Err(VerifyError::EscrowFieldMismatch {
            field: "refund_after_unix",
            expected: terms.sol_refund_after_unix.to_string(),
            got: state.refund_after_unix.to_string(),
        });
    }

    // 4. Enough runway before the refund cliff to pay and claim.
    if now_unix.saturating_add(safety_margin_secs) >= state.refund_after_unix {
        return Err(VerifyError::EscrowTimeTooTight {
            refund_after_unix: state.refund_after_unix,
            now_unix,
            safety_margin_secs,
        });
    }

    // 5. The vault really is the PDA's token account and holds the funds.
    let expected_vault = derive_ata(&escrow.escrow_pda, &terms.sol_mint);
    if escrow.vault_ata != expected_vault || state.vault != expected_vault {
        return Err(VerifyError::VaultMismatch { field: "address" });
    }
    let vault = chain
        .get_token_account(&expected_vault)
        .await?
        .ok_or_else(|| VerifyError::VaultMissing(expected_vault.clone()))?;
    if vault.mint != terms.sol_mint {
        return Err(VerifyError::VaultMismatch { field: "mint" });
    }
    if vault.owner != escrow.escrow_pda {
        return Err(VerifyError::VaultMismatch { field: "owner" });
    }
    if vault.amount < state.amount {
        return Err(VerifyError::VaultUnderfunded {
            required: state.amount,
            available: vault.amount,
        });
    }

    // 6. The invoice charges exactly the negotiated sats.
    let got_msat: u128 = invoice
        .amount_msat
        .parse()
        .map_err(|_| VerifyError::AmountOverflow(invoice.amount_msat.clone()))?;
    let expected_msat = u128::from(terms.btc_sats) * 1000;
    if got_msat != expected_msat {
        return Err(VerifyError::InvoiceAmountMismatch {
            expected_msat,
            got_msat,
        });
    }

    Ok(())
}

fn parse_payment_hash(hex_str: &str) -> Result<[u8; 32], VerifyError> {
    let raw =
        hex::decode(hex_str).map_err(|_| VerifyError::BadPaymentHash(hex_str.to_string()))?;
    raw.try_into()
        .map_err(|_| VerifyError::BadPaymentHash(hex_str.to_string()))
}

fn check_field(
    field: &'static str,
    got: &str,
    expected: &str,
) -> Result<(), VerifyError> {
    if got != expected {
        return Err(VerifyError::EscrowFieldMismatch {
            field,
            expected: expected.to_string(),
            got: got.to_string(),
        });
    }
    Ok(())
}
