use anyhow::Result;
use sha2::{Digest as _, Sha256};

use intercom_swap::envelope::{Direction, LnInvoiceBody, Pair, SolEscrowCreatedBody, TermsBody};
use intercom_swap::solana::chain::MemoryChain;
use intercom_swap::solana::escrow::EscrowIx;
use intercom_swap::solana::{ChainRpc as _, EscrowTx, derive_ata, derive_escrow_pda};
use intercom_swap::verify::{VerifyError, verify_prepay};

const NOW: i64 = 1_700_000_000;
const REFUND_AFTER: i64 = NOW + 3600;
const MARGIN: i64 = 600;
const PROGRAM: &str = "EscrowProg1";
const MINT: &str = "UsdtMint1";
const SERVICE_SOL: &str = "ServiceSol1";
const CLIENT_SOL: &str = "ClientSol1";
const PREIMAGE: [u8; 32] = [7u8; 32];

fn payment_hash() -> [u8; 32] {
    Sha256::digest(PREIMAGE).into()
}

fn sample_terms() -> TermsBody {
    TermsBody {
        pair: Pair::BtcLnUsdtSol,
        direction: Direction::BtcToUsdt,
        btc_sats: 50_000,
        usdt_amount: "100000000".to_string(),
        usdt_decimals: 6,
        sol_mint: MINT.to_string(),
        sol_recipient: CLIENT_SOL.to_string(),
        sol_refund: SERVICE_SOL.to_string(),
        sol_refund_after_unix: REFUND_AFTER,
        ln_receiver_peer: "svc".to_string(),
        ln_payer_peer: "cli".to_string(),
        terms_valid_until_unix: NOW + 600,
    }
}

fn sample_invoice() -> LnInvoiceBody {
    LnInvoiceBody {
        bolt11: "lnsim1t1".to_string(),
        payment_hash_hex: hex::encode(payment_hash()),
        amount_msat: "50000000".to_string(),
    }
}

fn sample_escrow() -> SolEscrowCreatedBody {
    let escrow_pda = derive_escrow_pda(PROGRAM, &payment_hash());
    let vault_ata = derive_ata(&escrow_pda, MINT);
    SolEscrowCreatedBody {
        payment_hash_hex: hex::encode(payment_hash()),
        program_id: PROGRAM.to_string(),
        escrow_pda,
        vault_ata,
        mint: MINT.to_string(),
        amount: "100000000".to_string(),
        refund_after_unix: REFUND_AFTER,
        recipient: CLIENT_SOL.to_string(),
        refund: SERVICE_SOL.to_string(),
        tx_sig: "SimTxSig1".to_string(),
    }
}

/// A chain with the escrow funded at `fund_amount`, which may differ from
/// the announced/negotiated 100 USDT.
async fn chain_with_escrow(fund_amount: u64) -> Result<MemoryChain> {
    let chain = MemoryChain::new(NOW);
    chain.mint_to(SERVICE_SOL, MINT, fund_amount);
    chain
        .send_tx(&EscrowTx {
            program_id: PROGRAM.to_string(),
            signer: SERVICE_SOL.to_string(),
            ix: EscrowIx::Create {
                payment_hash: payment_hash(),
                recipient: CLIENT_SOL.to_string(),
                refund: SERVICE_SOL.to_string(),
                refund_after_unix: REFUND_AFTER,
                mint: MINT.to_string(),
                amount: fund_amount,
            },
        })
        .await?;
    Ok(chain)
}

#[tokio::test]
async fn all_checks_pass_on_a_faithful_escrow() -> Result<()> {
    let chain = chain_with_escrow(100_000_000).await?;
    verify_prepay(
        &sample_terms(),
        &sample_invoice(),
        &sample_escrow(),
        &chain,
        NOW,
        MARGIN,
    )
    .await?;
    Ok(())
}

#[tokio::test]
async fn underfunded_escrow_is_an_amount_mismatch() -> Result<()> {
    // TERMS say 100 USDT, the service only escrowed 90.
    let chain = chain_with_escrow(90_000_000).await?;
    let err = verify_prepay(
        &sample_terms(),
        &sample_invoice(),
        &sample_escrow(),
        &chain,
        NOW,
        MARGIN,
    )
    .await
    .unwrap_err();
    assert_eq!(
        err,
        VerifyError::EscrowAmountMismatch {
            expected: "100000000".to_string(),
            got: 90_000_000,
        }
    );
    Ok(())
}

#[tokio::test]
async fn drained_vault_is_underfunded() -> Result<()> {
    let chain = chain_with_escrow(100_000_000).await?;
    chain.drain_vault_to(&sample_escrow().vault_ata, 1);
    let err = verify_prepay(
        &sample_terms(),
        &sample_invoice(),
        &sample_escrow(),
        &chain,
        NOW,
        MARGIN,
    )
    .await
    .unwrap_err();
    assert_eq!(
        err,
        VerifyError::VaultUnderfunded {
            required: 100_000_000,
            available: 1,
        }
    );
    Ok(())
}

#[tokio::test]
async fn refund_cliff_too_close_refuses_payment() -> Result<()> {
    let chain = chain_with_escrow(100_000_000).await?;
    let late = REFUND_AFTER - MARGIN;
    let err = verify_prepay(
        &sample_terms(),
        &sample_invoice(),
        &sample_escrow(),
        &chain,
        late,
        MARGIN,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, VerifyError::EscrowTimeTooTight { .. }));
    Ok(())
}

#[tokio::test]
async fn invoice_and_escrow_hashes_must_agree() -> Result<()> {
    let chain = chain_with_escrow(100_000_000).await?;
    let mut invoice = sample_invoice();
    invoice.payment_hash_hex = hex::encode([9u8; 32]);
    let err = verify_prepay(
        &sample_terms(),
        &invoice,
        &sample_escrow(),
        &chain,
        NOW,
        MARGIN,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, VerifyError::PayHashMismatch { .. }));
    Ok(())
}

#[tokio::test]
async fn announced_pda_must_match_derivation() -> Result<()> {
    let chain = chain_with_escrow(100_000_000).await?;
    let mut escrow = sample_escrow();
    escrow.escrow_pda = "SomewhereElse111".to_string();
    let err = verify_prepay(
        &sample_terms(),
        &sample_invoice(),
        &escrow,
        &chain,
        NOW,
        MARGIN,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, VerifyError::PdaMismatch { .. }));
    Ok(())
}

#[tokio::test]
async fn missing_escrow_account_refuses_payment() -> Result<()> {
    let chain = MemoryChain::new(NOW);
    let err = verify_prepay(
        &sample_terms(),
        &sample_invoice(),
        &sample_escrow(),
        &chain,
        NOW,
        MARGIN,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, VerifyError::EscrowMissing(_)));
    Ok(())
}

#[tokio::test]
async fn claimed_escrow_is_no_longer_payable() -> Result<()> {
    let chain = chain_with_escrow(100_000_000).await?;
    chain
        .send_tx(&EscrowTx {
            program_id: PROGRAM.to_string(),
            signer: CLIENT_SOL.to_string(),
            ix: EscrowIx::Claim {
                payment_hash: payment_hash(),
                preimage: PREIMAGE,
            },
        })
        .await?;
    let err = verify_prepay(
        &sample_terms(),
        &sample_invoice(),
        &sample_escrow(),
        &chain,
        NOW,
        MARGIN,
    )
    .await
    .unwrap_err();
    assert_eq!(err, VerifyError::EscrowNotFunded);
    Ok(())
}

#[tokio::test]
async fn invoice_msat_must_equal_negotiated_sats() -> Result<()> {
    let chain = chain_with_escrow(100_000_000).await?;
    let mut invoice = sample_invoice();
    invoice.amount_msat = "49999000".to_string();
    let err = verify_prepay(
        &sample_terms(),
        &invoice,
        &sample_escrow(),
        &chain,
        NOW,
        MARGIN,
    )
    .await
    .unwrap_err();
    assert_eq!(
        err,
        VerifyError::InvoiceAmountMismatch {
            expected_msat: 50_000_000,
            got_msat: 49_999_000,
        }
    );
    Ok(())
}
