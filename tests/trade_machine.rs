use anyhow::Result;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest as _, Sha256};

use intercom_swap::envelope::{
    AcceptBody, Body, CancelBody, Direction, Envelope, LnInvoiceBody, LnPaidBody, Pair,
    SignedEnvelope, SolClaimedBody, SolEscrowCreatedBody, StatusBody, TermsBody,
};
use intercom_swap::envelope::codec;
use intercom_swap::solana::{derive_ata, derive_escrow_pda};
use intercom_swap::trade::machine::{apply, mark_inconsistent, observe_refund};
use intercom_swap::trade::{Trade, TradeError, TradeState};

const NOW: i64 = 1_700_000_000;
const PROGRAM: &str = "EscrowProg1";
const MINT: &str = "UsdtMint1";
const PREIMAGE: [u8; 32] = [7u8; 32];

struct Flow {
    service: SigningKey,
    client: SigningKey,
    payment_hash_hex: String,
}

impl Flow {
    fn new() -> Self {
        Self {
            service: SigningKey::generate(&mut OsRng),
            client: SigningKey::generate(&mut OsRng),
            payment_hash_hex: hex::encode(Sha256::digest(PREIMAGE)),
        }
    }

    fn sign(&self, key: &SigningKey, body: Body) -> SignedEnvelope {
        codec::sign(&Envelope::new("t1", body), key).expect("signing must not fail")
    }

    fn terms_body(&self) -> TermsBody {
        TermsBody {
            pair: Pair::BtcLnUsdtSol,
            direction: Direction::BtcToUsdt,
            btc_sats: 50_000,
            usdt_amount: "100000000".to_string(),
            usdt_decimals: 6,
            sol_mint: MINT.to_string(),
            sol_recipient: "ClientSol1".to_string(),
            sol_refund: "ServiceSol1".to_string(),
            sol_refund_after_unix: NOW + 3600,
            ln_receiver_peer: hex::encode(self.service.verifying_key().as_bytes()),
            ln_payer_peer: hex::encode(self.client.verifying_key().as_bytes()),
            terms_valid_until_unix: NOW + 600,
        }
    }

    fn terms(&self) -> SignedEnvelope {
        self.sign(&self.service, Body::Terms(self.terms_body()))
    }

    fn accept(&self, terms_hash: &str) -> SignedEnvelope {
        self.sign(
            &self.client,
            Body::Accept(AcceptBody {
                terms_hash: terms_hash.to_string(),
            }),
        )
    }

    fn invoice(&self) -> SignedEnvelope {
        self.sign(
            &self.service,
            Body::LnInvoice(LnInvoiceBody {
                bolt11: "lnsim1t1".to_string(),
                payment_hash_hex: self.payment_hash_hex.clone(),
                amount_msat: "50000000".to_string(),
            }),
        )
    }

    fn escrow_body(&self) -> SolEscrowCreatedBody {
        let payment_hash: [u8; 32] = Sha256::digest(PREIMAGE).into();
        let escrow_pda = derive_escrow_pda(PROGRAM, &payment_hash);
        let vault_ata = derive_ata(&escrow_pda, MINT);
        SolEscrowCreatedBody {
            payment_hash_hex: self.payment_hash_hex.clone(),
            program_id: PROGRAM.to_string(),
            escrow_pda,
            vault_ata,
            mint: MINT.to_string(),
            amount: "100000000".to_string(),
            refund_after_unix: NOW + 3600,
            recipient: "ClientSol1".to_string(),
            refund: "ServiceSol1".to_string(),
            tx_sig: "SimTxSig1".to_string(),
        }
    }

    fn escrow(&self) -> SignedEnvelope {
        self.sign(&self.service, Body::SolEscrowCreated(self.escrow_body()))
    }

    fn paid(&self) -> SignedEnvelope {
        self.sign(
            &self.client,
            Body::LnPaid(LnPaidBody {
                payment_hash_hex: self.payment_hash_hex.clone(),
                preimage_hex: Some(hex::encode(PREIMAGE)),
            }),
        )
    }

    fn claimed(&self) -> SignedEnvelope {
        self.sign(
            &self.client,
            Body::SolClaimed(SolClaimedBody {
                payment_hash_hex: self.payment_hash_hex.clone(),
                escrow_pda: self.escrow_body().escrow_pda,
                tx_sig: "SimTxSig2".to_string(),
            }),
        )
    }

    /// Applies the full settlement sequence and returns each intermediate
    /// trade, INIT first.
    fn run_to_claimed(&self) -> Vec<Trade> {
        let mut stages = vec![Trade::new("t1")];
        let terms = self.terms();
        let mut trade = apply(stages.last().unwrap(), &terms, NOW).expect("apply terms");
        let terms_hash = trade.terms_hash.clone().expect("terms hash");
        stages.push(trade.clone());
        for envelope in [
            self.accept(&terms_hash),
            self.invoice(),
            self.escrow(),
            self.paid(),
            self.claimed(),
        ] {
            trade = apply(&trade, &envelope, NOW).expect("apply envelope");
            stages.push(trade.clone());
        }
        stages
    }
}

#[test]
fn happy_path_reaches_claimed() {
    let flow = Flow::new();
    let stages = flow.run_to_claimed();
    let states: Vec<TradeState> = stages.iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![
            TradeState::Init,
            TradeState::Terms,
            TradeState::Accepted,
            TradeState::Invoice,
            TradeState::Escrow,
            TradeState::LnPaid,
            TradeState::Claimed,
        ]
    );
    assert!(stages.last().unwrap().state.is_terminal());
}

#[test]
fn state_rank_is_monotonic() {
    let flow = Flow::new();
    let stages = flow.run_to_claimed();
    for pair in stages.windows(2) {
        assert!(pair[1].state.rank() >= pair[0].state.rank());
    }
}

#[test]
fn binding_closure_holds_at_escrow() {
    let flow = Flow::new();
    let stages = flow.run_to_claimed();
    let at_escrow = &stages[4];
    assert_eq!(at_escrow.state, TradeState::Escrow);

    let terms = at_escrow.terms.as_ref().expect("terms recorded");
    let invoice = at_escrow.invoice.as_ref().expect("invoice recorded");
    let escrow = at_escrow.escrow.as_ref().expect("escrow recorded");
    assert_eq!(escrow.amount, terms.usdt_amount);
    assert_eq!(escrow.mint, terms.sol_mint);
    assert_eq!(escrow.recipient, terms.sol_recipient);
    assert_eq!(escrow.refund_after_unix, terms.sol_refund_after_unix);
    assert_eq!(escrow.payment_hash_hex, invoice.payment_hash_hex);
}

#[test]
fn stale_terms_are_rejected() {
    let flow = Flow::new();
    let mut body = flow.terms_body();
    body.terms_valid_until_unix = NOW - 1;
    let stale = flow.sign(&flow.service, Body::Terms(body));

    let trade = Trade::new("t1");
    assert_eq!(
        apply(&trade, &stale, NOW),
        Err(TradeError::StaleExpiry {
            valid_until_unix: NOW - 1,
            now_unix: NOW,
        })
    );
}

#[test]
fn second_terms_envelope_is_a_duplicate() {
    let flow = Flow::new();
    let trade = apply(&Trade::new("t1"), &flow.terms(), NOW).expect("apply terms");

    let mut other = flow.terms_body();
    other.usdt_amount = "90000000".to_string();
    let second = flow.sign(&flow.service, Body::Terms(other));
    assert_eq!(apply(&trade, &second, NOW), Err(TradeError::DuplicateTerms));

    // The recorded terms still reflect the first envelope.
    assert_eq!(
        trade.terms.as_ref().expect("terms recorded").usdt_amount,
        "100000000"
    );
}

#[test]
fn byte_identical_replay_is_a_noop() {
    let flow = Flow::new();
    let terms = flow.terms();
    let once = apply(&Trade::new("t1"), &terms, NOW).expect("apply terms");
    let twice = apply(&once, &terms, NOW).expect("replay terms");
    assert_eq!(once, twice);
}

#[test]
fn out_of_order_envelopes_are_illegal() {
    let flow = Flow::new();
    let trade = Trade::new("t1");
    let err = apply(&trade, &flow.invoice(), NOW).unwrap_err();
    assert!(matches!(
        err,
        TradeError::IllegalTransition {
            from: TradeState::Init,
            ..
        }
    ));
}

#[test]
fn wrong_trade_id_is_rejected() {
    let flow = Flow::new();
    let trade = Trade::new("t2");
    assert_eq!(
        apply(&trade, &flow.terms(), NOW),
        Err(TradeError::WrongTradeId {
            want: "t2".to_string(),
            got: "t1".to_string(),
        })
    );
}

#[test]
fn accept_must_quote_the_recorded_terms_hash() {
    let flow = Flow::new();
    let trade = apply(&Trade::new("t1"), &flow.terms(), NOW).expect("apply terms");
    let bogus = flow.accept(&"ab".repeat(32));
    assert!(matches!(
        apply(&trade, &bogus, NOW),
        Err(TradeError::MismatchedBinding(_))
    ));
}

#[test]
fn escrow_announcement_must_mirror_terms() {
    let flow = Flow::new();
    let trade = apply(&Trade::new("t1"), &flow.terms(), NOW).expect("terms");
    let terms_hash = trade.terms_hash.clone().expect("terms hash");
    let trade = apply(&trade, &flow.accept(&terms_hash), NOW).expect("accept");
    let trade = apply(&trade, &flow.invoice(), NOW).expect("invoice");

    let mut body = flow.escrow_body();
    body.amount = "90000000".to_string();
    let short = flow.sign(&flow.service, Body::SolEscrowCreated(body));
    assert!(matches!(
        apply(&trade, &short, NOW),
        Err(TradeError::MismatchedBinding(_))
    ));
}

#[test]
fn ln_paid_preimage_must_hash_to_payment_hash() {
    let flow = Flow::new();
    let stages = flow.run_to_claimed();
    let at_escrow = &stages[4];

    let bogus = flow.sign(
        &flow.client,
        Body::LnPaid(LnPaidBody {
            payment_hash_hex: flow.payment_hash_hex.clone(),
            preimage_hex: Some(hex::encode([9u8; 32])),
        }),
    );
    assert!(matches!(
        apply(at_escrow, &bogus, NOW),
        Err(TradeError::MismatchedBinding(_))
    ));
}

#[test]
fn cancel_works_from_any_nonterminal_state_and_sticks() {
    let flow = Flow::new();
    let cancel = flow.sign(
        &flow.client,
        Body::Cancel(CancelBody {
            reason: "changed my mind".to_string(),
        }),
    );

    let late_cancel = flow.sign(
        &flow.service,
        Body::Cancel(CancelBody {
            reason: "too late".to_string(),
        }),
    );
    let status = flow.sign(
        &flow.service,
        Body::Status(StatusBody {
            state: "PROBE".to_string(),
            note: String::new(),
        }),
    );
    for stage in &flow.run_to_claimed()[..6] {
        let cancelled = apply(stage, &cancel, NOW).expect("cancel applies");
        assert_eq!(cancelled.state, TradeState::Cancelled);

        // Terminal states reject further transitions.
        let err = apply(&cancelled, &late_cancel, NOW).unwrap_err();
        assert!(matches!(err, TradeError::IllegalTransition { .. }));

        // STATUS stays recordable without one.
        let noted = apply(&cancelled, &status, NOW).expect("status applies");
        assert_eq!(noted.state, TradeState::Cancelled);
    }

    let claimed = &flow.run_to_claimed()[6];
    assert!(matches!(
        apply(claimed, &cancel, NOW),
        Err(TradeError::IllegalTransition { .. })
    ));
}

#[test]
fn refund_observation_needs_the_deadline() -> Result<()> {
    let flow = Flow::new();
    let stages = flow.run_to_claimed();
    let at_escrow = &stages[4];

    assert_eq!(
        observe_refund(at_escrow, NOW),
        Err(TradeError::RefundTooEarly {
            refund_after_unix: NOW + 3600,
            now_unix: NOW,
        })
    );

    let refunded = observe_refund(at_escrow, NOW + 3600)?;
    assert_eq!(refunded.state, TradeState::Refunded);

    // Not a legal observation before the escrow exists.
    assert!(matches!(
        observe_refund(&stages[1], NOW + 3600),
        Err(TradeError::IllegalTransition { .. })
    ));
    Ok(())
}

#[test]
fn inconsistent_is_terminal_and_carries_the_note() {
    let flow = Flow::new();
    let stages = flow.run_to_claimed();
    let marked = mark_inconsistent(&stages[5], "claim contradicts chain");
    assert_eq!(marked.state, TradeState::Inconsistent);
    assert!(marked.state.is_terminal());
    assert_eq!(
        marked.inconsistency.as_deref(),
        Some("claim contradicts chain")
    );
}
