//! The trade state machine: a pure function from `(Trade, SignedEnvelope,
//! now)` to the successor trade or a rejection. All I/O lives in the runner;
//! this module never suspends, which keeps replay-from-receipts and
//! property tests exact.

use sha2::{Digest as _, Sha256};

use crate::envelope::codec::{self, CodecError};
use crate::envelope::{Body, Kind, SignedEnvelope};

use super::{Trade, TradeError, TradeState};

/// Applies one signed envelope to a trade. On success the returned trade has
/// recorded the envelope; on rejection the input trade is untouched.
/// Byte-identical replay of an already-applied envelope is a no-op `Ok`.
pub fn apply(
    trade: &Trade,
    signed: &SignedEnvelope,
    now_unix: i64,
) -> Result<Trade, TradeError> {
    codec::verify(signed).map_err(|e| match e {
        CodecError::BadSig => TradeError::BadSig,
        other => TradeError::SchemaInvalid(other.to_string()),
    })?;

    let envelope = &signed.envelope;
    if envelope.trade_id != trade.trade_id {
        return Err(TradeError::WrongTradeId {
            want: trade.trade_id.clone(),
            got: envelope.trade_id.clone(),
        });
    }

    let envelope_hash = envelope.hash()?;
    if trade.applied.contains(&envelope_hash) {
        return Ok(trade.clone());
    }

    check_freshness(&envelope.body, now_unix)?;

    let kind = envelope.kind();
    let illegal = || TradeError::IllegalTransition {
        from: trade.state,
        kind,
    };

    // STATUS stays informational even after a terminal state; everything
    // else is rejected once the trade has settled.
    if trade.state.is_terminal() && kind != Kind::Status {
        return Err(illegal());
    }

    let mut next = trade.clone();
    match &envelope.body {
        Body::Rfq(body) => {
            if trade.state != TradeState::Init {
                return Err(illegal());
            }
            if trade.rfq.is_some() {
                return Err(TradeError::AlreadyApplied { kind });
            }
            next.rfq = Some(body.clone());
            next.rfq_id = Some(envelope_hash.clone());
        }
        Body::Quote(body) => {
            if trade.state != TradeState::Init {
                return Err(illegal());
            }
            if trade.quote.is_some() {
                return Err(TradeError::AlreadyApplied { kind });
            }
            bind(&mut next.rfq_id, &body.rfq_id, "rfq_id")?;
            next.quote = Some(body.clone());
            next.quote_id = Some(envelope_hash.clone());
        }
        Body::QuoteAccept(body) => {
            if trade.state != TradeState::Init {
                return Err(illegal());
            }
            bind(&mut next.rfq_id, &body.rfq_id, "rfq_id")?;
            bind(&mut next.quote_id, &body.quote_id, "quote_id")?;
        }
        Body::SwapInvite(body) => {
            if trade.state != TradeState::Init {
                return Err(illegal());
            }
            if trade.invite.is_some() {
                return Err(TradeError::AlreadyApplied { kind });
            }
            bind(&mut next.rfq_id, &body.rfq_id, "rfq_id")?;
            bind(&mut next.quote_id, &body.quote_id, "quote_id")?;
            next.invite = Some(body.clone());
        }
        Body::Terms(body) => {
            if trade.terms.is_some() {
                return Err(TradeError::DuplicateTerms);
            }
            if trade.state != TradeState::Init {
                return Err(illegal());
            }
            next.terms = Some(body.clone());
            next.terms_hash = Some(envelope_hash.clone());
            next.state = TradeState::Terms;
        }
        Body::Accept(body) => {
            if trade.state != TradeState::Terms {
                return Err(illegal());
            }
            let terms_hash = trade.terms_hash.as_deref().unwrap_or_default();
            if body.terms_hash != terms_hash {
                return Err(TradeError::MismatchedBinding(format!(
                    "terms_hash {} does not match recorded {}",
                    body.terms_hash, terms_hash
                )));
            }
            next.state = TradeState::Accepted;
        }
        Body::LnInvoice(body) => {
            if trade.state != TradeState::Accepted {
                return Err(illegal());
            }
            next.invoice = Some(body.clone());
            next.payment_hash_hex = Some(body.payment_hash_hex.clone());
            next.state = TradeState::Invoice;
        }
        Body::SolEscrowCreated(body) => {
            if trade.state != TradeState::Invoice {
                return Err(illegal());
            }
            check_payment_hash(trade, &body.payment_hash_hex)?;
            check_escrow_mirrors_terms(trade, body)?;
            next.escrow = Some(body.clone());
            next.state = TradeState::Escrow;
        }
        Body::LnPaid(body) => {
            if trade.state != TradeState::Escrow {
                return Err(illegal());
            }
            check_payment_hash(trade, &body.payment_hash_hex)?;
            if let Some(preimage_hex) = &body.preimage_hex {
                check_preimage(&body.payment_hash_hex, preimage_hex)?;
            }
            next.paid = Some(body.clone());
            next.state = TradeState::LnPaid;
        }
        Body::SolClaimed(body) => {
            if trade.state != TradeState::LnPaid {
                return Err(illegal());
            }
            check_payment_hash(trade, &body.payment_hash_hex)?;
            let escrow_pda = trade
                .escrow
                .as_ref()
                .map(|e| e.escrow_pda.as_str())
                .unwrap_or_default();
            if body.escrow_pda != escrow_pda {
                return Err(TradeError::MismatchedBinding(format!(
                    "escrow_pda {} does not match recorded {}",
                    body.escrow_pda, escrow_pda
                )));
            }
            next.claim = Some(body.clone());
            next.state = TradeState::Claimed;
        }
        Body::Status(_) => {
            // Informational; recorded but never a transition.
        }
        Body::Cancel(_) => {
            next.state = TradeState::Cancelled;
        }
    }

    next.applied.insert(envelope_hash);
    next.counterparties.insert(signed.signer_pubkey.clone());
    Ok(next)
}

/// Transition for an observed on-chain refund. Not envelope-driven: the
/// runner calls this after it has seen the escrow reach REFUNDED.
pub fn observe_refund(trade: &Trade, now_unix: i64) -> Result<Trade, TradeError> {
    if !matches!(trade.state, TradeState::Escrow | TradeState::LnPaid) {
        return Err(TradeError::IllegalTransition {
            from: trade.state,
            kind: Kind::Status,
        });
    }
    let refund_after_unix = trade
        .escrow
        .as_ref()
        .map(|e| e.refund_after_unix)
        .unwrap_or(i64::MAX);
    if now_unix < refund_after_unix {
        return Err(TradeError::RefundTooEarly {
            refund_after_unix,
            now_unix,
        });
    }
    let mut next = trade.clone();
    next.state = TradeState::Refunded;
    Ok(next)
}

/// Marks a trade fatally inconsistent with a confirmed chain observation.
pub fn mark_inconsistent(trade: &Trade, note: impl Into<String>) -> Trade {
    let mut next = trade.clone();
    next.state = TradeState::Inconsistent;
    next.inconsistency = Some(note.into());
    next
}

fn check_freshness(body: &Body, now_unix: i64) -> Result<(), TradeError> {
    let valid_until_unix = match body {
        Body::Rfq(b) => Some(b.valid_until_unix),
        Body::Quote(b) => Some(b.valid_until_unix),
        Body::Terms(b) => Some(b.terms_valid_until_unix),
        _ => None,
    };
    match valid_until_unix {
        Some(valid_until_unix) if now_unix > valid_until_unix => Err(TradeError::StaleExpiry {
            valid_until_unix,
            now_unix,
        }),
        _ => Ok(()),
    }
}

/// Records `incoming` into an unset reference, or insists it matches.
fn bind(
    slot: &mut Option<String>,
    incoming: &str,
    what: &'static str,
) -> Result<(), TradeError> {
    match slot {
        Some(existing) if existing != incoming => Err(TradeError::MismatchedBinding(format!(
            "{what} {incoming} does not match recorded {existing}"
        ))),
        Some(_) => Ok(()),
        None => {
            *slot = Some(incoming.to_string());
            Ok(())
        }
    }
}

fn check_payment_hash(trade: &Trade, payment_hash_hex: &str) -> Result<(), TradeError> {
    let recorded = trade.payment_hash_hex.as_deref().unwrap_or_default();
    if payment_hash_hex != recorded {
        return Err(TradeError::MismatchedBinding(format!(
            "payment_hash {payment_hash_hex} does not match recorded {recorded}"
        )));
    }
    Ok(())
}

fn check_preimage(payment_hash_hex: &str, preimage_hex: &str) -> Result<(), TradeError> {
    let preimage = hex::decode(preimage_hex)
        .map_err(|_| TradeError::MismatchedBinding("preimage is not hex".to_string()))?;
    let hashed = hex::encode(Sha256::digest(&preimage));
    if hashed != payment_hash_hex {
        return Err(TradeError::MismatchedBinding(format!(
            "sha256(preimage) = {hashed}, payment_hash = {payment_hash_hex}"
        )));
    }
    Ok(())
}

fn check_escrow_mirrors_terms(
    trade: &Trade,
    body: &crate::envelope::SolEscrowCreatedBody,
) -> Result<(), TradeError> {
    let Some(terms) = trade.terms.as_ref() else {
        return Err(TradeError::MismatchedBinding(
            "escrow announced before terms".to_string(),
        ));
    };
    let mirrored = [
        ("amount", body.amount.as_str(), terms.usdt_amount.as_str()),
        ("mint", body.mint.as_str(), terms.sol_mint.as_str()),
        (
            "recipient",
            body.recipient.as_str(),
            terms.sol_recipient.as_str(),
        ),
        ("refund", body.refund.as_str(), terms.sol_refund.as_str()),
    ];
    for (field, got, want) in mirrored {
        if got != want {
            return Err(TradeError::MismatchedBinding(format!(
                "escrow {field} {got} does not match terms {want}"
            )));
        }
    }
    if body.refund_after_unix != terms.sol_refund_after_unix {
        return Err(TradeError::MismatchedBinding(format!(
            "escrow refund_after_unix {} does not match terms {}",
            body.refund_after_unix, terms.sol_refund_after_unix
        )));
    }
    Ok(())
}
