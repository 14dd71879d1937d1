//! Per-kind body schemas. This module is the only path from wire JSON into
//! the typed [`Body`] variants: field presence, integer widths, hex widths,
//! amount shape, and enum membership are all enforced here, so downstream
//! code never sees a present-but-wrong-type field.

use serde_json::Value;
use thiserror::Error;

use super::{
    AcceptBody, Body, CancelBody, Direction, Envelope, Kind, LnInvoiceBody, LnPaidBody, Pair,
    QuoteAcceptBody, QuoteBody, RfqBody, SignedEnvelope, SolClaimedBody, SolEscrowCreatedBody,
    StatusBody, SwapInviteBody, TermsBody,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("unsupported protocol version {0}")]
    BadVersion(u64),
    #[error("unknown envelope kind {0:?}")]
    UnknownKind(String),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

impl SchemaError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Parses and validates a signed envelope from its wire form. Signature
/// *shape* is checked here; cryptographic verification lives in
/// [`super::codec::verify`].
pub fn parse_signed(wire: &Value) -> Result<SignedEnvelope, SchemaError> {
    let envelope = parse_unsigned(wire)?;
    let obj = wire.as_object().ok_or(SchemaError::NotAnObject)?;
    let signer_pubkey = hex_field(obj, "signer_pubkey", 64)?;
    let signature = hex_field(obj, "signature", 128)?;
    Ok(SignedEnvelope {
        envelope,
        signer_pubkey,
        signature,
    })
}

/// Parses and validates an unsigned envelope `{v, kind, trade_id, body}`.
pub fn parse_unsigned(wire: &Value) -> Result<Envelope, SchemaError> {
    let obj = wire.as_object().ok_or(SchemaError::NotAnObject)?;

    let v = u64_field(obj, "v")?;
    if v != super::PROTOCOL_VERSION {
        return Err(SchemaError::BadVersion(v));
    }

    let kind_str = str_field(obj, "kind")?;
    let kind = parse_kind(&kind_str)?;
    let trade_id = str_field(obj, "trade_id")?;
    if trade_id.is_empty() {
        return Err(SchemaError::invalid("trade_id", "must not be empty"));
    }

    let body_value = obj.get("body").ok_or(SchemaError::MissingField("body"))?;
    let body_obj = body_value
        .as_object()
        .ok_or_else(|| SchemaError::invalid("body", "must be an object"))?;
    let body = parse_body(kind, body_obj)?;

    Ok(Envelope { v, trade_id, body })
}

fn parse_kind(s: &str) -> Result<Kind, SchemaError> {
    match s {
        "RFQ" => Ok(Kind::Rfq),
        "QUOTE" => Ok(Kind::Quote),
        "QUOTE_ACCEPT" => Ok(Kind::QuoteAccept),
        "SWAP_INVITE" => Ok(Kind::SwapInvite),
        "TERMS" => Ok(Kind::Terms),
        "ACCEPT" => Ok(Kind::Accept),
        "LN_INVOICE" => Ok(Kind::LnInvoice),
        "SOL_ESCROW_CREATED" => Ok(Kind::SolEscrowCreated),
        "LN_PAID" => Ok(Kind::LnPaid),
        "SOL_CLAIMED" => Ok(Kind::SolClaimed),
        "STATUS" => Ok(Kind::Status),
        "CANCEL" => Ok(Kind::Cancel),
        other => Err(SchemaError::UnknownKind(other.to_string())),
    }
}

type Obj = serde_json::Map<String, Value>;

fn parse_body(kind: Kind, body: &Obj) -> Result<Body, SchemaError> {
    match kind {
        Kind::Rfq => Ok(Body::Rfq(RfqBody {
            pair: pair_field(body)?,
            direction: direction_field(body)?,
            btc_sats: u64_field(body, "btc_sats")?,
            usdt_amount: amount_field(body, "usdt_amount")?,
            valid_until_unix: i64_field(body, "valid_until_unix")?,
        })),
        Kind::Quote => Ok(Body::Quote(QuoteBody {
            pair: pair_field(body)?,
            direction: direction_field(body)?,
            btc_sats: u64_field(body, "btc_sats")?,
            usdt_amount: amount_field(body, "usdt_amount")?,
            rfq_id: hex_field(body, "rfq_id", 64)?,
            valid_until_unix: i64_field(body, "valid_until_unix")?,
        })),
        Kind::QuoteAccept => Ok(Body::QuoteAccept(QuoteAcceptBody {
            rfq_id: hex_field(body, "rfq_id", 64)?,
            quote_id: hex_field(body, "quote_id", 64)?,
        })),
        Kind::SwapInvite => Ok(Body::SwapInvite(SwapInviteBody {
            rfq_id: hex_field(body, "rfq_id", 64)?,
            quote_id: hex_field(body, "quote_id", 64)?,
            swap_channel: nonempty_field(body, "swap_channel")?,
            owner_pubkey: nonempty_field(body, "owner_pubkey")?,
            invite: nonempty_field(body, "invite")?,
            welcome: nonempty_field(body, "welcome")?,
        })),
        Kind::Terms => Ok(Body::Terms(TermsBody {
            pair: pair_field(body)?,
            direction: direction_field(body)?,
            btc_sats: u64_field(body, "btc_sats")?,
            usdt_amount: amount_field(body, "usdt_amount")?,
            usdt_decimals: u8_field(body, "usdt_decimals")?,
            sol_mint: nonempty_field(body, "sol_mint")?,
            sol_recipient: nonempty_field(body, "sol_recipient")?,
            sol_refund: nonempty_field(body, "sol_refund")?,
            sol_refund_after_unix: i64_field(body, "sol_refund_after_unix")?,
            ln_receiver_peer: nonempty_field(body, "ln_receiver_peer")?,
            ln_payer_peer: nonempty_field(body, "ln_payer_peer")?,
            terms_valid_until_unix: i64_field(body, "terms_valid_until_unix")?,
        })),
        Kind::Accept => Ok(Body::Accept(AcceptBody {
            terms_hash: hex_field(body, "terms_hash", 64)?,
        })),
        Kind::LnInvoice => Ok(Body::LnInvoice(LnInvoiceBody {
            bolt11: nonempty_field(body, "bolt11")?,
            payment_hash_hex: hex_field(body, "payment_hash_hex", 64)?,
            amount_msat: amount_field(body, "amount_msat")?,
        })),
        Kind::SolEscrowCreated => Ok(Body::SolEscrowCreated(SolEscrowCreatedBody {
            payment_hash_hex: hex_field(body, "payment_hash_hex", 64)?,
            program_id: nonempty_field(body, "program_id")?,
            escrow_pda: nonempty_field(body, "escrow_pda")?,
            vault_ata: nonempty_field(body, "vault_ata")?,
            mint: nonempty_field(body, "mint")?,
            amount: amount_field(body, "amount")?,
            refund_after_unix: i64_field(body, "refund_after_unix")?,
            recipient: nonempty_field(body, "recipient")?,
            refund: nonempty_field(body, "refund")?,
            tx_sig: nonempty_field(body, "tx_sig")?,
        })),
        Kind::LnPaid => {
            let preimage_hex = match body.get("preimage_hex") {
                None | Some(Value::Null) => None,
                Some(_) => Some(hex_field(body, "preimage_hex", 64)?),
            };
            Ok(Body::LnPaid(LnPaidBody {
                payment_hash_hex: hex_field(body, "payment_hash_hex", 64)?,
                preimage_hex,
            }))
        }
        Kind::SolClaimed => Ok(Body::SolClaimed(SolClaimedBody {
            payment_hash_hex: hex_field(body, "payment_hash_hex", 64)?,
            escrow_pda: nonempty_field(body, "escrow_pda")?,
            tx_sig: nonempty_field(body, "tx_sig")?,
        })),
        Kind::Status => Ok(Body::Status(StatusBody {
            state: str_field(body, "state")?,
            note: str_field(body, "note")?,
        })),
        Kind::Cancel => Ok(Body::Cancel(CancelBody {
            reason: str_field(body, "reason")?,
        })),
    }
}

fn str_field(obj: &Obj, field: &'static str) -> Result<String, SchemaError> {
    obj.get(field)
        .ok_or(SchemaError::MissingField(field))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| SchemaError::invalid(field, "must be a string"))
}

fn nonempty_field(obj: &Obj, field: &'static str) -> Result<String, SchemaError> {
    let s = str_field(obj, field)?;
    if s.is_empty() {
        return Err(SchemaError::invalid(field, "must not be empty"));
    }
    Ok(s)
}

/// Lowercase hex of exactly `width` characters.
fn hex_field(obj: &Obj, field: &'static str, width: usize) -> Result<String, SchemaError> {
    let s = str_field(obj, field)?;
    if s.len() != width {
        return Err(SchemaError::invalid(
            field,
            format!("must be {width} hex chars, got {}", s.len()),
        ));
    }
    if !s
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(SchemaError::invalid(field, "must be lowercase hex"));
    }
    Ok(s)
}

/// Atomic amount: decimal digits only.
fn amount_field(obj: &Obj, field: &'static str) -> Result<String, SchemaError> {
    let s = str_field(obj, field)?;
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SchemaError::invalid(field, "must match ^[0-9]+$"));
    }
    Ok(s)
}

fn u64_field(obj: &Obj, field: &'static str) -> Result<u64, SchemaError> {
    obj.get(field)
        .ok_or(SchemaError::MissingField(field))?
        .as_u64()
        .ok_or_else(|| SchemaError::invalid(field, "must be an unsigned integer"))
}

fn u8_field(obj: &Obj, field: &'static str) -> Result<u8, SchemaError> {
    let n = u64_field(obj, field)?;
    u8::try_from(n).map_err(|_| SchemaError::invalid(field, "out of range for u8"))
}

fn i64_field(obj: &Obj, field: &'static str) -> Result<i64, SchemaError> {
    obj.get(field)
        .ok_or(SchemaError::MissingField(field))?
        .as_i64()
        .ok_or_else(|| SchemaError::invalid(field, "must be an integer"))
}

fn pair_field(obj: &Obj) -> Result<Pair, SchemaError> {
    match str_field(obj, "pair")?.as_str() {
        "BTC_LN/USDT_SOL" => Ok(Pair::BtcLnUsdtSol),
        other => Err(SchemaError::invalid(
            "pair",
            format!("unsupported pair {other:?}"),
        )),
    }
}

fn direction_field(obj: &Obj) -> Result<Direction, SchemaError> {
    match str_field(obj, "direction")?.as_str() {
        "BTC_LN->USDT_SOL" => Ok(Direction::BtcToUsdt),
        "USDT_SOL->BTC_LN" => Ok(Direction::UsdtToBtc),
        other => Err(SchemaError::invalid(
            "direction",
            format!("unsupported direction {other:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rfq_wire() -> Value {
        json!({
            "v": 1,
            "kind": "RFQ",
            "trade_id": "t1",
            "body": {
                "pair": "BTC_LN/USDT_SOL",
                "direction": "BTC_LN->USDT_SOL",
                "btc_sats": 50_000u64,
                "usdt_amount": "100000000",
                "valid_until_unix": 2_000_000_000i64,
            },
        })
    }

    #[test]
    fn rfq_parses_into_typed_body() {
        let env = parse_unsigned(&rfq_wire()).unwrap();
        assert_eq!(env.kind(), Kind::Rfq);
        match env.body {
            Body::Rfq(b) => {
                assert_eq!(b.btc_sats, 50_000);
                assert_eq!(b.usdt_amount, "100000000");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut wire = rfq_wire();
        wire["kind"] = json!("GOSSIP");
        assert_eq!(
            parse_unsigned(&wire),
            Err(SchemaError::UnknownKind("GOSSIP".to_string()))
        );
    }

    #[test]
    fn non_decimal_amount_is_rejected() {
        let mut wire = rfq_wire();
        wire["body"]["usdt_amount"] = json!("100.5");
        assert!(matches!(
            parse_unsigned(&wire),
            Err(SchemaError::InvalidField {
                field: "usdt_amount",
                ..
            })
        ));
    }

    #[test]
    fn uppercase_hex_is_rejected() {
        let wire = json!({
            "v": 1,
            "kind": "ACCEPT",
            "trade_id": "t1",
            "body": { "terms_hash": "AB".repeat(32) },
        });
        assert!(matches!(
            parse_unsigned(&wire),
            Err(SchemaError::InvalidField {
                field: "terms_hash",
                ..
            })
        ));
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut wire = rfq_wire();
        wire["v"] = json!(2);
        assert_eq!(parse_unsigned(&wire), Err(SchemaError::BadVersion(2)));
    }

    #[test]
    fn optional_preimage_is_allowed() {
        let wire = json!({
            "v": 1,
            "kind": "LN_PAID",
            "trade_id": "t1",
            "body": { "payment_hash_hex": "ab".repeat(32) },
        });
        match parse_unsigned(&wire).unwrap().body {
            Body::LnPaid(b) => assert!(b.preimage_hex.is_none()),
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
