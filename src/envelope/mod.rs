//! The signed envelope protocol: an append-only, verifiable message format
//! carried over an untrusted transport. Every negotiation and settlement step
//! of a swap is one envelope `{v, kind, trade_id, body}` plus a detached
//! ed25519 signature over the canonical encoding.

pub mod canonical;
pub mod codec;
pub mod schema;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use canonical::CanonicalError;

/// Current protocol version.
pub const PROTOCOL_VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Kind {
    Rfq,
    Quote,
    QuoteAccept,
    SwapInvite,
    Terms,
    Accept,
    LnInvoice,
    SolEscrowCreated,
    LnPaid,
    SolClaimed,
    Status,
    Cancel,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Rfq => "RFQ",
            Kind::Quote => "QUOTE",
            Kind::QuoteAccept => "QUOTE_ACCEPT",
            Kind::SwapInvite => "SWAP_INVITE",
            Kind::Terms => "TERMS",
            Kind::Accept => "ACCEPT",
            Kind::LnInvoice => "LN_INVOICE",
            Kind::SolEscrowCreated => "SOL_ESCROW_CREATED",
            Kind::LnPaid => "LN_PAID",
            Kind::SolClaimed => "SOL_CLAIMED",
            Kind::Status => "STATUS",
            Kind::Cancel => "CANCEL",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pair {
    #[serde(rename = "BTC_LN/USDT_SOL")]
    BtcLnUsdtSol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "BTC_LN->USDT_SOL")]
    BtcToUsdt,
    #[serde(rename = "USDT_SOL->BTC_LN")]
    UsdtToBtc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfqBody {
    pub pair: Pair,
    pub direction: Direction,
    pub btc_sats: u64,
    /// Atomic USDT amount as a decimal string.
    pub usdt_amount: String,
    pub valid_until_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteBody {
    pub pair: Pair,
    pub direction: Direction,
    pub btc_sats: u64,
    pub usdt_amount: String,
    /// Envelope hash of the RFQ being answered.
    pub rfq_id: String,
    pub valid_until_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteAcceptBody {
    pub rfq_id: String,
    pub quote_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapInviteBody {
    pub rfq_id: String,
    pub quote_id: String,
    /// Private channel the swap continues on; carries the gated prefix.
    pub swap_channel: String,
    pub owner_pubkey: String,
    /// Opaque capability blobs issued by the sidechannel owner.
    pub invite: String,
    pub welcome: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermsBody {
    pub pair: Pair,
    pub direction: Direction,
    pub btc_sats: u64,
    pub usdt_amount: String,
    pub usdt_decimals: u8,
    pub sol_mint: String,
    pub sol_recipient: String,
    pub sol_refund: String,
    pub sol_refund_after_unix: i64,
    pub ln_receiver_peer: String,
    pub ln_payer_peer: String,
    pub terms_valid_until_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptBody {
    /// Envelope hash of the TERMS being accepted.
    pub terms_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnInvoiceBody {
    pub bolt11: String,
    pub payment_hash_hex: String,
    /// Millisatoshi amount as a decimal string.
    pub amount_msat: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolEscrowCreatedBody {
    pub payment_hash_hex: String,
    pub program_id: String,
    pub escrow_pda: String,
    pub vault_ata: String,
    pub mint: String,
    pub amount: String,
    pub refund_after_unix: i64,
    pub recipient: String,
    pub refund: String,
    pub tx_sig: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnPaidBody {
    pub payment_hash_hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preimage_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolClaimedBody {
    pub payment_hash_hex: String,
    pub escrow_pda: String,
    pub tx_sig: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBody {
    pub state: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelBody {
    pub reason: String,
}

/// Kind-specific envelope body. Downstream code only ever sees these typed
/// variants; the wire form is parsed through [`schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Rfq(RfqBody),
    Quote(QuoteBody),
    QuoteAccept(QuoteAcceptBody),
    SwapInvite(SwapInviteBody),
    Terms(TermsBody),
    Accept(AcceptBody),
    LnInvoice(LnInvoiceBody),
    SolEscrowCreated(SolEscrowCreatedBody),
    LnPaid(LnPaidBody),
    SolClaimed(SolClaimedBody),
    Status(StatusBody),
    Cancel(CancelBody),
}

impl Body {
    pub fn kind(&self) -> Kind {
        match self {
            Body::Rfq(_) => Kind::Rfq,
            Body::Quote(_) => Kind::Quote,
            Body::QuoteAccept(_) => Kind::QuoteAccept,
            Body::SwapInvite(_) => Kind::SwapInvite,
            Body::Terms(_) => Kind::Terms,
            Body::Accept(_) => Kind::Accept,
            Body::LnInvoice(_) => Kind::LnInvoice,
            Body::SolEscrowCreated(_) => Kind::SolEscrowCreated,
            Body::LnPaid(_) => Kind::LnPaid,
            Body::SolClaimed(_) => Kind::SolClaimed,
            Body::Status(_) => Kind::Status,
            Body::Cancel(_) => Kind::Cancel,
        }
    }

    fn to_wire(&self) -> Result<Value, CanonicalError> {
        let value = match self {
            Body::Rfq(b) => serde_json::to_value(b),
            Body::Quote(b) => serde_json::to_value(b),
            Body::QuoteAccept(b) => serde_json::to_value(b),
            Body::SwapInvite(b) => serde_json::to_value(b),
            Body::Terms(b) => serde_json::to_value(b),
            Body::Accept(b) => serde_json::to_value(b),
            Body::LnInvoice(b) => serde_json::to_value(b),
            Body::SolEscrowCreated(b) => serde_json::to_value(b),
            Body::LnPaid(b) => serde_json::to_value(b),
            Body::SolClaimed(b) => serde_json::to_value(b),
            Body::Status(b) => serde_json::to_value(b),
            Body::Cancel(b) => serde_json::to_value(b),
        };
        value.map_err(|e| CanonicalError::Serialize(e.to_string()))
    }
}

/// An unsigned envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub v: u64,
    pub trade_id: String,
    pub body: Body,
}

impl Envelope {
    pub fn new(trade_id: impl Into<String>, body: Body) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            trade_id: trade_id.into(),
            body,
        }
    }

    pub fn kind(&self) -> Kind {
        self.body.kind()
    }

    /// Wire form `{v, kind, trade_id, body}` of the unsigned envelope.
    pub fn to_wire(&self) -> Result<Value, CanonicalError> {
        let mut map = serde_json::Map::new();
        map.insert("v".to_string(), Value::from(self.v));
        map.insert(
            "kind".to_string(),
            Value::String(self.kind().as_str().to_string()),
        );
        map.insert("trade_id".to_string(), Value::String(self.trade_id.clone()));
        map.insert("body".to_string(), self.body.to_wire()?);
        Ok(Value::Object(map))
    }

    /// Stable identifier of this envelope: SHA-256 over the canonical
    /// encoding of the unsigned wire form.
    pub fn hash(&self) -> Result<String, CanonicalError> {
        canonical::hash_canonical(&self.to_wire()?)
    }
}

/// An envelope plus the signer public key and detached signature, both
/// lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    pub envelope: Envelope,
    pub signer_pubkey: String,
    pub signature: String,
}

impl SignedEnvelope {
    pub fn to_wire(&self) -> Result<Value, CanonicalError> {
        let mut wire = self.envelope.to_wire()?;
        if let Value::Object(map) = &mut wire {
            map.insert(
                "signer_pubkey".to_string(),
                Value::String(self.signer_pubkey.clone()),
            );
            map.insert(
                "signature".to_string(),
                Value::String(self.signature.clone()),
            );
        }
        Ok(wire)
    }

    /// Canonical transport bytes of the signed envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CanonicalError> {
        canonical::encode_canonical(&self.to_wire()?)
    }
}
