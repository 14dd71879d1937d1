//! Per-trade record and the errors the state machine can reject an envelope
//! with. A trade advances only through [`machine::apply`]; terminal states
//! are sticky and the latest TERMS, once recorded, never changes.

pub mod machine;
pub mod receipts;
pub mod runner;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::canonical::CanonicalError;
use crate::envelope::{
    Kind, LnInvoiceBody, LnPaidBody, QuoteBody, RfqBody, SolClaimedBody, SolEscrowCreatedBody,
    SwapInviteBody, TermsBody,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    Init,
    Terms,
    Accepted,
    Invoice,
    Escrow,
    LnPaid,
    Claimed,
    Cancelled,
    Refunded,
    /// A confirmed on-chain observation contradicted the persisted record.
    /// Fatal; surfaces to the operator, never recovers automatically.
    Inconsistent,
}

impl TradeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TradeState::Claimed
                | TradeState::Cancelled
                | TradeState::Refunded
                | TradeState::Inconsistent
        )
    }

    /// Position along the happy path, for monotonicity checks. Terminal
    /// states share the highest rank.
    pub fn rank(self) -> u8 {
        match self {
            TradeState::Init => 0,
            TradeState::Terms => 1,
            TradeState::Accepted => 2,
            TradeState::Invoice => 3,
            TradeState::Escrow => 4,
            TradeState::LnPaid => 5,
            TradeState::Claimed
            | TradeState::Cancelled
            | TradeState::Refunded
            | TradeState::Inconsistent => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TradeState::Init => "INIT",
            TradeState::Terms => "TERMS",
            TradeState::Accepted => "ACCEPTED",
            TradeState::Invoice => "INVOICE",
            TradeState::Escrow => "ESCROW",
            TradeState::LnPaid => "LN_PAID",
            TradeState::Claimed => "CLAIMED",
            TradeState::Cancelled => "CANCELLED",
            TradeState::Refunded => "REFUNDED",
            TradeState::Inconsistent => "INCONSISTENT",
        }
    }
}

impl std::fmt::Display for TradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the coordinator remembers about one trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    pub trade_id: String,
    pub state: TradeState,
    pub rfq: Option<RfqBody>,
    pub quote: Option<QuoteBody>,
    pub invite: Option<SwapInviteBody>,
    pub terms: Option<TermsBody>,
    pub invoice: Option<LnInvoiceBody>,
    pub escrow: Option<SolEscrowCreatedBody>,
    pub paid: Option<LnPaidBody>,
    pub claim: Option<SolClaimedBody>,
    pub rfq_id: Option<String>,
    pub quote_id: Option<String>,
    pub terms_hash: Option<String>,
    pub payment_hash_hex: Option<String>,
    /// Signer pubkeys observed on applied envelopes.
    pub counterparties: BTreeSet<String>,
    /// Hashes of envelopes already applied; replays are no-ops.
    pub applied: BTreeSet<String>,
    pub inconsistency: Option<String>,
}

impl Trade {
    pub fn new(trade_id: impl Into<String>) -> Self {
        Self {
            trade_id: trade_id.into(),
            state: TradeState::Init,
            rfq: None,
            quote: None,
            invite: None,
            terms: None,
            invoice: None,
            escrow: None,
            paid: None,
            claim: None,
            rfq_id: None,
            quote_id: None,
            terms_hash: None,
            payment_hash_hex: None,
            counterparties: BTreeSet::new(),
            applied: BTreeSet::new(),
            inconsistency: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TradeError {
    #[error("signature verification failed")]
    BadSig,
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),
    #[error("unknown envelope kind {0:?}")]
    UnknownKind(String),
    #[error("envelope trade_id {got:?} does not belong to trade {want:?}")]
    WrongTradeId { want: String, got: String },
    #[error("envelope expired at {valid_until_unix} (now {now_unix})")]
    StaleExpiry {
        valid_until_unix: i64,
        now_unix: i64,
    },
    #[error("{kind} is illegal in state {from}")]
    IllegalTransition { from: TradeState, kind: Kind },
    #[error("mismatched binding: {0}")]
    MismatchedBinding(String),
    #[error("terms already recorded for this trade")]
    DuplicateTerms,
    #[error("a different {kind} was already applied")]
    AlreadyApplied { kind: Kind },
    #[error("refund deadline {refund_after_unix} not reached (now {now_unix})")]
    RefundTooEarly {
        refund_after_unix: i64,
        now_unix: i64,
    },
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}
