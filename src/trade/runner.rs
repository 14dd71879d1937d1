//! Orchestration around the pure state machine. A [`SwapPeer`] owns the
//! I/O handles (sidechannel, chain, Lightning, receipt store) and linearizes
//! all envelopes of one trade through one queue and one task; distinct trades
//! run concurrently without shared mutable state beyond the receipt store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{Context as _, Result};
use ed25519_dalek::SigningKey;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::PeerConfig;
use crate::envelope::codec;
use crate::envelope::schema;
use crate::envelope::{
    Body, CancelBody, Direction, Envelope, Kind, LnInvoiceBody, LnPaidBody, Pair, QuoteBody,
    RfqBody, SignedEnvelope, SolClaimedBody, SolEscrowCreatedBody, StatusBody, SwapInviteBody,
    TermsBody,
};
use crate::lightning::LightningRpc;
use crate::sidechannel::{Invite, Sidechannel, Welcome};
use crate::solana::escrow::{EscrowIx, EscrowState, EscrowStatus};
use crate::solana::{ChainRpc, EscrowTx, derive_ata, derive_escrow_pda};
use crate::verify::{self, VerifyError};

use super::receipts::{ReceiptDirection, ReceiptStore};
use super::{Trade, TradeState, machine};

/// Status value a client publishes after joining the swap channel; its note
/// carries the client's chain address for the service to write into TERMS.
const STATUS_JOINED: &str = "JOINED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Service,
    Client,
}

/// Chain-side identity and quoting parameters of the service peer.
#[derive(Debug, Clone)]
pub struct ServiceParams {
    pub program_id: String,
    pub mint: String,
    /// The service's chain address: escrow payer and refund authority.
    pub sol_address: String,
    pub usdt_decimals: u8,
    /// Seconds from TERMS issuance to the escrow refund cliff.
    pub refund_window_secs: i64,
    pub terms_ttl_secs: i64,
    /// Demonstration hook: fund the vault with this amount instead of the
    /// negotiated one. The announcement still carries the negotiated amount,
    /// which is exactly the lie the client's pre-pay verifier must catch.
    pub fund_amount_override: Option<u64>,
}

/// Chain-side identity of the client peer.
#[derive(Debug, Clone)]
pub struct ClientParams {
    /// Receives the escrowed USDT; must end up in TERMS as `sol_recipient`.
    pub sol_address: String,
}

enum TradeMsg {
    Inbound(SignedEnvelope),
    /// Periodic nudge from the refund worker.
    CheckRefund,
}

pub struct SwapPeer {
    role: Role,
    cfg: PeerConfig,
    key: SigningKey,
    pubkey_hex: String,
    chain: Arc<dyn ChainRpc>,
    lightning: Arc<dyn LightningRpc>,
    sidechannel: Arc<dyn Sidechannel>,
    receipts: Mutex<ReceiptStore>,
    /// Latest snapshot per trade, refreshed by the owning trade task.
    snapshots: Mutex<HashMap<String, Trade>>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<TradeMsg>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    service: Option<ServiceParams>,
    client: Option<ClientParams>,
}

impl SwapPeer {
    pub fn service(
        cfg: PeerConfig,
        key: SigningKey,
        chain: Arc<dyn ChainRpc>,
        lightning: Arc<dyn LightningRpc>,
        sidechannel: Arc<dyn Sidechannel>,
        receipts: ReceiptStore,
        params: ServiceParams,
    ) -> Arc<Self> {
        Self::new(Role::Service, cfg, key, chain, lightning, sidechannel, receipts, Some(params), None)
    }

    pub fn client(
        cfg: PeerConfig,
        key: SigningKey,
        chain: Arc<dyn ChainRpc>,
        lightning: Arc<dyn LightningRpc>,
        sidechannel: Arc<dyn Sidechannel>,
        receipts: ReceiptStore,
        params: ClientParams,
    ) -> Arc<Self> {
        Self::new(Role::Client, cfg, key, chain, lightning, sidechannel, receipts, None, Some(params))
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        role: Role,
        cfg: PeerConfig,
        key: SigningKey,
        chain: Arc<dyn ChainRpc>,
        lightning: Arc<dyn LightningRpc>,
        sidechannel: Arc<dyn Sidechannel>,
        receipts: ReceiptStore,
        service: Option<ServiceParams>,
        client: Option<ClientParams>,
    ) -> Arc<Self> {
        let pubkey_hex = hex::encode(key.verifying_key().as_bytes());
        Arc::new(Self {
            role,
            cfg,
            key,
            pubkey_hex,
            chain,
            lightning,
            sidechannel,
            receipts: Mutex::new(receipts),
            snapshots: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            service,
            client,
        })
    }

    pub fn pubkey_hex(&self) -> &str {
        &self.pubkey_hex
    }

    pub fn trade(&self, trade_id: &str) -> Option<Trade> {
        self.snapshots
            .lock()
            .expect("snapshot mutex poisoned")
            .get(trade_id)
            .cloned()
    }

    /// Joins the public rendezvous channel: the service hosts it with a
    /// welcome, a client only subscribes.
    pub async fn join_rendezvous(&self) -> Result<()> {
        let channel = self.cfg.rendezvous_channel.clone();
        match self.role {
            Role::Service => {
                let welcome = Welcome::issue(&channel, &self.key, now_unix());
                self.sidechannel
                    .host(&channel, &welcome)
                    .await
                    .context("host rendezvous channel")?;
            }
            Role::Client => {
                self.sidechannel
                    .subscribe(&[channel])
                    .await
                    .context("subscribe rendezvous channel")?;
            }
        }
        Ok(())
    }

    /// Client entry point: opens a trade and broadcasts the RFQ.
    pub async fn start_swap(
        self: &Arc<Self>,
        trade_id: &str,
        btc_sats: u64,
        usdt_amount: &str,
        ttl_secs: i64,
    ) -> Result<()> {
        anyhow::ensure!(self.role == Role::Client, "only the client starts swaps");

        let mut trade = Trade::new(trade_id);
        let body = Body::Rfq(RfqBody {
            pair: Pair::BtcLnUsdtSol,
            direction: Direction::BtcToUsdt,
            btc_sats,
            usdt_amount: usdt_amount.to_string(),
            valid_until_unix: now_unix() + ttl_secs,
        });
        let channel = self.cfg.rendezvous_channel.clone();
        self.send_signed(&mut trade, &channel, body)
            .await
            .context("send RFQ")?;

        self.register_trade(trade);
        Ok(())
    }

    /// Main loop: receive sidechannel messages and route each to its trade's
    /// queue. Returns when the transport disconnects.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            let message = match self.sidechannel.recv().await {
                Ok(message) => message,
                Err(err) => {
                    tracing::info!(error = %err, "sidechannel closed; stopping peer loop");
                    return Ok(());
                }
            };

            let wire: serde_json::Value = match serde_json::from_slice(&message.payload) {
                Ok(wire) => wire,
                Err(err) => {
                    tracing::warn!(channel = %message.channel, error = %err, "undecodable payload");
                    continue;
                }
            };
            let signed = match schema::parse_signed(&wire) {
                Ok(signed) => signed,
                Err(err) => {
                    tracing::warn!(channel = %message.channel, error = %err, "schema rejected envelope");
                    continue;
                }
            };
            if signed.signer_pubkey == self.pubkey_hex {
                continue;
            }

            self.route(signed);
        }
    }

    /// Background worker nudging every trade to check the refund cliff.
    pub fn spawn_refund_worker(self: &Arc<Self>, poll_interval: Duration) {
        let peer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                let queues: Vec<mpsc::UnboundedSender<TradeMsg>> = peer
                    .queues
                    .lock()
                    .expect("queue mutex poisoned")
                    .values()
                    .cloned()
                    .collect();
                for queue in queues {
                    let _ = queue.send(TradeMsg::CheckRefund);
                }
            }
        });
        self.tasks.lock().expect("task mutex poisoned").push(handle);
    }

    /// Aborts every spawned task; in-flight chain and Lightning calls are
    /// dropped at their next await point.
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().expect("task mutex poisoned").drain(..) {
            handle.abort();
        }
    }

    fn route(self: &Arc<Self>, signed: SignedEnvelope) {
        let trade_id = signed.envelope.trade_id.clone();
        let existing = self
            .queues
            .lock()
            .expect("queue mutex poisoned")
            .get(&trade_id)
            .cloned();

        let queue = match existing {
            Some(queue) => queue,
            None => {
                // A service opens a trade on a fresh RFQ; everything else for
                // an unknown trade is noise.
                if self.role != Role::Service || signed.envelope.kind() != Kind::Rfq {
                    tracing::debug!(%trade_id, kind = %signed.envelope.kind(), "dropping envelope for unknown trade");
                    return;
                }
                self.register_trade(Trade::new(&trade_id))
            }
        };

        let _ = queue.send(TradeMsg::Inbound(signed));
    }

    fn register_trade(self: &Arc<Self>, trade: Trade) -> mpsc::UnboundedSender<TradeMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        let trade_id = trade.trade_id.clone();
        self.update_snapshot(&trade);
        self.queues
            .lock()
            .expect("queue mutex poisoned")
            .insert(trade_id, tx.clone());

        let peer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            peer.trade_loop(trade, rx).await;
        });
        self.tasks.lock().expect("task mutex poisoned").push(handle);
        tx
    }

    async fn trade_loop(self: Arc<Self>, mut trade: Trade, mut rx: mpsc::UnboundedReceiver<TradeMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                TradeMsg::Inbound(signed) => self.handle_inbound(&mut trade, signed).await,
                TradeMsg::CheckRefund => self.check_refund(&mut trade).await,
            }
            if trade.state.is_terminal() {
                tracing::info!(trade_id = %trade.trade_id, state = %trade.state, "trade reached terminal state");
            }
        }
    }

    async fn handle_inbound(&self, trade: &mut Trade, signed: SignedEnvelope) {
        let before = trade.state;
        match self.apply_and_persist(trade, &signed, ReceiptDirection::Received) {
            Ok(next) => {
                let replay = next == *trade;
                *trade = next;
                if replay {
                    return;
                }
                tracing::info!(
                    trade_id = %trade.trade_id,
                    kind = %signed.envelope.kind(),
                    from = %before,
                    to = %trade.state,
                    "applied envelope"
                );
                if let Err(err) = self.react(trade, &signed).await {
                    tracing::warn!(trade_id = %trade.trade_id, error = %format!("{err:#}"), "reaction failed; cancelling");
                    self.cancel(trade, &format!("{err:#}")).await;
                }
            }
            Err(err) => {
                // Rejection is local: log, leave the trade untouched.
                tracing::warn!(
                    trade_id = %trade.trade_id,
                    kind = %signed.envelope.kind(),
                    error = %err,
                    "rejected envelope"
                );
            }
        }
    }

    async fn react(&self, trade: &mut Trade, signed: &SignedEnvelope) -> Result<()> {
        match (self.role, &signed.envelope.body) {
            (Role::Service, Body::Rfq(rfq)) => self.service_quote(trade, rfq).await,
            (Role::Service, Body::QuoteAccept(_)) => {
                self.service_invite(trade, &signed.signer_pubkey).await
            }
            (Role::Service, Body::Status(status)) if status.state == STATUS_JOINED => {
                self.service_terms(trade, &status.note).await
            }
            (Role::Service, Body::Accept(_)) => self.service_invoice_and_escrow(trade).await,
            (Role::Service, Body::SolClaimed(claim)) => {
                self.service_check_claim(trade, &claim.escrow_pda).await
            }
            (Role::Client, Body::Quote(quote)) => self.client_accept_quote(trade, quote).await,
            (Role::Client, Body::SwapInvite(invite)) => self.client_join(trade, invite).await,
            (Role::Client, Body::Terms(terms)) => self.client_accept_terms(trade, terms).await,
            (Role::Client, Body::SolEscrowCreated(_)) => self.client_verify_and_pay(trade).await,
            _ => Ok(()),
        }
    }

    // --- service side ---

    async fn service_quote(&self, trade: &mut Trade, rfq: &RfqBody) -> Result<()> {
        let rfq_id = trade.rfq_id.clone().context("rfq_id recorded")?;
        let body = Body::Quote(QuoteBody {
            pair: rfq.pair,
            direction: rfq.direction,
            btc_sats: rfq.btc_sats,
            usdt_amount: rfq.usdt_amount.clone(),
            rfq_id,
            valid_until_unix: now_unix() + self.cfg.quote_ttl_secs,
        });
        let channel = self.cfg.rendezvous_channel.clone();
        self.send_signed(trade, &channel, body).await
    }

    async fn service_invite(&self, trade: &mut Trade, invitee_pubkey: &str) -> Result<()> {
        let swap_channel = format!("{}{}", self.cfg.gated_prefix, trade.trade_id);
        let now = now_unix();
        let welcome = Welcome::issue(&swap_channel, &self.key, now);
        let invite = Invite::issue(
            &swap_channel,
            invitee_pubkey,
            &self.key,
            now + self.cfg.invite_ttl_secs,
        );
        self.sidechannel
            .host(&swap_channel, &welcome)
            .await
            .context("host swap channel")?;

        let body = Body::SwapInvite(SwapInviteBody {
            rfq_id: trade.rfq_id.clone().context("rfq_id recorded")?,
            quote_id: trade.quote_id.clone().context("quote_id recorded")?,
            swap_channel,
            owner_pubkey: self.pubkey_hex.clone(),
            invite: invite.encode(),
            welcome: welcome.encode(),
        });
        let channel = self.cfg.rendezvous_channel.clone();
        self.send_signed(trade, &channel, body).await
    }

    async fn service_terms(&self, trade: &mut Trade, recipient: &str) -> Result<()> {
        if trade.state != TradeState::Init || trade.terms.is_some() {
            return Ok(());
        }
        let params = self.service.as_ref().context("service params")?;
        let quote = trade.quote.clone().context("quote recorded")?;
        let now = now_unix();

        let body = Body::Terms(TermsBody {
            pair: quote.pair,
            direction: quote.direction,
            btc_sats: quote.btc_sats,
            usdt_amount: quote.usdt_amount.clone(),
            usdt_decimals: params.usdt_decimals,
            sol_mint: params.mint.clone(),
            sol_recipient: recipient.to_string(),
            sol_refund: params.sol_address.clone(),
            sol_refund_after_unix: now + params.refund_window_secs,
            ln_receiver_peer: self.pubkey_hex.clone(),
            ln_payer_peer: trade
                .counterparties
                .iter()
                .find(|p| *p != &self.pubkey_hex)
                .cloned()
                .unwrap_or_default(),
            terms_valid_until_unix: now + params.terms_ttl_secs,
        });
        let channel = self.swap_channel(trade)?;
        self.send_signed(trade, &channel, body).await
    }

    async fn service_invoice_and_escrow(&self, trade: &mut Trade) -> Result<()> {
        let params = self.service.as_ref().context("service params")?.clone();
        let terms = trade.terms.clone().context("terms recorded")?;
        let channel = self.swap_channel(trade)?;

        // Lightning invoice for the negotiated sats.
        let amount_msat = terms
            .btc_sats
            .checked_mul(1000)
            .context("amount_msat overflow")?;
        let invoice = self
            .lightning
            .invoice(amount_msat, &trade.trade_id, "intercom swap")
            .await
            .context("create invoice")?;
        let body = Body::LnInvoice(LnInvoiceBody {
            bolt11: invoice.bolt11.clone(),
            payment_hash_hex: invoice.payment_hash_hex.clone(),
            amount_msat: amount_msat.to_string(),
        });
        self.send_signed(trade, &channel, body).await?;

        // Fund the escrow under the same payment hash.
        let payment_hash = parse_hash32(&invoice.payment_hash_hex)?;
        let negotiated: u64 = terms
            .usdt_amount
            .parse()
            .context("terms usdt_amount fits u64")?;
        let fund_amount = params.fund_amount_override.unwrap_or(negotiated);
        let tx = EscrowTx {
            program_id: params.program_id.clone(),
            signer: params.sol_address.clone(),
            ix: EscrowIx::Create {
                payment_hash,
                recipient: terms.sol_recipient.clone(),
                refund: terms.sol_refund.clone(),
                refund_after_unix: terms.sol_refund_after_unix,
                mint: params.mint.clone(),
                amount: fund_amount,
            },
        };
        let tx_sig = self
            .submit_tx_with_retry("create escrow", &tx)
            .await
            .context("create escrow")?;

        let escrow_pda = derive_escrow_pda(&params.program_id, &payment_hash);
        let vault_ata = derive_ata(&escrow_pda, &params.mint);
        let body = Body::SolEscrowCreated(SolEscrowCreatedBody {
            payment_hash_hex: invoice.payment_hash_hex,
            program_id: params.program_id,
            escrow_pda,
            vault_ata,
            mint: params.mint,
            amount: terms.usdt_amount.clone(),
            refund_after_unix: terms.sol_refund_after_unix,
            recipient: terms.sol_recipient.clone(),
            refund: terms.sol_refund.clone(),
            tx_sig,
        });
        self.send_signed(trade, &channel, body).await
    }

    /// Cross-checks an announced claim against the chain. A confirmed
    /// contradiction is fatal for the trade record.
    async fn service_check_claim(&self, trade: &mut Trade, escrow_pda: &str) -> Result<()> {
        let account = self
            .chain
            .get_account(escrow_pda)
            .await
            .context("fetch escrow account")?;
        let status = account
            .as_ref()
            .and_then(|a| EscrowState::try_from_account(a).ok())
            .map(|s| s.status);
        if status != Some(EscrowStatus::Claimed) {
            let note = format!("claim announced but escrow {escrow_pda} reports {status:?}");
            tracing::error!(trade_id = %trade.trade_id, %note, "trade is inconsistent");
            *trade = machine::mark_inconsistent(trade, note);
            self.update_snapshot(trade);
        }
        Ok(())
    }

    // --- client side ---

    async fn client_accept_quote(&self, trade: &mut Trade, quote: &QuoteBody) -> Result<()> {
        let body = Body::QuoteAccept(crate::envelope::QuoteAcceptBody {
            rfq_id: quote.rfq_id.clone(),
            quote_id: trade.quote_id.clone().context("quote_id recorded")?,
        });
        let channel = self.cfg.rendezvous_channel.clone();
        self.send_signed(trade, &channel, body).await
    }

    async fn client_join(&self, trade: &mut Trade, invite_body: &SwapInviteBody) -> Result<()> {
        let params = self.client.as_ref().context("client params")?;

        let welcome = Welcome::decode(&invite_body.welcome).context("decode welcome")?;
        welcome.verify().context("verify welcome")?;
        anyhow::ensure!(
            welcome.owner_pubkey == invite_body.owner_pubkey,
            "welcome owner does not match invite owner"
        );
        let invite = Invite::decode(&invite_body.invite).context("decode invite")?;
        invite.verify().context("verify invite")?;
        anyhow::ensure!(
            invite.invitee_pubkey == self.pubkey_hex,
            "invite names a different peer"
        );

        self.sidechannel
            .join(&invite_body.swap_channel, Some(&invite), Some(&welcome))
            .await
            .context("join swap channel")?;

        let body = Body::Status(StatusBody {
            state: STATUS_JOINED.to_string(),
            note: params.sol_address.clone(),
        });
        let channel = invite_body.swap_channel.clone();
        self.send_signed(trade, &channel, body).await
    }

    async fn client_accept_terms(&self, trade: &mut Trade, terms: &TermsBody) -> Result<()> {
        let params = self.client.as_ref().context("client params")?;
        let rfq = trade.rfq.clone().context("rfq recorded")?;

        // The service must not have moved the goalposts since the quote.
        if terms.sol_recipient != params.sol_address
            || terms.btc_sats != rfq.btc_sats
            || terms.usdt_amount != rfq.usdt_amount
            || terms.direction != rfq.direction
        {
            self.cancel(trade, "terms do not match the quoted trade").await;
            return Ok(());
        }

        let body = Body::Accept(crate::envelope::AcceptBody {
            terms_hash: trade.terms_hash.clone().context("terms_hash recorded")?,
        });
        let channel = self.swap_channel(trade)?;
        self.send_signed(trade, &channel, body).await
    }

    async fn client_verify_and_pay(&self, trade: &mut Trade) -> Result<()> {
        let params = self.client.as_ref().context("client params")?.clone();
        let terms = trade.terms.clone().context("terms recorded")?;
        let invoice = trade.invoice.clone().context("invoice recorded")?;
        let escrow = trade.escrow.clone().context("escrow recorded")?;
        let channel = self.swap_channel(trade)?;

        // The critical safety rule: no payment until the chain itself proves
        // the escrow matches the negotiated terms. Chain reads get bounded
        // retries; a definitive verification failure is a refusal, not an
        // error.
        let mut attempt = 0u32;
        loop {
            match verify::verify_prepay(
                &terms,
                &invoice,
                &escrow,
                self.chain.as_ref(),
                now_unix(),
                self.cfg.safety_margin_secs,
            )
            .await
            {
                Ok(()) => break,
                Err(VerifyError::Chain(chain_err)) => {
                    attempt += 1;
                    if attempt >= self.cfg.max_attempts.max(1) {
                        return Err(anyhow::anyhow!(chain_err)).context("pre-pay chain read");
                    }
                    tracing::warn!(trade_id = %trade.trade_id, error = %chain_err, attempt, "pre-pay chain read failed; retrying");
                    tokio::time::sleep(self.cfg.retry_base_delay * 2u32.saturating_pow(attempt - 1))
                        .await;
                }
                Err(refusal) => {
                    tracing::warn!(trade_id = %trade.trade_id, error = %refusal, "pre-pay verification failed; refusing to pay");
                    self.cancel(trade, &refusal.to_string()).await;
                    return Ok(());
                }
            }
        }

        let outcome = self
            .lightning
            .pay(&invoice.bolt11)
            .await
            .context("pay invoice")?;
        let body = Body::LnPaid(LnPaidBody {
            payment_hash_hex: invoice.payment_hash_hex.clone(),
            preimage_hex: Some(outcome.preimage_hex.clone()),
        });
        self.send_signed(trade, &channel, body).await?;

        // Claim the escrow with the revealed preimage.
        let payment_hash = parse_hash32(&invoice.payment_hash_hex)?;
        let preimage = parse_hash32(&outcome.preimage_hex)?;
        let tx = EscrowTx {
            program_id: escrow.program_id.clone(),
            signer: params.sol_address.clone(),
            ix: EscrowIx::Claim {
                payment_hash,
                preimage,
            },
        };
        let tx_sig = self
            .submit_tx_with_retry("claim escrow", &tx)
            .await
            .context("claim escrow")?;

        let body = Body::SolClaimed(SolClaimedBody {
            payment_hash_hex: invoice.payment_hash_hex,
            escrow_pda: escrow.escrow_pda,
            tx_sig,
        });
        self.send_signed(trade, &channel, body).await
    }

    // --- shared plumbing ---

    async fn check_refund(&self, trade: &mut Trade) {
        if !matches!(trade.state, TradeState::Escrow | TradeState::LnPaid) {
            return;
        }
        let Some(escrow) = trade.escrow.clone() else {
            return;
        };
        let now = now_unix();
        if now < escrow.refund_after_unix {
            return;
        }

        match self.role {
            Role::Service => {
                let Some(params) = self.service.as_ref() else {
                    return;
                };
                let Ok(payment_hash) = parse_hash32(&escrow.payment_hash_hex) else {
                    return;
                };
                let tx = EscrowTx {
                    program_id: escrow.program_id.clone(),
                    signer: params.sol_address.clone(),
                    ix: EscrowIx::Refund { payment_hash },
                };
                match self.chain.send_tx(&tx).await {
                    Ok(tx_sig) => {
                        tracing::info!(trade_id = %trade.trade_id, %tx_sig, "escrow refunded");
                        self.apply_refund_observation(trade, now);
                    }
                    Err(err) => {
                        tracing::warn!(trade_id = %trade.trade_id, error = %err, "refund submit failed");
                    }
                }
            }
            Role::Client => {
                // The client only observes: has the escrow been refunded?
                let state = self
                    .chain
                    .get_account(&escrow.escrow_pda)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|a| EscrowState::try_from_account(&a).ok());
                if state.map(|s| s.status) == Some(EscrowStatus::Refunded) {
                    self.apply_refund_observation(trade, now);
                }
            }
        }
    }

    fn apply_refund_observation(&self, trade: &mut Trade, now_unix: i64) {
        match machine::observe_refund(trade, now_unix) {
            Ok(next) => {
                *trade = next;
                self.update_snapshot(trade);
            }
            Err(err) => {
                tracing::warn!(trade_id = %trade.trade_id, error = %err, "refund observation rejected");
            }
        }
    }

    async fn cancel(&self, trade: &mut Trade, reason: &str) {
        if trade.state.is_terminal() {
            return;
        }
        let channel = self
            .swap_channel(trade)
            .unwrap_or_else(|_| self.cfg.rendezvous_channel.clone());
        let body = Body::Cancel(CancelBody {
            reason: reason.to_string(),
        });
        if let Err(err) = self.send_signed(trade, &channel, body).await {
            tracing::warn!(trade_id = %trade.trade_id, error = %format!("{err:#}"), "cancel send failed");
        }
    }

    /// Signs, applies to our own trade record, persists, and transmits.
    async fn send_signed(&self, trade: &mut Trade, channel: &str, body: Body) -> Result<()> {
        let envelope = Envelope::new(&trade.trade_id, body);
        let signed = codec::sign(&envelope, &self.key).context("sign envelope")?;
        let next = self
            .apply_and_persist(trade, &signed, ReceiptDirection::Sent)
            .context("apply own envelope")?;
        *trade = next;

        let bytes = signed.to_bytes().context("encode envelope")?;
        self.sidechannel
            .send(channel, bytes)
            .await
            .context("sidechannel send")?;
        tracing::debug!(trade_id = %trade.trade_id, kind = %signed.envelope.kind(), %channel, "sent envelope");
        Ok(())
    }

    fn apply_and_persist(
        &self,
        trade: &Trade,
        signed: &SignedEnvelope,
        direction: ReceiptDirection,
    ) -> Result<Trade, super::TradeError> {
        let now = now_unix();
        let next = machine::apply(trade, signed, now)?;
        if next == *trade {
            // Byte-identical replay; nothing new to persist.
            return Ok(next);
        }
        if let Err(err) = self
            .receipts
            .lock()
            .expect("receipt store mutex poisoned")
            .append(&trade.trade_id, direction, signed, now)
        {
            tracing::error!(trade_id = %trade.trade_id, error = %format!("{err:#}"), "receipt append failed");
        }
        self.update_snapshot(&next);
        Ok(next)
    }

    async fn submit_tx_with_retry(&self, what: &'static str, tx: &EscrowTx) -> Result<String> {
        let chain = Arc::clone(&self.chain);
        let sig = with_retry(
            self.cfg.max_attempts,
            self.cfg.retry_base_delay,
            what,
            || {
                let chain = Arc::clone(&chain);
                let tx = tx.clone();
                async move { chain.send_tx(&tx).await }
            },
        )
        .await?;
        self.chain.confirm(&sig).await.context("confirm tx")?;
        Ok(sig)
    }

    fn swap_channel(&self, trade: &Trade) -> Result<String> {
        match self.role {
            Role::Service => Ok(format!("{}{}", self.cfg.gated_prefix, trade.trade_id)),
            Role::Client => trade
                .invite
                .as_ref()
                .map(|i| i.swap_channel.clone())
                .context("swap channel not known before SWAP_INVITE"),
        }
    }

    fn update_snapshot(&self, trade: &Trade) {
        self.snapshots
            .lock()
            .expect("snapshot mutex poisoned")
            .insert(trade.trade_id.clone(), trade.clone());
    }
}

async fn with_retry<T, E, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    what: &'static str,
    mut f: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts.max(1) {
                    return Err(err);
                }
                tracing::warn!(what, attempt, error = %err, "retrying after backoff");
                tokio::time::sleep(base_delay * 2u32.saturating_pow(attempt - 1)).await;
            }
        }
    }
}

fn parse_hash32(hex_str: &str) -> Result<[u8; 32]> {
    let raw = hex::decode(hex_str).context("decode hex")?;
    raw.try_into()
        .map_err(|_| anyhow::anyhow!("expected 32 bytes"))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
