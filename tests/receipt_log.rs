use anyhow::{Context as _, Result};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use intercom_swap::envelope::codec;
use intercom_swap::envelope::{
    AcceptBody, Body, Direction, Envelope, Pair, SignedEnvelope, TermsBody,
};
use intercom_swap::trade::receipts::{ReceiptDirection, ReceiptStore};
use intercom_swap::trade::TradeState;

const NOW: i64 = 1_700_000_000;

fn sample_terms(key: &SigningKey, trade_id: &str) -> SignedEnvelope {
    let body = Body::Terms(TermsBody {
        pair: Pair::BtcLnUsdtSol,
        direction: Direction::BtcToUsdt,
        btc_sats: 50_000,
        usdt_amount: "100000000".to_string(),
        usdt_decimals: 6,
        sol_mint: "UsdtMint1".to_string(),
        sol_recipient: "ClientSol1".to_string(),
        sol_refund: "ServiceSol1".to_string(),
        sol_refund_after_unix: NOW + 3600,
        ln_receiver_peer: "svc".to_string(),
        ln_payer_peer: "cli".to_string(),
        terms_valid_until_unix: NOW + 600,
    });
    codec::sign(&Envelope::new(trade_id, body), key).expect("sign terms")
}

#[test]
fn receipts_are_sequenced_per_trade() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store =
        ReceiptStore::open(dir.path().join("receipts.sqlite3")).context("open store")?;

    let key = SigningKey::generate(&mut OsRng);
    let t1_terms = sample_terms(&key, "t1");
    let t2_terms = sample_terms(&key, "t2");

    assert_eq!(
        store.append("t1", ReceiptDirection::Received, &t1_terms, NOW)?,
        1
    );
    assert_eq!(
        store.append("t2", ReceiptDirection::Received, &t2_terms, NOW)?,
        1
    );

    let accept = codec::sign(
        &Envelope::new(
            "t1",
            Body::Accept(AcceptBody {
                terms_hash: t1_terms.envelope.hash()?,
            }),
        ),
        &key,
    )?;
    assert_eq!(store.append("t1", ReceiptDirection::Sent, &accept, NOW + 1)?, 2);

    let receipts = store.list("t1")?;
    assert_eq!(receipts.len(), 2);
    assert_eq!(receipts[0].seq, 1);
    assert_eq!(receipts[0].direction, ReceiptDirection::Received);
    assert_eq!(receipts[1].seq, 2);
    assert_eq!(receipts[1].direction, ReceiptDirection::Sent);

    assert_eq!(store.latest_seq("t1")?, Some(2));
    assert_eq!(store.latest_seq("missing")?, None);
    assert_eq!(store.trade_ids()?, vec!["t1".to_string(), "t2".to_string()]);
    Ok(())
}

#[test]
fn snapshot_rebuilds_from_the_log() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("receipts.sqlite3");

    let service = SigningKey::generate(&mut OsRng);
    let client = SigningKey::generate(&mut OsRng);
    let terms = sample_terms(&service, "t1");
    let accept = codec::sign(
        &Envelope::new(
            "t1",
            Body::Accept(AcceptBody {
                terms_hash: terms.envelope.hash()?,
            }),
        ),
        &client,
    )?;

    {
        let mut store = ReceiptStore::open(path.clone()).context("open store")?;
        store.append("t1", ReceiptDirection::Received, &terms, NOW)?;
        store.append("t1", ReceiptDirection::Sent, &accept, NOW + 1)?;
    }

    // A fresh process rebuilds the same trade from disk, replaying each
    // receipt at its original clock.
    let store = ReceiptStore::open(path).context("reopen store")?;
    let trade = store.rebuild("t1").context("rebuild trade")?;
    assert_eq!(trade.state, TradeState::Accepted);
    assert_eq!(trade.terms_hash, Some(terms.envelope.hash()?));
    assert_eq!(
        trade.terms.as_ref().map(|t| t.usdt_amount.as_str()),
        Some("100000000")
    );
    Ok(())
}
