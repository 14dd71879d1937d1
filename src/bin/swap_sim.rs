//! Runs a complete swap between a service peer and a client peer in one
//! process, over the in-memory sidechannel, chain and Lightning network.
//! Exit codes: 0 on success, 2 on bad arguments (clap), 3 on runtime failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context as _, Result};
use clap::Parser as _;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde_json::json;

use intercom_swap::config::{DEFAULT_GATED_PREFIX, DEFAULT_RENDEZVOUS_CHANNEL, PeerConfig};
use intercom_swap::lightning::node::MemoryLightningHub;
use intercom_swap::sidechannel::memory::MemoryHub;
use intercom_swap::solana::chain::MemoryChain;
use intercom_swap::solana::derive_ata;
use intercom_swap::trade::TradeState;
use intercom_swap::trade::receipts::ReceiptStore;
use intercom_swap::trade::runner::{ClientParams, ServiceParams, SwapPeer};

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = DEFAULT_RENDEZVOUS_CHANNEL)]
    rendezvous_channel: String,

    #[arg(long, default_value = DEFAULT_GATED_PREFIX)]
    gated_prefix: String,

    #[arg(long, default_value = "swap-sim-data/service.sqlite3")]
    service_store_path: PathBuf,

    #[arg(long, default_value = "swap-sim-data/client.sqlite3")]
    client_store_path: PathBuf,

    /// Accepted for parity with a networked deployment; the in-memory
    /// transport needs no bootstrap.
    #[arg(long)]
    bootstrap: Vec<String>,

    /// Opaque token handed to the local bridge.
    #[arg(long)]
    bridge_token: Option<String>,

    /// Trade id to negotiate under; a fresh one is minted when omitted.
    #[arg(long)]
    trade_id: Option<String>,

    #[arg(long, default_value_t = 50_000)]
    btc_sats: u64,

    /// Atomic USDT amount (6 decimals).
    #[arg(long, default_value = "100000000")]
    usdt_amount: String,

    #[arg(long, default_value_t = 3600)]
    refund_window_secs: i64,

    #[arg(long, default_value_t = 600)]
    safety_margin_secs: i64,

    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Fund the escrow with this amount instead of the negotiated one, to
    /// watch the client's pre-pay verifier refuse and cancel.
    #[arg(long)]
    fail_escrow_amount: Option<u64>,
}

fn main() {
    intercom_swap::logging::init().ok();
    let args = Args::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            std::process::exit(3);
        }
    };
    if let Err(err) = runtime.block_on(run(args)) {
        eprintln!("swap-sim failed: {err:#}");
        std::process::exit(3);
    }
}

async fn run(args: Args) -> Result<()> {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let trade_id = args
        .trade_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if !args.bootstrap.is_empty() {
        tracing::info!(bootstrap = ?args.bootstrap, "bootstrap peers noted (in-memory transport)");
    }

    // Shared in-process collaborators.
    let sidehub = MemoryHub::new(&args.gated_prefix, now);
    let lnhub = MemoryLightningHub::new();
    let chain = MemoryChain::new(now);

    let service_key = SigningKey::generate(&mut OsRng);
    let client_key = SigningKey::generate(&mut OsRng);
    let service_pubkey = hex::encode(service_key.verifying_key().as_bytes());
    let client_pubkey = hex::encode(client_key.verifying_key().as_bytes());

    let mint = "UsdtMintSim111".to_string();
    let program_id = "EscrowProgSim111".to_string();
    let service_sol = "ServiceSol111".to_string();
    let client_sol = "ClientSol111".to_string();

    // Give the service enough USDT to fund the escrow.
    let negotiated: u64 = args
        .usdt_amount
        .parse()
        .context("usdt_amount must be an atomic integer")?;
    chain.mint_to(&service_sol, &mint, negotiated.max(args.fail_escrow_amount.unwrap_or(0)));

    let cfg = PeerConfig {
        rendezvous_channel: args.rendezvous_channel.clone(),
        gated_prefix: args.gated_prefix.clone(),
        safety_margin_secs: args.safety_margin_secs,
        bridge_token: args.bridge_token.clone(),
        ..PeerConfig::default()
    };

    let service = SwapPeer::service(
        cfg.clone(),
        service_key,
        Arc::new(chain.clone()),
        Arc::new(lnhub.node("service")),
        Arc::new(sidehub.endpoint(&service_pubkey)),
        ReceiptStore::open(args.service_store_path.clone()).context("open service store")?,
        ServiceParams {
            program_id: program_id.clone(),
            mint: mint.clone(),
            sol_address: service_sol.clone(),
            usdt_decimals: 6,
            refund_window_secs: args.refund_window_secs,
            terms_ttl_secs: 600,
            fund_amount_override: args.fail_escrow_amount,
        },
    );

    let client = SwapPeer::client(
        cfg,
        client_key,
        Arc::new(chain.clone()),
        Arc::new(lnhub.node("client")),
        Arc::new(sidehub.endpoint(&client_pubkey)),
        ReceiptStore::open(args.client_store_path.clone()).context("open client store")?,
        ClientParams {
            sol_address: client_sol.clone(),
        },
    );

    service.join_rendezvous().await.context("service rendezvous")?;
    client.join_rendezvous().await.context("client rendezvous")?;

    let service_loop = tokio::spawn(Arc::clone(&service).run());
    let client_loop = tokio::spawn(Arc::clone(&client).run());

    client
        .start_swap(&trade_id, args.btc_sats, &args.usdt_amount, 600)
        .await
        .context("start swap")?;

    // Wait for both peers to reach a terminal state.
    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    let (service_trade, client_trade) = loop {
        let service_trade = service.trade(&trade_id);
        let client_trade = client.trade(&trade_id);
        let done = |t: &Option<intercom_swap::trade::Trade>| {
            t.as_ref().is_some_and(|t| t.state.is_terminal())
        };
        if done(&service_trade) && done(&client_trade) {
            break (
                service_trade.expect("service trade present"),
                client_trade.expect("client trade present"),
            );
        }
        anyhow::ensure!(Instant::now() < deadline, "swap did not settle in time");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    service.shutdown();
    client.shutdown();
    service_loop.abort();
    client_loop.abort();

    let client_balance = chain.token_balance(&derive_ata(&client_sol, &mint));
    let summary = json!({
        "trade_id": trade_id,
        "service_state": service_trade.state.as_str(),
        "client_state": client_trade.state.as_str(),
        "client_usdt_balance": client_balance,
        "service_ln_received_msat": lnhub.settled_msat("service"),
        "service_receipts": args.service_store_path,
        "client_receipts": args.client_store_path,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let expected = if args.fail_escrow_amount.is_some() {
        TradeState::Cancelled
    } else {
        TradeState::Claimed
    };
    anyhow::ensure!(
        client_trade.state == expected,
        "client finished {} but expected {}",
        client_trade.state,
        expected
    );
    Ok(())
}
