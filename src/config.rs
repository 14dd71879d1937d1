use std::time::Duration;

use crate::repair::RepairOptions;

/// Default public rendezvous channel for RFQ traffic.
pub const DEFAULT_RENDEZVOUS_CHANNEL: &str = "0000intercomswapbtcusdt";

/// Channels with this prefix are invite-gated by the sidechannel transport.
pub const DEFAULT_GATED_PREFIX: &str = "swap:";

/// Maximum time the client attributes to Lightning payment plus on-chain
/// claim when checking the escrow refund deadline.
pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 600;

/// Immutable per-peer configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub rendezvous_channel: String,
    pub gated_prefix: String,
    pub safety_margin_secs: i64,
    /// Bounded retry for chain/transport calls before the peer gives up and
    /// emits CANCEL.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    /// How long quotes issued by the service stay valid.
    pub quote_ttl_secs: i64,
    /// How long invites issued by the service stay valid.
    pub invite_ttl_secs: i64,
    pub repair: RepairOptions,
    /// Opaque token handed to the local bridge; the core only carries it.
    pub bridge_token: Option<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            rendezvous_channel: DEFAULT_RENDEZVOUS_CHANNEL.to_string(),
            gated_prefix: DEFAULT_GATED_PREFIX.to_string(),
            safety_margin_secs: DEFAULT_SAFETY_MARGIN_SECS,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(250),
            quote_ttl_secs: 300,
            invite_ttl_secs: 3600,
            repair: RepairOptions::default(),
            bridge_token: None,
        }
    }
}
