//! Peer-to-peer coordinator for atomic cross-chain swaps between Bitcoin
//! over Lightning and an SPL USDT on a Solana-like chain. Two mutually
//! distrusting peers negotiate over a signed-envelope sidechannel; the
//! Lightning preimage that settles the payment is the same secret that
//! unlocks the on-chain escrow.

pub mod config;
pub mod envelope;
pub mod lightning;
pub mod logging;
pub mod repair;
pub mod sidechannel;
pub mod solana;
pub mod trade;
pub mod verify;
