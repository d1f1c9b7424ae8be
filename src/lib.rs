//! Bridge daemon mirroring TFT between a Stellar account and an EVM token
//! contract.
//!
//! A master node watches both chains, translating Stellar deposits into
//! quorum-signed mints and confirmed EVM withdrawals into Stellar payments.
//! Follower nodes validate and co-sign the master's requests over a libp2p
//! overlay.

pub mod bridge;
pub mod config;
pub mod error;
pub mod evm;
pub mod p2p;
pub mod server;
pub mod state;
pub mod stellar;
pub mod types;
