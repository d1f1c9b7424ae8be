//! Stellar side of the bridge: Horizon access, the memo index, the account
//! watcher, and payment construction.

pub mod horizon;
pub mod memo_index;
pub mod tx;
pub mod wallet;
pub mod watcher;

use eyre::{eyre, Result};

/// Stroops per whole TFT unit.
pub const PRECISION: i64 = 10_000_000;

/// Asset code of the bridged token.
pub const ASSET_CODE: &str = "TFT";

/// Horizon page size used by every fetch loop.
pub const PAGE_LIMIT: u16 = 100;

/// A Stellar network the bridge can run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StellarNetwork {
    Testnet,
    Production,
}

impl StellarNetwork {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "testnet" => Ok(StellarNetwork::Testnet),
            "production" => Ok(StellarNetwork::Production),
            other => Err(eyre!("stellar network {} is not supported", other)),
        }
    }

    pub fn horizon_url(&self) -> &'static str {
        match self {
            StellarNetwork::Testnet => "https://horizon-testnet.stellar.org",
            StellarNetwork::Production => "https://horizon.stellar.org",
        }
    }

    pub fn passphrase(&self) -> &'static str {
        match self {
            StellarNetwork::Testnet => "Test SDF Network ; September 2015",
            StellarNetwork::Production => "Public Global Stellar Network ; September 2015",
        }
    }

    /// Issuer of the bridged TFT asset on this network.
    pub fn asset_issuer(&self) -> &'static str {
        match self {
            StellarNetwork::Testnet => {
                "GA47YZA3PKFUZMPLQ3B5F2E3CJIB57TGGU7SPCQT2WAEYKN766PWIMB3"
            }
            StellarNetwork::Production => {
                "GBOVQKJYHXRR3DX6NOX2RRYFRCUMSADGDESTDNBDS6CDVLGVESRTAC47"
            }
        }
    }
}

/// Convert whole TFT units to stroops.
pub fn units_to_stroops(units: i64) -> i64 {
    units * PRECISION
}

/// Parse a Horizon decimal amount string (seven fractional digits) into
/// stroops without going through floating point.
pub fn amount_to_stroops(amount: &str) -> Result<i64> {
    let (whole, frac) = match amount.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount, ""),
    };
    if frac.len() > 7 {
        return Err(eyre!("amount {} has more than 7 fractional digits", amount));
    }
    let whole: i64 = whole
        .parse()
        .map_err(|_| eyre!("invalid amount {}", amount))?;
    let mut frac_padded = frac.to_string();
    while frac_padded.len() < 7 {
        frac_padded.push('0');
    }
    let frac: i64 = frac_padded
        .parse()
        .map_err(|_| eyre!("invalid amount {}", amount))?;
    whole
        .checked_mul(PRECISION)
        .and_then(|w| w.checked_add(frac))
        .ok_or_else(|| eyre!("amount {} overflows stroops", amount))
}

/// Render stroops as a Horizon decimal amount string.
pub fn stroops_to_amount(stroops: i64) -> String {
    format!("{}.{:07}", stroops / PRECISION, stroops % PRECISION)
}
