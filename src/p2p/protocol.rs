//! Wire messages of the cosigner request/response protocol.
//!
//! Exchanged CBOR-encoded over the libp2p overlay between the master and the
//! cosigner followers.

use serde::{Deserialize, Serialize};

/// Stable protocol identifier.
pub const SIGNER_PROTOCOL: &str = "/tft/signer/1.0.0";

/// A signing request dispatched by the master to every cosigner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignRequest {
    Mint(MintSignRequest),
    Payment(PaymentSignRequest),
    Refund(PaymentSignRequest),
}

/// Request for a signature over an EVM mint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintSignRequest {
    /// EVM receiver of the minted tokens.
    pub receiver: [u8; 20],
    /// Amount after the deposit fee, in stroops.
    pub amount: i64,
    /// Hash of the Stellar deposit transaction; the mint idempotency key.
    pub tx_id: String,
    /// Cosigner signatures the master still needs (its own excluded).
    pub required_signatures: i64,
}

/// Request for a signature over a Stellar payment or refund. The cosigner
/// rebuilds the identical transaction from these fields and signs its
/// network digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSignRequest {
    pub destination: String,
    /// Net amount paid to the destination, in stroops.
    pub amount_stroops: i64,
    /// 32-byte memo; a hash memo for payouts, a return memo for refunds.
    pub memo: [u8; 32],
    /// Hex hash of the transaction this payment settles: the EVM withdrawal
    /// for payouts, the Stellar deposit for refunds.
    pub settles_tx: String,
    /// EVM block of the withdrawal; zero for refunds.
    pub block_height: u64,
    /// Sequence number the rebuilt transaction must consume.
    pub sequence: i64,
    /// Fee-wallet operation included in the same transaction, if any.
    pub fee_payment: Option<FeePayment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePayment {
    pub destination: String,
    pub amount_stroops: i64,
}

/// A cosigner's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignResponse {
    Mint(MintSignResponse),
    Stellar(StellarSignResponse),
    Rejected { reason: String },
}

/// ECDSA signature over the mint digest, attributed to the cosigner's EVM
/// signer address so the master can order it against `getSigners()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintSignResponse {
    pub who: [u8; 20],
    pub v: u8,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

/// Ed25519 signature over the payment digest, attributed to the cosigner's
/// Stellar address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StellarSignResponse {
    pub who: String,
    pub signature: Vec<u8>,
}
