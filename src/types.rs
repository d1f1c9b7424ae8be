use alloy::primitives::{Address, B256};

use crate::error::BridgeError;

/// An inbound Stellar payment to the bridge account, classified from a
/// Horizon transaction page. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositEvent {
    /// Hex-encoded Stellar transaction hash; the mint idempotency key.
    pub tx_hash: String,
    pub source_account: String,
    pub amount_stroops: i64,
    /// Raw 32-byte hash memo attached to the deposit.
    pub memo: [u8; 32],
    /// EVM receiver decoded from the first 20 memo bytes. `None` marks a
    /// deposit whose memo carries no usable receiver; such deposits are
    /// refunded minus the deposit fee.
    pub receiver: Option<Address>,
}

impl DepositEvent {
    pub fn memo_hex(&self) -> String {
        hex::encode(self.memo)
    }
}

/// A Withdraw log observed on the EVM chain, held in the pending map until
/// the confirmation depth is met.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawEvent {
    pub tx_hash: B256,
    pub block_height: u64,
    pub amount_stroops: u64,
    /// EVM account that burned the tokens.
    pub burner: Address,
    /// Target address on the destination chain.
    pub destination: String,
    /// Target network name; only `"stellar"` selects this bridge.
    pub network: String,
}

impl WithdrawEvent {
    /// The payout idempotency key: the withdrawal transaction hash, used
    /// verbatim as the 32-byte Stellar hash memo.
    pub fn memo(&self) -> [u8; 32] {
        self.tx_hash.0
    }
}

/// An ECDSA signature in the contract's `(v, r, s)` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintSignature {
    pub v: u8,
    pub r: B256,
    pub s: B256,
}

/// A mint signature attributed to the EVM signer that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMint {
    pub who: Address,
    pub signature: MintSignature,
}

/// Arrange gathered mint signatures in the contract's `getSigners()` order.
///
/// The contract verifies signatures positionally against its signer list, so
/// the submitted set must be the ordered subsequence of signers that actually
/// signed: a response from an unknown signer is a protocol violation, and
/// fewer than `required` usable slots fails the quorum. Duplicates per signer
/// collapse to the first response.
pub fn order_mint_signatures(
    signers: &[Address],
    gathered: &[SignedMint],
    required: usize,
) -> Result<Vec<MintSignature>, BridgeError> {
    for signed in gathered {
        if !signers.contains(&signed.who) {
            return Err(BridgeError::UnknownSigner(format!("{:?}", signed.who)));
        }
    }
    let ordered: Vec<MintSignature> = signers
        .iter()
        .filter_map(|signer| {
            gathered
                .iter()
                .find(|s| s.who == *signer)
                .map(|s| s.signature)
        })
        .collect();
    if ordered.len() < required {
        return Err(BridgeError::QuorumNotReached {
            got: ordered.len(),
            needed: required,
        });
    }
    Ok(ordered)
}
