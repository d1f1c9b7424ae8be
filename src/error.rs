use thiserror::Error;

/// Errors produced by the bridge's own decision logic.
///
/// The orchestrator branches on these: refusals are logged and dropped,
/// everything else is retried on the next observation window.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("deposited amount does not cover the deposit fee")]
    InsufficientDepositAmount,

    #[error("withdrawn amount does not cover the withdraw fee")]
    WithdrawBelowFee,

    #[error("withdraw destination is the bridge account or the fee wallet")]
    SelfDestination,

    #[error("transaction with memo {0} already exists on the bridge account")]
    DuplicateMemo(String),

    #[error("gathered {got} of {needed} required signatures")]
    QuorumNotReached { got: usize, needed: usize },

    #[error("signature from {0} does not match any on-chain signer")]
    UnknownSigner(String),

    #[error("bridge is not synced, retry later")]
    NotSynced,

    #[error(transparent)]
    Other(#[from] eyre::Report),
}

impl BridgeError {
    /// A refusal is terminal for the triggering event: the event is dropped
    /// and the watcher may advance its cursor past it.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            BridgeError::InsufficientDepositAmount
                | BridgeError::WithdrawBelowFee
                | BridgeError::SelfDestination
        )
    }
}

/// Horizon transaction submission failures, split so the wallet can react to
/// a stale sequence number differently from a hard rejection.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("transaction rejected with tx_bad_seq")]
    BadSequence,

    #[error("transaction rejected by horizon: {0}")]
    Rejected(String),

    #[error("horizon transport error: {0}")]
    Transport(String),
}
