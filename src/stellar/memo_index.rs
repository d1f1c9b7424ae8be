//! Index of hash/return memos seen on the bridge Stellar account.
//!
//! Every outbound bridge payment carries the source-chain transaction hash as
//! its memo, so the set of memos on the account history is the set of already
//! settled payouts and refunds. The index is a best-effort duplicate guard;
//! the hard guarantee is the economic idempotence of the memo itself.

use std::collections::HashSet;

use eyre::Result;
use tracing::{debug, info};

use super::horizon::TransactionFetcher;
use crate::error::BridgeError;

pub struct MemoIndex {
    account: String,
    known: HashSet<String>,
    /// Paging position of the last applied record, so rescans do not redo
    /// the whole account history. Separate from the watcher's persisted
    /// cursor: the index always rebuilds from genesis on startup.
    cursor: String,
}

impl MemoIndex {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            known: HashSet::new(),
            cursor: String::new(),
        }
    }

    pub fn has(&self, memo_hex: &str) -> bool {
        self.known.contains(memo_hex)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Record a memo directly, used when the bridge itself just submitted a
    /// payment and should not wait for the next scan to know about it.
    pub fn insert(&mut self, memo_hex: String) {
        if self.known.insert(memo_hex.clone()) {
            debug!(memo = %memo_hex, "storing memo in known transaction index");
        }
    }

    /// Page through the account history from the index's own cursor,
    /// absorbing every hash/return memo. Idempotent; resumable.
    pub async fn scan_bridge_account(&mut self, fetcher: &dyn TransactionFetcher) -> Result<()> {
        loop {
            let page = fetcher
                .fetch_transactions(&self.account, &self.cursor)
                .await?;
            if page.records.is_empty() {
                return Ok(());
            }
            for record in &page.records {
                if let Some(memo) = record.decoded_memo() {
                    self.insert(hex::encode(memo));
                }
                self.cursor = record.paging_token.clone();
            }
        }
    }

    /// Duplicate guard run immediately before a payment submission. A miss
    /// triggers one incremental rescan to the latest ledger and a recheck;
    /// only then may the payment proceed. The reservation itself happens
    /// implicitly when the submitted payment is observed on the account.
    pub async fn check_and_reserve(
        &mut self,
        fetcher: &dyn TransactionFetcher,
        memo_hex: &str,
    ) -> Result<(), BridgeError> {
        if self.has(memo_hex) {
            return Err(BridgeError::DuplicateMemo(memo_hex.to_string()));
        }

        self.scan_bridge_account(fetcher)
            .await
            .map_err(BridgeError::Other)?;

        if self.has(memo_hex) {
            return Err(BridgeError::DuplicateMemo(memo_hex.to_string()));
        }
        info!(memo = %memo_hex, "memo not found on bridge account");
        Ok(())
    }
}
