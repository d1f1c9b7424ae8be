//! Stellar Watcher: pages the bridge account's transaction history and turns
//! inbound payments into deposit events for the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use eyre::Result;
use tracing::{error, info, warn};

use super::horizon::{PaymentRecord, TransactionFetcher, TransactionRecord};
use super::{amount_to_stroops, ASSET_CODE};
use crate::error::BridgeError;
use crate::state::CursorStore;
use crate::types::DepositEvent;

/// Backoff applied after transport errors and transient handler failures.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Poll interval once the account history is exhausted.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The orchestrator's deposit entry point.
#[async_trait]
pub trait DepositHandler: Send + Sync {
    async fn on_deposit(&self, deposit: DepositEvent) -> Result<(), BridgeError>;
}

pub struct StellarWatcher {
    bridge_account: String,
    asset_issuer: String,
    cursor_store: Arc<CursorStore>,
    fetcher: Arc<dyn TransactionFetcher>,
    handler: Arc<dyn DepositHandler>,
}

impl StellarWatcher {
    pub fn new(
        bridge_account: String,
        asset_issuer: String,
        cursor_store: Arc<CursorStore>,
        fetcher: Arc<dyn TransactionFetcher>,
        handler: Arc<dyn DepositHandler>,
    ) -> Self {
        Self {
            bridge_account,
            asset_issuer,
            cursor_store,
            fetcher,
            handler,
        }
    }

    /// Run the fetch loop. The cursor only advances after a record has been
    /// fully handled, so a crash or a transient mint failure replays the
    /// record on the next pass; the contract's mint-id check keeps the
    /// replay harmless.
    pub async fn run(&self) -> Result<()> {
        let mut cursor = self.cursor_store.load_stellar_cursor()?;
        info!(
            component = "stellar_watcher",
            account = %self.bridge_account,
            cursor = %cursor,
            "watching bridge account"
        );

        loop {
            let page = match self
                .fetcher
                .fetch_transactions(&self.bridge_account, &cursor)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        component = "stellar_watcher",
                        cursor = %cursor,
                        err = %err,
                        "failed to fetch transactions, backing off"
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            if page.records.is_empty() {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            for record in &page.records {
                match self.process_record(record).await {
                    Ok(()) => {
                        cursor = record.paging_token.clone();
                        if let Err(err) = self.cursor_store.save_stellar_cursor(&cursor) {
                            warn!(
                                component = "stellar_watcher",
                                err = %err,
                                "failed to persist stellar cursor, continuing"
                            );
                        }
                    }
                    Err(err) => {
                        warn!(
                            component = "stellar_watcher",
                            tx = %record.hash,
                            err = %err,
                            "deposit handling failed, will retry this page"
                        );
                        tokio::time::sleep(RETRY_DELAY).await;
                        break;
                    }
                }
            }
        }
    }

    /// Handle one transaction record. Refusals and duplicates are terminal
    /// (the cursor may advance past them); everything else bubbles up as a
    /// retry.
    async fn process_record(&self, record: &TransactionRecord) -> Result<(), BridgeError> {
        if record.memo_type != "hash" || record.source_account == self.bridge_account {
            return Ok(());
        }

        let payments = self
            .fetcher
            .fetch_payments(&record.hash)
            .await
            .map_err(BridgeError::Other)?;

        let Some(deposit) =
            classify_transaction(record, &payments, &self.bridge_account, &self.asset_issuer)
        else {
            return Ok(());
        };

        match self.handler.on_deposit(deposit.clone()).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_refusal() => {
                error!(
                    component = "stellar_watcher",
                    tx = %deposit.tx_hash,
                    amount = deposit.amount_stroops,
                    err = %err,
                    "deposit refused, dropping"
                );
                Ok(())
            }
            Err(BridgeError::DuplicateMemo(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Pure classification of one transaction into a deposit event.
///
/// A deposit is a successful transaction with a hash memo whose payment
/// operations pay the bridge account in the bridged asset from elsewhere.
/// The memo's first 20 bytes name the EVM receiver; an all-zero receiver
/// marks the deposit for refunding.
pub fn classify_transaction(
    record: &TransactionRecord,
    payments: &[PaymentRecord],
    bridge_account: &str,
    asset_issuer: &str,
) -> Option<DepositEvent> {
    if record.memo_type != "hash" || record.source_account == bridge_account {
        return None;
    }
    let memo = record.decoded_memo()?;

    let mut total: i64 = 0;
    for payment in payments {
        if payment.type_str != "payment"
            || payment.to != bridge_account
            || payment.from == bridge_account
            || payment.asset_code.as_deref() != Some(ASSET_CODE)
            || payment.asset_issuer.as_deref() != Some(asset_issuer)
        {
            continue;
        }
        total += amount_to_stroops(&payment.amount).ok()?;
    }
    if total == 0 {
        return None;
    }

    let receiver = Address::from_slice(&memo[..20]);
    DepositEvent {
        tx_hash: record.hash.clone(),
        source_account: record.source_account.clone(),
        amount_stroops: total,
        memo,
        receiver: (receiver != Address::ZERO).then_some(receiver),
    }
    .into()
}
