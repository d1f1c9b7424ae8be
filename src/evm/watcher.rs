//! EVM Watcher: streams new heads and Withdraw logs to the orchestrator and
//! replays the historical window missed while the bridge was down.

use alloy::primitives::Address;
use alloy::providers::Provider;
use alloy::pubsub::PubSubFrontend;
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use eyre::{eyre, Result, WrapErr};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::contract::TokenBridge;
use crate::types::WithdrawEvent;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Number of blocks a withdrawal must be buried under before payout; also
/// the overlap replayed before the persisted height on restart.
pub const ETH_BLOCK_DELAY: u64 = 3;

/// First block of the historical withdraw filter: the persisted height (or
/// the operator's rescan height) rewound by the confirmation delay, clamped
/// at genesis.
pub fn filter_start(persisted_height: u64, rescan_height: Option<u64>) -> u64 {
    match rescan_height {
        Some(height) => height.saturating_sub(ETH_BLOCK_DELAY),
        None => persisted_height.saturating_sub(ETH_BLOCK_DELAY),
    }
}

pub struct EvmWatcher<P> {
    provider: P,
    token_address: Address,
    from_height: u64,
    heads_tx: mpsc::UnboundedSender<u64>,
    withdraw_tx: mpsc::UnboundedSender<WithdrawEvent>,
}

impl<P> EvmWatcher<P>
where
    P: Provider<PubSubFrontend> + Clone + Send + Sync + 'static,
{
    pub fn new(
        provider: P,
        token_address: Address,
        from_height: u64,
        heads_tx: mpsc::UnboundedSender<u64>,
        withdraw_tx: mpsc::UnboundedSender<WithdrawEvent>,
    ) -> Self {
        Self {
            provider,
            token_address,
            from_height,
            heads_tx,
            withdraw_tx,
        }
    }

    /// Run the subscriptions, reconnecting on stream loss.
    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.watch().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        component = "evm_watcher",
                        err = %err,
                        "subscription lost, reconnecting"
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn watch(&mut self) -> Result<()> {
        let withdraw_filter = Filter::new()
            .address(self.token_address)
            .event_signature(TokenBridge::Withdraw::SIGNATURE_HASH);

        // Live streams first, then the catch-up filter bounded by the head
        // observed afterwards: the two ranges abut or overlap, never gap.
        let mut heads = self.provider.subscribe_blocks().await?.into_stream();
        let mut logs = self
            .provider
            .subscribe_logs(&withdraw_filter)
            .await?
            .into_stream();

        let head = self
            .provider
            .get_block_number()
            .await
            .wrap_err("eth_blockNumber call failed")?;
        if self.from_height < head {
            self.filter_withdraws(self.from_height, head).await?;
            // a reconnect replays only from the already-covered head
            self.from_height = head;
        }

        info!(
            component = "evm_watcher",
            contract = %self.token_address,
            head,
            "watching withdraw events"
        );

        loop {
            tokio::select! {
                block = heads.next() => {
                    let Some(block) = block else {
                        return Err(eyre!("head subscription ended"));
                    };
                    if self.heads_tx.send(block.inner.number).is_err() {
                        return Ok(());
                    }
                }
                log = logs.next() => {
                    let Some(log) = log else {
                        return Err(eyre!("withdraw subscription ended"));
                    };
                    self.forward_log(&log);
                }
            }
        }
    }

    /// Historical `FilterWithdraw` pass closing the restart gap.
    async fn filter_withdraws(&self, from: u64, to: u64) -> Result<()> {
        info!(
            component = "evm_watcher",
            from, to, "replaying withdraw history"
        );
        let filter = Filter::new()
            .address(self.token_address)
            .event_signature(TokenBridge::Withdraw::SIGNATURE_HASH)
            .from_block(from)
            .to_block(to);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .wrap_err("eth_getLogs call failed")?;
        for log in &logs {
            self.forward_log(log);
        }
        Ok(())
    }

    fn forward_log(&self, log: &Log) {
        match decode_withdraw_log(log) {
            Ok(event) => {
                let _ = self.withdraw_tx.send(event);
            }
            Err(err) => {
                error!(
                    component = "evm_watcher",
                    tx = ?log.transaction_hash,
                    err = %err,
                    "failed to decode withdraw log"
                );
            }
        }
    }
}

/// Decode a raw Withdraw log into a [`WithdrawEvent`].
pub fn decode_withdraw_log(log: &Log) -> Result<WithdrawEvent> {
    let event = TokenBridge::Withdraw::decode_log_data(log.data(), true)
        .wrap_err("malformed Withdraw log data")?;
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| eyre!("withdraw log misses transaction hash"))?;
    let block_height = log
        .block_number
        .ok_or_else(|| eyre!("withdraw log misses block number"))?;
    let amount_stroops: u64 = event
        .tokens
        .try_into()
        .map_err(|_| eyre!("withdraw amount does not fit u64"))?;
    Ok(WithdrawEvent {
        tx_hash,
        block_height,
        amount_stroops,
        burner: event.receiver,
        destination: event.blockchain_address,
        network: event.network,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{B256, U256};

    fn withdraw_log(amount: u64, destination: &str, network: &str) -> Log {
        let event = TokenBridge::Withdraw {
            tokens: U256::from(amount),
            receiver: Address::repeat_byte(7),
            blockchain_address: destination.to_string(),
            network: network.to_string(),
        };
        let mut log = Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(1),
                data: event.encode_log_data(),
            },
            ..Default::default()
        };
        log.transaction_hash = Some(B256::repeat_byte(0xE1));
        log.block_number = Some(1000);
        log
    }

    #[test]
    fn test_decode_withdraw_log() {
        let log = withdraw_log(1_000_000_000, "GABC", "stellar");
        let event = decode_withdraw_log(&log).unwrap();
        assert_eq!(event.amount_stroops, 1_000_000_000);
        assert_eq!(event.destination, "GABC");
        assert_eq!(event.network, "stellar");
        assert_eq!(event.block_height, 1000);
        assert_eq!(event.tx_hash, B256::repeat_byte(0xE1));
    }

    #[test]
    fn test_decode_requires_block_metadata() {
        let mut log = withdraw_log(1, "GABC", "stellar");
        log.block_number = None;
        assert!(decode_withdraw_log(&log).is_err());
    }

    #[test]
    fn test_filter_start_rewinds_by_delay() {
        assert_eq!(filter_start(900, None), 897);
        assert_eq!(filter_start(900, Some(500)), 497);
    }

    #[test]
    fn test_filter_start_clamps_at_genesis() {
        assert_eq!(filter_start(0, None), 0);
        assert_eq!(filter_start(2, None), 0);
        assert_eq!(filter_start(900, Some(1)), 0);
    }
}
