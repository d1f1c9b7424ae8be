//! Bridge Orchestrator: owns the dispatch loop, routes chain events to the
//! signing quorum and enforces the bridge invariants.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use eyre::{eyre, Result};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::BridgeError;
use crate::evm::contract::BridgeContract;
use crate::evm::watcher::ETH_BLOCK_DELAY;
use crate::p2p::protocol::{MintSignRequest, SignRequest, SignResponse};
use crate::p2p::SignerClient;
use crate::server::{SharedMetrics, SharedStats};
use crate::state::CursorStore;
use crate::stellar::horizon::{HorizonAccounts, TransactionFetcher};
use crate::stellar::memo_index::MemoIndex;
use crate::stellar::tx::Memo;
use crate::stellar::wallet::{BridgeWallet, PaymentIntent};
use crate::stellar::watcher::DepositHandler;
use crate::stellar::{stroops_to_amount, PRECISION};
use crate::types::{order_mint_signatures, DepositEvent, MintSignature, SignedMint, WithdrawEvent};

/// Fee withheld from every payout: 1 TFT in stroops.
pub const WITHDRAW_FEE_STROOPS: i64 = PRECISION;

/// Target network selecting this bridge in Withdraw events.
pub const BRIDGE_NETWORK: &str = "stellar";

/// The bridge's role. A master watches both chains and initiates mints and
/// payouts; a follower only answers signing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Follower => "follower",
        }
    }
}

/// Deposit handler of the master role: validates deposits and drives the
/// mint (or refund) through the signing quorum.
pub struct MasterMinter {
    contract: Arc<dyn BridgeContract>,
    signers: Arc<dyn SignerClient>,
    wallet: Arc<BridgeWallet>,
    horizon: Arc<dyn HorizonAccounts>,
    fetcher: Arc<dyn TransactionFetcher>,
    memo_index: Arc<Mutex<MemoIndex>>,
    deposit_fee_stroops: i64,
    synced: watch::Receiver<bool>,
    metrics: SharedMetrics,
}

impl MasterMinter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        contract: Arc<dyn BridgeContract>,
        signers: Arc<dyn SignerClient>,
        wallet: Arc<BridgeWallet>,
        horizon: Arc<dyn HorizonAccounts>,
        fetcher: Arc<dyn TransactionFetcher>,
        memo_index: Arc<Mutex<MemoIndex>>,
        deposit_fee_stroops: i64,
        synced: watch::Receiver<bool>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            contract,
            signers,
            wallet,
            horizon,
            fetcher,
            memo_index,
            deposit_fee_stroops,
            synced,
            metrics,
        }
    }

    async fn mint(&self, deposit: &DepositEvent, receiver: Address) -> Result<(), BridgeError> {
        info!(
            component = "bridge",
            tx = %deposit.tx_hash,
            receiver = %receiver,
            amount = %stroops_to_amount(deposit.amount_stroops),
            "minting"
        );

        if self.contract.is_mint_tx_id(&deposit.tx_hash).await? {
            info!(
                component = "bridge",
                tx = %deposit.tx_hash,
                "skipping known minting transaction"
            );
            return Ok(());
        }

        if deposit.amount_stroops <= self.deposit_fee_stroops {
            return Err(BridgeError::InsufficientDepositAmount);
        }
        let amount = (deposit.amount_stroops - self.deposit_fee_stroops) as u64;

        let required = self.contract.get_required_signature_count().await? as usize;
        debug!(component = "bridge", required, "required signature count");

        // the master's own signature counts toward the quorum
        let needed = required.saturating_sub(1);
        let mut gathered: Vec<SignedMint> = Vec::new();
        if needed > 0 {
            let request = SignRequest::Mint(MintSignRequest {
                receiver: receiver.into_array(),
                amount: amount as i64,
                tx_id: deposit.tx_hash.clone(),
                required_signatures: needed as i64,
            });
            for response in self.signers.gather(request, needed).await? {
                match response {
                    SignResponse::Mint(m) => gathered.push(SignedMint {
                        who: Address::from(m.who),
                        signature: MintSignature {
                            v: m.v,
                            r: m.r.into(),
                            s: m.s.into(),
                        },
                    }),
                    SignResponse::Rejected { reason } => warn!(
                        component = "bridge",
                        tx = %deposit.tx_hash,
                        reason = %reason,
                        "cosigner rejected mint request"
                    ),
                    SignResponse::Stellar(_) => warn!(
                        component = "bridge",
                        tx = %deposit.tx_hash,
                        "cosigner answered a mint request with a stellar signature"
                    ),
                }
            }
        }
        gathered.push(self.contract.sign_mint(receiver, amount, &deposit.tx_hash)?);

        let signers = self.contract.get_signers().await?;
        let ordered = match order_mint_signatures(&signers, &gathered, required) {
            Ok(ordered) => ordered,
            Err(err) => {
                if matches!(err, BridgeError::QuorumNotReached { .. }) {
                    self.metrics.quorum_failures_total.inc();
                }
                return Err(err);
            }
        };
        debug!(
            component = "bridge",
            signatures = ordered.len(),
            "total signatures count"
        );

        match self
            .contract
            .mint(receiver, amount, &deposit.tx_hash, ordered)
            .await
        {
            Ok(()) => {
                self.metrics
                    .mints_submitted_total
                    .with_label_values(&["success"])
                    .inc();
                Ok(())
            }
            Err(err) => {
                self.metrics
                    .mints_submitted_total
                    .with_label_values(&["failure"])
                    .inc();
                Err(err.into())
            }
        }
    }

    /// Return a deposit whose memo carries no receiver, minus the deposit
    /// fee, with a return memo naming the refunded transaction.
    async fn refund(&self, deposit: &DepositEvent) -> Result<(), BridgeError> {
        if deposit.amount_stroops <= self.deposit_fee_stroops {
            return Err(BridgeError::InsufficientDepositAmount);
        }

        let raw = hex::decode(&deposit.tx_hash)
            .map_err(|e| BridgeError::Other(eyre!("deposit hash is not hex: {e}")))?;
        let memo: [u8; 32] = raw
            .try_into()
            .map_err(|_| BridgeError::Other(eyre!("deposit hash must be 32 bytes")))?;

        warn!(
            component = "bridge",
            tx = %deposit.tx_hash,
            destination = %deposit.source_account,
            "deposit memo carries no receiver, refunding"
        );

        let intent = PaymentIntent {
            destination: deposit.source_account.clone(),
            amount_stroops: deposit.amount_stroops - self.deposit_fee_stroops,
            memo: Memo::Return(memo),
            settles_tx: deposit.tx_hash.clone(),
            block_height: 0,
            fee_stroops: Some(self.deposit_fee_stroops),
        };
        let mut index = self.memo_index.lock().await;
        match self
            .wallet
            .create_and_submit_payment(
                self.horizon.as_ref(),
                self.fetcher.as_ref(),
                &mut index,
                self.signers.as_ref(),
                intent,
            )
            .await
        {
            Ok(_) => {
                self.metrics
                    .refunds_submitted_total
                    .with_label_values(&["success"])
                    .inc();
                Ok(())
            }
            Err(err) => {
                if matches!(err, BridgeError::QuorumNotReached { .. }) {
                    self.metrics.quorum_failures_total.inc();
                }
                if !matches!(err, BridgeError::DuplicateMemo(_)) {
                    self.metrics
                        .refunds_submitted_total
                        .with_label_values(&["failure"])
                        .inc();
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl DepositHandler for MasterMinter {
    async fn on_deposit(&self, deposit: DepositEvent) -> Result<(), BridgeError> {
        self.metrics.deposits_observed_total.inc();
        if !*self.synced.borrow() {
            return Err(BridgeError::NotSynced);
        }
        match deposit.receiver {
            Some(receiver) => self.mint(&deposit, receiver).await,
            None => self.refund(&deposit).await,
        }
    }
}

/// The master's dispatch loop: single owner of the pending withdrawal map,
/// the synced flag and the persisted head height.
pub struct MasterBridge {
    contract: Arc<dyn BridgeContract>,
    signers: Arc<dyn SignerClient>,
    wallet: Arc<BridgeWallet>,
    horizon: Arc<dyn HorizonAccounts>,
    fetcher: Arc<dyn TransactionFetcher>,
    memo_index: Arc<Mutex<MemoIndex>>,
    cursor_store: Arc<CursorStore>,
    heads_rx: mpsc::UnboundedReceiver<u64>,
    withdraw_rx: mpsc::UnboundedReceiver<WithdrawEvent>,
    synced_tx: watch::Sender<bool>,
    synced: bool,
    stats: SharedStats,
    metrics: SharedMetrics,
}

impl MasterBridge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        contract: Arc<dyn BridgeContract>,
        signers: Arc<dyn SignerClient>,
        wallet: Arc<BridgeWallet>,
        horizon: Arc<dyn HorizonAccounts>,
        fetcher: Arc<dyn TransactionFetcher>,
        memo_index: Arc<Mutex<MemoIndex>>,
        cursor_store: Arc<CursorStore>,
        heads_rx: mpsc::UnboundedReceiver<u64>,
        withdraw_rx: mpsc::UnboundedReceiver<WithdrawEvent>,
        synced_tx: watch::Sender<bool>,
        stats: SharedStats,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            contract,
            signers,
            wallet,
            horizon,
            fetcher,
            memo_index,
            cursor_store,
            heads_rx,
            withdraw_rx,
            synced_tx,
            synced: false,
            stats,
            metrics,
        }
    }

    /// Run until shutdown. Pending withdrawals left in memory at shutdown
    /// are re-observed on the next start by the historical filter.
    pub async fn run(mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut pending: HashMap<B256, WithdrawEvent> = HashMap::new();
        info!(component = "bridge", "dispatch loop started");

        loop {
            tokio::select! {
                Some(event) = self.withdraw_rx.recv() => {
                    self.on_withdraw(&mut pending, event).await;
                }
                Some(head) = self.heads_rx.recv() => {
                    self.on_head(&mut pending, head).await;
                }
                _ = shutdown.recv() => {
                    info!(component = "bridge", "shutdown signal received, stopping dispatcher");
                    return Ok(());
                }
            }
        }
    }

    async fn on_withdraw(&self, pending: &mut HashMap<B256, WithdrawEvent>, event: WithdrawEvent) {
        if event.network != BRIDGE_NETWORK {
            warn!(
                component = "bridge",
                tx = %event.tx_hash,
                height = event.block_height,
                network = %event.network,
                "ignoring withdrawal, invalid target network"
            );
            return;
        }
        info!(
            component = "bridge",
            tx = %event.tx_hash,
            height = event.block_height,
            "remembering withdraw event"
        );
        pending.insert(event.tx_hash, event);
        self.stats.write().await.pending_withdrawals = pending.len();
    }

    async fn on_head(&mut self, pending: &mut HashMap<B256, WithdrawEvent>, head: u64) {
        match self.contract.is_synced().await {
            Ok(synced) => {
                self.synced = synced;
                let _ = self.synced_tx.send(synced);
            }
            Err(err) => error!(component = "bridge", err = %err, "failed to get sync progress"),
        }
        debug!(component = "bridge", head, synced = self.synced, "found new head");

        if self.synced {
            let ready: Vec<B256> = pending
                .iter()
                .filter(|(_, we)| head >= we.block_height + ETH_BLOCK_DELAY)
                .map(|(key, _)| *key)
                .collect();

            for key in ready {
                let Some(event) = pending.get(&key).cloned() else {
                    continue;
                };
                info!(component = "bridge", tx = %event.tx_hash, "starting withdrawal");
                match self.payout(&event).await {
                    Ok(()) => {
                        pending.remove(&key);
                    }
                    Err(err) if err.is_refusal() => {
                        warn!(
                            component = "bridge",
                            tx = %event.tx_hash,
                            destination = %event.destination,
                            amount = event.amount_stroops,
                            err = %err,
                            "withdrawal refused, dropping"
                        );
                        pending.remove(&key);
                    }
                    Err(BridgeError::DuplicateMemo(_)) => {
                        info!(
                            component = "bridge",
                            tx = %event.tx_hash,
                            "withdrawal already paid out"
                        );
                        pending.remove(&key);
                    }
                    Err(err) => {
                        error!(
                            component = "bridge",
                            tx = %event.tx_hash,
                            destination = %event.destination,
                            amount = event.amount_stroops,
                            err = %err,
                            "failed to create payment for withdrawal, will retry on next head"
                        );
                    }
                }
            }
        }

        if let Err(err) = self.cursor_store.save_height(head) {
            error!(component = "bridge", err = %err, "error occurred saving blockheight");
        }

        let known_memos = self.memo_index.lock().await.len();
        let mut stats = self.stats.write().await;
        stats.synced = self.synced;
        stats.last_evm_height = head;
        stats.pending_withdrawals = pending.len();
        stats.known_memos = known_memos;
    }

    async fn payout(&self, event: &WithdrawEvent) -> Result<(), BridgeError> {
        if event.destination == self.wallet.address()
            || Some(event.destination.as_str()) == self.wallet.fee_wallet()
        {
            return Err(BridgeError::SelfDestination);
        }
        if event.amount_stroops as i64 <= WITHDRAW_FEE_STROOPS {
            return Err(BridgeError::WithdrawBelowFee);
        }
        let net = event.amount_stroops as i64 - WITHDRAW_FEE_STROOPS;

        info!(
            component = "bridge",
            tx = %event.tx_hash,
            destination = %event.destination,
            amount = %stroops_to_amount(net),
            "creating a withdraw tx"
        );

        let intent = PaymentIntent {
            destination: event.destination.clone(),
            amount_stroops: net,
            memo: Memo::Hash(event.memo()),
            settles_tx: format!("{:x}", event.tx_hash),
            block_height: event.block_height,
            fee_stroops: Some(WITHDRAW_FEE_STROOPS),
        };
        let mut index = self.memo_index.lock().await;
        match self
            .wallet
            .create_and_submit_payment(
                self.horizon.as_ref(),
                self.fetcher.as_ref(),
                &mut index,
                self.signers.as_ref(),
                intent,
            )
            .await
        {
            Ok(_) => {
                self.metrics
                    .payouts_submitted_total
                    .with_label_values(&["success"])
                    .inc();
                Ok(())
            }
            Err(err) => {
                if matches!(err, BridgeError::QuorumNotReached { .. }) {
                    self.metrics.quorum_failures_total.inc();
                }
                if !matches!(err, BridgeError::DuplicateMemo(_)) {
                    self.metrics
                        .payouts_submitted_total
                        .with_label_values(&["failure"])
                        .inc();
                }
                Err(err)
            }
        }
    }
}
