//! End-to-end bridge flows over mocked chain interfaces: a mock contract
//! counting mints, a capturing Horizon submitter, and real follower
//! validators answering the signing fan-out.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use base64::Engine;
use ed25519_dalek::SigningKey;
use eyre::Result;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use tft_bridge::bridge::{MasterBridge, MasterMinter, WITHDRAW_FEE_STROOPS};
use tft_bridge::error::{BridgeError, SubmitError};
use tft_bridge::evm::contract::BridgeContract;
use tft_bridge::p2p::server::FollowerValidator;
use tft_bridge::p2p::protocol::{SignRequest, SignResponse};
use tft_bridge::p2p::SignerClient;
use tft_bridge::server::{BridgeStats, Metrics, SharedMetrics, SharedStats};
use tft_bridge::state::CursorStore;
use tft_bridge::stellar::horizon::{
    AccountRecord, AccountSigner, HorizonAccounts, PaymentRecord, Thresholds, TransactionFetcher,
    TransactionPage, TransactionRecord,
};
use tft_bridge::stellar::memo_index::MemoIndex;
use tft_bridge::stellar::wallet::BridgeWallet;
use tft_bridge::stellar::{units_to_stroops, StellarNetwork, ASSET_CODE};
use tft_bridge::stellar::watcher::DepositHandler;
use tft_bridge::types::{DepositEvent, MintSignature, SignedMint, WithdrawEvent};

const DEPOSIT_TX: &str = "5111f07e52d25b1cb941232712c9e816f1ae3e0682b9e829d17e593853a03f8b";

fn signing_key(n: u8) -> SigningKey {
    SigningKey::from_bytes(&[n; 32])
}

fn stellar_seed(n: u8) -> String {
    stellar_strkey::ed25519::PrivateKey(signing_key(n).to_bytes()).to_string()
}

fn stellar_address(n: u8) -> String {
    stellar_strkey::ed25519::PublicKey(signing_key(n).verifying_key().to_bytes()).to_string()
}

fn master_address() -> String {
    stellar_address(7)
}

fn cosigner_address() -> String {
    stellar_address(8)
}

fn dest_address() -> String {
    stellar_address(9)
}

fn fee_wallet_address() -> String {
    stellar_address(10)
}

fn depositor_address() -> String {
    stellar_address(11)
}

const MASTER_EVM: Address = Address::repeat_byte(0xA1);
const COSIGNER_EVM: Address = Address::repeat_byte(0xB2);

struct MintCall {
    receiver: Address,
    amount: u64,
    tx_id: String,
    signatures: Vec<MintSignature>,
}

/// Contract double: counts mints and reports already-minted tx ids.
struct MockContract {
    signer_address: Address,
    signers: Vec<Address>,
    required: u64,
    minted: StdMutex<HashSet<String>>,
    mint_calls: StdMutex<Vec<MintCall>>,
}

impl MockContract {
    fn new(signer_address: Address, signers: Vec<Address>, required: u64) -> Arc<Self> {
        Arc::new(Self {
            signer_address,
            signers,
            required,
            minted: StdMutex::new(HashSet::new()),
            mint_calls: StdMutex::new(Vec::new()),
        })
    }

    fn mint_count(&self) -> usize {
        self.mint_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl BridgeContract for MockContract {
    async fn is_mint_tx_id(&self, tx_id: &str) -> Result<bool> {
        Ok(self.minted.lock().unwrap().contains(tx_id))
    }
    async fn get_signers(&self) -> Result<Vec<Address>> {
        Ok(self.signers.clone())
    }
    async fn get_required_signature_count(&self) -> Result<u64> {
        Ok(self.required)
    }
    async fn mint(
        &self,
        receiver: Address,
        amount: u64,
        tx_id: &str,
        signatures: Vec<MintSignature>,
    ) -> Result<()> {
        self.minted.lock().unwrap().insert(tx_id.to_string());
        self.mint_calls.lock().unwrap().push(MintCall {
            receiver,
            amount,
            tx_id: tx_id.to_string(),
            signatures,
        });
        Ok(())
    }
    async fn is_synced(&self) -> Result<bool> {
        Ok(true)
    }
    fn sign_mint(&self, _receiver: Address, _amount: u64, _tx_id: &str) -> Result<SignedMint> {
        // marker signature keyed by the signer so ordering is observable
        let marker = self.signer_address.as_slice()[0];
        Ok(SignedMint {
            who: self.signer_address,
            signature: MintSignature {
                v: 27,
                r: B256::repeat_byte(marker),
                s: B256::repeat_byte(marker),
            },
        })
    }
}

/// Horizon double: serves one account record and captures submissions.
struct MockHorizon {
    account: AccountRecord,
    submissions: StdMutex<Vec<String>>,
}

impl MockHorizon {
    fn new(account: AccountRecord) -> Arc<Self> {
        Arc::new(Self {
            account,
            submissions: StdMutex::new(Vec::new()),
        })
    }

    fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }
}

#[async_trait]
impl HorizonAccounts for MockHorizon {
    async fn account(&self, _id: &str) -> Result<AccountRecord> {
        Ok(self.account.clone())
    }
    async fn submit(&self, envelope_xdr: &str) -> std::result::Result<String, SubmitError> {
        self.submissions
            .lock()
            .unwrap()
            .push(envelope_xdr.to_string());
        Ok("a1b2c3".to_string())
    }
}

/// Fetcher double serving canned pages and transactions.
#[derive(Default)]
struct MockFetcher {
    pages: Vec<(String, TransactionPage)>,
    transactions: Vec<(TransactionRecord, Vec<PaymentRecord>)>,
}

#[async_trait]
impl TransactionFetcher for MockFetcher {
    async fn fetch_transactions(&self, _account: &str, cursor: &str) -> Result<TransactionPage> {
        Ok(self
            .pages
            .iter()
            .find(|(c, _)| c == cursor)
            .map(|(_, p)| p.clone())
            .unwrap_or_default())
    }
    async fn fetch_transaction(&self, hash: &str) -> Result<Option<TransactionRecord>> {
        Ok(self
            .transactions
            .iter()
            .find(|(record, _)| record.hash == hash)
            .map(|(record, _)| record.clone()))
    }
    async fn fetch_payments(&self, tx_hash: &str) -> Result<Vec<PaymentRecord>> {
        Ok(self
            .transactions
            .iter()
            .find(|(record, _)| record.hash == tx_hash)
            .map(|(_, payments)| payments.clone())
            .unwrap_or_default())
    }
}

/// Signer fan-out double: every request is answered by real follower
/// validators, in process.
struct MockSigners {
    validators: Vec<Arc<FollowerValidator>>,
}

#[async_trait]
impl SignerClient for MockSigners {
    async fn gather(&self, request: SignRequest, _needed: usize) -> Result<Vec<SignResponse>> {
        let mut responses = Vec::new();
        for validator in &self.validators {
            responses.push(validator.handle(request.clone()).await);
        }
        Ok(responses)
    }
}

fn master_account_record() -> AccountRecord {
    AccountRecord {
        account_id: master_address(),
        sequence: "100".into(),
        thresholds: Thresholds {
            low_threshold: 0,
            med_threshold: 2,
            high_threshold: 2,
        },
        signers: vec![
            AccountSigner {
                key: master_address(),
                weight: 1,
            },
            AccountSigner {
                key: cosigner_address(),
                weight: 1,
            },
        ],
    }
}

fn deposit_fixture(receiver: [u8; 20], amount: &str) -> (TransactionRecord, Vec<PaymentRecord>) {
    let mut memo = [0u8; 32];
    memo[..20].copy_from_slice(&receiver);
    let record = TransactionRecord {
        hash: DEPOSIT_TX.into(),
        paging_token: "1".into(),
        source_account: depositor_address(),
        memo_type: "hash".into(),
        memo: Some(base64::engine::general_purpose::STANDARD.encode(memo)),
        successful: true,
    };
    let payments = vec![PaymentRecord {
        type_str: "payment".into(),
        from: depositor_address(),
        to: master_address(),
        asset_type: "credit_alphanum4".into(),
        asset_code: Some(ASSET_CODE.into()),
        asset_issuer: Some(StellarNetwork::Testnet.asset_issuer().into()),
        amount: amount.into(),
    }];
    (record, payments)
}

fn deposit_event(receiver: Option<Address>, amount_stroops: i64) -> DepositEvent {
    let mut memo = [0u8; 32];
    if let Some(receiver) = receiver {
        memo[..20].copy_from_slice(receiver.as_slice());
    }
    DepositEvent {
        tx_hash: DEPOSIT_TX.into(),
        source_account: depositor_address(),
        amount_stroops,
        memo,
        receiver,
    }
}

fn follower(
    contract: Arc<MockContract>,
    fetcher: MockFetcher,
) -> Arc<FollowerValidator> {
    let wallet = Arc::new(
        BridgeWallet::new(&stellar_seed(8), StellarNetwork::Testnet, None).unwrap(),
    );
    Arc::new(FollowerValidator::new(
        wallet,
        contract,
        Arc::new(fetcher),
        Arc::new(Mutex::new(MemoIndex::new(master_address()))),
        master_address(),
        units_to_stroops(50),
    ))
}

struct MasterHarness {
    contract: Arc<MockContract>,
    horizon: Arc<MockHorizon>,
    memo_index: Arc<Mutex<MemoIndex>>,
    stats: SharedStats,
    metrics: SharedMetrics,
    wallet: Arc<BridgeWallet>,
    signers: Arc<MockSigners>,
    synced_tx: watch::Sender<bool>,
}

impl MasterHarness {
    fn new(deposit: Option<(TransactionRecord, Vec<PaymentRecord>)>) -> Self {
        let contract = MockContract::new(MASTER_EVM, vec![COSIGNER_EVM, MASTER_EVM], 2);
        let follower_contract = MockContract::new(COSIGNER_EVM, vec![COSIGNER_EVM, MASTER_EVM], 2);
        let follower_fetcher = MockFetcher {
            pages: vec![],
            transactions: deposit.into_iter().collect(),
        };
        let signers = Arc::new(MockSigners {
            validators: vec![follower(follower_contract, follower_fetcher)],
        });
        let wallet = Arc::new(
            BridgeWallet::new(
                &stellar_seed(7),
                StellarNetwork::Testnet,
                Some(fee_wallet_address()),
            )
            .unwrap(),
        );
        let (synced_tx, _) = watch::channel(true);
        Self {
            contract,
            horizon: MockHorizon::new(master_account_record()),
            memo_index: Arc::new(Mutex::new(MemoIndex::new(master_address()))),
            stats: Arc::new(RwLock::new(BridgeStats::default())),
            metrics: Arc::new(Metrics::new()),
            wallet,
            signers,
            synced_tx,
        }
    }

    fn minter(&self) -> MasterMinter {
        MasterMinter::new(
            self.contract.clone(),
            self.signers.clone(),
            self.wallet.clone(),
            self.horizon.clone(),
            Arc::new(MockFetcher::default()),
            self.memo_index.clone(),
            units_to_stroops(50),
            self.synced_tx.subscribe(),
            self.metrics.clone(),
        )
    }
}

/// Poll until `condition` holds or a second has passed.
async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 1s");
}

// ---------------------------------------------------------------------------
// Deposit → mint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path_deposit_mints_once() {
    let receiver = Address::repeat_byte(0xAB);
    let harness = MasterHarness::new(Some(deposit_fixture(receiver.into_array(), "100.0000000")));
    let minter = harness.minter();

    // 100 TFT deposited, 50 TFT deposit fee
    minter
        .on_deposit(deposit_event(Some(receiver), 1_000_000_000))
        .await
        .unwrap();

    let calls = harness.contract.mint_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].receiver, receiver);
    assert_eq!(calls[0].amount, 500_000_000);
    assert_eq!(calls[0].tx_id, DEPOSIT_TX);
    assert_eq!(calls[0].signatures.len(), 2);
    // getSigners order: cosigner first, master second
    assert_eq!(
        calls[0].signatures[0].r,
        B256::repeat_byte(COSIGNER_EVM.as_slice()[0])
    );
    assert_eq!(
        calls[0].signatures[1].r,
        B256::repeat_byte(MASTER_EVM.as_slice()[0])
    );
}

#[tokio::test]
async fn test_replayed_deposit_is_minted_at_most_once() {
    let receiver = Address::repeat_byte(0xAB);
    let harness = MasterHarness::new(Some(deposit_fixture(receiver.into_array(), "100.0000000")));
    let minter = harness.minter();
    let deposit = deposit_event(Some(receiver), 1_000_000_000);

    minter.on_deposit(deposit.clone()).await.unwrap();
    // crash/restart replay of the same page
    minter.on_deposit(deposit).await.unwrap();

    assert_eq!(harness.contract.mint_count(), 1);
}

#[tokio::test]
async fn test_deposit_at_fee_boundary_is_refused() {
    let receiver = Address::repeat_byte(0xAB);
    let harness = MasterHarness::new(Some(deposit_fixture(receiver.into_array(), "50.0000000")));
    let minter = harness.minter();

    let err = minter
        .on_deposit(deposit_event(Some(receiver), 500_000_000))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::InsufficientDepositAmount));
    assert_eq!(harness.contract.mint_count(), 0);
}

#[tokio::test]
async fn test_memoless_deposit_is_refunded_minus_fee() {
    let harness = MasterHarness::new(Some(deposit_fixture([0u8; 20], "100.0000000")));
    let minter = harness.minter();

    minter
        .on_deposit(deposit_event(None, 1_000_000_000))
        .await
        .unwrap();

    assert_eq!(harness.contract.mint_count(), 0);
    assert_eq!(harness.horizon.submission_count(), 1);
    let envelope = harness.horizon.submissions.lock().unwrap()[0].clone();
    let decoded = DecodedEnvelope::parse(&envelope);
    // return memo names the refunded deposit
    assert_eq!(decoded.memo_type, 4);
    assert_eq!(hex::encode(decoded.memo), DEPOSIT_TX);
    // 100 TFT minus the 50 TFT deposit fee back to the depositor
    assert_eq!(decoded.operations[0].1, 500_000_000);
}

// ---------------------------------------------------------------------------
// Withdrawal → payout
// ---------------------------------------------------------------------------

struct BridgeHarness {
    harness: MasterHarness,
    heads_tx: mpsc::UnboundedSender<u64>,
    withdraw_tx: mpsc::UnboundedSender<WithdrawEvent>,
    shutdown_tx: mpsc::Sender<()>,
    _store_dir: tempfile::TempDir,
}

impl BridgeHarness {
    fn start(harness: MasterHarness) -> Self {
        let (heads_tx, heads_rx) = mpsc::unbounded_channel();
        let (withdraw_tx, withdraw_rx) = mpsc::unbounded_channel();
        let (synced_tx, _synced_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let store_dir = tempfile::tempdir().unwrap();
        let cursor_store = Arc::new(CursorStore::new(store_dir.path().join("node.json")));

        let bridge = MasterBridge::new(
            harness.contract.clone(),
            harness.signers.clone(),
            harness.wallet.clone(),
            harness.horizon.clone(),
            Arc::new(MockFetcher::default()),
            harness.memo_index.clone(),
            cursor_store,
            heads_rx,
            withdraw_rx,
            synced_tx,
            harness.stats.clone(),
            harness.metrics.clone(),
        );
        tokio::spawn(bridge.run(shutdown_rx));

        Self {
            harness,
            heads_tx,
            withdraw_tx,
            shutdown_tx,
            _store_dir: store_dir,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

fn withdraw_event(destination: &str, amount_stroops: u64, network: &str) -> WithdrawEvent {
    WithdrawEvent {
        tx_hash: B256::repeat_byte(0xE1),
        block_height: 1000,
        amount_stroops,
        burner: Address::repeat_byte(0x42),
        destination: destination.to_string(),
        network: network.to_string(),
    }
}

/// Parsed payment envelope, offsets per the transaction wire layout.
struct DecodedEnvelope {
    memo_type: u32,
    memo: [u8; 32],
    operations: Vec<([u8; 32], i64)>,
}

impl DecodedEnvelope {
    fn parse(envelope_b64: &str) -> Self {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(envelope_b64)
            .unwrap();
        let tx = &raw[4..];
        let memo_type = u32::from_be_bytes(tx[52..56].try_into().unwrap());
        let memo: [u8; 32] = tx[56..88].try_into().unwrap();
        let op_count = u32::from_be_bytes(tx[88..92].try_into().unwrap()) as usize;
        let mut operations = Vec::new();
        for i in 0..op_count {
            let op = &tx[92 + i * 96..92 + (i + 1) * 96];
            let destination: [u8; 32] = op[12..44].try_into().unwrap();
            let amount = i64::from_be_bytes(op[88..96].try_into().unwrap());
            operations.push((destination, amount));
        }
        Self {
            memo_type,
            memo,
            operations,
        }
    }
}

fn account_key(address: &str) -> [u8; 32] {
    stellar_strkey::ed25519::PublicKey::from_string(address)
        .unwrap()
        .0
}

#[tokio::test]
async fn test_happy_path_withdrawal_pays_out_at_depth() {
    let harness = MasterHarness::new(None);
    let bridge = BridgeHarness::start(harness);

    bridge
        .withdraw_tx
        .send(withdraw_event(&dest_address(), 1_000_000_000, "stellar"))
        .unwrap();

    // heads below the confirmation depth must not trigger a payout
    bridge.heads_tx.send(1001).unwrap();
    bridge.heads_tx.send(1002).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(bridge.harness.horizon.submission_count(), 0);

    bridge.heads_tx.send(1003).unwrap();
    let horizon = bridge.harness.horizon.clone();
    wait_for(move || horizon.submission_count() == 1).await;

    let envelope = bridge.harness.horizon.submissions.lock().unwrap()[0].clone();
    let decoded = DecodedEnvelope::parse(&envelope);
    // hash memo equal to the withdrawal transaction hash
    assert_eq!(decoded.memo_type, 3);
    assert_eq!(decoded.memo, [0xE1; 32]);
    // net to the destination, fee to the fee wallet, one transaction
    assert_eq!(decoded.operations.len(), 2);
    assert_eq!(decoded.operations[0].0, account_key(&dest_address()));
    assert_eq!(decoded.operations[0].1, 1_000_000_000 - WITHDRAW_FEE_STROOPS);
    assert_eq!(decoded.operations[1].0, account_key(&fee_wallet_address()));
    assert_eq!(decoded.operations[1].1, WITHDRAW_FEE_STROOPS);

    bridge.stop().await;
}

#[tokio::test]
async fn test_withdrawal_below_fee_is_dropped() {
    let harness = MasterHarness::new(None);
    let bridge = BridgeHarness::start(harness);

    // exactly the withdraw fee
    bridge
        .withdraw_tx
        .send(withdraw_event(
            &dest_address(),
            WITHDRAW_FEE_STROOPS as u64,
            "stellar",
        ))
        .unwrap();
    bridge.heads_tx.send(1003).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(bridge.harness.horizon.submission_count(), 0);
    bridge.stop().await;
}

#[tokio::test]
async fn test_non_stellar_withdrawal_is_ignored() {
    let harness = MasterHarness::new(None);
    let bridge = BridgeHarness::start(harness);

    bridge
        .withdraw_tx
        .send(withdraw_event(&dest_address(), 1_000_000_000, "ethereum"))
        .unwrap();
    bridge.heads_tx.send(1010).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(bridge.harness.horizon.submission_count(), 0);
    bridge.stop().await;
}

#[tokio::test]
async fn test_withdrawal_to_bridge_or_fee_wallet_is_dropped() {
    let harness = MasterHarness::new(None);
    let bridge = BridgeHarness::start(harness);

    let mut to_self = withdraw_event(&master_address(), 1_000_000_000, "stellar");
    to_self.tx_hash = B256::repeat_byte(0xE2);
    let mut to_fee = withdraw_event(&fee_wallet_address(), 1_000_000_000, "stellar");
    to_fee.tx_hash = B256::repeat_byte(0xE3);

    bridge.withdraw_tx.send(to_self).unwrap();
    bridge.withdraw_tx.send(to_fee).unwrap();
    bridge.heads_tx.send(1010).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(bridge.harness.horizon.submission_count(), 0);
    bridge.stop().await;
}

#[tokio::test]
async fn test_restart_replay_does_not_double_pay() {
    let harness = MasterHarness::new(None);
    // the memo of E1 is already on the bridge account: settled before the
    // crash, found again by the startup scan
    {
        let mut index = harness.memo_index.lock().await;
        let fetcher = MockFetcher {
            pages: vec![(
                String::new(),
                TransactionPage {
                    records: vec![TransactionRecord {
                        hash: "feedface".into(),
                        paging_token: "9".into(),
                        source_account: master_address(),
                        memo_type: "hash".into(),
                        memo: Some(
                            base64::engine::general_purpose::STANDARD.encode([0xE1u8; 32]),
                        ),
                        successful: true,
                    }],
                },
            )],
            transactions: vec![],
        };
        index.scan_bridge_account(&fetcher).await.unwrap();
    }
    let bridge = BridgeHarness::start(harness);

    // the historical filter re-emits E1 after restart
    bridge
        .withdraw_tx
        .send(withdraw_event(&dest_address(), 1_000_000_000, "stellar"))
        .unwrap();
    bridge.heads_tx.send(1005).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(bridge.harness.horizon.submission_count(), 0);
    bridge.stop().await;
}

#[tokio::test]
async fn test_payout_stays_buffered_after_quorum_failure() {
    // no cosigners answer: the quorum can never be reached
    let mut harness = MasterHarness::new(None);
    harness.signers = Arc::new(MockSigners { validators: vec![] });
    let bridge = BridgeHarness::start(harness);

    bridge
        .withdraw_tx
        .send(withdraw_event(&dest_address(), 1_000_000_000, "stellar"))
        .unwrap();
    bridge.heads_tx.send(1003).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // nothing submitted, and the event is still buffered for the next head
    assert_eq!(bridge.harness.horizon.submission_count(), 0);
    assert_eq!(bridge.harness.stats.read().await.pending_withdrawals, 1);

    bridge.heads_tx.send(1004).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(bridge.harness.horizon.submission_count(), 0);
    assert_eq!(bridge.harness.stats.read().await.pending_withdrawals, 1);
    bridge.stop().await;
}
