//! Payment Builder: constructs, co-signs and submits the bridge's outbound
//! Stellar payments.

use std::collections::HashSet;

use ed25519_dalek::SigningKey;
use eyre::{eyre, Result, WrapErr};
use tracing::{info, warn};

use super::horizon::{AccountRecord, HorizonAccounts, TransactionFetcher};
use super::memo_index::MemoIndex;
use super::tx::{verify_signature, DecoratedSignature, Memo, PaymentOperation, PaymentTransaction};
use super::{StellarNetwork, ASSET_CODE};
use crate::error::{BridgeError, SubmitError};
use crate::p2p::protocol::{FeePayment, PaymentSignRequest, SignRequest, SignResponse};
use crate::p2p::SignerClient;

/// Submission attempts before giving up; only `tx_bad_seq` consumes one.
const SUBMIT_ATTEMPTS: u32 = 5;

/// What a payment is for; built by the orchestrator, turned into a signed
/// transaction here.
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub destination: String,
    /// Net amount to the destination, fees already subtracted.
    pub amount_stroops: i64,
    pub memo: Memo,
    /// Hex hash of the event this payment settles.
    pub settles_tx: String,
    /// EVM block of the withdrawal; zero for refunds.
    pub block_height: u64,
    /// Amount routed to the fee wallet inside the same transaction.
    pub fee_stroops: Option<i64>,
}

/// The bridge's Stellar wallet: holds the master signing key and drives the
/// multisig payment flow.
pub struct BridgeWallet {
    address: String,
    signing_key: SigningKey,
    network: StellarNetwork,
    fee_wallet: Option<String>,
}

impl BridgeWallet {
    pub fn new(seed: &str, network: StellarNetwork, fee_wallet: Option<String>) -> Result<Self> {
        let secret = stellar_strkey::ed25519::PrivateKey::from_string(seed)
            .map_err(|e| eyre!("invalid stellar secret: {:?}", e))?;
        let signing_key = SigningKey::from_bytes(&secret.0);
        let address =
            stellar_strkey::ed25519::PublicKey(signing_key.verifying_key().to_bytes()).to_string();
        Ok(Self {
            address,
            signing_key,
            network,
            fee_wallet,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn fee_wallet(&self) -> Option<&str> {
        self.fee_wallet.as_deref()
    }

    pub fn network(&self) -> StellarNetwork {
        self.network
    }

    /// Raw ed25519 signature over a transaction's network digest. Followers
    /// use this to answer payment signing requests; the master re-attaches
    /// the hint from the responder's address.
    pub fn sign_transaction(&self, tx: &PaymentTransaction) -> Result<Vec<u8>> {
        Ok(tx
            .sign(self.network.passphrase(), &self.signing_key)?
            .signature)
    }

    /// The account's signer set and threshold determine the quorum: the
    /// cosigners are every signer key except this wallet's own, and the
    /// medium threshold is the number of signatures a payment needs.
    pub fn signing_requirements(&self, account: &AccountRecord) -> (Vec<String>, usize) {
        let cosigners = account
            .signers
            .iter()
            .filter(|s| s.key != self.address && s.weight > 0)
            .map(|s| s.key.clone())
            .collect();
        let required = (account.thresholds.med_threshold as usize).max(1);
        (cosigners, required)
    }

    fn build_transaction(&self, intent: &PaymentIntent, sequence: i64) -> PaymentTransaction {
        let mut operations = vec![PaymentOperation {
            destination: intent.destination.clone(),
            amount_stroops: intent.amount_stroops,
        }];
        if let (Some(fee), Some(fee_wallet)) = (intent.fee_stroops, self.fee_wallet.as_ref()) {
            operations.push(PaymentOperation {
                destination: fee_wallet.clone(),
                amount_stroops: fee,
            });
        }
        PaymentTransaction {
            source: self.address.clone(),
            sequence,
            memo: intent.memo,
            operations,
            asset_code: ASSET_CODE.to_string(),
            asset_issuer: self.network.asset_issuer().to_string(),
        }
    }

    /// Build, co-sign and submit one payment transaction.
    ///
    /// The memo duplicate guard runs first and is a hard error on a hit. A
    /// `tx_bad_seq` rejection refreshes the sequence and rebuilds; every
    /// other failure surfaces to the caller, which retries on the next head.
    pub async fn create_and_submit_payment(
        &self,
        horizon: &dyn HorizonAccounts,
        fetcher: &dyn TransactionFetcher,
        memo_index: &mut MemoIndex,
        signers: &dyn SignerClient,
        intent: PaymentIntent,
    ) -> Result<String, BridgeError> {
        let memo_bytes = match intent.memo {
            Memo::Hash(h) | Memo::Return(h) => h,
        };
        let memo_hex = hex::encode(memo_bytes);
        memo_index.check_and_reserve(fetcher, &memo_hex).await?;

        for attempt in 1..=SUBMIT_ATTEMPTS {
            let account = horizon
                .account(&self.address)
                .await
                .wrap_err("failed to load bridge account")
                .map_err(BridgeError::Other)?;
            let (cosigners, required) = self.signing_requirements(&account);
            let sequence = account.sequence_number().map_err(BridgeError::Other)? + 1;

            let tx = self.build_transaction(&intent, sequence);
            let digest = tx
                .signature_base(self.network.passphrase())
                .map_err(BridgeError::Other)?;
            let mut signatures = vec![tx
                .sign(self.network.passphrase(), &self.signing_key)
                .map_err(BridgeError::Other)?];

            if required > 1 {
                let needed = required - 1;
                let request = PaymentSignRequest {
                    destination: intent.destination.clone(),
                    amount_stroops: intent.amount_stroops,
                    memo: memo_bytes,
                    settles_tx: intent.settles_tx.clone(),
                    block_height: intent.block_height,
                    sequence,
                    fee_payment: match (intent.fee_stroops, self.fee_wallet.as_ref()) {
                        (Some(amount), Some(wallet)) => Some(FeePayment {
                            destination: wallet.clone(),
                            amount_stroops: amount,
                        }),
                        _ => None,
                    },
                };
                let request = match intent.memo {
                    Memo::Hash(_) => SignRequest::Payment(request),
                    Memo::Return(_) => SignRequest::Refund(request),
                };

                let responses = signers
                    .gather(request, needed)
                    .await
                    .map_err(BridgeError::Other)?;
                let mut seen = HashSet::new();
                for response in responses {
                    let SignResponse::Stellar(r) = response else {
                        continue;
                    };
                    if r.who == self.address
                        || !cosigners.contains(&r.who)
                        || !seen.insert(r.who.clone())
                    {
                        continue;
                    }
                    if !verify_signature(&r.who, &digest, &r.signature) {
                        warn!(
                            component = "wallet",
                            who = %r.who,
                            tx = %intent.settles_tx,
                            "cosigner returned an invalid payment signature"
                        );
                        continue;
                    }
                    signatures.push(DecoratedSignature {
                        hint: signature_hint(&r.who),
                        signature: r.signature,
                    });
                }
                if signatures.len() < required {
                    return Err(BridgeError::QuorumNotReached {
                        got: signatures.len(),
                        needed: required,
                    });
                }
                signatures.truncate(required);
            }

            let envelope = tx.envelope_xdr(&signatures).map_err(BridgeError::Other)?;
            match horizon.submit(&envelope).await {
                Ok(hash) => {
                    memo_index.insert(memo_hex);
                    info!(
                        component = "wallet",
                        tx = %hash,
                        amount = intent.amount_stroops,
                        destination = %intent.destination,
                        settles = %intent.settles_tx,
                        "payment submitted"
                    );
                    return Ok(hash);
                }
                Err(SubmitError::BadSequence) => {
                    warn!(
                        component = "wallet",
                        attempt,
                        tx = %intent.settles_tx,
                        "sequence was stale, refreshing and retrying"
                    );
                    continue;
                }
                Err(err) => {
                    return Err(BridgeError::Other(eyre!(
                        "payment submission failed: {err}"
                    )))
                }
            }
        }

        Err(BridgeError::Other(eyre!(
            "payment submission exhausted {} attempts",
            SUBMIT_ATTEMPTS
        )))
    }
}

fn signature_hint(address: &str) -> [u8; 4] {
    let mut hint = [0u8; 4];
    if let Ok(public) = stellar_strkey::ed25519::PublicKey::from_string(address) {
        hint.copy_from_slice(&public.0[28..]);
    }
    hint
}
