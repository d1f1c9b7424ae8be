//! Follower-side signer: answers the master's signing requests after
//! independently validating them against Horizon and the contract.

use std::sync::Arc;

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};
use futures::StreamExt;
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, ResponseChannel};
use libp2p::swarm::SwarmEvent;
use libp2p::{identity, Multiaddr};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use super::protocol::{
    MintSignRequest, MintSignResponse, PaymentSignRequest, SignRequest, SignResponse,
    StellarSignResponse,
};
use super::{build_swarm, SignerBehaviourEvent};
use crate::evm::contract::BridgeContract;
use crate::stellar::horizon::TransactionFetcher;
use crate::stellar::memo_index::MemoIndex;
use crate::stellar::tx::{Memo, PaymentOperation, PaymentTransaction};
use crate::stellar::wallet::BridgeWallet;
use crate::stellar::watcher::classify_transaction;
use crate::stellar::ASSET_CODE;

/// Validates signing requests the way the master would have: by looking at
/// the chains, never by trusting the request.
pub struct FollowerValidator {
    wallet: Arc<BridgeWallet>,
    contract: Arc<dyn BridgeContract>,
    fetcher: Arc<dyn TransactionFetcher>,
    memo_index: Arc<Mutex<MemoIndex>>,
    bridge_master: String,
    deposit_fee_stroops: i64,
}

impl FollowerValidator {
    pub fn new(
        wallet: Arc<BridgeWallet>,
        contract: Arc<dyn BridgeContract>,
        fetcher: Arc<dyn TransactionFetcher>,
        memo_index: Arc<Mutex<MemoIndex>>,
        bridge_master: String,
        deposit_fee_stroops: i64,
    ) -> Self {
        Self {
            wallet,
            contract,
            fetcher,
            memo_index,
            bridge_master,
            deposit_fee_stroops,
        }
    }

    /// Answer a request; any validation failure becomes a rejection so the
    /// master can log the reason.
    pub async fn handle(&self, request: SignRequest) -> SignResponse {
        let result = match &request {
            SignRequest::Mint(req) => self.validate_mint(req).await,
            SignRequest::Payment(req) => self.validate_payment(req, false).await,
            SignRequest::Refund(req) => self.validate_payment(req, true).await,
        };
        match result {
            Ok(response) => response,
            Err(err) => {
                warn!(component = "signer_server", err = %err, "rejecting signing request");
                SignResponse::Rejected {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// A mint is signed only for a deposit this node can see on the bridge
    /// account, with the memo naming the requested receiver, the amount
    /// matching after the fee, and no prior mint recorded on-chain.
    async fn validate_mint(&self, req: &MintSignRequest) -> Result<SignResponse> {
        let receiver = Address::from(req.receiver);

        if self.contract.is_mint_tx_id(&req.tx_id).await? {
            return Err(eyre!("transaction {} is already minted", req.tx_id));
        }

        let record = self
            .fetcher
            .fetch_transaction(&req.tx_id)
            .await?
            .ok_or_else(|| eyre!("deposit transaction {} not found", req.tx_id))?;
        let payments = self.fetcher.fetch_payments(&req.tx_id).await?;
        let deposit = classify_transaction(
            &record,
            &payments,
            &self.bridge_master,
            self.wallet.network().asset_issuer(),
        )
        .ok_or_else(|| eyre!("transaction {} is not a bridge deposit", req.tx_id))?;

        if deposit.receiver != Some(receiver) {
            return Err(eyre!(
                "memo of {} does not decode to the requested receiver",
                req.tx_id
            ));
        }
        if deposit.amount_stroops - self.deposit_fee_stroops != req.amount {
            return Err(eyre!(
                "amount mismatch for {}: deposited {} minus fee, requested {}",
                req.tx_id,
                deposit.amount_stroops,
                req.amount
            ));
        }

        let signed = self
            .contract
            .sign_mint(receiver, req.amount as u64, &req.tx_id)?;
        Ok(SignResponse::Mint(MintSignResponse {
            who: signed.who.into_array(),
            v: signed.signature.v,
            r: signed.signature.r.0,
            s: signed.signature.s.0,
        }))
    }

    /// Payments and refunds are rebuilt from the request fields and signed
    /// only when the memo matches the settled transaction, the destination
    /// is sane, and this node's own view of the account shows no prior
    /// payment with that memo.
    async fn validate_payment(
        &self,
        req: &PaymentSignRequest,
        refund: bool,
    ) -> Result<SignResponse> {
        let settles =
            hex::decode(&req.settles_tx).wrap_err("settled transaction hash is not hex")?;
        if settles.as_slice() != req.memo {
            return Err(eyre!("memo does not match the settled transaction hash"));
        }
        if req.amount_stroops <= 0 {
            return Err(eyre!("payment amount must be positive"));
        }

        if refund {
            let record = self
                .fetcher
                .fetch_transaction(&req.settles_tx)
                .await?
                .ok_or_else(|| eyre!("refunded deposit {} not found", req.settles_tx))?;
            if record.source_account != req.destination {
                return Err(eyre!("refund does not return to the deposit source"));
            }
        } else if req.destination == self.bridge_master
            || Some(req.destination.as_str()) == self.wallet.fee_wallet()
        {
            return Err(eyre!("payout destination is the bridge or the fee wallet"));
        }

        self.memo_index
            .lock()
            .await
            .check_and_reserve(self.fetcher.as_ref(), &hex::encode(req.memo))
            .await
            .map_err(|err| eyre!("{err}"))?;

        let mut operations = vec![PaymentOperation {
            destination: req.destination.clone(),
            amount_stroops: req.amount_stroops,
        }];
        if let Some(fee) = &req.fee_payment {
            operations.push(PaymentOperation {
                destination: fee.destination.clone(),
                amount_stroops: fee.amount_stroops,
            });
        }
        let tx = PaymentTransaction {
            source: self.bridge_master.clone(),
            sequence: req.sequence,
            memo: if refund {
                Memo::Return(req.memo)
            } else {
                Memo::Hash(req.memo)
            },
            operations,
            asset_code: ASSET_CODE.to_string(),
            asset_issuer: self.wallet.network().asset_issuer().to_string(),
        };

        let signature = self.wallet.sign_transaction(&tx)?;
        Ok(SignResponse::Stellar(StellarSignResponse {
            who: self.wallet.address().to_string(),
            signature,
        }))
    }
}

/// The follower's network loop: listens behind the relay and serves signing
/// requests, validation running off the swarm task.
pub struct SignerServer {
    validator: Arc<FollowerValidator>,
}

impl SignerServer {
    pub fn new(validator: Arc<FollowerValidator>) -> Self {
        Self { validator }
    }

    pub async fn run(self, keypair: identity::Keypair, relay: Multiaddr) -> Result<()> {
        let mut swarm = build_swarm(keypair)?;
        swarm
            .listen_on("/ip4/0.0.0.0/tcp/0".parse()?)
            .wrap_err("failed to listen")?;
        swarm.dial(relay.clone()).wrap_err("failed to dial relay")?;
        swarm
            .listen_on(relay.with(Protocol::P2pCircuit))
            .wrap_err("failed to request a relay reservation")?;

        let (response_tx, mut response_rx) =
            mpsc::channel::<(ResponseChannel<SignResponse>, SignResponse)>(16);

        loop {
            tokio::select! {
                Some((channel, response)) = response_rx.recv() => {
                    if swarm
                        .behaviour_mut()
                        .request_response
                        .send_response(channel, response)
                        .is_err()
                    {
                        warn!(
                            component = "signer_server",
                            "requester went away before the response was sent"
                        );
                    }
                }
                event = swarm.select_next_some() => match event {
                    SwarmEvent::Behaviour(SignerBehaviourEvent::RequestResponse(
                        request_response::Event::Message {
                            peer,
                            message: request_response::Message::Request { request, channel, .. },
                            ..
                        },
                    )) => {
                        info!(component = "signer_server", %peer, "received signing request");
                        let validator = self.validator.clone();
                        let response_tx = response_tx.clone();
                        tokio::spawn(async move {
                            let response = validator.handle(request).await;
                            let _ = response_tx.send((channel, response)).await;
                        });
                    }
                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!(component = "signer_server", %address, "listening");
                    }
                    _ => {}
                },
            }
        }
    }
}
