//! Token/multisig contract surface.
//!
//! The [`BridgeContract`] trait is the seam the orchestrator and the signer
//! server work against; [`EvmBridgeContract`] is the alloy-backed
//! implementation speaking to the deployed contracts.

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::providers::Provider;
use alloy::pubsub::PubSubFrontend;
use alloy::rpc::types::SyncStatus;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use tracing::{debug, info};

use crate::types::{MintSignature, SignedMint};

sol! {
    /// Wrapped-token bridge interface.
    #[sol(rpc)]
    contract TokenBridge {
        struct Signature {
            uint8 v;
            bytes32 r;
            bytes32 s;
        }

        function isMintTxID(string txid) external view returns (bool);
        function getSigners() external view returns (address[] memory);
        function getRequiredSignatureCount() external view returns (uint256);
        function mint(address receiver, uint256 tokens, string txid, Signature[] signatures) external;

        /// Emitted when tokens are burned for a payout on another chain.
        event Withdraw(uint256 tokens, address receiver, string blockchain_address, string network);
    }
}

/// Prefix of the signed mint digest, as checked by the contract.
pub const ETH_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n32";

/// The digest every signer signs to authorize a mint:
/// `keccak256(prefix || keccak256(receiver || amount || txid))`.
pub fn mint_digest(receiver: Address, amount: u64, tx_id: &str) -> B256 {
    let mut packed = Vec::with_capacity(20 + 32 + tx_id.len());
    packed.extend_from_slice(receiver.as_slice());
    packed.extend_from_slice(&U256::from(amount).to_be_bytes::<32>());
    packed.extend_from_slice(tx_id.as_bytes());
    let inner = keccak256(&packed);

    let mut prefixed = ETH_MESSAGE_PREFIX.as_bytes().to_vec();
    prefixed.extend_from_slice(inner.as_slice());
    keccak256(&prefixed)
}

/// Everything the orchestrator needs from the deployed contracts.
#[async_trait]
pub trait BridgeContract: Send + Sync {
    async fn is_mint_tx_id(&self, tx_id: &str) -> Result<bool>;

    /// On-chain signer list; defines the signature order `mint` expects.
    async fn get_signers(&self) -> Result<Vec<Address>>;

    async fn get_required_signature_count(&self) -> Result<u64>;

    /// Submit a mint and wait for its inclusion.
    async fn mint(
        &self,
        receiver: Address,
        amount: u64,
        tx_id: &str,
        signatures: Vec<MintSignature>,
    ) -> Result<()>;

    /// Whether the node reports no sync in progress.
    async fn is_synced(&self) -> Result<bool>;

    /// Produce this node's own mint signature.
    fn sign_mint(&self, receiver: Address, amount: u64, tx_id: &str) -> Result<SignedMint>;
}

pub struct EvmBridgeContract<P> {
    provider: P,
    multisig_address: Address,
    signer: PrivateKeySigner,
}

impl<P> EvmBridgeContract<P> {
    pub fn new(provider: P, multisig_address: Address, signer: PrivateKeySigner) -> Self {
        Self {
            provider,
            multisig_address,
            signer,
        }
    }
}

#[async_trait]
impl<P> BridgeContract for EvmBridgeContract<P>
where
    P: Provider<PubSubFrontend> + Clone + Send + Sync + 'static,
{
    async fn is_mint_tx_id(&self, tx_id: &str) -> Result<bool> {
        let contract = TokenBridge::new(self.multisig_address, self.provider.clone());
        let known = contract
            .isMintTxID(tx_id.to_string())
            .call()
            .await
            .wrap_err("isMintTxID call failed")?;
        Ok(known._0)
    }

    async fn get_signers(&self) -> Result<Vec<Address>> {
        let contract = TokenBridge::new(self.multisig_address, self.provider.clone());
        let signers = contract
            .getSigners()
            .call()
            .await
            .wrap_err("getSigners call failed")?;
        Ok(signers._0)
    }

    async fn get_required_signature_count(&self) -> Result<u64> {
        let contract = TokenBridge::new(self.multisig_address, self.provider.clone());
        let count = contract
            .getRequiredSignatureCount()
            .call()
            .await
            .wrap_err("getRequiredSignatureCount call failed")?;
        count
            ._0
            .try_into()
            .wrap_err("required signature count does not fit u64")
    }

    async fn mint(
        &self,
        receiver: Address,
        amount: u64,
        tx_id: &str,
        signatures: Vec<MintSignature>,
    ) -> Result<()> {
        let contract = TokenBridge::new(self.multisig_address, self.provider.clone());
        let signatures: Vec<TokenBridge::Signature> = signatures
            .into_iter()
            .map(|s| TokenBridge::Signature {
                v: s.v,
                r: s.r,
                s: s.s,
            })
            .collect();

        debug!(
            component = "contract",
            receiver = %receiver,
            amount,
            tx = tx_id,
            signatures = signatures.len(),
            "submitting mint"
        );
        let pending = contract
            .mint(receiver, U256::from(amount), tx_id.to_string(), signatures)
            .send()
            .await
            .wrap_err("mint submission failed")?;
        let tx_hash = pending.watch().await.wrap_err("mint confirmation failed")?;
        info!(
            component = "contract",
            receiver = %receiver,
            amount,
            tx = tx_id,
            mint_tx = %tx_hash,
            "mint confirmed"
        );
        Ok(())
    }

    async fn is_synced(&self) -> Result<bool> {
        let status = self
            .provider
            .syncing()
            .await
            .wrap_err("eth_syncing call failed")?;
        Ok(matches!(status, SyncStatus::None))
    }

    fn sign_mint(&self, receiver: Address, amount: u64, tx_id: &str) -> Result<SignedMint> {
        let digest = mint_digest(receiver, amount, tx_id);
        let signature = self
            .signer
            .sign_hash_sync(&digest)
            .wrap_err("mint signing failed")?;
        let bytes = signature.as_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        // the contract expects the legacy 27/28 recovery id
        let v = if bytes[64] < 27 { bytes[64] + 27 } else { bytes[64] };
        Ok(SignedMint {
            who: self.signer.address(),
            signature: MintSignature {
                v,
                r: B256::from(r),
                s: B256::from(s),
            },
        })
    }
}
