//! Cosigner overlay: peer identity derivation and the signing
//! request/response fabric.

pub mod client;
pub mod protocol;
pub mod server;

use std::time::Duration;

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use libp2p::{identity, request_response, PeerId, StreamProtocol, Swarm, SwarmBuilder};

use protocol::{SignRequest, SignResponse, SIGNER_PROTOCOL};

/// How long the master waits for the quorum before failing the operation.
pub const GATHER_TIMEOUT: Duration = Duration::from_secs(30);

/// Fan-out interface the orchestrator and wallet depend on.
#[async_trait]
pub trait SignerClient: Send + Sync {
    /// Dispatch `request` to every cosigner and collect answers until
    /// `needed` signers responded or the deadline passed. Rejections and
    /// transport failures are simply absent from the result; the caller
    /// enforces the quorum.
    async fn gather(&self, request: SignRequest, needed: usize) -> Result<Vec<SignResponse>>;
}

/// A cosigner's peer ID is derived deterministically from its Stellar
/// account: the account's ed25519 public key is also its libp2p identity.
pub fn peer_id_from_stellar_address(address: &str) -> Result<PeerId> {
    let public = stellar_strkey::ed25519::PublicKey::from_string(address)
        .map_err(|e| eyre!("invalid stellar address {}: {:?}", address, e))?;
    let key = identity::ed25519::PublicKey::try_from_bytes(&public.0)
        .wrap_err("stellar key is not a valid ed25519 public key")?;
    Ok(PeerId::from_public_key(&identity::PublicKey::from(key)))
}

/// The local p2p identity is the node's Stellar signing key.
pub fn keypair_from_stellar_seed(seed: &str) -> Result<identity::Keypair> {
    let secret = stellar_strkey::ed25519::PrivateKey::from_string(seed)
        .map_err(|e| eyre!("invalid stellar secret: {:?}", e))?;
    identity::Keypair::ed25519_from_bytes(secret.0)
        .wrap_err("stellar seed is not a valid ed25519 secret key")
}

/// Network behaviour shared by the master client and the follower server.
#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct SignerBehaviour {
    pub request_response: request_response::cbor::Behaviour<SignRequest, SignResponse>,
    pub identify: libp2p::identify::Behaviour,
    pub relay: libp2p::relay::client::Behaviour,
}

/// Build the swarm every signer node runs: tcp + noise + yamux, dns
/// resolution, and a relay client for reaching peers through the configured
/// relay address.
pub fn build_swarm(keypair: identity::Keypair) -> Result<Swarm<SignerBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default(),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )
        .wrap_err("failed to build tcp transport")?
        .with_dns()
        .wrap_err("failed to build dns transport")?
        .with_relay_client(libp2p::noise::Config::new, libp2p::yamux::Config::default)
        .wrap_err("failed to build relay client")?
        .with_behaviour(|key, relay| SignerBehaviour {
            request_response: request_response::cbor::Behaviour::new(
                [(
                    StreamProtocol::new(SIGNER_PROTOCOL),
                    request_response::ProtocolSupport::Full,
                )],
                request_response::Config::default().with_request_timeout(GATHER_TIMEOUT),
            ),
            identify: libp2p::identify::Behaviour::new(libp2p::identify::Config::new(
                "/tft/1.0.0".into(),
                key.public(),
            )),
            relay,
        })
        .map_err(|e| eyre!("failed to build behaviour: {e}"))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(120)))
        .build();
    Ok(swarm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    #[test]
    fn test_peer_id_matches_stellar_identity() {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let address =
            stellar_strkey::ed25519::PublicKey(signing_key.verifying_key().to_bytes()).to_string();
        let seed = stellar_strkey::ed25519::PrivateKey(signing_key.to_bytes()).to_string();

        // The peer id derived from the public address equals the id of the
        // keypair derived from the seed: followers are reachable without any
        // discovery beyond their Stellar account.
        let from_address = peer_id_from_stellar_address(&address).unwrap();
        let from_seed = keypair_from_stellar_seed(&seed)
            .unwrap()
            .public()
            .to_peer_id();
        assert_eq!(from_address, from_seed);
    }

    #[test]
    fn test_peer_id_derivation_is_deterministic() {
        let signing_key = SigningKey::from_bytes(&[9u8; 32]);
        let address =
            stellar_strkey::ed25519::PublicKey(signing_key.verifying_key().to_bytes()).to_string();
        assert_eq!(
            peer_id_from_stellar_address(&address).unwrap(),
            peer_id_from_stellar_address(&address).unwrap()
        );
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        assert!(peer_id_from_stellar_address("not-an-address").is_err());
    }
}
