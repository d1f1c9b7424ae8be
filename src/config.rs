use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};

use crate::stellar::StellarNetwork;

/// Main configuration for the bridge daemon.
#[derive(Debug, Clone)]
pub struct Config {
    pub eth: EthConfig,
    pub stellar: StellarConfig,
    pub bridge: BridgeOptions,
    /// Bind address of the health/status/metrics server.
    pub api_addr: SocketAddr,
}

/// EVM-side configuration.
#[derive(Clone)]
pub struct EthConfig {
    /// Preset network name; selects chain id and contract addresses.
    pub network: String,
    pub url: String,
    pub private_key: String,
    /// Token contract override.
    pub contract_address: Option<String>,
    /// Multisig contract override.
    pub multisig_address: Option<String>,
}

/// Custom Debug that redacts the private key to prevent accidental log leakage.
impl fmt::Debug for EthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EthConfig")
            .field("network", &self.network)
            .field("url", &self.url)
            .field("private_key", &"<redacted>")
            .field("contract_address", &self.contract_address)
            .field("multisig_address", &self.multisig_address)
            .finish()
    }
}

/// Stellar-side configuration.
#[derive(Clone)]
pub struct StellarConfig {
    /// `testnet` or `production`.
    pub network: String,
    pub secret: String,
    pub fee_wallet: Option<String>,
    /// The bridge's Stellar account; the master's own address.
    pub bridge_master_address: String,
}

/// Custom Debug that redacts the signing seed.
impl fmt::Debug for StellarConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StellarConfig")
            .field("network", &self.network)
            .field("secret", &"<redacted>")
            .field("fee_wallet", &self.fee_wallet)
            .field("bridge_master_address", &self.bridge_master_address)
            .finish()
    }
}

/// Bridge behaviour options.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub follower: bool,
    /// Relay multiaddr through which cosigner peers are reached.
    pub relay: String,
    /// Reset the stellar cursor and replay the whole account history.
    pub rescan_bridge_account: bool,
    /// Rewind the EVM scan to this height.
    pub rescan_height: Option<u64>,
    /// Deposit fee in whole TFT units.
    pub deposit_fee: i64,
    /// Path of the persisted cursor file.
    pub persistency_file: String,
}

/// An EVM network preset: chain id and deployed contract addresses.
#[derive(Debug, Clone, Copy)]
pub struct EthNetworkConfig {
    pub network_id: u64,
    pub contract_address: Address,
    pub multisig_address: Address,
}

fn eth_network_configuration(name: &str) -> Result<EthNetworkConfig> {
    match name {
        "smart-chain-mainnet" => Ok(EthNetworkConfig {
            network_id: 56,
            contract_address: address("0x8f0FB159380176D324542b3a7933F0C2Fd0c2bbf")?,
            multisig_address: address("0xa4E8d413004d46f367D4F09D6BD4EcBccfE51D33")?,
        }),
        "smart-chain-testnet" => Ok(EthNetworkConfig {
            network_id: 97,
            contract_address: address("0x4DFe8A53cD9dbA17038cAaDB4cd6743160dAf049")?,
            multisig_address: address("0x0586d6afA50fA3b47FB51a34b906Ec8Fab5ACE0D")?,
        }),
        other => Err(eyre!("eth network {} is not supported", other)),
    }
}

fn address(raw: &str) -> Result<Address> {
    Address::from_str(raw).wrap_err_with(|| format!("invalid address {raw}"))
}

fn default_deposit_fee() -> i64 {
    50
}

fn default_persistency_file() -> String {
    "./node.json".to_string()
}

fn default_api_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

impl EthConfig {
    /// Resolve the preset, applying any contract address overrides.
    pub fn network_config(&self) -> Result<EthNetworkConfig> {
        let mut preset = eth_network_configuration(&self.network)?;
        if let Some(contract) = &self.contract_address {
            preset.contract_address = address(contract)?;
        }
        if let Some(multisig) = &self.multisig_address {
            preset.multisig_address = address(multisig)?;
        }
        Ok(preset)
    }
}

impl Config {
    /// Load configuration from the environment, reading `.env` if present.
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let eth = EthConfig {
            network: env::var("ETH_NETWORK").unwrap_or_else(|_| "smart-chain-testnet".to_string()),
            url: env::var("ETH_URL").unwrap_or_else(|_| "ws://localhost:8576".to_string()),
            private_key: env::var("ETH_PRIVATE_KEY")
                .map_err(|_| eyre!("ETH_PRIVATE_KEY environment variable is required"))?,
            contract_address: env::var("CONTRACT_ADDRESS").ok(),
            multisig_address: env::var("MS_CONTRACT_ADDRESS").ok(),
        };

        let stellar = StellarConfig {
            network: env::var("STELLAR_NETWORK").unwrap_or_else(|_| "testnet".to_string()),
            secret: env::var("STELLAR_SECRET")
                .map_err(|_| eyre!("STELLAR_SECRET environment variable is required"))?,
            fee_wallet: env::var("STELLAR_FEE_WALLET").ok(),
            bridge_master_address: env::var("BRIDGE_MASTER_ADDRESS")
                .map_err(|_| eyre!("BRIDGE_MASTER_ADDRESS environment variable is required"))?,
        };

        let bridge = BridgeOptions {
            follower: env::var("FOLLOWER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            relay: env::var("RELAY")
                .map_err(|_| eyre!("RELAY environment variable is required"))?,
            rescan_bridge_account: env::var("RESCAN_BRIDGE_ACCOUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            rescan_height: env::var("RESCAN_HEIGHT").ok().and_then(|v| v.parse().ok()),
            deposit_fee: env::var("DEPOSIT_FEE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_deposit_fee),
            persistency_file: env::var("PERSISTENCY_FILE")
                .unwrap_or_else(|_| default_persistency_file()),
        };

        let api_addr = env::var("API_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_api_addr);

        let config = Config {
            eth,
            stellar,
            bridge,
            api_addr,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration; any failure here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.eth.url.is_empty() {
            return Err(eyre!("eth.url cannot be empty"));
        }
        if !self.eth.url.starts_with("ws://") && !self.eth.url.starts_with("wss://") {
            return Err(eyre!(
                "eth.url must be a websocket endpoint (ws:// or wss://)"
            ));
        }
        if self.eth.private_key.len() != 66 || !self.eth.private_key.starts_with("0x") {
            return Err(eyre!("eth.private_key must be 66 chars (0x + 64 hex chars)"));
        }
        self.eth.network_config()?;

        StellarNetwork::from_name(&self.stellar.network)?;
        stellar_strkey::ed25519::PrivateKey::from_string(&self.stellar.secret)
            .map_err(|e| eyre!("stellar.secret is not a valid seed: {:?}", e))?;
        stellar_strkey::ed25519::PublicKey::from_string(&self.stellar.bridge_master_address)
            .map_err(|e| eyre!("stellar.bridge_master_address is not a valid address: {:?}", e))?;
        if let Some(fee_wallet) = &self.stellar.fee_wallet {
            stellar_strkey::ed25519::PublicKey::from_string(fee_wallet)
                .map_err(|e| eyre!("stellar.fee_wallet is not a valid address: {:?}", e))?;
        }

        if self.bridge.relay.is_empty() {
            return Err(eyre!("bridge.relay cannot be empty"));
        }
        if self.bridge.deposit_fee <= 0 {
            return Err(eyre!("bridge.deposit_fee must be positive"));
        }
        if self.bridge.persistency_file.is_empty() {
            return Err(eyre!("bridge.persistency_file cannot be empty"));
        }

        Ok(())
    }
}
