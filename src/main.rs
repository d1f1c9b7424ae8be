use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::providers::{ProviderBuilder, WsConnect};
use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, Result, WrapErr};
use libp2p::Multiaddr;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use tft_bridge::bridge::{MasterBridge, MasterMinter, Role};
use tft_bridge::config::Config;
use tft_bridge::evm::contract::{BridgeContract, EvmBridgeContract};
use tft_bridge::evm::watcher::{filter_start, EvmWatcher};
use tft_bridge::p2p::client::SignersClient;
use tft_bridge::p2p::server::{FollowerValidator, SignerServer};
use tft_bridge::p2p::{keypair_from_stellar_seed, peer_id_from_stellar_address, SignerClient};
use tft_bridge::server::{AppState, BridgeStats, Metrics};
use tft_bridge::state::CursorStore;
use tft_bridge::stellar::horizon::{HorizonAccounts, HorizonClient, TransactionFetcher};
use tft_bridge::stellar::memo_index::MemoIndex;
use tft_bridge::stellar::wallet::BridgeWallet;
use tft_bridge::stellar::watcher::StellarWatcher;
use tft_bridge::stellar::{units_to_stroops, StellarNetwork};

fn main() -> Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    init_logging();

    tracing::info!("Starting TFT Stellar-EVM bridge");

    let config = Config::load()?;
    let role = if config.bridge.follower {
        Role::Follower
    } else {
        Role::Master
    };
    tracing::info!(
        role = role.as_str(),
        eth_network = %config.eth.network,
        stellar_network = %config.stellar.network,
        "Configuration loaded"
    );

    let network = StellarNetwork::from_name(&config.stellar.network)?;
    let wallet = Arc::new(BridgeWallet::new(
        &config.stellar.secret,
        network,
        config.stellar.fee_wallet.clone(),
    )?);
    let horizon = Arc::new(HorizonClient::new(network.horizon_url())?);
    let horizon_accounts: Arc<dyn HorizonAccounts> = horizon.clone();
    let fetcher: Arc<dyn TransactionFetcher> = horizon.clone();

    let cursor_store = Arc::new(CursorStore::new(&config.bridge.persistency_file));
    if config.bridge.rescan_bridge_account {
        // setting the cursor to 0 makes the watcher replay every transaction
        // ever made on the bridge account and mint accordingly
        tracing::info!("rescan triggered");
        cursor_store.save_stellar_cursor("0")?;
    }
    if let Some(height) = config.bridge.rescan_height {
        tracing::info!(height, "evm rescan requested, rewinding persisted height");
        cursor_store.rewind_height(height)?;
    }

    let eth_network = config.eth.network_config()?;
    let eth_signer: PrivateKeySigner = config
        .eth
        .private_key
        .parse()
        .wrap_err("Invalid EVM private key")?;
    let eth_wallet = EthereumWallet::from(eth_signer.clone());
    let provider = ProviderBuilder::new()
        .with_recommended_fillers()
        .wallet(eth_wallet)
        .on_ws(WsConnect::new(&config.eth.url))
        .await
        .wrap_err("Failed to connect to the EVM RPC endpoint")?;
    let contract: Arc<dyn BridgeContract> = Arc::new(EvmBridgeContract::new(
        provider.clone(),
        eth_network.multisig_address,
        eth_signer,
    ));
    tracing::info!(
        network_id = eth_network.network_id,
        contract = %eth_network.contract_address,
        multisig = %eth_network.multisig_address,
        "EVM connection established"
    );

    let keypair = keypair_from_stellar_seed(&config.stellar.secret)?;
    tracing::info!(peer_id = %keypair.public().to_peer_id(), "p2p node identity");
    let relay: Multiaddr = config
        .bridge
        .relay
        .parse()
        .wrap_err("Invalid relay multiaddr")?;

    let stats = Arc::new(RwLock::new(BridgeStats {
        role: role.as_str().to_string(),
        ..Default::default()
    }));
    let metrics = Arc::new(Metrics::new());
    let api_state = AppState {
        stats: stats.clone(),
        metrics: metrics.clone(),
    };
    let api_addr = config.api_addr;
    tokio::spawn(async move {
        if let Err(err) = tft_bridge::server::serve(api_addr, api_state).await {
            tracing::error!(err = %err, "API server error");
        }
    });

    let memo_index = Arc::new(Mutex::new(MemoIndex::new(
        config.stellar.bridge_master_address.clone(),
    )));
    let deposit_fee_stroops = units_to_stroops(config.bridge.deposit_fee);

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    match role {
        Role::Follower => {
            // Scan the bridge account so the duplicate guard is primed
            // before the first signing request arrives.
            memo_index
                .lock()
                .await
                .scan_bridge_account(fetcher.as_ref())
                .await
                .wrap_err("Initial bridge account scan failed")?;
            let known_memos = memo_index.lock().await.len();
            tracing::info!(known_memos, "bridge account scanned");
            stats.write().await.known_memos = known_memos;

            let validator = Arc::new(FollowerValidator::new(
                wallet,
                contract,
                fetcher,
                memo_index,
                config.stellar.bridge_master_address.clone(),
                deposit_fee_stroops,
            ));
            let server = SignerServer::new(validator);

            tokio::select! {
                result = server.run(keypair, relay) => {
                    result.wrap_err("signer server stopped")?;
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown signal received");
                }
            }
        }
        Role::Master => {
            if wallet.address() != config.stellar.bridge_master_address {
                return Err(eyre!(
                    "the master's secret does not control the bridge account {}",
                    config.stellar.bridge_master_address
                ));
            }

            // Scan the bridge account for past payouts before paying anything
            memo_index
                .lock()
                .await
                .scan_bridge_account(fetcher.as_ref())
                .await
                .wrap_err("Initial bridge account scan failed")?;

            let account = horizon_accounts.account(wallet.address()).await?;
            let (cosigners, required) = wallet.signing_requirements(&account);
            tracing::info!(
                signatures = required,
                cosigners = cosigners.len(),
                "required Stellar signature count"
            );
            let cosigner_peers = cosigners
                .iter()
                .map(|address| peer_id_from_stellar_address(address))
                .collect::<Result<Vec<_>>>()?;
            let signers: Arc<dyn SignerClient> =
                Arc::new(SignersClient::start(keypair, cosigner_peers, relay)?);

            let (heads_tx, heads_rx) = mpsc::unbounded_channel();
            let (withdraw_tx, withdraw_rx) = mpsc::unbounded_channel();
            let (synced_tx, synced_rx) = watch::channel(false);

            let persisted_height = cursor_store.load_height()?;
            let from_height = filter_start(persisted_height, config.bridge.rescan_height);
            let evm_watcher = EvmWatcher::new(
                provider,
                eth_network.contract_address,
                from_height,
                heads_tx,
                withdraw_tx,
            );

            let minter = Arc::new(MasterMinter::new(
                contract.clone(),
                signers.clone(),
                wallet.clone(),
                horizon_accounts.clone(),
                fetcher.clone(),
                memo_index.clone(),
                deposit_fee_stroops,
                synced_rx,
                metrics.clone(),
            ));
            let stellar_watcher = StellarWatcher::new(
                config.stellar.bridge_master_address.clone(),
                network.asset_issuer().to_string(),
                cursor_store.clone(),
                fetcher.clone(),
                minter,
            );
            let bridge = MasterBridge::new(
                contract,
                signers,
                wallet,
                horizon_accounts,
                fetcher,
                memo_index,
                cursor_store,
                heads_rx,
                withdraw_rx,
                synced_tx,
                stats,
                metrics,
            );

            let mut join_set = tokio::task::JoinSet::new();
            join_set.spawn(evm_watcher.run());
            join_set.spawn(async move { stellar_watcher.run().await });
            join_set.spawn(bridge.run(shutdown_rx));

            let result = match join_set.join_next().await {
                Some(Ok(Ok(()))) => Ok(()),
                Some(Ok(Err(err))) => {
                    tracing::error!(err = %err, "a bridge task stopped with an error");
                    Err(err)
                }
                Some(Err(err)) => {
                    tracing::error!(err = %err, "a bridge task panicked");
                    Err(eyre!("bridge task panicked: {err}"))
                }
                None => Err(eyre!("no bridge tasks were started")),
            };
            join_set.abort_all();
            result?;
        }
    }

    tracing::info!("TFT Stellar-EVM bridge stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tft_bridge=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
