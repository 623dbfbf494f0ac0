use std::path::PathBuf;

use tracing::{error, info, warn};
use wallet_sync_engine::node::NodeClient;
use wallet_sync_engine::wallet::sync::{
    StatePersistenceService, WalletService, load_or_create_wallet_id,
};
use wallet_sync_engine::wallet::{MemoryWalletStore, Wallet, WalletStore};
use wallet_sync_engine::{WalletConfig, WalletError};

const CONFIG_ENV: &str = "WALLET_CONFIG";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::time())
        .init();

    if let Err(e) = run().await {
        error!("Wallet stopped: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), WalletError> {
    let config = match std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
    {
        Some(path) => WalletConfig::load(PathBuf::from(path))?,
        None => {
            warn!("No configuration given, using defaults");
            WalletConfig::default()
        }
    };
    config.validate()?;

    info!("Starting wallet sync engine against {}", config.node_url);

    let mut store: Box<dyn WalletStore> = Box::new(MemoryWalletStore::new());
    if config.enable_persistence {
        let persistence = StatePersistenceService::new(config.data_dir.clone());
        if let Some((restored, height)) = persistence.restore_state().await? {
            info!("Resuming from height {}", height);
            store = Box::new(restored);
        }
    }

    let my_id = load_or_create_wallet_id(store.as_mut())?;
    info!("Wallet address {}", my_id);

    let client = NodeClient::new(
        config.node_url.clone(),
        config.node_ws_url.clone(),
        config.request_timeout(),
    )?;
    let wallet = Wallet::from_config(store, &config, my_id);
    let mut service = WalletService::new(wallet, client, &config);

    service
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    let stats = service.wallet().sync_stats();
    info!("{}", stats.summary());
    Ok(())
}
