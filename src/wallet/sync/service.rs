//! Async runner for the wallet engine.
//!
//! [`WalletService`] connects a [`Wallet`] to a [`NodeClient`]: outgoing requests are forwarded
//! to a request task, tip updates come from a subscription task, and every notification is fed
//! into the wallet from a single loop. The wallet itself never awaits. State is saved after each
//! completed sync round and on shutdown.

use crate::config::WalletConfig;
use crate::node::{ChannelNodeNetwork, NodeClient, NodeNotification};
use crate::wallet::WalletError;
use crate::wallet::storage::{MY_ID_VAR, VarStore, WalletStore};
use crate::wallet::sync::events::{EventCollector, SharedEvents, WalletEvent};
use crate::wallet::sync::orchestrator::Wallet;
use crate::wallet::sync::state_persistence::StatePersistenceService;
use crate::wallet::types::{NATIVE_ASSET_ID, WalletId};
use crate::utils::format_amount;

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Return the wallet address stored in `store`, creating one on first use.
pub fn load_or_create_wallet_id(store: &mut dyn WalletStore) -> Result<WalletId, WalletError> {
    if let Some(id) = store.get_var_value::<WalletId>(MY_ID_VAR) {
        return Ok(id);
    }
    let id = WalletId::generate();
    store.set_var_value(MY_ID_VAR, &id)?;
    info!("Created wallet address {}", id);
    Ok(id)
}

pub struct WalletService {
    wallet: Wallet,
    client: NodeClient,
    persistence: Option<StatePersistenceService>,
    events: SharedEvents,
    reconnect_delay: Duration,
}

impl WalletService {
    pub fn new(mut wallet: Wallet, client: NodeClient, config: &WalletConfig) -> Self {
        let (collector, events) = EventCollector::shared();
        wallet.register_event_handler(Box::new(collector));

        let persistence = config
            .enable_persistence
            .then(|| StatePersistenceService::new(config.data_dir.clone()));

        Self {
            wallet,
            client,
            persistence,
            events,
            reconnect_delay: config.reconnect_delay(),
        }
    }

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    pub fn wallet_mut(&mut self) -> &mut Wallet {
        &mut self.wallet
    }

    /// Run until `shutdown` resolves or the node tasks stop.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<(), WalletError> {
        let (network, requests) = ChannelNodeNetwork::channel();
        let (notifications, mut incoming) = mpsc::unbounded_channel::<NodeNotification>();
        self.wallet.set_node_network(Box::new(network));

        let request_task = tokio::spawn(
            self.client
                .clone()
                .run_requests(requests, notifications.clone()),
        );
        let tip_task = tokio::spawn(
            self.client
                .clone()
                .run_tip_subscription(notifications, self.reconnect_delay),
        );

        self.wallet.resume_all_transactions();
        self.log_balance();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                notification = incoming.recv() => {
                    let Some(notification) = notification else {
                        warn!("Node tasks stopped");
                        break;
                    };
                    self.wallet.handle_notification(notification);
                    self.handle_events().await;
                }
            }
        }

        request_task.abort();
        tip_task.abort();
        self.wallet.cleanup_network();
        self.save_state(self.wallet.tip_height()).await;
        Ok(())
    }

    async fn handle_events(&mut self) {
        // Drain before awaiting, handlers may push while we save
        let events: Vec<WalletEvent> = self.events.borrow_mut().drain(..).collect();
        for event in events {
            match event {
                WalletEvent::SyncCompleted { height } => {
                    self.save_state(height).await;
                    self.log_balance();
                }
                WalletEvent::TransactionCompleted(tx_id) => {
                    info!("{} Transaction completed", tx_id)
                }
                WalletEvent::TransactionFailed(tx_id) => warn!("{} Transaction failed", tx_id),
                WalletEvent::RolledBack { height } => warn!("Chain rolled back to {}", height),
                WalletEvent::OwnedNode { connected } => {
                    info!("Owned node {}", if connected { "connected" } else { "disconnected" })
                }
                WalletEvent::SyncProgress { .. } => {}
            }
        }
    }

    async fn save_state(&self, height: u64) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Err(e) = persistence.save_state(self.wallet.store(), height).await {
            error!("Failed to save wallet state: {}", e);
        }
    }

    fn log_balance(&mut self) {
        let available = self.wallet.available_balance(NATIVE_ASSET_ID);
        info!("Available balance: {}", format_amount(available));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::storage::MemoryWalletStore;

    #[test]
    fn wallet_id_is_created_once() {
        let mut store = MemoryWalletStore::new();
        let first = load_or_create_wallet_id(&mut store).unwrap();
        let second = load_or_create_wallet_id(&mut store).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn shutdown_saves_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalletConfig {
            node_url: "http://127.0.0.1:9".to_string(),
            node_ws_url: "ws://127.0.0.1:9".to_string(),
            data_dir: dir.path().to_path_buf(),
            reconnect_delay_secs: 60,
            ..WalletConfig::default()
        };
        let wallet = Wallet::from_config(
            Box::new(MemoryWalletStore::new()),
            &config,
            WalletId::default(),
        );
        let client = NodeClient::new(
            config.node_url.clone(),
            config.node_ws_url.clone(),
            config.request_timeout(),
        )
        .unwrap();
        let mut service = WalletService::new(wallet, client, &config);

        service.run(async {}).await.unwrap();

        let restored = StatePersistenceService::new(dir.path().to_path_buf())
            .restore_state()
            .await
            .unwrap();
        assert!(restored.is_some());
    }
}
