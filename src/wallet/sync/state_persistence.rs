//! State persistence service for the wallet engine.
//!
//! This module provides the `StatePersistenceService`, which saves and restores the wallet store
//! between runs. It uses the repository trait to abstract the details of file-based persistence, so
//! an interrupted sync resumes from the last completed round.

use crate::wallet::WalletError;
use crate::wallet::storage::{MemoryWalletStore, WalletSnapshot, WalletStore};
use crate::wallet::sync::repositories::{FileWalletStateRepository, WalletStateRepository};

use std::path::PathBuf;
use tracing::info;

/// Service for managing state persistence operations.
pub struct StatePersistenceService {
    repo: Box<dyn WalletStateRepository + Send + Sync>,
}

impl StatePersistenceService {
    /// Create a new state persistence service for the given data directory.
    pub fn new(data_dir: PathBuf) -> Self {
        Self::with_repository(Box::new(FileWalletStateRepository::new(data_dir)))
    }

    pub fn with_repository(repo: Box<dyn WalletStateRepository + Send + Sync>) -> Self {
        Self { repo }
    }

    /// Save the contents of `store`, tagged with the last synchronized height.
    pub async fn save_state(
        &self,
        store: &dyn WalletStore,
        height: u64,
    ) -> Result<(), WalletError> {
        let snapshot: WalletSnapshot = store.snapshot();
        self.repo.save(&snapshot, height).await
    }

    /// Restore a store saved earlier, returning it with its height.
    pub async fn restore_state(&self) -> Result<Option<(MemoryWalletStore, u64)>, WalletError> {
        let Some((snapshot, height)) = self.repo.load().await? else {
            return Ok(None);
        };
        info!("Restored wallet state from height {}", height);
        Ok(Some((MemoryWalletStore::from_snapshot(snapshot), height)))
    }
}
