use crate::wallet::WalletError;
use crate::wallet::storage::WalletSnapshot;
use std::path::PathBuf;
use tracing::info;

const STATE_FILE: &str = "wallet_state.json";
const METADATA_FILE: &str = "wallet_state.meta.json";

/// Repository for wallet state persistence
#[async_trait::async_trait]
pub trait WalletStateRepository {
    async fn save(&self, snapshot: &WalletSnapshot, height: u64) -> Result<(), WalletError>;
    async fn load(&self) -> Result<Option<(WalletSnapshot, u64)>, WalletError>;
}

/// File-based implementation of WalletStateRepository
pub struct FileWalletStateRepository {
    data_dir: PathBuf,
}

impl FileWalletStateRepository {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn state_filename(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE)
    }

    fn metadata_filename(&self) -> PathBuf {
        self.data_dir.join(METADATA_FILE)
    }
}

#[async_trait::async_trait]
impl WalletStateRepository for FileWalletStateRepository {
    async fn save(&self, snapshot: &WalletSnapshot, height: u64) -> Result<(), WalletError> {
        tokio::fs::create_dir_all(&self.data_dir).await?;

        // Write state first, metadata only describes a complete file
        let filename = self.state_filename();
        let content = serde_json::to_vec(snapshot)?;
        tokio::fs::write(&filename, content).await?;

        let metadata = serde_json::json!({
            "sync_height": height,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "coins": snapshot.coins.len(),
        });
        tokio::fs::write(
            self.metadata_filename(),
            serde_json::to_string_pretty(&metadata)?,
        )
        .await?;

        info!("Saved wallet state to {:?} at height {}", filename, height);
        Ok(())
    }

    async fn load(&self) -> Result<Option<(WalletSnapshot, u64)>, WalletError> {
        let filename = self.state_filename();
        if !tokio::fs::try_exists(&filename).await? {
            return Ok(None);
        }

        let mut height = 0u64;
        if let Ok(meta_content) = tokio::fs::read_to_string(self.metadata_filename()).await {
            if let Ok(metadata) = serde_json::from_str::<serde_json::Value>(&meta_content) {
                if let Some(h) = metadata.get("sync_height").and_then(|h| h.as_u64()) {
                    height = h;
                }
            }
        }

        let content = tokio::fs::read(&filename).await?;
        let snapshot: WalletSnapshot = serde_json::from_slice(&content)?;

        info!("Loaded wallet state from {:?} at height {}", filename, height);
        Ok(Some((snapshot, height)))
    }
}
