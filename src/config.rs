//! Wallet configuration.
//!
//! Loaded from a JSON file; every field has a default so a partial file (or none at all) is valid.

use crate::wallet::WalletError;
use crate::wallet::types::Height;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// HTTP endpoint of the node.
    pub node_url: String,
    /// WebSocket endpoint for tip updates.
    pub node_ws_url: String,
    /// Directory for the persisted wallet snapshot.
    pub data_dir: PathBuf,
    pub enable_persistence: bool,
    /// Largest page the node returns for one Events request.
    pub events_page_max: usize,
    /// Maximum age of the tip timestamp for the wallet to consider itself synced.
    pub tip_time_tolerance_secs: i64,
    /// Confirmations a receiver waits for past the kernel proof height.
    pub coin_confirmations_offset: Height,
    /// Number of block headers kept below the tip.
    pub history_depth: Height,
    pub request_timeout_secs: u64,
    /// Kernel validity window used when a transaction has no explicit max height.
    pub max_kernel_validity: Height,
    /// Maturity applied to coins confirmed by our own transactions.
    pub maturity_std: Height,
    pub reconnect_delay_secs: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            node_url: "http://127.0.0.1:10000".to_string(),
            node_ws_url: "ws://127.0.0.1:10001".to_string(),
            data_dir: PathBuf::from("wallet_data"),
            enable_persistence: true,
            events_page_max: 64,
            tip_time_tolerance_secs: 600,
            coin_confirmations_offset: 0,
            history_depth: 1440,
            request_timeout_secs: 30,
            max_kernel_validity: 1440,
            maturity_std: 0,
            reconnect_delay_secs: 5,
        }
    }
}

impl WalletConfig {
    /// Read configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WalletError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WalletError> {
        if self.events_page_max == 0 {
            return Err(WalletError::Config(
                "events_page_max must be positive".to_string(),
            ));
        }
        if self.tip_time_tolerance_secs < 0 {
            return Err(WalletError::Config(
                "tip_time_tolerance_secs must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"events_page_max": 16, "data_dir": "/tmp/w"}}"#).unwrap();

        let config = WalletConfig::load(file.path()).unwrap();
        assert_eq!(config.events_page_max, 16);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/w"));
        assert_eq!(config.tip_time_tolerance_secs, 600);
        assert_eq!(config.history_depth, 1440);
        assert!(config.enable_persistence);
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"events_page_max": 0}}"#).unwrap();
        assert!(matches!(
            WalletConfig::load(file.path()),
            Err(WalletError::Config(_))
        ));
    }

    #[test]
    fn missing_file_is_config_error() {
        assert!(matches!(
            WalletConfig::load("/nonexistent/wallet.json"),
            Err(WalletError::Config(_))
        ));
    }
}
