use crate::node::NodeError;

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block height on the chain.
pub type Height = u64;

/// Asset identifier. Zero is the native coin.
pub type AssetId = u32;

/// Sub-transaction index used by multi-leg protocols.
pub type SubTxId = u32;

/// Index of an output inside the shielded pool.
pub type TxoId = u64;

/// Sub-transaction used when a transaction has a single leg.
pub const DEFAULT_SUB_TX_ID: SubTxId = 0;

/// Asset id of the native coin.
pub const NATIVE_ASSET_ID: AssetId = 0;

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub [u8; $len]);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(value: [u8; $len]) -> Self {
                Self(value)
            }
        }
    };
}

hash_newtype!(
    /// Globally unique transaction identifier, fixed at creation.
    TxId,
    16
);
hash_newtype!(
    /// Address of a wallet on the peer messaging network.
    WalletId,
    32
);
hash_newtype!(KernelId, 32);
hash_newtype!(Commitment, 32);
hash_newtype!(
    /// Public identity of an asset owner.
    PeerId,
    32
);
hash_newtype!(BlockHash, 32);

impl TxId {
    /// Generate a fresh random transaction id.
    pub fn generate() -> Self {
        let mut id = [0u8; 16];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl WalletId {
    /// Generate a fresh random wallet address.
    pub fn generate() -> Self {
        let mut id = [0u8; 32];
        rand::rng().fill(&mut id);
        Self(id)
    }
}

/// Kind of key derivation used for a coin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyType {
    Regular,
    Change,
    Coinbase,
    Treasury,
}

/// Identity of a regular output: derivation index, key type and value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoinId {
    pub idx: u64,
    pub key_type: KeyType,
    pub value: u64,
    pub asset_id: AssetId,
}

impl CoinId {
    pub fn new(idx: u64, key_type: KeyType, value: u64) -> Self {
        Self {
            idx,
            key_type,
            value,
            asset_id: NATIVE_ASSET_ID,
        }
    }

    pub fn with_asset(mut self, asset_id: AssetId) -> Self {
        self.asset_id = asset_id;
        self
    }
}

impl fmt::Display for CoinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:?}:{}:{}",
            self.idx, self.key_type, self.value, self.asset_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoinStatus {
    /// Not (or no longer) seen on chain.
    Unconfirmed,
    /// Confirmed, mature and free.
    Unspent,
    /// Confirmed but below its maturity height.
    Locked,
    /// Reserved as an input of an ongoing transaction.
    Outgoing,
    /// Created by an ongoing transaction and not yet confirmed.
    Incoming,
    Spent,
}

/// One spendable output tracked by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub id: CoinId,
    pub status: CoinStatus,
    pub confirm_height: Option<Height>,
    pub spent_height: Option<Height>,
    pub maturity: Height,
    /// Transaction that created this coin. May refer to a transaction no longer stored.
    pub create_tx_id: Option<TxId>,
    /// Transaction that spends this coin. May refer to a transaction no longer stored.
    pub spent_tx_id: Option<TxId>,
}

impl Coin {
    pub fn new(id: CoinId) -> Self {
        Self {
            id,
            status: CoinStatus::Unconfirmed,
            confirm_height: None,
            spent_height: None,
            maturity: 0,
            create_tx_id: None,
            spent_tx_id: None,
        }
    }

    pub fn value(&self) -> u64 {
        self.id.value
    }

    pub fn asset_id(&self) -> AssetId {
        self.id.asset_id
    }

    pub fn is_asset(&self) -> bool {
        self.id.asset_id != NATIVE_ASSET_ID
    }

    /// Whether the coin references the given transaction in either direction.
    pub fn is_linked_to(&self, tx_id: &TxId) -> bool {
        self.create_tx_id.as_ref() == Some(tx_id) || self.spent_tx_id.as_ref() == Some(tx_id)
    }
}

/// Identity of a shielded output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShieldedCoinId {
    /// Key derivation index.
    pub key: u64,
    pub value: u64,
    pub asset_id: AssetId,
}

/// Whether a shielded output belongs to us or was only observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShieldedVisibility {
    Mine,
    Observed,
}

/// A coin of the shielded output pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShieldedCoin {
    pub id: ShieldedCoinId,
    pub txo_id: TxoId,
    pub status: CoinStatus,
    pub visibility: ShieldedVisibility,
    pub confirm_height: Option<Height>,
    pub spent_height: Option<Height>,
    pub create_tx_id: Option<TxId>,
    pub spent_tx_id: Option<TxId>,
}

impl ShieldedCoin {
    pub fn new(id: ShieldedCoinId, txo_id: TxoId) -> Self {
        Self {
            id,
            txo_id,
            status: CoinStatus::Unconfirmed,
            visibility: ShieldedVisibility::Observed,
            confirm_height: None,
            spent_height: None,
            create_tx_id: None,
            spent_tx_id: None,
        }
    }
}

/// Asset metadata as confirmed by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AssetInfo {
    pub id: AssetId,
    pub owner: PeerId,
    pub value: u128,
    /// Height of the last issue/consume operation.
    pub lock_height: Height,
    pub metadata: String,
}

impl AssetInfo {
    pub fn is_valid(&self) -> bool {
        self.id != NATIVE_ASSET_ID
    }
}

/// Asset known to the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAsset {
    pub info: AssetInfo,
    /// Tip height at which the metadata was last refreshed.
    pub refresh_height: Height,
    pub is_owned: bool,
}

impl WalletAsset {
    /// Number of blocks after an issue/consume during which a reorg could change the asset.
    pub const LOCK_PERIOD: Height = 1440;
    /// Metadata older than this is refreshed before use.
    pub const MAX_AGE: Height = 1440;

    pub fn new(info: AssetInfo, refresh_height: Height) -> Self {
        Self {
            info,
            refresh_height,
            is_owned: false,
        }
    }

    pub fn can_rollback(&self, tip: Height) -> bool {
        self.info.lock_height + Self::LOCK_PERIOD > tip
    }

    pub fn is_expired(&self, tip: Height) -> bool {
        self.refresh_height + Self::MAX_AGE < tip
    }
}

/// Block header summary as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub height: Height,
    pub hash: BlockHash,
    /// Unix timestamp (seconds) of the block.
    pub timestamp: i64,
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, &self.hash.to_string()[..8])
    }
}

/// Error types for the wallet engine
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported transaction type: {0:?}")]
    UnknownTransactionType(crate::transaction::TxType),

    #[error("Invalid transaction parameters: {0}")]
    InvalidParameters(String),

    #[error("Transaction {0} is still active")]
    TransactionActive(TxId),
}
