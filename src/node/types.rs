//! Logical request/response pairs exchanged with the remote node.
//!
//! Requests and responses are closed enums so that every request kind has exactly one response
//! shape. Payloads travel as JSON between the node client and the node; their byte encoding is
//! owned by the node.

use crate::wallet::types::{
    AssetId, AssetInfo, ChainState, CoinId, Commitment, Height, KernelId, PeerId, ShieldedCoinId,
    TxoId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned to every request accepted by the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of a node request. Each kind has its own dedup key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Utxo,
    Kernel,
    KernelDetails,
    Asset,
    Events,
    ShieldedList,
    ShieldedOutputProof,
    Registration,
    StateSummary,
}

impl RequestKind {
    /// Whether outstanding requests of this kind keep the wallet out of sync.
    pub fn is_sync_critical(&self) -> bool {
        matches!(
            self,
            RequestKind::Utxo
                | RequestKind::Kernel
                | RequestKind::Events
                | RequestKind::StateSummary
        )
    }
}

/// Asset lookup target: either the asset id or its owner identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AssetRef {
    Id(AssetId),
    Owner(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeRequest {
    UtxoProof {
        commitment: Commitment,
    },
    KernelProof {
        kernel_id: KernelId,
    },
    KernelDetails {
        kernel_id: KernelId,
        fetch_body: bool,
    },
    AssetProof {
        target: AssetRef,
    },
    Events {
        start_height: Height,
    },
    ShieldedList {
        start: TxoId,
        count: u32,
    },
    ShieldedOutputProof {
        public_key: Vec<u8>,
    },
    Registration {
        transaction: Vec<u8>,
    },
    StateSummary,
}

impl NodeRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            NodeRequest::UtxoProof { .. } => RequestKind::Utxo,
            NodeRequest::KernelProof { .. } => RequestKind::Kernel,
            NodeRequest::KernelDetails { .. } => RequestKind::KernelDetails,
            NodeRequest::AssetProof { .. } => RequestKind::Asset,
            NodeRequest::Events { .. } => RequestKind::Events,
            NodeRequest::ShieldedList { .. } => RequestKind::ShieldedList,
            NodeRequest::ShieldedOutputProof { .. } => RequestKind::ShieldedOutputProof,
            NodeRequest::Registration { .. } => RequestKind::Registration,
            NodeRequest::StateSummary => RequestKind::StateSummary,
        }
    }
}

/// Inclusion proof of a regular output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoProof {
    pub maturity: Height,
    #[serde(default)]
    pub proof: Vec<u8>,
}

/// Proof that a kernel is included in the block identified by `state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelProof {
    pub state: ChainState,
    #[serde(default)]
    pub merkle_proof: Vec<u8>,
}

impl KernelProof {
    pub fn height(&self) -> Height {
        self.state.height
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDetails {
    pub height: Height,
    #[serde(default)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetProof {
    pub info: AssetInfo,
    #[serde(default)]
    pub proof: Vec<u8>,
}

/// Entry of the shielded output pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShieldedEntry {
    pub txo_id: TxoId,
    pub commitment: Commitment,
}

/// Node verdict on a registered transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Ok,
    InvalidContext,
    InvalidInput,
    LowFee,
    Unspecified,
}

/// Aggregate chain counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub shielded_outputs: u64,
    pub shielded_inputs: u64,
    pub assets_max: u32,
    pub assets_active: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeResponse {
    UtxoProof {
        proofs: Vec<UtxoProof>,
    },
    KernelProof {
        proof: Option<KernelProof>,
    },
    KernelDetails {
        kernel: Option<KernelDetails>,
    },
    AssetProof {
        asset: Option<AssetProof>,
    },
    Events {
        events: Vec<ChainEvent>,
    },
    ShieldedList {
        items: Vec<ShieldedEntry>,
    },
    ShieldedOutputProof {
        proof: Vec<u8>,
    },
    Registration {
        status: RegistrationStatus,
        #[serde(default)]
        extra_info: String,
    },
    StateSummary(StateSummary),
}

impl NodeResponse {
    pub fn kind(&self) -> RequestKind {
        match self {
            NodeResponse::UtxoProof { .. } => RequestKind::Utxo,
            NodeResponse::KernelProof { .. } => RequestKind::Kernel,
            NodeResponse::KernelDetails { .. } => RequestKind::KernelDetails,
            NodeResponse::AssetProof { .. } => RequestKind::Asset,
            NodeResponse::Events { .. } => RequestKind::Events,
            NodeResponse::ShieldedList { .. } => RequestKind::ShieldedList,
            NodeResponse::ShieldedOutputProof { .. } => RequestKind::ShieldedOutputProof,
            NodeResponse::Registration { .. } => RequestKind::Registration,
            NodeResponse::StateSummary(_) => RequestKind::StateSummary,
        }
    }
}

/// A regular output was created (`added`) or spent at the event height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEvent {
    pub coin: CoinId,
    pub maturity: Height,
    pub added: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShieldedEvent {
    pub coin: ShieldedCoinId,
    pub txo_id: TxoId,
    pub added: bool,
    /// Output was sent by this wallet rather than to it.
    #[serde(default)]
    pub outgoing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEvent {
    pub info: AssetInfo,
    /// False when the asset was unregistered.
    pub added: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Utxo(UtxoEvent),
    Shielded(ShieldedEvent),
    Asset(AssetEvent),
}

/// A height-stamped chain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub height: Height,
    pub body: Event,
}

impl ChainEvent {
    pub fn utxo(height: Height, coin: CoinId, maturity: Height, added: bool) -> Self {
        Self {
            height,
            body: Event::Utxo(UtxoEvent {
                coin,
                maturity,
                added,
            }),
        }
    }
}

/// Notifications delivered by the node connection to the wallet loop.
#[derive(Debug)]
pub enum NodeNotification {
    NewTip(ChainState),
    TipUnchanged,
    RolledBack(Height),
    OwnedNode(bool),
    Response {
        id: RequestId,
        result: Result<NodeResponse, NodeError>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request rejected by node: {0}")]
    Rejected(String),

    #[error("Unexpected response: expected {expected:?}, got {actual:?}")]
    UnexpectedResponse {
        expected: RequestKind,
        actual: RequestKind,
    },

    #[error("Node connection closed")]
    Disconnected,
}
