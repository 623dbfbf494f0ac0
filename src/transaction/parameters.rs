//! Transaction parameter bag.
//!
//! A transaction's whole persisted state is a set of opaque values keyed by
//! `(TxId, SubTxId, ParameterId)`. Values are bincode-encoded; typed access goes through
//! [`TxParameterStore`] for stored transactions and [`TxParameters`] for detached bags
//! (start requests and peer messages).

use crate::transaction::base::{TxStatus, TxType};
use crate::wallet::WalletError;
use crate::wallet::storage::WalletStore;
use crate::wallet::types::{DEFAULT_SUB_TX_ID, SubTxId, TxId, WalletId};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Parameters with ids below this value may be set by peers.
pub const PRIVATE_FIRST_PARAM: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ParameterId {
    // public
    TransactionType = 0,
    IsSender = 1,
    Amount = 2,
    Fee = 3,
    MinHeight = 4,
    Message = 5,
    MyId = 6,
    PeerId = 7,
    CreateTime = 10,
    IsInitiator = 11,
    PeerMaxHeight = 12,
    AmountList = 13,
    PreselectedCoins = 14,
    Lifetime = 15,
    PeerProtoVersion = 16,
    MaxHeight = 17,
    AssetId = 18,
    PeerResponseTime = 24,
    SubTxIndex = 25,
    IsSelfTx = 27,
    PeerPublicNonce = 40,
    PeerPublicExcess = 50,
    PeerSignature = 60,
    PeerOffset = 70,
    PeerInputs = 80,
    PeerOutputs = 81,
    TransactionRegistered = 90,
    FailureReason = 92,
    ShieldedOutputId = 122,

    // private
    ModifyTime = 128,
    KernelProofHeight = 129,
    KernelUnconfirmedHeight = 133,
    PeerResponseHeight = 134,
    AssetConfirmedHeight = 135,
    AssetUnconfirmedHeight = 136,
    AssetInfoFull = 137,
    Offset = 140,
    Status = 151,
    KernelId = 152,
    PartialSignature = 159,
    PublicNonce = 164,
    PublicExcess = 165,
    PeerAddr = 170,
    InputCoins = 183,
    OutputCoins = 184,
    InputCoinsShielded = 185,
    ShieldedList = 186,
    ShieldedOutputProof = 187,
    Kernel = 200,
    InternalFailureReason = 210,
    TransactionRegisteredInternal = 222,
    TransactionRegisteredExtraInfo = 223,
    State = 255,
}

impl ParameterId {
    pub fn is_public(self) -> bool {
        (self as u8) < PRIVATE_FIRST_PARAM
    }
}

pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, WalletError> {
    Ok(bincode::serialize(value)?)
}

pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    match bincode::deserialize(bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Failed to decode parameter value: {}", e);
            None
        }
    }
}

/// Detached parameter bag, grouped by sub-transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxParameters {
    tx_id: Option<TxId>,
    params: BTreeMap<SubTxId, BTreeMap<ParameterId, Vec<u8>>>,
}

impl TxParameters {
    pub fn new(tx_id: Option<TxId>) -> Self {
        Self {
            tx_id,
            params: BTreeMap::new(),
        }
    }

    pub fn tx_id(&self) -> Option<TxId> {
        self.tx_id
    }

    pub fn set_tx_id(&mut self, tx_id: TxId) {
        self.tx_id = Some(tx_id);
    }

    pub fn get<T: DeserializeOwned>(&self, id: ParameterId) -> Option<T> {
        self.get_sub(id, DEFAULT_SUB_TX_ID)
    }

    pub fn get_sub<T: DeserializeOwned>(&self, id: ParameterId, sub_tx_id: SubTxId) -> Option<T> {
        self.get_raw(id, sub_tx_id).and_then(from_bytes)
    }

    pub fn get_raw(&self, id: ParameterId, sub_tx_id: SubTxId) -> Option<&[u8]> {
        self.params
            .get(&sub_tx_id)
            .and_then(|sub| sub.get(&id))
            .map(Vec::as_slice)
    }

    pub fn set<T: Serialize + ?Sized>(
        &mut self,
        id: ParameterId,
        value: &T,
    ) -> Result<&mut Self, WalletError> {
        self.set_sub(id, value, DEFAULT_SUB_TX_ID)
    }

    pub fn set_sub<T: Serialize + ?Sized>(
        &mut self,
        id: ParameterId,
        value: &T,
        sub_tx_id: SubTxId,
    ) -> Result<&mut Self, WalletError> {
        self.set_raw(id, to_bytes(value)?, sub_tx_id);
        Ok(self)
    }

    pub fn set_raw(&mut self, id: ParameterId, value: Vec<u8>, sub_tx_id: SubTxId) {
        self.params.entry(sub_tx_id).or_default().insert(id, value);
    }

    /// Flatten into an ordered list. Entries of a non-default sub-transaction are preceded by a
    /// `SubTxIndex` marker.
    pub fn pack(&self) -> Result<Vec<(ParameterId, Vec<u8>)>, WalletError> {
        let mut packed = Vec::new();
        for (sub_tx_id, params) in &self.params {
            if *sub_tx_id != DEFAULT_SUB_TX_ID || self.params.len() > 1 {
                packed.push((ParameterId::SubTxIndex, to_bytes(sub_tx_id)?));
            }
            packed.extend(params.iter().map(|(id, value)| (*id, value.clone())));
        }
        Ok(packed)
    }

    /// Iterate `(sub_tx_id, parameter_id, value)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (SubTxId, ParameterId, &[u8])> {
        self.params.iter().flat_map(|(sub_tx_id, params)| {
            params
                .iter()
                .map(move |(id, value)| (*sub_tx_id, *id, value.as_slice()))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.params.values().all(BTreeMap::is_empty)
    }
}

/// Parameter message exchanged between wallets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetTxParameter {
    pub from: WalletId,
    pub tx_id: TxId,
    pub tx_type: TxType,
    pub parameters: Vec<(ParameterId, Vec<u8>)>,
}

impl SetTxParameter {
    pub fn new(from: WalletId, tx_id: TxId, tx_type: TxType) -> Self {
        Self {
            from,
            tx_id,
            tx_type,
            parameters: Vec::new(),
        }
    }

    pub fn add_parameter<T: Serialize + ?Sized>(
        mut self,
        id: ParameterId,
        value: &T,
    ) -> Result<Self, WalletError> {
        self.parameters.push((id, to_bytes(value)?));
        Ok(self)
    }

    pub fn get_parameter<T: DeserializeOwned>(&self, id: ParameterId) -> Option<T> {
        self.parameters
            .iter()
            .find(|(pid, _)| *pid == id)
            .and_then(|(_, value)| from_bytes(value))
    }
}

/// Typed access to the parameters of stored transactions.
pub trait TxParameterStore: WalletStore {
    fn get_tx_param<T: DeserializeOwned>(
        &self,
        tx_id: &TxId,
        sub_tx_id: SubTxId,
        id: ParameterId,
    ) -> Option<T> {
        self.get_tx_parameter(tx_id, sub_tx_id, id)
            .and_then(|bytes| from_bytes(&bytes))
    }

    /// Store a value. Returns whether the stored value changed.
    fn set_tx_param<T: Serialize + ?Sized>(
        &mut self,
        tx_id: &TxId,
        sub_tx_id: SubTxId,
        id: ParameterId,
        value: &T,
    ) -> Result<bool, WalletError> {
        Ok(self.set_tx_parameter(tx_id, sub_tx_id, id, to_bytes(value)?))
    }

    fn tx_status(&self, tx_id: &TxId) -> Option<TxStatus> {
        self.get_tx_param(tx_id, DEFAULT_SUB_TX_ID, ParameterId::Status)
    }

    fn tx_type(&self, tx_id: &TxId) -> Option<TxType> {
        self.get_tx_param(tx_id, DEFAULT_SUB_TX_ID, ParameterId::TransactionType)
    }

    /// Whether the transaction exists and has not reached a terminal status.
    fn is_ongoing_tx(&self, tx_id: Option<&TxId>) -> bool {
        tx_id
            .and_then(|id| self.tx_status(id))
            .is_some_and(|status| !status.is_terminal())
    }
}

impl<S: WalletStore + ?Sized> TxParameterStore for S {}
