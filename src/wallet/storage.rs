//! Wallet storage contract and the in-memory store.
//!
//! The engine treats storage as a synchronous repository of coins, assets, transaction
//! parameters, named variables and recent chain headers. [`MemoryWalletStore`] keeps everything in
//! ordered maps and converts to/from a [`WalletSnapshot`] for file persistence.

use crate::transaction::parameters::{ParameterId, TxParameters, from_bytes, to_bytes};
use crate::wallet::WalletError;
use crate::wallet::types::*;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Name of the variable holding the next event height to request.
pub const NEXT_EVENT_HEIGHT_VAR: &str = "NextEventHeight";
/// Name of the variable holding the last fully synchronized tip.
pub const SYSTEM_STATE_VAR: &str = "SystemStateID";
pub const SHIELDED_OUTPUTS_VAR: &str = "ShieldedOuts";
pub const SHIELDED_INPUTS_VAR: &str = "ShieldedIns";
pub const ASSETS_MAX_VAR: &str = "AssetsMax";
pub const ASSETS_ACTIVE_VAR: &str = "AssetsActive";
/// Name of the variable holding this wallet's address.
pub const MY_ID_VAR: &str = "MyWalletId";

/// Recent block headers known to the wallet, ordered by height.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHistory {
    states: BTreeMap<Height, ChainState>,
}

impl ChainHistory {
    pub fn add_states(&mut self, states: &[ChainState]) {
        for state in states {
            self.states.insert(state.height, state.clone());
        }
    }

    /// Drop every header at or above `height`.
    pub fn delete_from(&mut self, height: Height) {
        self.states.split_off(&height);
    }

    pub fn get_tip(&self) -> Option<&ChainState> {
        self.states.values().next_back()
    }

    pub fn get(&self, height: Height) -> Option<&ChainState> {
        self.states.get(&height)
    }

    /// Keep only the headers within `depth` blocks of the tip.
    pub fn shrink(&mut self, depth: Height) {
        let Some(tip) = self.get_tip().map(|s| s.height) else {
            return;
        };
        let keep_from = tip.saturating_sub(depth);
        self.states = self.states.split_off(&keep_from);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainState> {
        self.states.values()
    }
}

/// Summary of a stored transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxDescription {
    pub tx_id: TxId,
    pub tx_type: crate::transaction::TxType,
    pub status: crate::transaction::TxStatus,
    pub amount: u64,
    pub is_sender: bool,
}

/// Storage contract consumed by the engine.
pub trait WalletStore {
    fn get_var(&self, name: &str) -> Option<Vec<u8>>;
    fn set_var(&mut self, name: &str, value: Vec<u8>);

    fn find_coin(&self, id: &CoinId) -> Option<Coin>;
    fn save_coin(&mut self, coin: &Coin);
    fn remove_coin(&mut self, id: &CoinId) -> bool;
    fn coins(&self) -> Vec<Coin>;
    fn clear_coins(&mut self);

    fn find_shielded_coin(&self, txo_id: TxoId) -> Option<ShieldedCoin>;
    fn save_shielded_coin(&mut self, coin: &ShieldedCoin);
    fn remove_shielded_coin(&mut self, txo_id: TxoId) -> bool;
    fn shielded_coins(&self) -> Vec<ShieldedCoin>;
    fn clear_shielded_coins(&mut self);

    fn find_asset(&self, id: AssetId) -> Option<WalletAsset>;
    fn save_asset(&mut self, asset: &WalletAsset);
    fn drop_asset(&mut self, id: AssetId) -> bool;
    fn assets(&self) -> Vec<WalletAsset>;

    fn get_tx_parameter(&self, tx_id: &TxId, sub_tx_id: SubTxId, id: ParameterId)
    -> Option<Vec<u8>>;
    /// Store a raw parameter value. Returns whether the stored value changed.
    fn set_tx_parameter(
        &mut self,
        tx_id: &TxId,
        sub_tx_id: SubTxId,
        id: ParameterId,
        value: Vec<u8>,
    ) -> bool;
    fn tx_parameters(&self, tx_id: &TxId) -> TxParameters;
    fn tx_ids(&self) -> Vec<TxId>;
    fn delete_tx(&mut self, tx_id: &TxId) -> bool;

    fn history(&self) -> &ChainHistory;
    fn history_mut(&mut self) -> &mut ChainHistory;

    /// Serializable image of everything stored.
    fn snapshot(&self) -> WalletSnapshot;

    /// Stored transactions that have a known type and status.
    fn get_tx_history(&self) -> Vec<TxDescription> {
        self.tx_ids()
            .into_iter()
            .filter_map(|tx_id| {
                let params = self.tx_parameters(&tx_id);
                Some(TxDescription {
                    tx_id,
                    tx_type: params.get(ParameterId::TransactionType)?,
                    status: params.get(ParameterId::Status)?,
                    amount: params.get(ParameterId::Amount).unwrap_or_default(),
                    is_sender: params.get(ParameterId::IsSender).unwrap_or_default(),
                })
            })
            .collect()
    }
}

/// Typed access to storage variables.
pub trait VarStore: WalletStore {
    fn get_var_value<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.get_var(name).and_then(|bytes| from_bytes(&bytes))
    }

    fn set_var_value<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), WalletError> {
        self.set_var(name, to_bytes(value)?);
        Ok(())
    }

    fn next_event_height(&self) -> Height {
        self.get_var_value(NEXT_EVENT_HEIGHT_VAR).unwrap_or(0)
    }

    fn set_next_event_height(&mut self, height: Height) -> Result<(), WalletError> {
        self.set_var_value(NEXT_EVENT_HEIGHT_VAR, &height)
    }
}

impl<S: WalletStore + ?Sized> VarStore for S {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredParameter {
    pub tx_id: TxId,
    pub sub_tx_id: SubTxId,
    pub id: ParameterId,
    pub value: Vec<u8>,
}

/// Serializable image of a [`MemoryWalletStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub vars: BTreeMap<String, Vec<u8>>,
    pub coins: Vec<Coin>,
    pub shielded_coins: Vec<ShieldedCoin>,
    pub assets: Vec<WalletAsset>,
    pub parameters: Vec<StoredParameter>,
    pub history: ChainHistory,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryWalletStore {
    vars: BTreeMap<String, Vec<u8>>,
    coins: BTreeMap<CoinId, Coin>,
    shielded_coins: BTreeMap<TxoId, ShieldedCoin>,
    assets: BTreeMap<AssetId, WalletAsset>,
    parameters: BTreeMap<(TxId, SubTxId, ParameterId), Vec<u8>>,
    history: ChainHistory,
}

impl MemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: WalletSnapshot) -> Self {
        Self {
            vars: snapshot.vars,
            coins: snapshot.coins.into_iter().map(|c| (c.id, c)).collect(),
            shielded_coins: snapshot
                .shielded_coins
                .into_iter()
                .map(|c| (c.txo_id, c))
                .collect(),
            assets: snapshot
                .assets
                .into_iter()
                .map(|a| (a.info.id, a))
                .collect(),
            parameters: snapshot
                .parameters
                .into_iter()
                .map(|p| ((p.tx_id, p.sub_tx_id, p.id), p.value))
                .collect(),
            history: snapshot.history,
        }
    }
}

impl WalletStore for MemoryWalletStore {
    fn get_var(&self, name: &str) -> Option<Vec<u8>> {
        self.vars.get(name).cloned()
    }

    fn set_var(&mut self, name: &str, value: Vec<u8>) {
        self.vars.insert(name.to_string(), value);
    }

    fn find_coin(&self, id: &CoinId) -> Option<Coin> {
        self.coins.get(id).cloned()
    }

    fn save_coin(&mut self, coin: &Coin) {
        self.coins.insert(coin.id, coin.clone());
    }

    fn remove_coin(&mut self, id: &CoinId) -> bool {
        self.coins.remove(id).is_some()
    }

    fn coins(&self) -> Vec<Coin> {
        self.coins.values().cloned().collect()
    }

    fn clear_coins(&mut self) {
        self.coins.clear();
    }

    fn find_shielded_coin(&self, txo_id: TxoId) -> Option<ShieldedCoin> {
        self.shielded_coins.get(&txo_id).cloned()
    }

    fn save_shielded_coin(&mut self, coin: &ShieldedCoin) {
        self.shielded_coins.insert(coin.txo_id, coin.clone());
    }

    fn remove_shielded_coin(&mut self, txo_id: TxoId) -> bool {
        self.shielded_coins.remove(&txo_id).is_some()
    }

    fn shielded_coins(&self) -> Vec<ShieldedCoin> {
        self.shielded_coins.values().cloned().collect()
    }

    fn clear_shielded_coins(&mut self) {
        self.shielded_coins.clear();
    }

    fn find_asset(&self, id: AssetId) -> Option<WalletAsset> {
        self.assets.get(&id).cloned()
    }

    fn save_asset(&mut self, asset: &WalletAsset) {
        self.assets.insert(asset.info.id, asset.clone());
    }

    fn drop_asset(&mut self, id: AssetId) -> bool {
        self.assets.remove(&id).is_some()
    }

    fn assets(&self) -> Vec<WalletAsset> {
        self.assets.values().cloned().collect()
    }

    fn get_tx_parameter(
        &self,
        tx_id: &TxId,
        sub_tx_id: SubTxId,
        id: ParameterId,
    ) -> Option<Vec<u8>> {
        self.parameters.get(&(*tx_id, sub_tx_id, id)).cloned()
    }

    fn set_tx_parameter(
        &mut self,
        tx_id: &TxId,
        sub_tx_id: SubTxId,
        id: ParameterId,
        value: Vec<u8>,
    ) -> bool {
        match self.parameters.insert((*tx_id, sub_tx_id, id), value) {
            Some(previous) => self.parameters.get(&(*tx_id, sub_tx_id, id)) != Some(&previous),
            None => true,
        }
    }

    fn tx_parameters(&self, tx_id: &TxId) -> TxParameters {
        let mut params = TxParameters::new(Some(*tx_id));
        for ((_, sub_tx_id, id), value) in self
            .parameters
            .range((*tx_id, SubTxId::MIN, ParameterId::TransactionType)..)
            .take_while(|((id, _, _), _)| id == tx_id)
        {
            params.set_raw(*id, value.clone(), *sub_tx_id);
        }
        params
    }

    fn tx_ids(&self) -> Vec<TxId> {
        self.parameters
            .keys()
            .map(|(tx_id, _, _)| *tx_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn delete_tx(&mut self, tx_id: &TxId) -> bool {
        let before = self.parameters.len();
        self.parameters.retain(|(id, _, _), _| id != tx_id);
        before != self.parameters.len()
    }

    fn history(&self) -> &ChainHistory {
        &self.history
    }

    fn history_mut(&mut self) -> &mut ChainHistory {
        &mut self.history
    }

    fn snapshot(&self) -> WalletSnapshot {
        WalletSnapshot {
            vars: self.vars.clone(),
            coins: self.coins.values().cloned().collect(),
            shielded_coins: self.shielded_coins.values().cloned().collect(),
            assets: self.assets.values().cloned().collect(),
            parameters: self
                .parameters
                .iter()
                .map(|((tx_id, sub_tx_id, id), value)| StoredParameter {
                    tx_id: *tx_id,
                    sub_tx_id: *sub_tx_id,
                    id: *id,
                    value: value.clone(),
                })
                .collect(),
            history: self.history.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TxStatus, TxType};
    use crate::transaction::parameters::TxParameterStore;

    fn state(height: Height) -> ChainState {
        ChainState {
            height,
            hash: BlockHash([height as u8; 32]),
            timestamp: 0,
        }
    }

    #[test]
    fn history_delete_and_shrink() {
        let mut history = ChainHistory::default();
        history.add_states(&(1..=10).map(state).collect::<Vec<_>>());
        assert_eq!(history.get_tip().map(|s| s.height), Some(10));

        history.delete_from(8);
        assert_eq!(history.get_tip().map(|s| s.height), Some(7));

        history.shrink(3);
        assert_eq!(history.len(), 4);
        assert!(history.get(3).is_none());
        assert!(history.get(4).is_some());
    }

    #[test]
    fn parameter_set_reports_change() {
        let mut store = MemoryWalletStore::new();
        let tx_id = TxId([3; 16]);
        assert!(
            store
                .set_tx_param(&tx_id, 0, ParameterId::Amount, &5u64)
                .unwrap()
        );
        assert!(
            !store
                .set_tx_param(&tx_id, 0, ParameterId::Amount, &5u64)
                .unwrap()
        );
        assert!(
            store
                .set_tx_param(&tx_id, 0, ParameterId::Amount, &6u64)
                .unwrap()
        );
    }

    #[test]
    fn tx_parameters_are_scoped_by_id() {
        let mut store = MemoryWalletStore::new();
        let a = TxId([1; 16]);
        let b = TxId([2; 16]);
        store.set_tx_param(&a, 0, ParameterId::Amount, &1u64).unwrap();
        store.set_tx_param(&a, 1, ParameterId::Amount, &2u64).unwrap();
        store.set_tx_param(&b, 0, ParameterId::Amount, &3u64).unwrap();

        let params = store.tx_parameters(&a);
        assert_eq!(params.get::<u64>(ParameterId::Amount), Some(1));
        assert_eq!(params.get_sub::<u64>(ParameterId::Amount, 1), Some(2));
        assert_eq!(store.tx_ids(), vec![a, b]);

        assert!(store.delete_tx(&a));
        assert_eq!(store.tx_ids(), vec![b]);
    }

    #[test]
    fn history_lists_typed_transactions() {
        let mut store = MemoryWalletStore::new();
        let tx_id = TxId([4; 16]);
        store
            .set_tx_param(&tx_id, 0, ParameterId::TransactionType, &TxType::Simple)
            .unwrap();
        store
            .set_tx_param(&tx_id, 0, ParameterId::Status, &TxStatus::Completed)
            .unwrap();
        store.set_tx_param(&tx_id, 0, ParameterId::Amount, &9u64).unwrap();

        let history = store.get_tx_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TxStatus::Completed);
        assert_eq!(history[0].amount, 9);
    }

    #[test]
    fn snapshot_round_trip_through_json() {
        let mut store = MemoryWalletStore::new();
        store.save_coin(&Coin::new(CoinId::new(1, KeyType::Regular, 50)));
        store.set_next_event_height(42).unwrap();
        store.history_mut().add_states(&[state(41)]);

        let json = serde_json::to_string(&store.snapshot()).unwrap();
        let restored = MemoryWalletStore::from_snapshot(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.coins().len(), 1);
        assert_eq!(restored.next_event_height(), 42);
        assert_eq!(restored.history().get_tip(), Some(&state(41)));
    }
}
