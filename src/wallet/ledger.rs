//! Local projection of spendable outputs.
//!
//! `CoinLedger` wraps the store for the duration of one engine step. Every write goes through
//! [`CoinLedger::save`] so a coin's status is always deduced from its heights, its back-references
//! and the status of the referenced transactions.

use crate::transaction::parameters::TxParameterStore;
use crate::wallet::storage::WalletStore;
use crate::wallet::types::*;

use itertools::Itertools;
use tracing::debug;

/// Lower of an optional existing height and a new one.
pub fn min_height(existing: Option<Height>, height: Height) -> Height {
    existing.map_or(height, |h| h.min(height))
}

pub struct CoinLedger<'a> {
    store: &'a mut dyn WalletStore,
}

impl<'a> CoinLedger<'a> {
    pub fn new(store: &'a mut dyn WalletStore) -> Self {
        Self { store }
    }

    pub fn tip_height(&self) -> Height {
        self.store.history().get_tip().map_or(0, |s| s.height)
    }

    pub fn find(&self, id: &CoinId) -> Option<Coin> {
        self.store.find_coin(id)
    }

    pub fn deduce_status(&self, coin: &Coin) -> CoinStatus {
        if coin.spent_height.is_some() {
            return CoinStatus::Spent;
        }
        if coin.confirm_height.is_some() {
            if coin.maturity > self.tip_height() {
                return CoinStatus::Locked;
            }
            if self.store.is_ongoing_tx(coin.spent_tx_id.as_ref()) {
                return CoinStatus::Outgoing;
            }
            return CoinStatus::Unspent;
        }
        if self.store.is_ongoing_tx(coin.create_tx_id.as_ref()) {
            return CoinStatus::Incoming;
        }
        CoinStatus::Unconfirmed
    }

    pub fn deduce_shielded_status(&self, coin: &ShieldedCoin) -> CoinStatus {
        if coin.spent_height.is_some() {
            return CoinStatus::Spent;
        }
        if coin.confirm_height.is_some() {
            if self.store.is_ongoing_tx(coin.spent_tx_id.as_ref()) {
                return CoinStatus::Outgoing;
            }
            return CoinStatus::Unspent;
        }
        if self.store.is_ongoing_tx(coin.create_tx_id.as_ref()) {
            return CoinStatus::Incoming;
        }
        CoinStatus::Unconfirmed
    }

    pub fn save(&mut self, mut coin: Coin) -> Coin {
        coin.status = self.deduce_status(&coin);
        self.store.save_coin(&coin);
        coin
    }

    pub fn save_shielded(&mut self, mut coin: ShieldedCoin) -> ShieldedCoin {
        coin.status = self.deduce_shielded_status(&coin);
        self.store.save_shielded_coin(&coin);
        coin
    }

    /// Re-deduce every coin status, e.g. after a transaction changed status.
    pub fn refresh_statuses(&mut self) {
        for coin in self.store.coins() {
            let status = self.deduce_status(&coin);
            if status != coin.status {
                self.save(coin);
            }
        }
        for coin in self.store.shielded_coins() {
            let status = self.deduce_shielded_status(&coin);
            if status != coin.status {
                self.save_shielded(coin);
            }
        }
    }

    pub fn available_coins(&self, asset_id: AssetId) -> Vec<Coin> {
        self.store
            .coins()
            .into_iter()
            .filter(|c| c.asset_id() == asset_id && self.deduce_status(c) == CoinStatus::Unspent)
            .collect()
    }

    pub fn coins_created_by(&self, tx_id: &TxId) -> Vec<Coin> {
        self.store
            .coins()
            .into_iter()
            .filter(|c| c.create_tx_id.as_ref() == Some(tx_id))
            .collect()
    }

    pub fn coins_spent_by(&self, tx_id: &TxId) -> Vec<Coin> {
        self.store
            .coins()
            .into_iter()
            .filter(|c| c.spent_tx_id.as_ref() == Some(tx_id))
            .collect()
    }

    /// Mark coins as inputs of `tx_id`. Unknown ids are skipped.
    pub fn reserve(&mut self, tx_id: &TxId, ids: &[CoinId]) -> Vec<Coin> {
        let mut reserved = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut coin) = self.store.find_coin(id) {
                coin.spent_tx_id = Some(*tx_id);
                reserved.push(self.save(coin));
            }
        }
        reserved
    }

    /// Register an output that `tx_id` is going to create.
    pub fn create_output(&mut self, tx_id: &TxId, id: CoinId) -> Coin {
        let mut coin = self.store.find_coin(&id).unwrap_or_else(|| Coin::new(id));
        coin.create_tx_id = Some(*tx_id);
        self.save(coin)
    }

    pub fn restore_spent_by_tx(&mut self, tx_id: &TxId) {
        for mut coin in self.coins_spent_by(tx_id) {
            if coin.spent_height.is_none() {
                coin.spent_tx_id = None;
                self.save(coin);
            }
        }
    }

    /// Delete not-yet-confirmed coins created by `tx_id`.
    pub fn delete_created_by_tx(&mut self, tx_id: &TxId) {
        for coin in self.coins_created_by(tx_id) {
            if coin.confirm_height.is_none() {
                self.store.remove_coin(&coin.id);
            }
        }
    }

    pub fn restore_shielded_spent_by_tx(&mut self, tx_id: &TxId) {
        for mut coin in self.store.shielded_coins() {
            if coin.spent_tx_id.as_ref() == Some(tx_id) && coin.spent_height.is_none() {
                coin.spent_tx_id = None;
                self.save_shielded(coin);
            }
        }
    }

    /// Undo every coin change a failed or canceled transaction made.
    pub fn rollback_tx(&mut self, tx_id: &TxId) {
        self.restore_spent_by_tx(tx_id);
        self.delete_created_by_tx(tx_id);
        self.restore_shielded_spent_by_tx(tx_id);
    }

    /// Forget confirmations and spends above `height`.
    ///
    /// A coin confirmed above `height` that no transaction of ours created is deleted; otherwise
    /// it falls back to an unconfirmed coin.
    pub fn rollback_confirmed(&mut self, height: Height) {
        for mut coin in self.store.coins() {
            let mut changed = false;
            if coin.confirm_height.is_some_and(|h| h > height) {
                if coin.create_tx_id.is_none() {
                    debug!("Dropping coin {} confirmed above {}", coin.id, height);
                    self.store.remove_coin(&coin.id);
                    continue;
                }
                coin.confirm_height = None;
                changed = true;
            }
            if coin.spent_height.is_some_and(|h| h > height) {
                coin.spent_height = None;
                changed = true;
            }
            if changed {
                self.save(coin);
            }
        }

        for mut coin in self.store.shielded_coins() {
            let mut changed = false;
            if coin.confirm_height.is_some_and(|h| h > height) {
                if coin.create_tx_id.is_none() {
                    self.store.remove_shielded_coin(coin.txo_id);
                    continue;
                }
                coin.confirm_height = None;
                changed = true;
            }
            if coin.spent_height.is_some_and(|h| h > height) {
                coin.spent_height = None;
                changed = true;
            }
            if changed {
                self.save_shielded(coin);
            }
        }
    }

    /// Assets refreshed above `height` are marked as refreshed at `height`.
    pub fn rollback_assets(&mut self, height: Height) {
        for mut asset in self.store.assets() {
            if asset.refresh_height > height {
                asset.refresh_height = height;
                self.store.save_asset(&asset);
            }
        }
    }

    /// Apply the kernel proof height of a completed transaction to its coins.
    pub fn set_completed_tx_coin_statuses(
        &mut self,
        tx_id: &TxId,
        proof_height: Height,
        maturity_std: Height,
    ) {
        for mut coin in self.coins_created_by(tx_id) {
            coin.confirm_height = Some(min_height(coin.confirm_height, proof_height));
            coin.maturity = proof_height.saturating_add(maturity_std);
            self.save(coin);
        }
        for mut coin in self.coins_spent_by(tx_id) {
            coin.spent_height = Some(min_height(coin.spent_height, proof_height));
            self.save(coin);
        }
    }

    /// Asset ids referenced by coins but missing from the asset table.
    pub fn missing_assets(&self) -> Vec<AssetId> {
        self.store
            .coins()
            .iter()
            .map(Coin::asset_id)
            .chain(self.store.shielded_coins().iter().map(|c| c.id.asset_id))
            .filter(|id| *id != NATIVE_ASSET_ID && self.store.find_asset(*id).is_none())
            .sorted_unstable()
            .dedup()
            .collect()
    }
}
