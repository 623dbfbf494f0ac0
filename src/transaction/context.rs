//! The gateway handed to a transaction while it updates.
//!
//! A transaction never holds references into the wallet. For the duration of one update it
//! receives a `TxContext` with access to storage, the chain tip and the signing service, and
//! records everything it wants the wallet to do (node requests, peer messages, rescheduling) as
//! [`GatewayAction`]s. The wallet executes those actions once the update has returned.

use crate::node::AssetRef;
use crate::transaction::base::{FailureReason, TransactionFailed, TxStatus};
use crate::transaction::key_keeper::{CoinSelector, KeyKeeper};
use crate::transaction::parameters::{ParameterId, SetTxParameter, TxParameterStore};
use crate::wallet::ledger::CoinLedger;
use crate::wallet::storage::WalletStore;
use crate::wallet::types::*;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// Engine settings a transaction may consult.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSettings {
    /// Address this wallet uses on the peer network.
    pub my_id: WalletId,
    pub max_kernel_validity: Height,
    pub coin_confirmations_offset: Height,
    pub maturity_std: Height,
}

impl Default for TxSettings {
    fn default() -> Self {
        Self {
            my_id: WalletId::default(),
            max_kernel_validity: 1440,
            coin_confirmations_offset: 0,
            maturity_std: 0,
        }
    }
}

/// Work a transaction asks the wallet to perform after its update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayAction {
    ConfirmKernel {
        sub_tx_id: SubTxId,
        kernel_id: KernelId,
    },
    GetKernel {
        sub_tx_id: SubTxId,
        kernel_id: KernelId,
    },
    ConfirmAsset {
        sub_tx_id: SubTxId,
        target: AssetRef,
    },
    RegisterTx {
        sub_tx_id: SubTxId,
        transaction: Vec<u8>,
    },
    GetShieldedList {
        start: TxoId,
        count: u32,
    },
    GetShieldedOutputProof {
        public_key: Vec<u8>,
    },
    SendTxParams {
        peer: WalletId,
        message: SetTxParameter,
    },
    UpdateOnNextTip,
    UpdateAsync,
    Completed,
    Failed,
}

pub struct TxContext<'a> {
    tx_id: TxId,
    sub_tx_id: SubTxId,
    store: &'a mut dyn WalletStore,
    settings: &'a TxSettings,
    key_keeper: Option<&'a mut dyn KeyKeeper>,
    coin_selector: &'a dyn CoinSelector,
    actions: Vec<GatewayAction>,
}

impl<'a> TxContext<'a> {
    pub fn new(
        tx_id: TxId,
        store: &'a mut dyn WalletStore,
        settings: &'a TxSettings,
        key_keeper: Option<&'a mut dyn KeyKeeper>,
        coin_selector: &'a dyn CoinSelector,
    ) -> Self {
        Self {
            tx_id,
            sub_tx_id: DEFAULT_SUB_TX_ID,
            store,
            settings,
            key_keeper,
            coin_selector,
            actions: Vec::new(),
        }
    }

    pub fn tx_id(&self) -> &TxId {
        &self.tx_id
    }

    pub fn sub_tx_id(&self) -> SubTxId {
        self.sub_tx_id
    }

    /// Switch the sub-transaction subsequent parameter access applies to.
    pub fn set_sub_tx_id(&mut self, sub_tx_id: SubTxId) {
        self.sub_tx_id = sub_tx_id;
    }

    pub fn settings(&self) -> &TxSettings {
        self.settings
    }

    pub fn get<T: DeserializeOwned>(&self, id: ParameterId) -> Option<T> {
        self.store.get_tx_param(&self.tx_id, self.sub_tx_id, id)
    }

    pub fn get_sub<T: DeserializeOwned>(&self, id: ParameterId, sub_tx_id: SubTxId) -> Option<T> {
        self.store.get_tx_param(&self.tx_id, sub_tx_id, id)
    }

    /// Read a parameter the transaction cannot proceed without.
    pub fn get_mandatory<T: DeserializeOwned>(
        &self,
        id: ParameterId,
    ) -> Result<T, TransactionFailed> {
        self.get(id).ok_or_else(|| {
            TransactionFailed::new(FailureReason::FailedToGetParameter, false)
                .with_message(format!("missing parameter {:?}", id))
        })
    }

    /// Store a parameter. Returns whether the value changed.
    pub fn set<T: Serialize + ?Sized>(
        &mut self,
        id: ParameterId,
        value: &T,
    ) -> Result<bool, TransactionFailed> {
        Ok(self
            .store
            .set_tx_param(&self.tx_id, self.sub_tx_id, id, value)?)
    }

    pub fn set_sub<T: Serialize + ?Sized>(
        &mut self,
        id: ParameterId,
        value: &T,
        sub_tx_id: SubTxId,
    ) -> Result<bool, TransactionFailed> {
        Ok(self.store.set_tx_param(&self.tx_id, sub_tx_id, id, value)?)
    }

    /// Status of the default sub-transaction.
    pub fn status(&self) -> Option<TxStatus> {
        self.store.tx_status(&self.tx_id)
    }

    pub fn tip(&self) -> Option<ChainState> {
        self.store.history().get_tip().cloned()
    }

    pub fn tip_height(&self) -> Height {
        self.store.history().get_tip().map_or(0, |s| s.height)
    }

    pub fn ledger(&mut self) -> CoinLedger<'_> {
        CoinLedger::new(&mut *self.store)
    }

    pub fn store(&self) -> &dyn WalletStore {
        &*self.store
    }

    pub fn key_keeper(&mut self) -> Option<&mut (dyn KeyKeeper + 'a)> {
        self.key_keeper.as_deref_mut()
    }

    pub fn has_key_keeper(&self) -> bool {
        self.key_keeper.is_some()
    }

    pub fn coin_selector(&self) -> &dyn CoinSelector {
        self.coin_selector
    }

    pub fn confirm_kernel(&mut self, kernel_id: KernelId) {
        self.push(GatewayAction::ConfirmKernel {
            sub_tx_id: self.sub_tx_id,
            kernel_id,
        });
    }

    pub fn get_kernel(&mut self, kernel_id: KernelId) {
        self.push(GatewayAction::GetKernel {
            sub_tx_id: self.sub_tx_id,
            kernel_id,
        });
    }

    pub fn confirm_asset(&mut self, target: AssetRef) {
        self.push(GatewayAction::ConfirmAsset {
            sub_tx_id: self.sub_tx_id,
            target,
        });
    }

    pub fn register_tx(&mut self, transaction: Vec<u8>) {
        self.push(GatewayAction::RegisterTx {
            sub_tx_id: self.sub_tx_id,
            transaction,
        });
    }

    pub fn get_shielded_list(&mut self, start: TxoId, count: u32) {
        self.push(GatewayAction::GetShieldedList { start, count });
    }

    pub fn get_shielded_output_proof(&mut self, public_key: Vec<u8>) {
        self.push(GatewayAction::GetShieldedOutputProof { public_key });
    }

    pub fn send_tx_params(&mut self, peer: WalletId, message: SetTxParameter) {
        self.push(GatewayAction::SendTxParams { peer, message });
    }

    pub fn update_on_next_tip(&mut self) {
        self.push(GatewayAction::UpdateOnNextTip);
    }

    pub fn update_async(&mut self) {
        self.push(GatewayAction::UpdateAsync);
    }

    pub(crate) fn push(&mut self, action: GatewayAction) {
        self.actions.push(action);
    }

    pub fn actions(&self) -> &[GatewayAction] {
        &self.actions
    }

    pub fn take_actions(&mut self) -> Vec<GatewayAction> {
        std::mem::take(&mut self.actions)
    }
}

impl fmt::Display for TxContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_tx_label(f, &self.tx_id, self.sub_tx_id)
    }
}

/// `TxID[SubTxID]`, with the sub id omitted for the default sub-transaction.
pub fn write_tx_label(f: &mut fmt::Formatter<'_>, tx_id: &TxId, sub_tx_id: SubTxId) -> fmt::Result {
    if sub_tx_id == DEFAULT_SUB_TX_ID {
        write!(f, "{}", tx_id)
    } else {
        write!(f, "{}[{}]", tx_id, sub_tx_id)
    }
}
