//! Chain reorganization handling.
//!
//! When the node reports that the chain was rolled back to a height, everything the wallet learnt
//! above it is forgotten: headers, confirmations, spends, asset refreshes and the event cursor.
//! Transactions whose kernel proof is no longer valid are re-queued, including historical ones
//! which are re-activated for the purpose.

use crate::transaction::base::{BaseTransaction, TransactionRegistry};
use crate::transaction::context::{GatewayAction, TxContext, TxSettings};
use crate::transaction::key_keeper::CoinSelector;
use crate::wallet::WalletError;
use crate::wallet::ledger::CoinLedger;
use crate::wallet::storage::{SYSTEM_STATE_VAR, VarStore, WalletStore};
use crate::wallet::sync::event_processor::EventProcessor;
use crate::wallet::types::{Height, TxId};

use std::collections::BTreeMap;
use tracing::{info, warn};

/// What the wallet has to do after a rollback was applied.
#[derive(Debug, Default)]
pub struct RollbackOutcome {
    /// Transactions to update once the wallet is in sync again.
    pub requeue: Vec<TxId>,
    /// Historical transactions that became active again.
    pub reactivated: usize,
    /// Requests transactions issued while rolling back.
    pub actions: Vec<(TxId, Vec<GatewayAction>)>,
}

pub struct RollbackHandler<'a> {
    store: &'a mut dyn WalletStore,
    settings: &'a TxSettings,
    registry: &'a TransactionRegistry,
    coin_selector: &'a dyn CoinSelector,
}

impl<'a> RollbackHandler<'a> {
    pub fn new(
        store: &'a mut dyn WalletStore,
        settings: &'a TxSettings,
        registry: &'a TransactionRegistry,
        coin_selector: &'a dyn CoinSelector,
    ) -> Self {
        Self {
            store,
            settings,
            registry,
            coin_selector,
        }
    }

    /// Roll local state back to `height`.
    pub fn on_rolled_back(
        &mut self,
        height: Height,
        active: &mut BTreeMap<TxId, BaseTransaction>,
    ) -> Result<RollbackOutcome, WalletError> {
        info!("Rolled back to {}", height);

        self.rollback_ledger(height)?;

        let mut outcome = RollbackOutcome::default();
        for (tx_id, tx) in active.iter_mut() {
            let mut ctx = self.context(*tx_id);
            if tx.rollback(&mut ctx, height) {
                outcome.requeue.push(*tx_id);
            }
            outcome.push_actions(*tx_id, ctx.take_actions());
        }

        for desc in self.store.get_tx_history() {
            if active.contains_key(&desc.tx_id) {
                continue;
            }
            let mut tx = match self.registry.construct(desc.tx_type, desc.tx_id) {
                Ok(tx) => tx,
                Err(e) => {
                    warn!("Cannot restore transaction {}: {}", desc.tx_id, e);
                    continue;
                }
            };
            let mut ctx = self.context(desc.tx_id);
            let affected = tx.rollback(&mut ctx, height);
            let actions = ctx.take_actions();
            if affected {
                info!("{} affected by rollback, reactivated", desc.tx_id);
                active.insert(desc.tx_id, tx);
                outcome.requeue.push(desc.tx_id);
                outcome.reactivated += 1;
                outcome.push_actions(desc.tx_id, actions);
            }
        }

        self.reset_cursor(height)?;
        Ok(outcome)
    }

    /// Forget headers, confirmations, spends and asset refreshes above `height`.
    pub fn rollback_ledger(&mut self, height: Height) -> Result<(), WalletError> {
        self.store.history_mut().delete_from(height + 1);
        if let Some(tip) = self.store.history().get_tip().cloned() {
            self.store.set_var_value(SYSTEM_STATE_VAR, &tip)?;
        }

        let mut ledger = CoinLedger::new(&mut *self.store);
        ledger.rollback_confirmed(height);
        ledger.rollback_assets(height);
        ledger.refresh_statuses();
        Ok(())
    }

    /// Move the event cursor back so events above `height` are fetched again.
    pub fn reset_cursor(&mut self, height: Height) -> Result<bool, WalletError> {
        if self.store.next_event_height() > height + 1 {
            EventProcessor::set_events_height(&mut *self.store, height)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn context(&mut self, tx_id: TxId) -> TxContext<'_> {
        TxContext::new(
            tx_id,
            &mut *self.store,
            self.settings,
            None,
            self.coin_selector,
        )
    }
}

impl RollbackOutcome {
    fn push_actions(&mut self, tx_id: TxId, actions: Vec<GatewayAction>) {
        if !actions.is_empty() {
            self.actions.push((tx_id, actions));
        }
    }
}
