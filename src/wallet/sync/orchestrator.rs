//! Wallet engine and integration point for all sync services.
//!
//! This module defines [`Wallet`], the single-threaded coordinator that keeps the local ledger in
//! step with a remote node and drives every active transaction to a terminal state.
//!
//! The wallet is responsible for:
//! - Tracking every outstanding node request through the [`RequestMultiplexer`]
//! - Applying chain events and reorganizations to the ledger
//! - Gating transaction updates on the wallet being in sync with the node
//! - Executing the actions transactions record while they update (requests, peer messages,
//!   rescheduling)
//! - Reporting progress and transaction outcomes to registered observers
//!
//! Nothing here blocks. Waiting is modelled as state: pending requests, the queue of
//! transactions to update once synced and the set of transactions waiting for the next tip.
//! Updates are never run from inside a response handler; they are queued and drained by
//! [`Wallet::process_pending_updates`] once the handler has returned.

use crate::config::WalletConfig;
use crate::node::{
    AssetRef, NodeError, NodeNetwork, NodeNotification, NodeRequest, NodeResponse, RequestId,
    RequestKind, UtxoEvent,
};
use crate::transaction::base::{BaseTransaction, TransactionRegistry, TxStatus, TxType};
use crate::transaction::context::{GatewayAction, TxContext, TxSettings, write_tx_label};
use crate::transaction::key_keeper::{
    CoinSelector, KeyKeeper, LargestFirstSelector, MessageEndpoint, SignedTransaction,
};
use crate::transaction::parameters::{
    ParameterId, SetTxParameter, TxParameterStore, TxParameters, from_bytes,
};
use crate::utils::is_valid_timestamp;
use crate::wallet::WalletError;
use crate::wallet::ledger::CoinLedger;
use crate::wallet::storage::{
    ASSETS_ACTIVE_VAR, ASSETS_MAX_VAR, SHIELDED_INPUTS_VAR, SHIELDED_OUTPUTS_VAR, SYSTEM_STATE_VAR,
    VarStore, WalletStore,
};
use crate::wallet::sync::event_processor::EventProcessor;
use crate::wallet::sync::events::{EventDispatcher, WalletEvent, WalletEventHandler};
use crate::wallet::sync::multiplexer::{PendingRequest, RequestKey, RequestMultiplexer};
use crate::wallet::sync::progress_tracker::{SyncProgressTracker, SyncStats};
use crate::wallet::sync::rollback::RollbackHandler;
use crate::wallet::types::*;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Default maximum age of the tip timestamp, in seconds.
pub const DEFAULT_TIP_TIME_TOLERANCE: i64 = 600;
/// Default number of headers kept below the tip.
pub const DEFAULT_HISTORY_DEPTH: Height = 1440;
/// Default Events page size.
pub const DEFAULT_EVENTS_PAGE_MAX: usize = 64;

/// Formats `TxID[SubTxID]` for log lines outside a transaction context.
struct TxLabel(TxId, SubTxId);

impl fmt::Display for TxLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_tx_label(f, &self.0, self.1)
    }
}

fn key_keeper_mut(key_keeper: &mut Option<Box<dyn KeyKeeper>>) -> Option<&mut dyn KeyKeeper> {
    match key_keeper {
        Some(k) => {
            let k: &mut dyn KeyKeeper = k.as_mut();
            Some(k)
        }
        None => None,
    }
}

/// The wallet engine.
///
/// Owns the store, the active transactions and all pending node requests. Every entry point
/// takes `&mut self`; the async runner in [`super::service`] feeds node notifications in one at a
/// time.
pub struct Wallet {
    store: Box<dyn WalletStore>,
    settings: TxSettings,
    registry: TransactionRegistry,
    key_keeper: Option<Box<dyn KeyKeeper>>,
    coin_selector: Box<dyn CoinSelector>,

    // Collaborators
    network: Option<Box<dyn NodeNetwork>>,
    endpoints: Vec<Box<dyn MessageEndpoint>>,
    dispatcher: EventDispatcher,

    // Services
    multiplexer: RequestMultiplexer,
    event_processor: EventProcessor,
    progress: SyncProgressTracker,

    active: BTreeMap<TxId, BaseTransaction>,
    /// Updates ready to run, drained by `process_pending_updates`
    pending_updates: VecDeque<TxId>,
    /// Updates waiting for the end of the current sync round
    update_once_synced: BTreeSet<TxId>,
    /// Transactions waiting for the next tip
    next_tip: BTreeSet<TxId>,

    owned_nodes_online: usize,
    tip_time_tolerance: i64,
    history_depth: Height,
}

impl Wallet {
    /// Create a wallet over `store` with the built-in transaction types and no key keeper.
    pub fn new(store: Box<dyn WalletStore>, settings: TxSettings) -> Self {
        Self {
            store,
            settings,
            registry: TransactionRegistry::with_simple(),
            key_keeper: None,
            coin_selector: Box::new(LargestFirstSelector),
            network: None,
            endpoints: Vec::new(),
            dispatcher: EventDispatcher::new(),
            multiplexer: RequestMultiplexer::new(),
            event_processor: EventProcessor::new(DEFAULT_EVENTS_PAGE_MAX),
            progress: SyncProgressTracker::new(),
            active: BTreeMap::new(),
            pending_updates: VecDeque::new(),
            update_once_synced: BTreeSet::new(),
            next_tip: BTreeSet::new(),
            owned_nodes_online: 0,
            tip_time_tolerance: DEFAULT_TIP_TIME_TOLERANCE,
            history_depth: DEFAULT_HISTORY_DEPTH,
        }
    }

    /// Create a wallet with the engine settings taken from `config`.
    pub fn from_config(
        store: Box<dyn WalletStore>,
        config: &WalletConfig,
        my_id: WalletId,
    ) -> Self {
        let settings = TxSettings {
            my_id,
            max_kernel_validity: config.max_kernel_validity,
            coin_confirmations_offset: config.coin_confirmations_offset,
            maturity_std: config.maturity_std,
        };
        let mut wallet = Self::new(store, settings);
        wallet.event_processor = EventProcessor::new(config.events_page_max);
        wallet.tip_time_tolerance = config.tip_time_tolerance_secs;
        wallet.history_depth = config.history_depth;
        wallet
    }

    pub fn with_key_keeper(mut self, key_keeper: Box<dyn KeyKeeper>) -> Self {
        self.key_keeper = Some(key_keeper);
        self
    }

    pub fn with_coin_selector(mut self, coin_selector: Box<dyn CoinSelector>) -> Self {
        self.coin_selector = coin_selector;
        self
    }

    pub fn with_registry(mut self, registry: TransactionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn set_node_network(&mut self, network: Box<dyn NodeNetwork>) {
        self.network = Some(network);
    }

    pub fn add_message_endpoint(&mut self, endpoint: Box<dyn MessageEndpoint>) {
        self.endpoints.push(endpoint);
    }

    pub fn register_event_handler(&mut self, handler: Box<dyn WalletEventHandler>) {
        info!("Registering wallet event handler: {}", handler.name());
        self.dispatcher.register_handler(handler);
    }

    /// Abort every pending request and detach the node and the message endpoints.
    pub fn cleanup_network(&mut self) {
        self.multiplexer.abort_all();
        self.endpoints.clear();
        self.network = None;
    }

    pub fn store(&self) -> &dyn WalletStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn WalletStore {
        self.store.as_mut()
    }

    pub fn settings(&self) -> &TxSettings {
        &self.settings
    }

    pub fn multiplexer(&self) -> &RequestMultiplexer {
        &self.multiplexer
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.progress.get_stats()
    }

    pub fn tip_height(&self) -> Height {
        self.store.history().get_tip().map_or(0, |s| s.height)
    }

    /// Total value of unspent coins of `asset_id`.
    pub fn available_balance(&mut self, asset_id: AssetId) -> u64 {
        CoinLedger::new(self.store.as_mut())
            .available_coins(asset_id)
            .iter()
            .map(Coin::value)
            .sum()
    }

    pub fn is_active(&self, tx_id: &TxId) -> bool {
        self.active.contains_key(tx_id)
    }

    pub fn active_transactions(&self) -> impl Iterator<Item = &TxId> {
        self.active.keys()
    }

    pub fn visit_active_transactions(&self, mut visitor: impl FnMut(&TxId, &BaseTransaction)) {
        for (tx_id, tx) in &self.active {
            visitor(tx_id, tx);
        }
    }

    /// Route a node notification to its handler.
    pub fn handle_notification(&mut self, notification: NodeNotification) {
        match notification {
            NodeNotification::NewTip(state) => self.on_new_tip(state),
            NodeNotification::TipUnchanged => self.on_tip_unchanged(),
            NodeNotification::RolledBack(height) => self.on_rolled_back(height),
            NodeNotification::OwnedNode(connected) => self.on_owned_node(connected),
            NodeNotification::Response { id, result } => self.on_response(id, result),
        }
    }

    // ---------------------------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------------------------

    /// Store and activate a new transaction, then try to update it right away.
    pub fn start_transaction(&mut self, params: TxParameters) -> Result<TxId, WalletError> {
        let tx_type: TxType = params.get(ParameterId::TransactionType).ok_or_else(|| {
            WalletError::InvalidParameters("No transaction type".to_string())
        })?;
        let creator = self
            .registry
            .get(tx_type)
            .ok_or(WalletError::UnknownTransactionType(tx_type))?;
        let mut params = creator.check_and_complete_parameters(params)?;

        let tx_id = params.tx_id().unwrap_or_else(TxId::generate);
        params.set_tx_id(tx_id);
        if self.store.tx_type(&tx_id).is_some() {
            return Err(WalletError::InvalidParameters(format!(
                "Transaction {} already exists",
                tx_id
            )));
        }

        let tx = self.registry.construct(tx_type, tx_id)?;
        for (sub_tx_id, id, value) in params.iter() {
            self.store
                .set_tx_parameter(&tx_id, sub_tx_id, id, value.to_vec());
        }
        self.store.set_tx_param(
            &tx_id,
            DEFAULT_SUB_TX_ID,
            ParameterId::CreateTime,
            &chrono::Utc::now().timestamp(),
        )?;
        if params.get::<TxStatus>(ParameterId::Status).is_none() {
            self.store
                .set_tx_param(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::Status, &TxStatus::Pending)?;
        }
        if params.get::<WalletId>(ParameterId::MyId).is_none() {
            self.store
                .set_tx_param(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::MyId, &self.settings.my_id)?;
        }

        info!("{} Starting {:?} transaction", tx_id, tx_type);
        self.active.insert(tx_id, tx);
        self.schedule_update(&tx_id);
        self.process_pending_updates();
        Ok(tx_id)
    }

    pub fn can_cancel_transaction(&mut self, tx_id: &TxId) -> bool {
        self.with_active_tx(tx_id, |tx, ctx| tx.can_cancel(ctx))
            .unwrap_or(false)
    }

    pub fn cancel_transaction(&mut self, tx_id: &TxId) {
        info!("{} Canceling tx", tx_id);
        let canceled = self.with_active_tx(tx_id, |tx, ctx| {
            if let Err(e) = tx.cancel(ctx) {
                error!("{} Failed to cancel: {}", ctx, e);
            }
        });
        if canceled.is_none() {
            warn!("Transaction already inactive");
        }
        self.process_pending_updates();
    }

    /// Delete a stored transaction. Active transactions cannot be deleted.
    pub fn delete_transaction(&mut self, tx_id: &TxId) -> Result<(), WalletError> {
        info!("deleting tx {}", tx_id);
        if self.active.contains_key(tx_id) {
            warn!("Cannot delete running transaction");
            return Err(WalletError::TransactionActive(*tx_id));
        }
        self.store.delete_tx(tx_id);
        Ok(())
    }

    /// Schedule an update of an active transaction and run whatever is ready.
    pub fn update_transaction(&mut self, tx_id: &TxId) {
        self.schedule_update(tx_id);
        self.process_pending_updates();
    }

    /// Re-activate every stored transaction that has not reached a terminal status.
    ///
    /// Resumed transactions are updated once the wallet is in sync.
    pub fn resume_all_transactions(&mut self) -> usize {
        let mut resumed = 0;
        for desc in self.store.get_tx_history() {
            if !desc.status.can_resume() || self.active.contains_key(&desc.tx_id) {
                continue;
            }
            match self.registry.construct(desc.tx_type, desc.tx_id) {
                Ok(tx) => {
                    debug!("{} Resuming transaction in state {:?}", desc.tx_id, desc.status);
                    self.active.insert(desc.tx_id, tx);
                    self.update_once_synced.insert(desc.tx_id);
                    resumed += 1;
                }
                Err(e) => warn!("{} Unsupported type of transaction: {}", desc.tx_id, e),
            }
        }
        if resumed > 0 {
            info!("Resumed {} transactions", resumed);
        }
        resumed
    }

    /// Active transactions that are not yet past the point where the peer can be left alone.
    pub fn get_unsafe_active_transactions_count(&mut self) -> usize {
        let ids: Vec<TxId> = self.active.keys().copied().collect();
        ids.iter()
            .filter(|tx_id| {
                self.with_active_tx(tx_id, |tx, ctx| !tx.is_in_safety(ctx))
                    .unwrap_or(false)
            })
            .count()
    }

    /// Run every queued update, as long as the wallet stays in sync.
    pub fn process_pending_updates(&mut self) {
        while let Some(tx_id) = self.pending_updates.pop_front() {
            if !self.is_synced() {
                self.update_once_synced.insert(tx_id);
                self.update_once_synced.extend(self.pending_updates.drain(..));
                break;
            }
            self.with_active_tx(&tx_id, |tx, ctx| tx.update(ctx));
        }
    }

    /// Queue an update; it runs now if the wallet is in sync, otherwise once it is.
    fn schedule_update(&mut self, tx_id: &TxId) {
        if !self.active.contains_key(tx_id) {
            debug!("{} Unexpected event", tx_id);
            return;
        }
        if self.is_synced() {
            if !self.pending_updates.contains(tx_id) {
                self.pending_updates.push_back(*tx_id);
            }
        } else {
            self.update_once_synced.insert(*tx_id);
        }
    }

    /// Run `f` on an active transaction with a freshly built context, then execute the actions
    /// it recorded.
    fn with_active_tx<R>(
        &mut self,
        tx_id: &TxId,
        f: impl FnOnce(&mut BaseTransaction, &mut TxContext<'_>) -> R,
    ) -> Option<R> {
        let mut tx = self.active.remove(tx_id)?;
        let (result, actions) = {
            let mut ctx = TxContext::new(
                *tx_id,
                self.store.as_mut(),
                &self.settings,
                key_keeper_mut(&mut self.key_keeper),
                self.coin_selector.as_ref(),
            );
            let result = f(&mut tx, &mut ctx);
            (result, ctx.take_actions())
        };
        self.active.insert(*tx_id, tx);
        self.process_actions(tx_id, actions);
        Some(result)
    }

    fn process_actions(&mut self, tx_id: &TxId, actions: Vec<GatewayAction>) {
        for action in actions {
            match action {
                GatewayAction::ConfirmKernel {
                    sub_tx_id,
                    kernel_id,
                } => self.confirm_kernel(tx_id, sub_tx_id, kernel_id),
                GatewayAction::GetKernel {
                    sub_tx_id,
                    kernel_id,
                } => {
                    let request = NodeRequest::KernelDetails {
                        kernel_id,
                        fetch_body: true,
                    };
                    if self.post_request(RequestKey::Tx { tx_id: *tx_id, sub_tx_id }, request) {
                        info!(
                            "{} Get details for kernel: {}",
                            TxLabel(*tx_id, sub_tx_id),
                            kernel_id
                        );
                    }
                }
                GatewayAction::ConfirmAsset { sub_tx_id, target } => {
                    self.confirm_asset(*tx_id, sub_tx_id, target)
                }
                GatewayAction::RegisterTx {
                    sub_tx_id,
                    transaction,
                } => {
                    debug!("{} sending tx for registration", TxLabel(*tx_id, sub_tx_id));
                    self.post_request(
                        RequestKey::Tx { tx_id: *tx_id, sub_tx_id },
                        NodeRequest::Registration { transaction },
                    );
                }
                GatewayAction::GetShieldedList { start, count } => {
                    if self.post_request(
                        RequestKey::TxOnly(*tx_id),
                        NodeRequest::ShieldedList { start, count },
                    ) {
                        info!(
                            "{} Get shielded list, start_index = {}, count = {}",
                            tx_id, start, count
                        );
                    }
                }
                GatewayAction::GetShieldedOutputProof { public_key } => {
                    if self.post_request(
                        RequestKey::TxOnly(*tx_id),
                        NodeRequest::ShieldedOutputProof { public_key },
                    ) {
                        info!("{} Get proof of shielded output.", tx_id);
                    }
                }
                GatewayAction::SendTxParams { peer, message } => {
                    for endpoint in &mut self.endpoints {
                        endpoint.send(&peer, message.clone());
                    }
                }
                GatewayAction::UpdateOnNextTip => {
                    self.next_tip.insert(*tx_id);
                }
                GatewayAction::UpdateAsync => self.schedule_update(tx_id),
                GatewayAction::Completed => self.on_tx_completed(tx_id, false),
                GatewayAction::Failed => self.on_tx_completed(tx_id, true),
            }
        }
    }

    /// Post a kernel proof request, unless the kernel was already found missing at the current
    /// tip, in which case the transaction waits for the next one.
    fn confirm_kernel(&mut self, tx_id: &TxId, sub_tx_id: SubTxId, kernel_id: KernelId) {
        if !self.active.contains_key(tx_id) {
            return;
        }
        let unconfirmed: Height = self
            .store
            .get_tx_param(tx_id, sub_tx_id, ParameterId::KernelUnconfirmedHeight)
            .unwrap_or(0);
        if unconfirmed > 0 {
            let tip = self.store.history().get_tip().map(|s| s.height);
            if tip.is_none_or(|h| h == unconfirmed) {
                self.next_tip.insert(*tx_id);
                return;
            }
        }

        if self.post_request(
            RequestKey::Tx { tx_id: *tx_id, sub_tx_id },
            NodeRequest::KernelProof { kernel_id },
        ) {
            info!("{} Get proof for kernel: {}", TxLabel(*tx_id, sub_tx_id), kernel_id);
        }
    }

    fn confirm_asset(&mut self, tx_id: TxId, sub_tx_id: SubTxId, target: AssetRef) {
        let key = RequestKey::Asset {
            tx_id,
            sub_tx_id,
            target,
        };
        if self.post_request(key, NodeRequest::AssetProof { target }) {
            if tx_id.is_zero() {
                info!("Get proof for asset {:?}", target);
            } else {
                info!("{} Get proof for asset {:?}", TxLabel(tx_id, sub_tx_id), target);
            }
        }
    }

    /// Post through the multiplexer. A transaction whose request could not be sent waits for
    /// the next tip.
    fn post_request(&mut self, key: RequestKey, request: NodeRequest) -> bool {
        let kind = request.kind();
        let posted = self
            .multiplexer
            .post(key, request, self.network.as_deref_mut());
        if !posted && !self.multiplexer.is_pending(kind, &key) {
            if let Some(tx_id) = key.tx_id().filter(|id| self.active.contains_key(id)) {
                self.next_tip.insert(tx_id);
            }
        }
        posted
    }

    fn on_tx_completed(&mut self, tx_id: &TxId, failed: bool) {
        self.active.remove(tx_id);
        self.next_tip.remove(tx_id);
        self.update_once_synced.remove(tx_id);
        self.pending_updates.retain(|id| id != tx_id);

        let aborted = self.multiplexer.abort_for_tx(tx_id);
        if aborted > 0 {
            debug!("{} Aborted {} pending requests", tx_id, aborted);
        }
        CoinLedger::new(self.store.as_mut()).refresh_statuses();

        self.dispatcher.dispatch(&if failed {
            WalletEvent::TransactionFailed(*tx_id)
        } else {
            WalletEvent::TransactionCompleted(*tx_id)
        });

        if aborted > 0 {
            self.check_sync_done();
        }
    }

    /// Apply a parameter message from a peer.
    ///
    /// Messages for an active transaction are applied if they come from the recorded peer. A
    /// message for an unknown transaction starts an incoming payment.
    pub fn on_transaction_msg(&mut self, my_id: WalletId, msg: SetTxParameter) {
        if let Some(tx) = self.active.get(&msg.tx_id) {
            if tx.tx_type() != msg.tx_type {
                warn!("{} Parameters for invalid tx type", msg.tx_id);
                return;
            }

            match self
                .store
                .get_tx_param::<WalletId>(&msg.tx_id, DEFAULT_SUB_TX_ID, ParameterId::PeerAddr)
            {
                Some(peer) if peer != msg.from => {
                    debug!("{} Ignoring parameters from {}", msg.tx_id, msg.from);
                    return;
                }
                Some(_) => {}
                None => {
                    if self
                        .set_param(&msg.tx_id, DEFAULT_SUB_TX_ID, ParameterId::PeerAddr, &msg.from)
                        .is_err()
                    {
                        return;
                    }
                }
            }

            if self.apply_parameters(&msg.tx_id, &msg.parameters, false) {
                self.schedule_update(&msg.tx_id);
            }
            self.process_pending_updates();
            return;
        }

        if self.store.tx_type(&msg.tx_id).is_some() {
            debug!("{} This request has already been processed", msg.tx_id);
            return;
        }

        if msg.tx_type != TxType::Simple {
            warn!(
                "Unsupported TX Type requested via peer message: type: {:?} txid: {}",
                msg.tx_type, msg.tx_id
            );
            return;
        }

        // Only invitations can start a transaction.
        match msg.get_parameter::<bool>(ParameterId::IsSender) {
            Some(false) => {}
            Some(true) => {
                warn!("{} Incoming message claims to be from the receiver", msg.tx_id);
                return;
            }
            None => return,
        }

        if let Err(e) = self.accept_incoming(my_id, &msg) {
            error!("{} Failed to accept incoming transaction: {}", msg.tx_id, e);
        }
        self.process_pending_updates();
    }

    fn accept_incoming(
        &mut self,
        my_id: WalletId,
        msg: &SetTxParameter,
    ) -> Result<(), WalletError> {
        let tx = self.registry.construct(msg.tx_type, msg.tx_id)?;
        let tx_id = msg.tx_id;
        let store = self.store.as_mut();
        store.set_tx_param(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::TransactionType, &msg.tx_type)?;
        store.set_tx_param(
            &tx_id,
            DEFAULT_SUB_TX_ID,
            ParameterId::CreateTime,
            &chrono::Utc::now().timestamp(),
        )?;
        store.set_tx_param(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::MyId, &my_id)?;
        store.set_tx_param(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::PeerId, &msg.from)?;
        store.set_tx_param(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::PeerAddr, &msg.from)?;
        store.set_tx_param(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::IsInitiator, &false)?;
        store.set_tx_param(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::Status, &TxStatus::Pending)?;

        info!("{} Incoming transaction from {}", tx_id, msg.from);
        self.active.insert(tx_id, tx);
        self.apply_parameters(&tx_id, &msg.parameters, false);
        self.schedule_update(&tx_id);
        Ok(())
    }

    /// Store message parameters. `SubTxIndex` switches the target sub-transaction; private ids
    /// are skipped unless `allow_private`. Returns whether anything changed.
    fn apply_parameters(
        &mut self,
        tx_id: &TxId,
        parameters: &[(ParameterId, Vec<u8>)],
        allow_private: bool,
    ) -> bool {
        let mut sub_tx_id = DEFAULT_SUB_TX_ID;
        let mut changed = false;
        for (id, value) in parameters {
            if *id == ParameterId::SubTxIndex {
                match from_bytes::<SubTxId>(value) {
                    Some(sub) => sub_tx_id = sub,
                    None => warn!("{} Malformed sub transaction index", tx_id),
                }
                continue;
            }
            if allow_private || id.is_public() {
                changed |= self
                    .store
                    .set_tx_parameter(tx_id, sub_tx_id, *id, value.clone());
            } else {
                warn!(
                    "{} Attempt to set private tx parameter {:?}",
                    TxLabel(*tx_id, sub_tx_id),
                    id
                );
            }
        }
        changed
    }

    // ---------------------------------------------------------------------------------------
    // Node notifications
    // ---------------------------------------------------------------------------------------

    pub fn on_new_tip(&mut self, state: ChainState) {
        self.store.history_mut().add_states(std::slice::from_ref(&state));
        self.store.history_mut().shrink(self.history_depth);

        let Some(tip) = self.store.history().get_tip().cloned() else {
            return;
        };
        // Maturity depends on the tip
        CoinLedger::new(self.store.as_mut()).refresh_statuses();
        if tip.height == 0 {
            return;
        }
        info!("Sync up to {}", tip);

        self.request_events();
        self.request_state_summary();

        let waiting = std::mem::take(&mut self.next_tip);
        self.update_once_synced.extend(waiting);

        self.check_sync_done();
        self.process_pending_updates();
    }

    pub fn on_tip_unchanged(&mut self) {
        info!("Tip has not been changed");
        self.check_sync_done();
        self.process_pending_updates();
    }

    /// The node switched to a branch that forks at `height`.
    pub fn on_rolled_back(&mut self, height: Height) {
        let outcome = RollbackHandler::new(
            self.store.as_mut(),
            &self.settings,
            &self.registry,
            self.coin_selector.as_ref(),
        )
        .on_rolled_back(height, &mut self.active);

        match outcome {
            Ok(outcome) => {
                self.progress.record_rollback();
                for (tx_id, actions) in outcome.actions {
                    self.process_actions(&tx_id, actions);
                }
                if outcome.reactivated > 0 {
                    info!("{} transactions re-activated by rollback", outcome.reactivated);
                }
                self.update_once_synced.extend(outcome.requeue);
                CoinLedger::new(self.store.as_mut()).refresh_statuses();
                self.dispatcher
                    .dispatch(&WalletEvent::RolledBack { height });
            }
            Err(e) => error!("Failed to roll back to {}: {}", height, e),
        }
    }

    pub fn on_owned_node(&mut self, connected: bool) {
        if connected {
            self.owned_nodes_online += 1;
            if self.owned_nodes_online == 1 {
                self.request_events();
            }
        } else if self.owned_nodes_online > 0 {
            self.owned_nodes_online -= 1;
            if self.owned_nodes_online == 0 {
                self.abort_events();
            }
        }
        self.dispatcher
            .dispatch(&WalletEvent::OwnedNode { connected });
        self.process_pending_updates();
    }

    /// Deliver the node's answer to request `id`.
    ///
    /// Answers to requests that were aborted or already answered are dropped. A transport failure
    /// never reaches the kind handler; the owning transaction retries on the next tip.
    pub fn on_response(&mut self, id: RequestId, result: Result<NodeResponse, NodeError>) {
        let syncing = self.multiplexer.sync_remains() > 0;
        let Some(pending) = self.multiplexer.complete(id) else {
            debug!("Dropping response to stale request {}", id);
            return;
        };

        match result {
            Ok(response) if response.kind() == pending.kind() => {
                self.handle_response(pending, response)
            }
            Ok(response) => {
                warn!(
                    "Request {} expected {:?}, node answered {:?}",
                    id,
                    pending.kind(),
                    response.kind()
                );
                self.wait_next_tip(&pending);
            }
            Err(e) => {
                warn!("{:?} request {} failed: {}", pending.kind(), id, e);
                self.wait_next_tip(&pending);
            }
        }

        if syncing {
            self.check_sync_done();
        }
        self.process_pending_updates();
    }

    fn wait_next_tip(&mut self, pending: &PendingRequest) {
        if let Some(tx_id) = pending.key.tx_id().filter(|id| self.active.contains_key(id)) {
            self.next_tip.insert(tx_id);
        }
    }

    fn handle_response(&mut self, pending: PendingRequest, response: NodeResponse) {
        let key = pending.key;
        match (pending.request, response) {
            (_, NodeResponse::UtxoProof { proofs }) => {
                let RequestKey::Coin(coin) = key else {
                    return;
                };
                // Multiple proofs for one commitment are not handled.
                let Some(proof) = proofs.first() else {
                    return;
                };
                let active: Vec<TxId> = self.active.keys().copied().collect();
                EventProcessor::process_utxo(
                    self.store.as_mut(),
                    &UtxoEvent {
                        coin,
                        maturity: proof.maturity,
                        added: true,
                    },
                    proof.maturity,
                    &active,
                );
            }
            (_, NodeResponse::KernelProof { proof }) => self.on_kernel_proof(key, proof),
            (
                NodeRequest::KernelDetails { kernel_id, .. },
                NodeResponse::KernelDetails { kernel },
            ) => {
                let (Some(tx_id), Some(sub_tx_id)) = (key.tx_id(), key.sub_tx_id()) else {
                    return;
                };
                if !self.active.contains_key(&tx_id) {
                    return;
                }
                let result = match kernel {
                    Some(details) => self
                        .set_param(&tx_id, sub_tx_id, ParameterId::Kernel, &SignedTransaction {
                            kernel_id,
                            body: details.body,
                        })
                        .and_then(|_| {
                            self.set_param(
                                &tx_id,
                                sub_tx_id,
                                ParameterId::KernelProofHeight,
                                &details.height,
                            )
                        }),
                    None => {
                        let tip = self.tip_height();
                        self.set_param(
                            &tx_id,
                            sub_tx_id,
                            ParameterId::KernelUnconfirmedHeight,
                            &tip,
                        )
                    }
                };
                if result.is_ok() {
                    self.schedule_update(&tx_id);
                }
            }
            (NodeRequest::AssetProof { target }, NodeResponse::AssetProof { asset }) => {
                self.on_asset_proof(key, target, asset)
            }
            (NodeRequest::Events { start_height }, NodeResponse::Events { events }) => {
                self.on_events(start_height, events)
            }
            (_, NodeResponse::ShieldedList { items }) => {
                if let Some(tx_id) = key.tx_id() {
                    if self
                        .set_param(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::ShieldedList, &items)
                        .is_ok()
                    {
                        self.schedule_update(&tx_id);
                    }
                }
            }
            (_, NodeResponse::ShieldedOutputProof { proof }) => {
                if let Some(tx_id) = key.tx_id() {
                    if self
                        .set_param(
                            &tx_id,
                            DEFAULT_SUB_TX_ID,
                            ParameterId::ShieldedOutputProof,
                            &proof,
                        )
                        .is_ok()
                    {
                        self.schedule_update(&tx_id);
                    }
                }
            }
            (_, NodeResponse::Registration { status, extra_info }) => {
                let (Some(tx_id), Some(sub_tx_id)) = (key.tx_id(), key.sub_tx_id()) else {
                    return;
                };
                info!(
                    "{} Registration result: {:?} {}",
                    TxLabel(tx_id, sub_tx_id),
                    status,
                    extra_info
                );
                let stored = self
                    .set_param(&tx_id, sub_tx_id, ParameterId::TransactionRegistered, &status)
                    .and_then(|_| {
                        self.set_param(
                            &tx_id,
                            sub_tx_id,
                            ParameterId::TransactionRegisteredExtraInfo,
                            &extra_info,
                        )
                    })
                    .and_then(|_| {
                        self.set_param(
                            &tx_id,
                            sub_tx_id,
                            ParameterId::TransactionRegisteredInternal,
                            &(status == crate::node::RegistrationStatus::Ok),
                        )
                    });
                if stored.is_ok() {
                    self.schedule_update(&tx_id);
                }
            }
            (_, NodeResponse::StateSummary(summary)) => {
                let stored = self
                    .store
                    .set_var_value(SHIELDED_OUTPUTS_VAR, &summary.shielded_outputs)
                    .and_then(|_| {
                        self.store
                            .set_var_value(SHIELDED_INPUTS_VAR, &summary.shielded_inputs)
                    })
                    .and_then(|_| self.store.set_var_value(ASSETS_MAX_VAR, &summary.assets_max))
                    .and_then(|_| {
                        self.store
                            .set_var_value(ASSETS_ACTIVE_VAR, &summary.assets_active)
                    });
                if let Err(e) = stored {
                    error!("Failed to store state summary: {}", e);
                }
            }
            (request, response) => {
                warn!(
                    "Unexpected {:?} answer to {:?} request",
                    response.kind(),
                    request.kind()
                );
            }
        }
    }

    fn on_kernel_proof(&mut self, key: RequestKey, proof: Option<crate::node::KernelProof>) {
        if let Some(proof) = &proof {
            self.store
                .history_mut()
                .add_states(std::slice::from_ref(&proof.state));
        }

        let (Some(tx_id), Some(sub_tx_id)) = (key.tx_id(), key.sub_tx_id()) else {
            return;
        };
        if !self.active.contains_key(&tx_id) {
            return;
        }

        match proof {
            Some(proof) => {
                if let Ok(true) = self.set_param(
                    &tx_id,
                    sub_tx_id,
                    ParameterId::KernelProofHeight,
                    &proof.height(),
                ) {
                    self.schedule_update(&tx_id);
                }
            }
            None => {
                let tip = self.tip_height();
                if self
                    .set_param(&tx_id, sub_tx_id, ParameterId::KernelUnconfirmedHeight, &tip)
                    .is_ok()
                {
                    self.schedule_update(&tx_id);
                }
            }
        }
    }

    fn on_asset_proof(
        &mut self,
        key: RequestKey,
        target: AssetRef,
        asset: Option<crate::node::AssetProof>,
    ) {
        let RequestKey::Asset {
            tx_id, sub_tx_id, ..
        } = key
        else {
            return;
        };
        let tip = self.tip_height();

        let stored = match asset {
            Some(proof) => {
                let info = proof.info;
                let is_owned = self
                    .store
                    .find_asset(info.id)
                    .is_some_and(|a| a.is_owned);
                let mut asset = WalletAsset::new(info.clone(), tip);
                asset.is_owned = is_owned;
                self.store.save_asset(&asset);
                info!("Received proof for Asset with ID {}", info.id);

                if tx_id.is_zero() {
                    return;
                }
                self.set_param(&tx_id, sub_tx_id, ParameterId::AssetConfirmedHeight, &tip)
                    .and_then(|_| {
                        self.set_param(&tx_id, sub_tx_id, ParameterId::AssetInfoFull, &info)
                    })
                    .and_then(|_| {
                        self.set_param(
                            &tx_id,
                            sub_tx_id,
                            ParameterId::AssetUnconfirmedHeight,
                            &0u64,
                        )
                    })
            }
            None => {
                let dropped = match target {
                    AssetRef::Id(id) => Some(id),
                    AssetRef::Owner(owner) => self
                        .store
                        .assets()
                        .into_iter()
                        .find(|a| a.info.owner == owner)
                        .map(|a| a.info.id),
                };
                if let Some(id) = dropped {
                    if self.store.drop_asset(id) {
                        info!("Asset {} is not known to the node, dropped", id);
                    }
                }

                if tx_id.is_zero() {
                    return;
                }
                self.set_param(&tx_id, sub_tx_id, ParameterId::AssetConfirmedHeight, &0u64)
                    .and_then(|_| {
                        self.set_param(
                            &tx_id,
                            sub_tx_id,
                            ParameterId::AssetInfoFull,
                            &AssetInfo::default(),
                        )
                    })
                    .and_then(|_| {
                        self.set_param(&tx_id, sub_tx_id, ParameterId::AssetUnconfirmedHeight, &tip)
                    })
            }
        };

        if stored.is_ok() && self.active.contains_key(&tx_id) {
            self.schedule_update(&tx_id);
        }
    }

    fn on_events(&mut self, start_height: Height, events: Vec<crate::node::ChainEvent>) {
        let active: Vec<TxId> = self.active.keys().copied().collect();
        match self
            .event_processor
            .apply(self.store.as_mut(), &events, &active)
        {
            Ok(page) => {
                debug!(
                    "Applied {} events from height {}, next event height {}",
                    page.applied,
                    start_height,
                    self.store.next_event_height()
                );
                let up_to = page.last_height.unwrap_or_else(|| self.tip_height());
                self.progress.record_events(page.applied, up_to);
                if page.more {
                    self.request_events();
                }
            }
            Err(e) => error!("Failed to apply events from height {}: {}", start_height, e),
        }
    }

    fn set_param<T: serde::Serialize + ?Sized>(
        &mut self,
        tx_id: &TxId,
        sub_tx_id: SubTxId,
        id: ParameterId,
        value: &T,
    ) -> Result<bool, WalletError> {
        self.store
            .set_tx_param(tx_id, sub_tx_id, id, value)
            .inspect_err(|e| error!("{} Failed to set {:?}: {}", TxLabel(*tx_id, sub_tx_id), id, e))
    }

    // ---------------------------------------------------------------------------------------
    // Sync
    // ---------------------------------------------------------------------------------------

    /// Request the next page of events, if an owned node is online and the cursor is not past
    /// the tip.
    pub fn request_events(&mut self) {
        if self.owned_nodes_online == 0 {
            return;
        }

        let start_height = self.store.next_event_height();
        if start_height > self.tip_height() {
            return;
        }

        if let Some(pending) = self.multiplexer.get(RequestKind::Events, &RequestKey::Singleton) {
            if pending.request == (NodeRequest::Events { start_height }) {
                return;
            }
            self.abort_events();
        }

        self.post_request(RequestKey::Singleton, NodeRequest::Events { start_height });
    }

    fn abort_events(&mut self) {
        self.multiplexer
            .abort(RequestKind::Events, RequestKey::Singleton);
    }

    fn request_state_summary(&mut self) {
        self.post_request(RequestKey::Singleton, NodeRequest::StateSummary);
    }

    /// Ask the node for the inclusion proof of one of our outputs.
    pub fn request_utxo_proof(&mut self, coin: CoinId, commitment: Commitment) -> bool {
        debug!("Get utxo proof: {}", commitment);
        self.post_request(RequestKey::Coin(coin), NodeRequest::UtxoProof { commitment })
    }

    /// Request metadata of an asset on behalf of the wallet rather than a transaction.
    pub fn confirm_wallet_asset(&mut self, asset_id: AssetId) {
        self.confirm_asset(TxId::default(), DEFAULT_SUB_TX_ID, AssetRef::Id(asset_id));
    }

    /// Drop every coin, keep the outputs of active transactions and fetch all events again.
    pub fn rescan(&mut self) -> Result<(), WalletError> {
        info!("Rescanning the chain");
        self.abort_events();

        let mut coins = Vec::new();
        let mut shielded = Vec::new();
        {
            let mut ledger = CoinLedger::new(self.store.as_mut());
            for tx_id in self.active.keys() {
                coins.extend(ledger.coins_created_by(tx_id));
            }
        }
        for coin in self.store.shielded_coins() {
            if coin
                .create_tx_id
                .is_some_and(|id| self.active.contains_key(&id))
            {
                shielded.push(coin);
            }
        }

        self.store.clear_coins();
        self.store.clear_shielded_coins();
        for coin in &coins {
            self.store.save_coin(coin);
        }
        for coin in &shielded {
            self.store.save_shielded_coin(coin);
        }

        self.store.set_next_event_height(0)?;
        self.request_events();
        Ok(())
    }

    /// Sync-critical requests still outstanding.
    pub fn sync_remains(&self) -> usize {
        self.multiplexer.sync_remains()
    }

    /// Whether the node is usable for transactions. Without a node the wallet works air-gapped.
    pub fn is_node_in_sync(&self) -> bool {
        match &self.network {
            Some(network) => network.is_node_in_sync() && self.is_wallet_in_sync(),
            None => true,
        }
    }

    /// Whether the last fully synchronized tip is recent.
    pub fn is_wallet_in_sync(&self) -> bool {
        match self.store.get_var_value::<ChainState>(SYSTEM_STATE_VAR) {
            Some(state) if state.height > 0 => {
                is_valid_timestamp(state.timestamp, self.tip_time_tolerance)
            }
            _ => false,
        }
    }

    fn is_synced(&self) -> bool {
        self.multiplexer.sync_remains() == 0 && self.is_node_in_sync()
    }

    fn report_sync_progress(&mut self) {
        let total = self.multiplexer.sync_total();
        if total == 0 {
            return;
        }
        if let Some((done, total)) = self.progress.report(total, self.multiplexer.sync_remains()) {
            self.dispatcher
                .dispatch(&WalletEvent::SyncProgress { done, total });
        }
    }

    fn check_sync_done(&mut self) {
        self.report_sync_progress();
        if self.multiplexer.sync_remains() > 0 {
            return;
        }

        self.multiplexer.reset_sync_total();
        self.progress.complete_round();
        self.save_known_state();
    }

    fn save_known_state(&mut self) {
        let tip = self.store.history().get_tip().cloned();
        let height = tip.as_ref().map_or(0, |s| s.height);
        if let Some(state) = &tip {
            if let Err(e) = self.store.set_var_value(SYSTEM_STATE_VAR, state) {
                error!("Failed to store the current state: {}", e);
            }
            info!("Current state is {}", state);
        }

        if let Some((done, total)) = self.progress.report(0, 0) {
            self.dispatcher
                .dispatch(&WalletEvent::SyncProgress { done, total });
        }
        self.dispatcher
            .dispatch(&WalletEvent::SyncCompleted { height });

        // Not ready to process transactions while the node lags behind.
        if !tip.is_some_and(|s| is_valid_timestamp(s.timestamp, self.tip_time_tolerance)) {
            return;
        }

        let waiting = std::mem::take(&mut self.update_once_synced);
        for tx_id in waiting {
            self.schedule_update(&tx_id);
        }

        let missing = CoinLedger::new(self.store.as_mut()).missing_assets();
        for asset_id in missing {
            self.confirm_wallet_asset(asset_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::sync::events::EventCollector;
    use crate::wallet::storage::MemoryWalletStore;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Posted = Rc<RefCell<Vec<(RequestId, NodeRequest)>>>;

    struct RecordingNetwork(Posted);

    impl NodeNetwork for RecordingNetwork {
        fn post_request(&mut self, id: RequestId, request: &NodeRequest) -> Result<(), NodeError> {
            self.0.borrow_mut().push((id, request.clone()));
            Ok(())
        }
    }

    fn state(height: Height) -> ChainState {
        ChainState {
            height,
            hash: BlockHash([height as u8; 32]),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    fn connected_wallet() -> (Wallet, Posted) {
        let posted = Posted::default();
        let mut wallet = Wallet::new(Box::new(MemoryWalletStore::new()), TxSettings::default());
        wallet.set_node_network(Box::new(RecordingNetwork(posted.clone())));
        wallet.on_owned_node(true);
        (wallet, posted)
    }

    fn take(posted: &Posted) -> Vec<(RequestId, NodeRequest)> {
        std::mem::take(&mut *posted.borrow_mut())
    }

    #[test]
    fn new_tip_requests_events_and_summary_once() {
        let (mut wallet, posted) = connected_wallet();

        wallet.on_new_tip(state(10));
        wallet.on_tip_unchanged();
        let kinds: Vec<_> = take(&posted).into_iter().map(|(_, r)| r.kind()).collect();
        assert_eq!(kinds, vec![RequestKind::Events, RequestKind::StateSummary]);
        assert_eq!(wallet.sync_remains(), 2);
        assert!(!wallet.is_wallet_in_sync());
    }

    #[test]
    fn sync_round_completes_and_saves_state() {
        let (mut wallet, posted) = connected_wallet();
        let (collector, events) = EventCollector::shared();
        wallet.register_event_handler(Box::new(collector));

        wallet.on_new_tip(state(10));
        for (id, request) in take(&posted) {
            let response = match request {
                NodeRequest::Events { .. } => NodeResponse::Events { events: vec![] },
                _ => NodeResponse::StateSummary(Default::default()),
            };
            wallet.on_response(id, Ok(response));
        }

        assert_eq!(wallet.sync_remains(), 0);
        assert!(wallet.is_wallet_in_sync());
        assert_eq!(wallet.store().next_event_height(), 11);
        assert!(events
            .borrow()
            .contains(&WalletEvent::SyncCompleted { height: 10 }));
        assert!(events
            .borrow()
            .contains(&WalletEvent::SyncProgress { done: 2, total: 2 }));
    }

    #[test]
    fn events_are_not_requested_past_the_tip_or_without_node() {
        let (mut wallet, posted) = connected_wallet();
        // Cursor 0, tip unknown: the first page is requested.
        assert_eq!(take(&posted).len(), 1);

        wallet.store_mut().set_next_event_height(5).unwrap();
        wallet.request_events();
        assert!(take(&posted).is_empty());

        wallet.on_owned_node(false);
        assert_eq!(wallet.sync_remains(), 0);
        wallet.store_mut().history_mut().add_states(&[state(9)]);
        wallet.request_events();
        assert!(take(&posted).is_empty());
    }

    #[test]
    fn pending_events_for_another_height_are_replaced() {
        let (mut wallet, posted) = connected_wallet();
        let (first, _) = take(&posted).remove(0);
        wallet.store_mut().history_mut().add_states(&[state(9)]);
        wallet.store_mut().set_next_event_height(4).unwrap();
        wallet.request_events();

        let requests = take(&posted);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1, NodeRequest::Events { start_height: 4 });
        let pending = wallet
            .multiplexer()
            .get(RequestKind::Events, &RequestKey::Singleton)
            .map(|p| p.id);
        assert_eq!(pending, Some(requests[0].0));
        assert_ne!(pending, Some(first));
        assert_eq!(wallet.multiplexer().len(), 1);
    }

    #[test]
    fn stale_response_is_dropped() {
        let (mut wallet, posted) = connected_wallet();
        let (id, _) = take(&posted).remove(0);
        wallet.on_owned_node(false);
        wallet.on_response(
            id,
            Ok(NodeResponse::Events {
                events: vec![crate::node::ChainEvent::utxo(
                    1,
                    CoinId::new(1, KeyType::Regular, 5),
                    1,
                    true,
                )],
            }),
        );
        assert!(wallet.store().coins().is_empty());
    }

    #[test]
    fn wallet_asset_confirmation_updates_table() {
        let (mut wallet, posted) = connected_wallet();
        take(&posted);
        wallet.store_mut().history_mut().add_states(&[state(30)]);
        wallet.confirm_wallet_asset(7);
        let (id, request) = take(&posted).remove(0);
        assert_eq!(
            request,
            NodeRequest::AssetProof {
                target: AssetRef::Id(7)
            }
        );

        let info = AssetInfo {
            id: 7,
            ..AssetInfo::default()
        };
        wallet.on_response(
            id,
            Ok(NodeResponse::AssetProof {
                asset: Some(crate::node::AssetProof {
                    info,
                    proof: vec![],
                }),
            }),
        );
        assert_eq!(wallet.store().find_asset(7).map(|a| a.refresh_height), Some(30));
        assert!(wallet.store().tx_ids().is_empty());
    }

    #[test]
    fn deleting_active_transaction_is_refused() {
        let mut wallet = Wallet::new(Box::new(MemoryWalletStore::new()), TxSettings::default());
        let tx_id = TxId([9; 16]);
        wallet
            .store_mut()
            .set_tx_param(&tx_id, 0, ParameterId::TransactionType, &TxType::Simple)
            .unwrap();
        wallet
            .store_mut()
            .set_tx_param(&tx_id, 0, ParameterId::Status, &TxStatus::InProgress)
            .unwrap();

        assert_eq!(wallet.resume_all_transactions(), 1);
        assert!(matches!(
            wallet.delete_transaction(&tx_id),
            Err(WalletError::TransactionActive(_))
        ));
    }
}
