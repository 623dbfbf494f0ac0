//! Transaction lifecycle shared by every transaction type.
//!
//! [`BaseTransaction`] wraps a type-specific [`TransactionBehavior`] and owns the engine-level
//! rules: external failure checks, expiry, cancellation, failure handling with coin rollback and
//! reorg rollback. The lifecycle helpers the behaviors call from `update_impl` live on
//! [`TxContext`].

use crate::node::AssetRef;
use crate::transaction::context::{GatewayAction, TxContext};
use crate::transaction::key_keeper::KeyKeeperError;
use crate::transaction::parameters::{ParameterId, SetTxParameter, TxParameters};
use crate::wallet::WalletError;
use crate::wallet::types::*;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TxType {
    Simple,
    AssetIssue,
    AssetConsume,
    AssetReg,
    AssetUnreg,
    AssetInfo,
    PushTransaction,
    Contract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    InProgress,
    Canceled,
    Completed,
    Failed,
    Registering,
    /// Kernel is on chain, waiting for the configured number of confirmations.
    Confirming,
}

impl TxStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxStatus::Canceled | TxStatus::Completed | TxStatus::Failed
        )
    }

    /// Statuses a stored transaction is resumed from at start-up.
    pub fn can_resume(self) -> bool {
        matches!(
            self,
            TxStatus::Pending | TxStatus::InProgress | TxStatus::Registering | TxStatus::Confirming
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum FailureReason {
    #[error("Unexpected reason")]
    Unknown,
    #[error("Transaction cancelled")]
    Canceled,
    #[error("Receiver signature is not valid")]
    InvalidPeerSignature,
    #[error("Failed to register transaction with the blockchain")]
    FailedToRegister,
    #[error("Transaction is not valid")]
    InvalidTransaction,
    #[error("Invalid kernel proof provided")]
    InvalidKernelProof,
    #[error("Failed to send transaction parameters")]
    FailedToSendParameters,
    #[error("Not enough inputs to process the transaction")]
    NoInputs,
    #[error("Failed to get transaction parameters")]
    FailedToGetParameter,
    #[error("Transaction timed out")]
    TransactionExpired,
    #[error("Kernel maximum height is too high")]
    MaxHeightIsUnacceptable,
    #[error("Transaction has invalid state")]
    InvalidState,
    #[error("Subtransaction has failed")]
    SubTxFailed,
    #[error("Fee is too small")]
    FeeIsTooSmall,
    #[error("Kernel's min height is unacceptable")]
    MinHeightIsUnacceptable,
    #[error("Key keeper is not initialized")]
    NoKeyKeeper,
    #[error("No valid asset id/asset owner id")]
    NoAssetId,
    #[error("No asset info or asset info is not valid")]
    NoAssetInfo,
    #[error("Invalid asset id")]
    InvalidAssetId,
    #[error("Failed to receive asset confirmation")]
    AssetConfirmFailed,
    #[error("Asset is still locked")]
    AssetLocked,
    #[error("Master key is needed for this transaction, but unavailable")]
    NoMasterKey,
    #[error("Key keeper malfunctioned")]
    KeyKeeperError,
    #[error("Aborted by the user")]
    KeyKeeperUserAbort,
    #[error("Key keeper out of slots")]
    KeyKeeperNoSlots,
    #[error("Asset transactions are disabled in the wallet")]
    AssetsDisabledInWallet,
    #[error("Asset transactions are disabled in the receiver wallet")]
    AssetsDisabledReceiver,
}

/// Typed failure signal returned from `update_impl`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct TransactionFailed {
    pub reason: FailureReason,
    /// Relay the failure to the counterparty.
    pub notify: bool,
    pub message: String,
}

impl TransactionFailed {
    pub fn new(reason: FailureReason, notify: bool) -> Self {
        Self {
            reason,
            notify,
            message: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl From<WalletError> for TransactionFailed {
    fn from(e: WalletError) -> Self {
        TransactionFailed::new(FailureReason::Unknown, false).with_message(e.to_string())
    }
}

impl From<KeyKeeperError> for TransactionFailed {
    fn from(e: KeyKeeperError) -> Self {
        let reason = match e {
            KeyKeeperError::UserAbort => FailureReason::KeyKeeperUserAbort,
            KeyKeeperError::NoSlots => FailureReason::KeyKeeperNoSlots,
            KeyKeeperError::Failed(_) => FailureReason::KeyKeeperError,
        };
        TransactionFailed::new(reason, true).with_message(e.to_string())
    }
}

/// Type-specific part of a transaction.
pub trait TransactionBehavior {
    fn tx_type(&self) -> TxType;

    /// Advance the transaction as far as currently possible.
    fn update_impl(&mut self, ctx: &mut TxContext<'_>) -> Result<(), TransactionFailed>;

    /// React to a chain rollback to `height`. Returns whether the transaction was affected.
    fn rollback(
        &mut self,
        ctx: &mut TxContext<'_>,
        height: Height,
    ) -> Result<bool, TransactionFailed> {
        ctx.rollback_kernel_proof(height)
    }

    /// Whether the transaction reached a point where it no longer needs this wallet online.
    fn is_in_safety(&self, ctx: &TxContext<'_>) -> bool {
        matches!(
            ctx.status(),
            Some(TxStatus::Registering) | Some(TxStatus::Confirming)
        )
    }

    fn can_cancel(&self, ctx: &TxContext<'_>) -> bool {
        matches!(
            ctx.status(),
            Some(TxStatus::Pending) | Some(TxStatus::InProgress)
        )
    }
}

/// State machine wrapper around a transaction behavior.
pub struct BaseTransaction {
    tx_id: TxId,
    behavior: Box<dyn TransactionBehavior>,
}

impl BaseTransaction {
    pub fn new(tx_id: TxId, behavior: Box<dyn TransactionBehavior>) -> Self {
        Self { tx_id, behavior }
    }

    pub fn tx_id(&self) -> &TxId {
        &self.tx_id
    }

    pub fn tx_type(&self) -> TxType {
        self.behavior.tx_type()
    }

    pub fn update(&mut self, ctx: &mut TxContext<'_>) {
        if let Err(e) = self.try_update(ctx) {
            if !e.message.is_empty() {
                error!("{} exception msg: {}", ctx, e.message);
            }
            if let Err(e) = ctx.on_failed(e.reason, e.notify) {
                error!("{} failed to record failure: {}", ctx, e);
            }
        }
    }

    fn try_update(&mut self, ctx: &mut TxContext<'_>) -> Result<(), TransactionFailed> {
        if ctx.check_external_failures()? {
            return Ok(());
        }

        self.behavior.update_impl(ctx)?;

        ctx.check_expired()?;
        ctx.set(ParameterId::ModifyTime, &chrono::Utc::now().timestamp())?;
        Ok(())
    }

    pub fn can_cancel(&self, ctx: &TxContext<'_>) -> bool {
        self.behavior.can_cancel(ctx)
    }

    /// Cancel a transaction that has not reached registration.
    pub fn cancel(&mut self, ctx: &mut TxContext<'_>) -> Result<(), TransactionFailed> {
        match ctx.status() {
            Some(status @ (TxStatus::Pending | TxStatus::InProgress)) => {
                if status == TxStatus::InProgress {
                    ctx.notify_failure(FailureReason::Canceled)?;
                }
                ctx.rollback_tx();
                ctx.set_status(TxStatus::Canceled)?;
                ctx.push(GatewayAction::Failed);
                Ok(())
            }
            status => {
                info!("{} You cannot cancel transaction in state: {:?}", ctx, status);
                Ok(())
            }
        }
    }

    pub fn rollback(&mut self, ctx: &mut TxContext<'_>, height: Height) -> bool {
        match self.behavior.rollback(ctx, height) {
            Ok(affected) => affected,
            Err(e) => {
                error!("{} rollback failed: {}", ctx, e);
                false
            }
        }
    }

    pub fn is_in_safety(&self, ctx: &TxContext<'_>) -> bool {
        self.behavior.is_in_safety(ctx)
    }
}

impl TxContext<'_> {
    pub fn is_sender(&self) -> bool {
        self.get(ParameterId::IsSender).unwrap_or(false)
    }

    pub fn set_status(&mut self, status: TxStatus) -> Result<bool, TransactionFailed> {
        self.set(ParameterId::Status, &status)
    }

    /// Apply a failure reported by the peer. Returns `true` when the update must stop here.
    pub fn check_external_failures(&mut self) -> Result<bool, TransactionFailed> {
        let Some(mut reason) = self.get::<FailureReason>(ParameterId::FailureReason) else {
            return Ok(false);
        };

        match self.get_mandatory::<TxStatus>(ParameterId::Status)? {
            TxStatus::Pending | TxStatus::InProgress => {
                if reason == FailureReason::AssetsDisabledInWallet && self.is_sender() {
                    reason = FailureReason::AssetsDisabledReceiver;
                }
                self.on_failed(reason, false)?;
                Ok(true)
            }
            TxStatus::Failed | TxStatus::Canceled => Ok(true),
            _ => Ok(false),
        }
    }

    /// Height after which the kernel can no longer be mined, if known.
    pub fn expiry_limit(&self) -> Option<Height> {
        self.get::<Height>(ParameterId::MaxHeight)
            .or_else(|| self.get(ParameterId::PeerResponseHeight))
            .or_else(|| {
                self.get::<Height>(ParameterId::MinHeight)
                    .and_then(|h| h.checked_add(self.settings().max_kernel_validity))
            })
    }

    /// Fail the transaction with `TransactionExpired` once its kernel can no longer make it
    /// on chain. Returns whether it expired.
    pub fn check_expired(&mut self) -> Result<bool, TransactionFailed> {
        if self.status().is_some_and(TxStatus::is_terminal) {
            return Ok(false);
        }
        let Some(max_height) = self.expiry_limit() else {
            return Ok(false);
        };

        let registered = self
            .get::<crate::node::RegistrationStatus>(ParameterId::TransactionRegistered)
            .is_some();
        let has_kernel = self.get::<KernelId>(ParameterId::KernelId).is_some();

        if (!registered && self.is_sender()) || !has_kernel {
            let tip = self.tip_height();
            if self.tip().is_some() && tip > max_height {
                info!(
                    "{} Transaction expired. Current height: {}, max kernel height: {}",
                    self, tip, max_height
                );
                self.on_failed(FailureReason::TransactionExpired, false)?;
                return Ok(true);
            }
        } else {
            let unconfirmed: Height = self.get(ParameterId::KernelUnconfirmedHeight).unwrap_or(0);
            if unconfirmed > 0 && unconfirmed >= max_height {
                info!(
                    "{} Transaction expired. Last unconfirmed height: {}, max kernel height: {}",
                    self, unconfirmed, max_height
                );
                self.on_failed(FailureReason::TransactionExpired, false)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn on_failed(
        &mut self,
        reason: FailureReason,
        notify: bool,
    ) -> Result<(), TransactionFailed> {
        error!("{} Failed. {}", self, reason);

        if notify {
            self.notify_failure(reason)?;
        }

        self.rollback_tx();
        self.set(ParameterId::FailureReason, &reason)?;
        self.set_status(if reason == FailureReason::Canceled {
            TxStatus::Canceled
        } else {
            TxStatus::Failed
        })?;
        self.push(GatewayAction::Failed);
        Ok(())
    }

    /// Tell the counterparty the transaction failed. Only sent while negotiation is ongoing.
    pub fn notify_failure(&mut self, reason: FailureReason) -> Result<(), TransactionFailed> {
        if !matches!(
            self.status(),
            Some(TxStatus::Pending) | Some(TxStatus::InProgress)
        ) {
            return Ok(());
        }
        let msg = self
            .new_message()?
            .add_parameter(ParameterId::FailureReason, &reason)?;
        self.send_to_peer(msg)
    }

    /// Message to the counterparty prefilled with our address.
    pub fn new_message(&self) -> Result<SetTxParameter, TransactionFailed> {
        let tx_type = self.get::<TxType>(ParameterId::TransactionType).unwrap_or(TxType::Simple);
        Ok(SetTxParameter::new(self.settings().my_id, *self.tx_id(), tx_type))
    }

    pub fn send_to_peer(&mut self, msg: SetTxParameter) -> Result<(), TransactionFailed> {
        let peer: WalletId = self.get_mandatory(ParameterId::PeerId)?;
        self.send_tx_params(peer, msg);
        Ok(())
    }

    /// Release coins this transaction reserved and drop the outputs it planned to create.
    pub fn rollback_tx(&mut self) {
        info!("{} Transaction failed. Rollback...", self);
        let tx_id = *self.tx_id();
        self.ledger().rollback_tx(&tx_id);
    }

    /// Default reorg handling: a kernel proof above `height` is no longer valid.
    pub fn rollback_kernel_proof(&mut self, height: Height) -> Result<bool, TransactionFailed> {
        match self.get::<Height>(ParameterId::KernelProofHeight) {
            Some(proof_height) if proof_height > height => {
                self.set_status(TxStatus::Registering)?;
                self.set(ParameterId::KernelProofHeight, &0u64)?;
                self.set(ParameterId::KernelUnconfirmedHeight, &0u64)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn confirm_kernel_status(&mut self, kernel_id: KernelId) -> Result<(), TransactionFailed> {
        self.set_status(TxStatus::Registering)?;
        self.confirm_kernel(kernel_id);
        Ok(())
    }

    /// Finalize, or wait for more confirmations when an offset is configured.
    pub fn complete_tx(&mut self) -> Result<(), TransactionFailed> {
        let offset = self.settings().coin_confirmations_offset;
        if offset > 0 {
            let proof_height: Height = self.get(ParameterId::KernelProofHeight).unwrap_or(0);
            if proof_height > 0 && self.tip_height().saturating_sub(proof_height) < offset {
                self.set_status(TxStatus::Confirming)?;
                self.update_on_next_tip();
                return Ok(());
            }
        }

        info!("{} Transaction completed", self);
        self.set_status(TxStatus::Completed)?;
        self.push(GatewayAction::Completed);
        Ok(())
    }

    pub fn set_completed_tx_coin_statuses(&mut self, proof_height: Height) {
        let tx_id = *self.tx_id();
        let maturity_std = self.settings().maturity_std;
        self.ledger()
            .set_completed_tx_coin_statuses(&tx_id, proof_height, maturity_std);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetCheckResult {
    Ok,
    Async,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssetCheckState {
    Initial,
    Confirmation,
    Check,
}

/// Per-transaction progress of asset metadata confirmation.
#[derive(Debug, Default)]
pub struct AssetChecker {
    states: BTreeMap<AssetId, AssetCheckState>,
}

impl AssetChecker {
    pub fn check(
        &mut self,
        ctx: &mut TxContext<'_>,
        asset_id: AssetId,
    ) -> Result<AssetCheckResult, TransactionFailed> {
        if asset_id == NATIVE_ASSET_ID {
            return Ok(AssetCheckResult::Ok);
        }

        let unconfirmed: Height = ctx.get(ParameterId::AssetUnconfirmedHeight).unwrap_or(0);
        if unconfirmed != 0 {
            ctx.on_failed(FailureReason::AssetConfirmFailed, false)?;
            return Ok(AssetCheckResult::Fail);
        }

        let state = self.states.entry(asset_id).or_insert(AssetCheckState::Initial);

        if *state == AssetCheckState::Initial {
            match ctx.store().find_asset(asset_id) {
                Some(asset) => {
                    ctx.set(ParameterId::AssetInfoFull, &asset.info)?;
                    ctx.set(ParameterId::AssetConfirmedHeight, &asset.refresh_height)?;
                    *state = AssetCheckState::Check;
                }
                None => {
                    *state = AssetCheckState::Confirmation;
                    Self::request_confirmation(ctx, asset_id)?;
                    return Ok(AssetCheckResult::Async);
                }
            }
        }

        if *state == AssetCheckState::Confirmation {
            let confirmed: Height = ctx.get(ParameterId::AssetConfirmedHeight).unwrap_or(0);
            if confirmed == 0 {
                return Ok(AssetCheckResult::Async);
            }
            *state = AssetCheckState::Check;
        }

        let info = match ctx.get::<AssetInfo>(ParameterId::AssetInfoFull) {
            Some(info) if info.is_valid() => info,
            _ => {
                ctx.on_failed(FailureReason::NoAssetInfo, true)?;
                return Ok(AssetCheckResult::Fail);
            }
        };
        let confirmed: Height = ctx.get(ParameterId::AssetConfirmedHeight).unwrap_or(0);
        if confirmed == 0 {
            ctx.on_failed(FailureReason::NoAssetInfo, true)?;
            return Ok(AssetCheckResult::Fail);
        }

        let asset = WalletAsset::new(info, confirmed);
        let tip = ctx.tip_height();
        if asset.can_rollback(tip) {
            ctx.on_failed(FailureReason::AssetLocked, true)?;
            return Ok(AssetCheckResult::Fail);
        }
        if asset.is_expired(tip) {
            *state = AssetCheckState::Confirmation;
            Self::request_confirmation(ctx, asset_id)?;
            return Ok(AssetCheckResult::Async);
        }

        debug!("{} Asset {} confirmed at {}", ctx, asset_id, confirmed);
        Ok(AssetCheckResult::Ok)
    }

    fn request_confirmation(
        ctx: &mut TxContext<'_>,
        asset_id: AssetId,
    ) -> Result<(), TransactionFailed> {
        ctx.set(ParameterId::AssetInfoFull, &AssetInfo::default())?;
        ctx.set(ParameterId::AssetUnconfirmedHeight, &0u64)?;
        ctx.set(ParameterId::AssetConfirmedHeight, &0u64)?;
        ctx.confirm_asset(AssetRef::Id(asset_id));
        Ok(())
    }
}

/// Builds transactions of one type.
pub trait TransactionCreator {
    fn create(&self, tx_id: TxId) -> Box<dyn TransactionBehavior>;

    /// Validate and complete start parameters before a new transaction is stored.
    fn check_and_complete_parameters(
        &self,
        params: TxParameters,
    ) -> Result<TxParameters, WalletError> {
        Ok(params)
    }
}

/// Constructors by transaction type, built once per wallet.
#[derive(Default)]
pub struct TransactionRegistry {
    creators: HashMap<TxType, Box<dyn TransactionCreator>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in payment transaction.
    pub fn with_simple() -> Self {
        let mut registry = Self::new();
        registry.register(
            TxType::Simple,
            Box::new(crate::transaction::simple::SimpleTransactionCreator),
        );
        registry
    }

    pub fn register(&mut self, tx_type: TxType, creator: Box<dyn TransactionCreator>) {
        self.creators.insert(tx_type, creator);
    }

    pub fn get(&self, tx_type: TxType) -> Option<&dyn TransactionCreator> {
        self.creators.get(&tx_type).map(|c| c.as_ref())
    }

    pub fn construct(&self, tx_type: TxType, tx_id: TxId) -> Result<BaseTransaction, WalletError> {
        let creator = self
            .get(tx_type)
            .ok_or(WalletError::UnknownTransactionType(tx_type))?;
        Ok(BaseTransaction::new(tx_id, creator.create(tx_id)))
    }
}
