//! Two-party payment.
//!
//! The sender selects and reserves inputs, creates change and invites the receiver. The receiver
//! creates its output, signs its half of the kernel and replies. The sender then completes the
//! signature, registers the transaction and both sides wait for the kernel proof.

use crate::node::RegistrationStatus;
use crate::transaction::base::{
    AssetCheckResult, AssetChecker, FailureReason, TransactionBehavior, TransactionCreator,
    TransactionFailed, TxStatus, TxType,
};
use crate::transaction::context::TxContext;
use crate::transaction::key_keeper::{
    KeyKeeper, ReceiverSignRequest, ReceiverSignature, SenderPublicData,
    SenderSignRequest, SignedTransaction,
};
use crate::transaction::parameters::{ParameterId, TxParameters};
use crate::utils::format_amount;
use crate::wallet::WalletError;
use crate::wallet::types::*;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Protocol version announced in invitations.
pub const PROTO_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Initial,
    Invitation,
    InvitationConfirmation,
    Registration,
    KernelConfirmation,
}

#[derive(Debug, Default)]
pub struct SimpleTransaction {
    assets: AssetChecker,
}

impl SimpleTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(ctx: &TxContext<'_>) -> State {
        ctx.get(ParameterId::State).unwrap_or(State::Initial)
    }

    fn set_state(ctx: &mut TxContext<'_>, state: State) -> Result<(), TransactionFailed> {
        ctx.set(ParameterId::State, &state)?;
        Ok(())
    }

    fn key_keeper<'c>(
        ctx: &'c mut TxContext<'_>,
    ) -> Result<&'c mut dyn KeyKeeper, TransactionFailed> {
        match ctx.key_keeper() {
            Some(kk) => Ok(kk),
            None => Err(TransactionFailed::new(FailureReason::NoKeyKeeper, true)),
        }
    }

    /// Negotiate as the initiator. Returns `true` once a signed kernel is available.
    fn build_as_sender(
        &mut self,
        ctx: &mut TxContext<'_>,
        amount: u64,
        fee: u64,
        asset_id: AssetId,
    ) -> Result<bool, TransactionFailed> {
        let state = Self::state(ctx);
        if state == State::Initial {
            info!(
                "{} Sending {} (fee: {}){}",
                ctx,
                format_amount(amount),
                format_amount(fee),
                asset_label(asset_id)
            );
            ctx.set_status(TxStatus::InProgress)?;

            if let Some(h) = ctx.get::<Height>(ParameterId::PeerResponseHeight) {
                info!("{} Max height for response: {}", ctx, h);
            }
            let total = amount.checked_add(fee).ok_or_else(|| {
                TransactionFailed::new(FailureReason::InvalidTransaction, false)
                    .with_message("Amount and fee overflow")
            })?;
            let inputs = Self::select_inputs(ctx, total, asset_id)?;
            let outputs = Self::add_change(ctx, &inputs, total, asset_id)?;

            let tx_id = *ctx.tx_id();
            let public: SenderPublicData =
                Self::key_keeper(ctx)?.sender_public_data(&tx_id, &inputs, &outputs)?;
            ctx.set(ParameterId::PublicNonce, &public.public_nonce)?;
            ctx.set(ParameterId::PublicExcess, &public.public_excess)?;

            Self::send_invitation(ctx, amount, fee, asset_id, &public)?;
            Self::set_state(ctx, State::Invitation)?;
        }

        let Some(peer) = ctx.get::<ReceiverSignature>(ParameterId::PeerSignature) else {
            ctx.update_on_next_tip();
            return Ok(false);
        };

        let request = SenderSignRequest {
            tx_id: *ctx.tx_id(),
            amount,
            fee,
            inputs: ctx.get(ParameterId::InputCoins).unwrap_or_default(),
            outputs: ctx.get(ParameterId::OutputCoins).unwrap_or_default(),
            peer,
        };
        let signed = Self::key_keeper(ctx)?.sign_sender(&request)?;
        ctx.set(ParameterId::KernelId, &signed.kernel_id)?;
        ctx.set(ParameterId::Kernel, &signed)?;
        Ok(true)
    }

    fn select_inputs(
        ctx: &mut TxContext<'_>,
        total: u64,
        asset_id: AssetId,
    ) -> Result<Vec<CoinId>, TransactionFailed> {
        if let Some(inputs) = ctx.get::<Vec<CoinId>>(ParameterId::InputCoins) {
            return Ok(inputs);
        }

        let available = ctx.ledger().available_coins(asset_id);
        let Some(selected) = ctx.coin_selector().select(&available, total) else {
            let have: u64 = available.iter().map(Coin::value).sum();
            return Err(TransactionFailed::new(FailureReason::NoInputs, false).with_message(
                format!(
                    "You only have {}, but {} is required",
                    format_amount(have),
                    format_amount(total)
                ),
            ));
        };

        let tx_id = *ctx.tx_id();
        ctx.ledger().reserve(&tx_id, &selected);
        ctx.set(ParameterId::InputCoins, &selected)?;
        Ok(selected)
    }

    fn add_change(
        ctx: &mut TxContext<'_>,
        inputs: &[CoinId],
        total: u64,
        asset_id: AssetId,
    ) -> Result<Vec<CoinId>, TransactionFailed> {
        if let Some(outputs) = ctx.get::<Vec<CoinId>>(ParameterId::OutputCoins) {
            return Ok(outputs);
        }

        let selected: u64 = inputs.iter().map(|id| id.value).sum();
        let mut outputs = Vec::new();
        let change = selected.saturating_sub(total);
        if change > 0 {
            let id = Self::key_keeper(ctx)?.generate_coin(change, asset_id, KeyType::Change)?;
            let tx_id = *ctx.tx_id();
            ctx.ledger().create_output(&tx_id, id);
            outputs.push(id);
        }
        ctx.set(ParameterId::OutputCoins, &outputs)?;
        Ok(outputs)
    }

    fn send_invitation(
        ctx: &mut TxContext<'_>,
        amount: u64,
        fee: u64,
        asset_id: AssetId,
        public: &SenderPublicData,
    ) -> Result<(), TransactionFailed> {
        let min_height: Height = match ctx.get(ParameterId::MinHeight) {
            Some(h) => h,
            None => {
                let h = ctx.tip_height();
                ctx.set(ParameterId::MinHeight, &h)?;
                h
            }
        };

        let mut msg = ctx
            .new_message()?
            .add_parameter(ParameterId::Amount, &amount)?
            .add_parameter(ParameterId::Fee, &fee)?
            .add_parameter(ParameterId::MinHeight, &min_height)?
            .add_parameter(ParameterId::IsSender, &false)?
            .add_parameter(ParameterId::PeerPublicNonce, &public.public_nonce)?
            .add_parameter(ParameterId::PeerPublicExcess, &public.public_excess)?
            .add_parameter(ParameterId::PeerProtoVersion, &PROTO_VERSION)?;
        if asset_id != NATIVE_ASSET_ID {
            msg = msg.add_parameter(ParameterId::AssetId, &asset_id)?;
        }
        if let Some(max_height) = ctx.get::<Height>(ParameterId::MaxHeight) {
            msg = msg.add_parameter(ParameterId::PeerMaxHeight, &max_height)?;
        }
        ctx.send_to_peer(msg)
    }

    /// Respond to an invitation. Returns `false` while waiting for asset confirmation.
    fn build_as_receiver(
        &mut self,
        ctx: &mut TxContext<'_>,
        amount: u64,
        fee: u64,
        asset_id: AssetId,
    ) -> Result<bool, TransactionFailed> {
        if ctx.get::<Vec<CoinId>>(ParameterId::OutputCoins).is_none() {
            let min_height: Height = ctx.get(ParameterId::MinHeight).unwrap_or(0);
            let acceptable = ctx
                .tip_height()
                .saturating_add(ctx.settings().max_kernel_validity);
            if min_height > acceptable {
                return Err(
                    TransactionFailed::new(FailureReason::MinHeightIsUnacceptable, true)
                        .with_message(format!(
                            "Min height {} is above {}",
                            min_height, acceptable
                        )),
                );
            }

            info!(
                "{} Receiving {} (fee: {}){}",
                ctx,
                format_amount(amount),
                format_amount(fee),
                asset_label(asset_id)
            );
            ctx.set_status(TxStatus::InProgress)?;

            let id = Self::key_keeper(ctx)?.generate_coin(amount, asset_id, KeyType::Regular)?;
            let tx_id = *ctx.tx_id();
            ctx.ledger().create_output(&tx_id, id);
            let outputs = vec![id];
            ctx.set(ParameterId::OutputCoins, &outputs)?;
        }

        let signature = match ctx.get::<ReceiverSignature>(ParameterId::PartialSignature) {
            Some(signature) => signature,
            None => {
                let request = ReceiverSignRequest {
                    tx_id: *ctx.tx_id(),
                    amount,
                    fee,
                    asset_id,
                    outputs: ctx.get(ParameterId::OutputCoins).unwrap_or_default(),
                    peer_public_nonce: ctx.get_mandatory(ParameterId::PeerPublicNonce)?,
                    peer_public_excess: ctx.get_mandatory(ParameterId::PeerPublicExcess)?,
                };
                let signature = Self::key_keeper(ctx)?.sign_receiver(&request)?;
                ctx.set(ParameterId::PartialSignature, &signature)?;
                signature
            }
        };

        // The asset may change while the key keeper signs, so it is checked last.
        if self.assets.check(ctx, asset_id)? != AssetCheckResult::Ok {
            return Ok(false);
        }

        ctx.set_status(TxStatus::Registering)?;
        let reply = ctx
            .new_message()?
            .add_parameter(ParameterId::PeerSignature, &signature)?;
        ctx.send_to_peer(reply)?;

        ctx.set(ParameterId::KernelId, &signature.kernel_id)?;
        ctx.set(ParameterId::TransactionRegistered, &RegistrationStatus::Ok)?;
        Self::set_state(ctx, State::KernelConfirmation)?;
        ctx.confirm_kernel_status(signature.kernel_id)?;
        Ok(false)
    }
}

impl TransactionBehavior for SimpleTransaction {
    fn tx_type(&self) -> TxType {
        TxType::Simple
    }

    fn update_impl(&mut self, ctx: &mut TxContext<'_>) -> Result<(), TransactionFailed> {
        let is_sender: bool = ctx.get_mandatory(ParameterId::IsSender)?;
        let amount: u64 = ctx.get_mandatory(ParameterId::Amount)?;
        let fee: u64 = ctx.get(ParameterId::Fee).unwrap_or(0);
        let asset_id: AssetId = ctx.get(ParameterId::AssetId).unwrap_or(NATIVE_ASSET_ID);
        let state = Self::state(ctx);

        let has_kernel = if is_sender {
            ctx.get::<SignedTransaction>(ParameterId::Kernel).is_some()
        } else {
            ctx.get::<KernelId>(ParameterId::KernelId).is_some() && state != State::Initial
        };

        if !has_kernel {
            // Watch-only wallet: nothing can be signed here.
            if !ctx.has_key_keeper() {
                return Ok(());
            }
            let ready = if is_sender {
                self.build_as_sender(ctx, amount, fee, asset_id)?
            } else {
                self.build_as_receiver(ctx, amount, fee, asset_id)?
            };
            if !ready {
                return Ok(());
            }
        }

        let Some(registered) = ctx.get::<RegistrationStatus>(ParameterId::TransactionRegistered)
        else {
            if ctx.check_expired()? {
                return Ok(());
            }
            let signed: SignedTransaction = ctx.get_mandatory(ParameterId::Kernel)?;
            ctx.set_status(TxStatus::Registering)?;
            ctx.register_tx(signed.body);
            Self::set_state(ctx, State::Registration)?;
            return Ok(());
        };

        if registered != RegistrationStatus::Ok {
            let unconfirmed: Height = ctx.get(ParameterId::KernelUnconfirmedHeight).unwrap_or(0);
            if unconfirmed > 0 {
                return Err(TransactionFailed::new(FailureReason::FailedToRegister, true));
            }
        }

        let proof_height: Height = ctx.get(ParameterId::KernelProofHeight).unwrap_or(0);
        if proof_height == 0 {
            Self::set_state(ctx, State::KernelConfirmation)?;
            let kernel_id: KernelId = ctx.get_mandatory(ParameterId::KernelId)?;
            ctx.confirm_kernel_status(kernel_id)?;
            return Ok(());
        }

        ctx.set_completed_tx_coin_statuses(proof_height);
        ctx.complete_tx()
    }

    fn is_in_safety(&self, ctx: &TxContext<'_>) -> bool {
        Self::state(ctx) == State::KernelConfirmation
    }
}

fn asset_label(asset_id: AssetId) -> String {
    if asset_id == NATIVE_ASSET_ID {
        String::new()
    } else {
        format!(", asset ID: {}", asset_id)
    }
}

pub struct SimpleTransactionCreator;

impl TransactionCreator for SimpleTransactionCreator {
    fn create(&self, _tx_id: TxId) -> Box<dyn TransactionBehavior> {
        Box::new(SimpleTransaction::new())
    }

    fn check_and_complete_parameters(
        &self,
        mut params: TxParameters,
    ) -> Result<TxParameters, WalletError> {
        if params.get::<WalletId>(ParameterId::PeerId).is_none() {
            return Err(WalletError::InvalidParameters("No PeerID".to_string()));
        }
        let amount = match params.get::<u64>(ParameterId::Amount) {
            Some(amount) if amount > 0 => amount,
            _ => return Err(WalletError::InvalidParameters("No amount".to_string())),
        };
        let fee: u64 = params.get(ParameterId::Fee).unwrap_or(0);
        if amount.checked_add(fee).is_none() {
            return Err(WalletError::InvalidParameters(
                "Amount and fee overflow".to_string(),
            ));
        }
        if params.get::<bool>(ParameterId::IsSender).is_none() {
            params.set(ParameterId::IsSender, &true)?;
        }
        params.set(ParameterId::IsInitiator, &true)?;
        Ok(params)
    }
}
