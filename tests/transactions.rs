mod common;

use common::*;
use wallet_sync_engine::node::{ChainEvent, NodeRequest, RegistrationStatus, RequestKind};
use wallet_sync_engine::transaction::parameters::TxParameterStore;
use wallet_sync_engine::transaction::{FailureReason, ParameterId, SetTxParameter, TxStatus, TxType};
use wallet_sync_engine::wallet::*;

const SENDER: WalletId = WalletId([1; 32]);
const RECEIVER: WalletId = WalletId([2; 32]);

fn funded_sender(tip: Height) -> (Harness, CoinId) {
    let mut sender = Harness::new(SENDER);
    let coin = CoinId::new(1, KeyType::Regular, 1000);
    sender.sync_to(tip, vec![ChainEvent::utxo(5, coin, 5, true)]);
    assert!(sender.wallet.is_wallet_in_sync());
    assert_eq!(sender.coin(&coin).map(|c| c.status), Some(CoinStatus::Unspent));
    (sender, coin)
}

fn invitation(tx_id: TxId) -> SetTxParameter {
    invitation_at(tx_id, 10)
}

fn invitation_at(tx_id: TxId, min_height: Height) -> SetTxParameter {
    SetTxParameter::new(SENDER, tx_id, TxType::Simple)
        .add_parameter(ParameterId::Amount, &300u64)
        .unwrap()
        .add_parameter(ParameterId::Fee, &10u64)
        .unwrap()
        .add_parameter(ParameterId::MinHeight, &min_height)
        .unwrap()
        .add_parameter(ParameterId::IsSender, &false)
        .unwrap()
        .add_parameter(ParameterId::PeerPublicNonce, &vec![1u8, 2])
        .unwrap()
        .add_parameter(ParameterId::PeerPublicExcess, &vec![3u8, 4])
        .unwrap()
}

#[test]
fn sender_completes_after_kernel_proof() {
    let (mut sender, coin) = funded_sender(10);

    let tx_id = sender
        .wallet
        .start_transaction(send_params(RECEIVER, 300, 10))
        .unwrap();
    assert!(sender.wallet.is_active(&tx_id));
    assert_eq!(sender.status(&tx_id), Some(TxStatus::InProgress));
    assert_eq!(sender.coin(&coin).map(|c| c.status), Some(CoinStatus::Outgoing));

    let sent = sender.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, RECEIVER);
    assert_eq!(sent[0].1.get_parameter::<bool>(ParameterId::IsSender), Some(false));
    assert_eq!(sent[0].1.get_parameter::<u64>(ParameterId::Amount), Some(300));

    let change: Vec<Coin> = sender
        .wallet
        .store()
        .coins()
        .into_iter()
        .filter(|c| c.create_tx_id == Some(tx_id))
        .collect();
    assert_eq!(change.len(), 1);
    assert_eq!(change[0].value(), 690);
    assert_eq!(change[0].status, CoinStatus::Incoming);

    sender
        .wallet
        .on_transaction_msg(SENDER, receiver_reply(RECEIVER, tx_id));
    assert_eq!(sender.status(&tx_id), Some(TxStatus::Registering));
    assert!(sender.posted.borrow().iter().any(|(_, r)| matches!(
        r,
        NodeRequest::Registration { transaction } if *transaction == vec![9, 9, 9]
    )));

    sender.answer_registration(RegistrationStatus::Ok);
    assert_eq!(
        sender
            .wallet
            .store()
            .get_tx_param::<bool>(
                &tx_id,
                DEFAULT_SUB_TX_ID,
                ParameterId::TransactionRegisteredInternal,
            ),
        Some(true)
    );

    sender.answer_kernel(Some(11));
    assert_eq!(sender.status(&tx_id), Some(TxStatus::Completed));
    assert!(!sender.wallet.is_active(&tx_id));
    assert!(sender
        .events()
        .contains(&WalletEvent::TransactionCompleted(tx_id)));

    assert_eq!(sender.coin(&coin).map(|c| c.status), Some(CoinStatus::Spent));
    let change = sender.coin(&change[0].id).unwrap();
    assert_eq!(change.confirm_height, Some(11));
    assert_eq!(change.status, CoinStatus::Unspent);
    assert!(sender.wallet.multiplexer().is_empty());
}

#[test]
fn receiver_signs_and_waits_for_next_tip() {
    let mut receiver = Harness::new(RECEIVER);
    receiver.sync_to(10, vec![]);

    let tx_id = TxId([7; 16]);
    receiver.wallet.on_transaction_msg(RECEIVER, invitation(tx_id));
    assert!(receiver.wallet.is_active(&tx_id));
    assert_eq!(receiver.status(&tx_id), Some(TxStatus::Registering));

    let store = receiver.wallet.store();
    assert_eq!(
        store.get_tx_param::<WalletId>(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::PeerId),
        Some(SENDER)
    );
    assert_eq!(
        store.get_tx_param::<bool>(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::IsInitiator),
        Some(false)
    );
    let output = store
        .coins()
        .into_iter()
        .find(|c| c.create_tx_id == Some(tx_id))
        .unwrap();
    assert_eq!(output.value(), 300);

    let sent = receiver.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, SENDER);
    assert!(
        sent[0]
            .1
            .parameters
            .iter()
            .any(|(id, _)| *id == ParameterId::PeerSignature)
    );

    // Kernel not found at the current tip: no new request until the tip moves.
    receiver.answer_kernel(None);
    assert!(receiver.take_request(RequestKind::Kernel).is_none());
    assert!(receiver.wallet.is_active(&tx_id));

    receiver.sync_to(11, vec![]);
    assert!(receiver.take_request(RequestKind::Kernel).is_some());
}

#[test]
fn kernel_expiry_fails_transaction() {
    let (mut sender, coin) = funded_sender(15);

    let mut params = send_params(RECEIVER, 300, 10);
    params.set(ParameterId::MaxHeight, &20u64).unwrap();
    let tx_id = sender.wallet.start_transaction(params).unwrap();
    sender
        .wallet
        .on_transaction_msg(SENDER, receiver_reply(RECEIVER, tx_id));
    sender.answer_registration(RegistrationStatus::Ok);

    sender.answer_kernel(None);
    assert!(sender.wallet.is_active(&tx_id));
    assert_eq!(sender.status(&tx_id), Some(TxStatus::Registering));

    sender.sync_to(25, vec![]);
    sender.answer_kernel(None);

    assert!(!sender.wallet.is_active(&tx_id));
    assert_eq!(sender.status(&tx_id), Some(TxStatus::Failed));
    assert_eq!(
        sender
            .wallet
            .store()
            .get_tx_param::<FailureReason>(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::FailureReason),
        Some(FailureReason::TransactionExpired)
    );
    assert!(sender.events().contains(&WalletEvent::TransactionFailed(tx_id)));
    assert_eq!(sender.coin(&coin).map(|c| c.status), Some(CoinStatus::Unspent));
}

#[test]
fn cancel_returns_coins() {
    let (mut sender, coin) = funded_sender(10);
    let tx_id = sender
        .wallet
        .start_transaction(send_params(RECEIVER, 300, 10))
        .unwrap();
    sender.take_sent();

    assert!(sender.wallet.can_cancel_transaction(&tx_id));
    sender.wallet.cancel_transaction(&tx_id);

    assert_eq!(sender.status(&tx_id), Some(TxStatus::Canceled));
    assert!(!sender.wallet.is_active(&tx_id));
    assert_eq!(sender.coin(&coin).map(|c| c.status), Some(CoinStatus::Unspent));
    assert!(sender.coin(&coin).unwrap().spent_tx_id.is_none());
    assert_eq!(sender.wallet.store().coins().len(), 1);

    let sent = sender.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].1.get_parameter::<FailureReason>(ParameterId::FailureReason),
        Some(FailureReason::Canceled)
    );

    // Already inactive: nothing changes.
    sender.wallet.cancel_transaction(&tx_id);
    assert_eq!(sender.status(&tx_id), Some(TxStatus::Canceled));
    assert!(sender.wallet.delete_transaction(&tx_id).is_ok());
    assert_eq!(sender.status(&tx_id), None);
}

#[test]
fn registered_transaction_cannot_be_canceled() {
    let (mut sender, _) = funded_sender(10);
    let tx_id = sender
        .wallet
        .start_transaction(send_params(RECEIVER, 300, 10))
        .unwrap();
    sender
        .wallet
        .on_transaction_msg(SENDER, receiver_reply(RECEIVER, tx_id));
    assert_eq!(sender.status(&tx_id), Some(TxStatus::Registering));

    assert!(!sender.wallet.can_cancel_transaction(&tx_id));
    sender.wallet.cancel_transaction(&tx_id);
    assert_eq!(sender.status(&tx_id), Some(TxStatus::Registering));
    assert!(sender.wallet.is_active(&tx_id));
    assert!(matches!(
        sender.wallet.delete_transaction(&tx_id),
        Err(WalletError::TransactionActive(_))
    ));
}

#[test]
fn messages_from_other_peers_are_ignored() {
    let (mut sender, _) = funded_sender(10);
    let tx_id = sender
        .wallet
        .start_transaction(send_params(RECEIVER, 300, 10))
        .unwrap();
    sender
        .wallet
        .on_transaction_msg(SENDER, receiver_reply(RECEIVER, tx_id));
    assert_eq!(sender.status(&tx_id), Some(TxStatus::Registering));

    let intruder = SetTxParameter::new(WalletId([9; 32]), tx_id, TxType::Simple)
        .add_parameter(ParameterId::FailureReason, &FailureReason::Canceled)
        .unwrap();
    sender.wallet.on_transaction_msg(SENDER, intruder);
    assert!(
        sender
            .wallet
            .store()
            .get_tx_param::<FailureReason>(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::FailureReason)
            .is_none()
    );
}

#[test]
fn private_parameters_from_peer_are_dropped() {
    let mut receiver = Harness::new(RECEIVER);
    receiver.sync_to(10, vec![]);

    let tx_id = TxId([8; 16]);
    let msg = invitation(tx_id)
        .add_parameter(ParameterId::KernelProofHeight, &3u64)
        .unwrap();
    receiver.wallet.on_transaction_msg(RECEIVER, msg);

    assert!(receiver.wallet.is_active(&tx_id));
    assert!(
        receiver
            .wallet
            .store()
            .get_tx_param::<Height>(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::KernelProofHeight)
            .is_none()
    );
}

#[test]
fn invitation_claiming_sender_role_is_refused() {
    let mut receiver = Harness::new(RECEIVER);
    receiver.sync_to(10, vec![]);

    let tx_id = TxId([6; 16]);
    let msg = SetTxParameter::new(SENDER, tx_id, TxType::Simple)
        .add_parameter(ParameterId::IsSender, &true)
        .unwrap();
    receiver.wallet.on_transaction_msg(RECEIVER, msg);
    assert!(!receiver.wallet.is_active(&tx_id));
    assert!(receiver.wallet.store().tx_ids().is_empty());
}

#[test]
fn updates_wait_for_sync() {
    let mut receiver = Harness::new(RECEIVER);

    let tx_id = TxId([5; 16]);
    receiver.wallet.on_transaction_msg(RECEIVER, invitation(tx_id));
    assert!(receiver.wallet.is_active(&tx_id));
    assert_eq!(receiver.status(&tx_id), Some(TxStatus::Pending));
    assert!(receiver.take_sent().is_empty());

    receiver.sync_to(10, vec![]);
    assert_eq!(receiver.status(&tx_id), Some(TxStatus::Registering));
    assert_eq!(receiver.take_sent().len(), 1);
}

#[test]
fn start_requires_known_type_and_fresh_id() {
    let (mut sender, _) = funded_sender(10);
    let empty = wallet_sync_engine::transaction::TxParameters::new(None);
    assert!(matches!(
        sender.wallet.start_transaction(empty),
        Err(WalletError::InvalidParameters(_))
    ));

    let tx_id = sender
        .wallet
        .start_transaction(send_params(RECEIVER, 300, 10))
        .unwrap();
    let mut again = send_params(RECEIVER, 300, 10);
    again.set_tx_id(tx_id);
    assert!(sender.wallet.start_transaction(again).is_err());
}

#[test]
fn invitation_with_unreachable_min_height_fails() {
    let mut receiver = Harness::new(RECEIVER);
    receiver.sync_to(10, vec![]);

    let tx_id = TxId([4; 16]);
    receiver
        .wallet
        .on_transaction_msg(RECEIVER, invitation_at(tx_id, u64::MAX));

    assert!(!receiver.wallet.is_active(&tx_id));
    assert_eq!(receiver.status(&tx_id), Some(TxStatus::Failed));
    assert_eq!(
        receiver
            .wallet
            .store()
            .get_tx_param::<FailureReason>(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::FailureReason),
        Some(FailureReason::MinHeightIsUnacceptable)
    );
    assert!(receiver.wallet.store().coins().is_empty());

    let sent = receiver.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].1.get_parameter::<FailureReason>(ParameterId::FailureReason),
        Some(FailureReason::MinHeightIsUnacceptable)
    );
}

#[test]
fn overflowing_amount_is_rejected_at_start() {
    let (mut sender, coin) = funded_sender(10);
    assert!(matches!(
        sender
            .wallet
            .start_transaction(send_params(RECEIVER, u64::MAX, 10)),
        Err(WalletError::InvalidParameters(_))
    ));
    assert!(sender.wallet.active_transactions().next().is_none());
    assert!(sender.take_sent().is_empty());
    assert_eq!(sender.coin(&coin).map(|c| c.status), Some(CoinStatus::Unspent));
}

#[test]
fn rejected_registration_fails_once_kernel_is_missing() {
    let (mut sender, coin) = funded_sender(10);
    let tx_id = sender
        .wallet
        .start_transaction(send_params(RECEIVER, 300, 10))
        .unwrap();
    sender
        .wallet
        .on_transaction_msg(SENDER, receiver_reply(RECEIVER, tx_id));
    sender.take_sent();

    // A rejected registration may still have reached the chain: check the kernel first.
    sender.answer_registration(RegistrationStatus::LowFee);
    assert_eq!(sender.status(&tx_id), Some(TxStatus::Registering));
    assert!(sender.wallet.is_active(&tx_id));

    sender.answer_kernel(None);
    assert!(!sender.wallet.is_active(&tx_id));
    assert_eq!(sender.status(&tx_id), Some(TxStatus::Failed));
    assert_eq!(
        sender
            .wallet
            .store()
            .get_tx_param::<FailureReason>(&tx_id, DEFAULT_SUB_TX_ID, ParameterId::FailureReason),
        Some(FailureReason::FailedToRegister)
    );
    assert!(sender.events().contains(&WalletEvent::TransactionFailed(tx_id)));
    // Past negotiation: the receiver is not notified.
    assert!(sender.take_sent().is_empty());

    assert_eq!(sender.coin(&coin).map(|c| c.status), Some(CoinStatus::Unspent));
    assert_eq!(sender.wallet.store().coins().len(), 1);
}
