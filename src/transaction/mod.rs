//! Transactions driven by the wallet engine.
//!
//! - `parameters`: the parameter bag that is a transaction's only persisted state.
//! - `context`: the gateway a transaction updates through.
//! - `base`: lifecycle shared by all transaction types, failure reasons and the type registry.
//! - `simple`: the two-party payment.
//! - `key_keeper`: signing service, coin selection and peer messaging collaborators.

/// Lifecycle wrapper, statuses and failure reasons
pub mod base;
/// Gateway handed to `update_impl`
pub mod context;
/// Signing, coin selection and messaging collaborators
pub mod key_keeper;
/// Parameter bag and peer messages
pub mod parameters;
/// Two-party payment
pub mod simple;

pub use base::{
    BaseTransaction, FailureReason, TransactionBehavior, TransactionCreator, TransactionFailed,
    TransactionRegistry, TxStatus, TxType,
};
pub use context::{GatewayAction, TxContext, TxSettings};
pub use key_keeper::{
    CoinSelector, KeyKeeper, KeyKeeperError, LargestFirstSelector, MessageEndpoint,
};
pub use parameters::{ParameterId, SetTxParameter, TxParameters};
pub use simple::{SimpleTransaction, SimpleTransactionCreator};
