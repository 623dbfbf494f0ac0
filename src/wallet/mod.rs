/// Coin ledger projection
pub mod ledger;
/// Storage contract and in-memory store
pub mod storage;
pub mod sync;
pub mod types;

pub use ledger::CoinLedger;
pub use storage::{MemoryWalletStore, WalletSnapshot, WalletStore};
pub use sync::{Wallet, WalletEvent, WalletService};
pub use types::*;
