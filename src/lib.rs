pub mod config;
pub mod node;
pub mod transaction;
pub mod utils;
pub mod wallet;

pub use config::WalletConfig;
pub use wallet::{Wallet, WalletError};
