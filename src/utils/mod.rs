//!
//! Utility module for the wallet engine.
//!
//! Re-exports formatting helpers and other utility functions for use throughout the codebase.
/// Utility functions for formatting and display
pub mod index;

pub use index::{COIN_DECIMALS, format_amount, format_token_amount, is_valid_timestamp};
