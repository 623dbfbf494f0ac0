/// Decimal places of the native coin.
pub const COIN_DECIMALS: u32 = 8;

pub fn format_token_amount(amount: u128, decimals: u32) -> String {
    let scale = 10u128.pow(decimals);
    if decimals == 0 {
        return amount.to_string();
    }
    format!(
        "{}.{:0width$}",
        amount / scale,
        amount % scale,
        width = decimals as usize
    )
}

/// Native coin amount in whole units.
pub fn format_amount(amount: u64) -> String {
    format_token_amount(amount as u128, COIN_DECIMALS)
}

/// Whether a block timestamp (unix seconds) is recent enough for the node to be considered up to
/// date.
pub fn is_valid_timestamp(block_time: i64, tolerance_secs: i64) -> bool {
    let now = chrono::Utc::now().timestamp();
    if now > block_time.saturating_add(tolerance_secs) {
        tracing::debug!(
            "It seems that node is not up to date. Block time: {}, now: {}",
            block_time,
            now
        );
        return false;
    }
    true
}
