//! Pure ladder arithmetic: gap per level, price per level, quantity per level.
//!
//! Levels are generated top-down. Each level's price is derived from the
//! previous level's price, never recomputed from the seed, so the ladder is
//! strictly decreasing and stays consistent when a single level fails.

use super::config::GridConfig;

/// Bounds applied to the per-level gap decay factor
const MIN_REDUCTION: f64 = 0.5;
const MAX_REDUCTION: f64 = 0.99;

/// Decimal places kept on a computed gap
const GAP_DECIMALS: u32 = 5;

/// Round half away from zero to `decimals` places
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Gap between `level` and the level above it.
///
/// `min(initial, max) * clamp(reduction)^level`, rounded to 5 places and
/// floored at `min_gap_percent`.
pub fn gap_percent(config: &GridConfig, level: u32) -> f64 {
    let base = config.initial_gap_percent.min(config.max_gap_percent);
    let reduction = config
        .gap_reduction_percent
        .clamp(MIN_REDUCTION, MAX_REDUCTION);
    let gap = round_to(base * reduction.powi(level as i32), GAP_DECIMALS);
    gap.max(config.min_gap_percent)
}

/// Price one gap below `previous_price`
pub fn price_from_gap(previous_price: f64, gap: f64, price_decimals: u32) -> f64 {
    round_to(previous_price * (1.0 - gap), price_decimals)
}

/// Quantity buying `trade_value` worth at `price`
pub fn quantity_from_value(price: f64, trade_value: f64, quantity_decimals: u32) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    round_to(trade_value / price, quantity_decimals)
}
