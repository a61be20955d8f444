//! Grid trading configuration

use serde::{Deserialize, Serialize};

use super::calculator::round_to;
use super::errors::{GridError, GridResult};

/// Rounding precision for a symbol, resolved once from exchange metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetPrecision {
    /// Decimal places for prices (from the tick size)
    pub price_decimals: u32,
    /// Decimal places for quantities (from the lot step size)
    pub quantity_decimals: u32,
}

impl AssetPrecision {
    pub fn new(price_decimals: u32, quantity_decimals: u32) -> Self {
        Self {
            price_decimals,
            quantity_decimals,
        }
    }

    /// Build precision from the exchange's tick and step increments,
    /// e.g. tick "0.01000000" and step "0.00100000" give (2, 3)
    pub fn from_increments(tick_size: &str, step_size: &str) -> GridResult<Self> {
        Ok(Self {
            price_decimals: decimals_from_increment(tick_size)?,
            quantity_decimals: decimals_from_increment(step_size)?,
        })
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_to(price, self.price_decimals)
    }

    pub fn round_quantity(&self, quantity: f64) -> f64 {
        round_to(quantity, self.quantity_decimals)
    }
}

impl Default for AssetPrecision {
    fn default() -> Self {
        // Exchange defaults before symbol metadata is known
        Self::new(3, 8)
    }
}

/// Count the significant decimal places of an increment string,
/// ignoring trailing zeros ("1.00" -> 0, "0.00010" -> 4)
pub fn decimals_from_increment(increment: &str) -> GridResult<u32> {
    let trimmed = increment.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| *v > 0.0)
        .ok_or_else(|| {
            GridError::InvalidConfig(format!("invalid increment '{}'", increment))
        })?;

    let decimals = match trimmed.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len() as u32,
        None => 0,
    };
    Ok(decimals)
}

/// Grid ladder parameters for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Number of rungs to seed (levels 0..total_grid_levels-1)
    pub total_grid_levels: u32,

    /// Quote value committed at level 0
    pub base_trade_value: f64,

    /// Extra quote value added per level (value at level i = base + i * increment)
    #[serde(default)]
    pub trade_value_increment: f64,

    /// Gap between level 0 and level 1, before decay
    pub initial_gap_percent: f64,

    /// Per-level gap decay factor, clamped to [0.5, 0.99]
    pub gap_reduction_percent: f64,

    pub max_gap_percent: f64,

    pub min_gap_percent: f64,

    /// Upward excursion above the level-0 bid that triggers a full reset
    pub reset_grid_percent: f64,

    /// Growth applied to `initial_gap_percent` on every reset
    #[serde(default)]
    pub reset_increment_percent: f64,
}

impl GridConfig {
    /// Create a configuration with the given ladder size and level-0 value.
    /// Gap parameters start from a 1% ladder decaying by 0.9 per level.
    pub fn new(total_grid_levels: u32, base_trade_value: f64) -> Self {
        Self {
            total_grid_levels,
            base_trade_value,
            trade_value_increment: 0.0,
            initial_gap_percent: 0.01,
            gap_reduction_percent: 0.9,
            max_gap_percent: 0.01,
            min_gap_percent: 0.001,
            reset_grid_percent: 0.05,
            reset_increment_percent: 0.0,
        }
    }

    /// Builder: set per-level value increment
    pub fn with_trade_value_increment(mut self, increment: f64) -> Self {
        self.trade_value_increment = increment;
        self
    }

    /// Builder: set gap parameters
    pub fn with_gaps(mut self, initial: f64, reduction: f64, max: f64, min: f64) -> Self {
        self.initial_gap_percent = initial;
        self.gap_reduction_percent = reduction;
        self.max_gap_percent = max;
        self.min_gap_percent = min;
        self
    }

    /// Builder: set reset trigger and the gap growth applied on reset
    pub fn with_reset(mut self, reset_grid_percent: f64, reset_increment_percent: f64) -> Self {
        self.reset_grid_percent = reset_grid_percent;
        self.reset_increment_percent = reset_increment_percent;
        self
    }

    /// Quote value allocated to a fresh rung at `level`
    pub fn trade_value_at(&self, level: u32) -> f64 {
        self.base_trade_value + level as f64 * self.trade_value_increment
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.total_grid_levels == 0 {
            return Err(GridError::InvalidConfig(
                "total_grid_levels must be at least 1".into(),
            ));
        }

        if self.base_trade_value <= 0.0 {
            return Err(GridError::InvalidConfig(
                "base_trade_value must be positive".into(),
            ));
        }

        if self.trade_value_increment < 0.0 {
            return Err(GridError::InvalidConfig(
                "trade_value_increment cannot be negative".into(),
            ));
        }

        if self.initial_gap_percent <= 0.0 || self.initial_gap_percent >= 1.0 {
            return Err(GridError::InvalidConfig(
                "initial_gap_percent must be in (0, 1)".into(),
            ));
        }

        if self.max_gap_percent <= 0.0 || self.max_gap_percent >= 1.0 {
            return Err(GridError::InvalidConfig(
                "max_gap_percent must be in (0, 1)".into(),
            ));
        }

        if self.min_gap_percent < 0.0 || self.min_gap_percent > self.max_gap_percent {
            return Err(GridError::InvalidConfig(
                "min_gap_percent must be between 0 and max_gap_percent".into(),
            ));
        }

        if self.gap_reduction_percent <= 0.0 {
            return Err(GridError::InvalidConfig(
                "gap_reduction_percent must be positive".into(),
            ));
        }

        if self.reset_grid_percent <= 0.0 {
            return Err(GridError::InvalidConfig(
                "reset_grid_percent must be positive".into(),
            ));
        }

        if self.reset_increment_percent < 0.0 {
            return Err(GridError::InvalidConfig(
                "reset_increment_percent cannot be negative".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let config = GridConfig::new(10, 100.0);
        assert!(config.validate().is_ok());

        // Invalid: no levels
        let config = GridConfig::new(0, 100.0);
        assert!(config.validate().is_err());

        // Invalid: base_trade_value <= 0
        let config = GridConfig::new(10, 0.0);
        assert!(config.validate().is_err());

        // Invalid: min gap above max gap
        let config = GridConfig::new(10, 100.0).with_gaps(0.01, 0.9, 0.01, 0.02);
        assert!(config.validate().is_err());

        // Invalid: negative reset growth
        let config = GridConfig::new(10, 100.0).with_reset(0.05, -0.1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trade_value_at_level() {
        let config = GridConfig::new(5, 100.0).with_trade_value_increment(10.0);
        assert!((config.trade_value_at(0) - 100.0).abs() < 0.0001);
        assert!((config.trade_value_at(3) - 130.0).abs() < 0.0001);
    }

    #[test]
    fn test_decimals_from_increment() {
        assert_eq!(decimals_from_increment("0.01000000").unwrap(), 2);
        assert_eq!(decimals_from_increment("0.00001000").unwrap(), 5);
        assert_eq!(decimals_from_increment("1.00000000").unwrap(), 0);
        assert_eq!(decimals_from_increment("10").unwrap(), 0);
        assert!(decimals_from_increment("0").is_err());
        assert!(decimals_from_increment("abc").is_err());
    }

    #[test]
    fn test_precision_rounding() {
        let precision = AssetPrecision::from_increments("0.01", "0.001").unwrap();
        assert_eq!(precision, AssetPrecision::new(2, 3));

        assert!((precision.round_price(123.456) - 123.46).abs() < 1e-9);
        assert!((precision.round_quantity(1.23456) - 1.235).abs() < 1e-9);
    }

    #[test]
    fn test_config_from_request_json() {
        let config: GridConfig = serde_json::from_str(
            r#"{
                "total_grid_levels": 4,
                "base_trade_value": 50.0,
                "initial_gap_percent": 0.01,
                "gap_reduction_percent": 0.9,
                "max_gap_percent": 0.01,
                "min_gap_percent": 0.001,
                "reset_grid_percent": 0.03
            }"#,
        )
        .unwrap();
        assert_eq!(config.total_grid_levels, 4);
        assert_eq!(config.trade_value_increment, 0.0);
        assert_eq!(config.reset_increment_percent, 0.0);
        assert!(config.validate().is_ok());
    }
}
