//! Backtest configuration
//!
//! Small serde struct loaded from a JSON file, with sane defaults for
//! direct construction in tests.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Simulation parameters for one backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Starting balance of the single shared account.
    pub initial_balance: Decimal,
    /// Leverage applied to pairs without an explicit setting.
    #[serde(default = "default_leverage")]
    pub default_leverage: u32,
    /// Quantity decimal places for pairs without an explicit provider.
    #[serde(default = "default_quantity_precision")]
    pub quantity_precision: u32,
    /// Inclusive start of the simulation window. Unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// Inclusive end of the simulation window. Unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

fn default_leverage() -> u32 {
    20
}

fn default_quantity_precision() -> u32 {
    3
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            initial_balance: dec!(10000),
            default_leverage: default_leverage(),
            quantity_precision: default_quantity_precision(),
            start: None,
            end: None,
        }
    }
}

impl BacktestConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: BacktestConfig =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.initial_balance >= Decimal::ZERO,
            "initial_balance must be >= 0"
        );
        anyhow::ensure!(
            (1..=125).contains(&self.default_leverage),
            "default_leverage must be in [1, 125]"
        );
        Ok(())
    }
}
