//! Typed strategy parameter table.
//!
//! The production signal module and every draft are the same document: a
//! table of named integer tunables with a declared class and optional
//! bounds, plus an optional provenance header. Rendering is TOML so the
//! artifact stays human-readable and diffable between versions.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing or rendering a strategy module.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("failed to parse strategy module: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render strategy module: {0}")]
    Render(#[from] toml::ser::Error),
}

/// Parameter class. Each class carries its own mutation deltas and floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamClass {
    /// Oscillator levels such as RSI buy/sell thresholds.
    Threshold,
    /// Lookback lengths such as moving-average windows.
    Window,
}

impl fmt::Display for ParamClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamClass::Threshold => write!(f, "threshold"),
            ParamClass::Window => write!(f, "window"),
        }
    }
}

/// A single tunable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub value: i64,
    pub class: ParamClass,
    /// Per-parameter lower bound, tightening the class floor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    /// Per-parameter upper bound, tightening the class ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
}

impl Param {
    pub fn threshold(value: i64) -> Self {
        Self {
            value,
            class: ParamClass::Threshold,
            min: None,
            max: None,
        }
    }

    pub fn window(value: i64) -> Self {
        Self {
            value,
            class: ParamClass::Window,
            min: None,
            max: None,
        }
    }

    pub fn with_bounds(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }
}

/// Provenance header stamped onto generated drafts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub generated_at: DateTime<Utc>,
    pub description: String,
}

/// The strategy module document: provenance header + parameter table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyModule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(default)]
    pub params: BTreeMap<String, Param>,
}

impl StrategyModule {
    /// Tunables of the MA-crossover + RSI + MACD signal module.
    pub fn default_signal_module() -> Self {
        let params = [
            ("ma_fast", Param::window(9)),
            ("ma_slow", Param::window(21)),
            ("rsi_period", Param::window(14)),
            ("buy_rsi", Param::threshold(70)),
            ("sell_rsi", Param::threshold(30)),
            ("macd_fast", Param::window(12)),
            ("macd_slow", Param::window(26)),
            ("macd_signal", Param::window(9)),
        ]
        .into_iter()
        .map(|(name, param)| (name.to_string(), param))
        .collect();

        Self {
            provenance: None,
            params,
        }
    }

    pub fn parse(text: &str) -> Result<Self, ModuleError> {
        Ok(toml::from_str(text)?)
    }

    pub fn render(&self) -> Result<String, ModuleError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.params.get(name).map(|p| p.value)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}
