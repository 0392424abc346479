//! Additive point scoring over an asset's indicators and market size.

use crate::indicators::IndicatorSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on the points a policy can award one asset.
pub const MAX_TOTAL_POINTS: u64 = 10_000;

/// Market-size facts taken from the ranked listing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct AssetMetrics {
    pub total_volume: f64,
    pub market_cap: f64,
}

/// Point weights and thresholds for each scoring rule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScoringPolicy {
    pub name: String,
    pub trend_points: u32,
    pub rsi_lower: f64,
    pub rsi_upper: f64,
    pub rsi_neutral_points: u32,
    pub rsi_oversold_points: u32,
    pub macd_points: u32,
    pub volume_threshold: f64,
    pub volume_points: u32,
    pub market_cap_threshold: f64,
    pub market_cap_points: u32,
    pub weekly_trend_percent: f64,
    pub weekly_trend_points: u32,
}

impl ScoringPolicy {
    pub fn balanced() -> Self {
        Self {
            name: "balanced".to_string(),
            trend_points: 25,
            rsi_lower: 30.0,
            rsi_upper: 70.0,
            rsi_neutral_points: 20,
            rsi_oversold_points: 30,
            macd_points: 15,
            volume_threshold: 100_000_000.0,
            volume_points: 10,
            market_cap_threshold: 1_000_000_000.0,
            market_cap_points: 10,
            weekly_trend_percent: 5.0,
            weekly_trend_points: 10,
        }
    }

    pub fn conservative() -> Self {
        Self {
            name: "conservative".to_string(),
            trend_points: 30,
            rsi_lower: 40.0,
            rsi_upper: 60.0,
            rsi_neutral_points: 15,
            rsi_oversold_points: 25,
            macd_points: 20,
            volume_threshold: 500_000_000.0,
            volume_points: 10,
            market_cap_threshold: 10_000_000_000.0,
            market_cap_points: 15,
            weekly_trend_percent: 5.0,
            weekly_trend_points: 5,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "balanced" => Some(Self::balanced()),
            "conservative" => Some(Self::conservative()),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ScoreError> {
        if !(0.0..=100.0).contains(&self.rsi_lower)
            || !(0.0..=100.0).contains(&self.rsi_upper)
            || self.rsi_lower >= self.rsi_upper
        {
            return Err(ScoreError::InvalidPolicy {
                reason: format!(
                    "RSI band [{}, {}) must be non-empty and inside [0, 100]",
                    self.rsi_lower, self.rsi_upper
                ),
            });
        }
        if self.rsi_oversold_points <= self.rsi_neutral_points {
            return Err(ScoreError::InvalidPolicy {
                reason: format!(
                    "oversold points ({}) must exceed neutral points ({})",
                    self.rsi_oversold_points, self.rsi_neutral_points
                ),
            });
        }
        if self.max_points() > MAX_TOTAL_POINTS {
            return Err(ScoreError::InvalidPolicy {
                reason: format!(
                    "rules can award {} points in total, more than the {} allowed",
                    self.max_points(),
                    MAX_TOTAL_POINTS
                ),
            });
        }
        Ok(())
    }

    /// Score of an asset that matches every rule.
    pub fn max_points(&self) -> u64 {
        [
            self.trend_points,
            self.rsi_oversold_points.max(self.rsi_neutral_points),
            self.macd_points,
            self.volume_points,
            self.market_cap_points,
            self.weekly_trend_points,
        ]
        .into_iter()
        .map(u64::from)
        .sum()
    }
}

/// Optional per-field overrides applied on top of a named policy.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PolicyOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend_points: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi_lower: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi_upper: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi_neutral_points: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi_oversold_points: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_points: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_points: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_cap_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_cap_points: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekly_trend_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekly_trend_points: Option<u32>,
}

impl PolicyOverrides {
    pub fn apply(&self, base: ScoringPolicy) -> ScoringPolicy {
        ScoringPolicy {
            name: base.name,
            trend_points: self.trend_points.unwrap_or(base.trend_points),
            rsi_lower: self.rsi_lower.unwrap_or(base.rsi_lower),
            rsi_upper: self.rsi_upper.unwrap_or(base.rsi_upper),
            rsi_neutral_points: self.rsi_neutral_points.unwrap_or(base.rsi_neutral_points),
            rsi_oversold_points: self.rsi_oversold_points.unwrap_or(base.rsi_oversold_points),
            macd_points: self.macd_points.unwrap_or(base.macd_points),
            volume_threshold: self.volume_threshold.unwrap_or(base.volume_threshold),
            volume_points: self.volume_points.unwrap_or(base.volume_points),
            market_cap_threshold: self.market_cap_threshold.unwrap_or(base.market_cap_threshold),
            market_cap_points: self.market_cap_points.unwrap_or(base.market_cap_points),
            weekly_trend_percent: self.weekly_trend_percent.unwrap_or(base.weekly_trend_percent),
            weekly_trend_points: self.weekly_trend_points.unwrap_or(base.weekly_trend_points),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub policy: String,
    pub overrides: PolicyOverrides,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            policy: "balanced".to_string(),
            overrides: PolicyOverrides::default(),
        }
    }
}

impl ScoringConfig {
    pub fn resolve(&self) -> Result<ScoringPolicy, ScoreError> {
        let base = ScoringPolicy::by_name(&self.policy).ok_or_else(|| ScoreError::InvalidPolicy {
            reason: format!(
                "unknown policy '{}' (expected 'balanced' or 'conservative')",
                self.policy
            ),
        })?;
        let policy = self.overrides.apply(base);
        policy.validate()?;
        Ok(policy)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoreError {
    #[error("precondition violated: {field} is {value}")]
    PreconditionViolation { field: &'static str, value: f64 },

    #[error("invalid scoring policy: {reason}")]
    InvalidPolicy { reason: String },
}

fn check_finite(field: &'static str, value: f64) -> Result<(), ScoreError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ScoreError::PreconditionViolation { field, value })
    }
}

fn check_inputs(indicators: &IndicatorSet, metrics: &AssetMetrics) -> Result<(), ScoreError> {
    check_finite("short_ma", indicators.short_ma)?;
    check_finite("long_ma", indicators.long_ma)?;
    check_finite("macd", indicators.macd)?;
    check_finite("current_price", indicators.current_price)?;
    if let Some(trend) = indicators.weekly_trend {
        check_finite("weekly_trend", trend)?;
    }
    if !(0.0..=100.0).contains(&indicators.rsi) {
        return Err(ScoreError::PreconditionViolation {
            field: "rsi",
            value: indicators.rsi,
        });
    }
    for (field, value) in [
        ("total_volume", metrics.total_volume),
        ("market_cap", metrics.market_cap),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(ScoreError::PreconditionViolation { field, value });
        }
    }
    Ok(())
}

/// Sum of the points every matching rule contributes. Rules are independent;
/// the RSI rule awards neutral or oversold points, never both.
pub fn calculate_score(
    indicators: &IndicatorSet,
    metrics: &AssetMetrics,
    policy: &ScoringPolicy,
) -> Result<u32, ScoreError> {
    check_inputs(indicators, metrics)?;

    // Six u32 terms cannot overflow a u64.
    let mut score: u64 = 0;

    if indicators.short_ma > indicators.long_ma {
        score += u64::from(policy.trend_points);
    }

    if indicators.rsi < policy.rsi_lower {
        score += u64::from(policy.rsi_oversold_points);
    } else if indicators.rsi < policy.rsi_upper {
        score += u64::from(policy.rsi_neutral_points);
    }

    if indicators.macd > 0.0 {
        score += u64::from(policy.macd_points);
    }

    if metrics.total_volume > policy.volume_threshold {
        score += u64::from(policy.volume_points);
    }

    if metrics.market_cap > policy.market_cap_threshold {
        score += u64::from(policy.market_cap_points);
    }

    if indicators
        .weekly_trend
        .is_some_and(|trend| trend > policy.weekly_trend_percent)
    {
        score += u64::from(policy.weekly_trend_points);
    }

    u32::try_from(score).map_err(|_| ScoreError::InvalidPolicy {
        reason: format!("score {} does not fit in a u32", score),
    })
}
