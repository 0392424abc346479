//! Technical indicators computed from a chronological closing-price series.
//!
//! Every moving average here is the mean of a trailing window, computed with
//! `ta`'s streaming indicators fed only the values that fall inside the window.

use serde::{Deserialize, Serialize};
use ta::Next;
use ta::indicators::{ExponentialMovingAverage, SimpleMovingAverage};
use thiserror::Error;

const WEEK_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub timestamp_ms: i64,
    pub price: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MacdMode {
    /// Difference of the trailing fast and slow simple means.
    #[default]
    Sma,
    /// Difference of fast and slow EMAs run over the whole series.
    Ema,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct IndicatorConfig {
    pub short_window: usize,
    pub long_window: usize,
    pub rsi_window: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_mode: MacdMode,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            short_window: 20,
            long_window: 50,
            rsi_window: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_mode: MacdMode::Sma,
        }
    }
}

impl IndicatorConfig {
    /// Shortest series the calculator accepts. RSI needs one extra point
    /// because it works on price deltas.
    pub fn min_points(&self) -> usize {
        self.long_window
            .max(self.macd_slow)
            .max(self.rsi_window + 1)
    }

    pub fn validate(&self) -> Result<(), IndicatorError> {
        let windows = [
            ("short_window", self.short_window),
            ("long_window", self.long_window),
            ("rsi_window", self.rsi_window),
            ("macd_fast", self.macd_fast),
            ("macd_slow", self.macd_slow),
        ];
        if let Some((name, _)) = windows.into_iter().find(|(_, size)| *size == 0) {
            return Err(IndicatorError::InvalidWindow {
                name,
                reason: "window size must be at least 1".to_string(),
            });
        }
        if self.short_window >= self.long_window {
            return Err(IndicatorError::InvalidWindow {
                name: "short_window",
                reason: format!(
                    "must be shorter than long_window ({} >= {})",
                    self.short_window, self.long_window
                ),
            });
        }
        if self.macd_fast >= self.macd_slow {
            return Err(IndicatorError::InvalidWindow {
                name: "macd_fast",
                reason: format!(
                    "must be shorter than macd_slow ({} >= {})",
                    self.macd_fast, self.macd_slow
                ),
            });
        }
        Ok(())
    }
}

/// Snapshot of the indicators for one asset at the end of its price series.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IndicatorSet {
    pub short_ma: f64,
    pub long_ma: f64,
    pub rsi: f64,
    pub macd: f64,
    pub weekly_trend: Option<f64>,
    pub current_price: f64,
}

impl IndicatorSet {
    pub fn is_uptrend(&self) -> bool {
        self.short_ma > self.long_ma
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    #[error("insufficient data: have {provided} prices, need at least {required}")]
    InsufficientData { required: usize, provided: usize },

    #[error("invalid {name}: {reason}")]
    InvalidWindow { name: &'static str, reason: String },

    #[error("price at index {index} is not a finite number")]
    InvalidPrice { index: usize },
}

pub fn compute_indicators(
    points: &[PricePoint],
    config: &IndicatorConfig,
) -> Result<IndicatorSet, IndicatorError> {
    config.validate()?;

    let required = config.min_points();
    if points.len() < required {
        return Err(IndicatorError::InsufficientData {
            required,
            provided: points.len(),
        });
    }

    if let Some(index) = points.iter().position(|p| !p.price.is_finite()) {
        return Err(IndicatorError::InvalidPrice { index });
    }

    let closes: Vec<f64> = points.iter().map(|p| p.price).collect();

    let short_ma = trailing_mean(&closes, config.short_window)?;
    let long_ma = trailing_mean(&closes, config.long_window)?;
    let rsi = relative_strength(&closes, config.rsi_window)?;
    let macd = match config.macd_mode {
        MacdMode::Sma => {
            trailing_mean(&closes, config.macd_fast)? - trailing_mean(&closes, config.macd_slow)?
        }
        MacdMode::Ema => ema_spread(&closes, config.macd_fast, config.macd_slow)?,
    };

    // Non-empty: checked against min_points above.
    let current_price = closes[closes.len() - 1];

    Ok(IndicatorSet {
        short_ma,
        long_ma,
        rsi,
        macd,
        weekly_trend: weekly_trend(points),
        current_price,
    })
}

/// RSI from average gain and loss. A window with no losses reads as neutral
/// (50) rather than 100.
pub fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 50.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

fn relative_strength(closes: &[f64], period: usize) -> Result<f64, IndicatorError> {
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let gains: Vec<f64> = deltas.iter().map(|d| d.max(0.0)).collect();
    let losses: Vec<f64> = deltas.iter().map(|d| (-d).max(0.0)).collect();

    let avg_gain = trailing_mean(&gains, period)?;
    let avg_loss = trailing_mean(&losses, period)?;
    Ok(rsi_from_averages(avg_gain, avg_loss))
}

fn trailing_mean(values: &[f64], period: usize) -> Result<f64, IndicatorError> {
    let mut sma = SimpleMovingAverage::new(period).map_err(|_| IndicatorError::InvalidWindow {
        name: "moving average",
        reason: format!("ta rejected period {}", period),
    })?;

    let start = values.len().saturating_sub(period);
    let mut mean = 0.0;
    for &value in &values[start..] {
        mean = sma.next(value);
    }
    Ok(mean)
}

fn ema_spread(closes: &[f64], fast: usize, slow: usize) -> Result<f64, IndicatorError> {
    let ema = |period: usize| {
        ExponentialMovingAverage::new(period).map_err(|_| IndicatorError::InvalidWindow {
            name: "macd",
            reason: format!("ta rejected EMA period {}", period),
        })
    };
    let mut fast_ema = ema(fast)?;
    let mut slow_ema = ema(slow)?;

    let mut spread = 0.0;
    for &close in closes {
        spread = fast_ema.next(close) - slow_ema.next(close);
    }
    Ok(spread)
}

/// Percent change from the last point at or before the one-week mark to the
/// latest point. None when the series covers less than a week.
fn weekly_trend(points: &[PricePoint]) -> Option<f64> {
    let first = points.first()?;
    let last = points.last()?;
    if last.timestamp_ms - first.timestamp_ms < WEEK_MS {
        return None;
    }

    let week_start = last.timestamp_ms - WEEK_MS;
    let base = points.iter().rev().find(|p| p.timestamp_ms <= week_start)?;
    if base.price == 0.0 {
        return None;
    }
    Some((last.price - base.price) / base.price * 100.0)
}
