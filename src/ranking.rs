use crate::indicators::IndicatorSet;
use crate::scoring::AssetMetrics;
use serde::{Deserialize, Serialize};

/// Hundredths of a percent handed out across a selection.
const ALLOCATION_UNITS: u64 = 10_000;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScoredAsset {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub indicators: IndicatorSet,
    pub metrics: AssetMetrics,
    pub score: u32,
    /// Set once by `rank_portfolio`.
    pub allocation_pct: Option<f64>,
    /// Latest spot quote, when the post-ranking refresh succeeded.
    #[serde(default)]
    pub spot_price: Option<f64>,
}

impl ScoredAsset {
    pub fn display_price(&self) -> f64 {
        self.spot_price.unwrap_or(self.indicators.current_price)
    }
}

/// Sorts candidates by score (highest first, ties keep their incoming order),
/// keeps the first `top_k` and attaches each one's share of the total score.
///
/// Shares are two-decimal percentages that always add up to exactly 100.00:
/// every asset gets its share truncated to the hundredth, and the hundredths
/// left over go to the largest remainders. With a zero total every share is 0.
pub fn rank_portfolio(mut candidates: Vec<ScoredAsset>, top_k: usize) -> Vec<ScoredAsset> {
    candidates.sort_by(|a, b| b.score.cmp(&a.score));
    candidates.truncate(top_k);

    let total: u64 = candidates.iter().map(|c| u64::from(c.score)).sum();
    if total == 0 {
        for candidate in &mut candidates {
            candidate.allocation_pct = Some(0.0);
        }
        return candidates;
    }

    let mut units: Vec<u64> = Vec::with_capacity(candidates.len());
    let mut remainders: Vec<(usize, u64)> = Vec::with_capacity(candidates.len());
    for (i, candidate) in candidates.iter().enumerate() {
        let weighted = u64::from(candidate.score) * ALLOCATION_UNITS;
        units.push(weighted / total);
        remainders.push((i, weighted % total));
    }

    let assigned: u64 = units.iter().sum();
    let leftover = (ALLOCATION_UNITS - assigned) as usize;
    remainders.sort_by(|a, b| b.1.cmp(&a.1));
    for &(i, _) in remainders.iter().take(leftover) {
        units[i] += 1;
    }

    for (candidate, share) in candidates.iter_mut().zip(units) {
        candidate.allocation_pct = Some(share as f64 / 100.0);
    }
    candidates
}
