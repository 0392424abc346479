//! The ranking pipeline: listing, per-coin history, indicators, score, portfolio.

use crate::indicators::{IndicatorError, compute_indicators};
use crate::market_data::{CoinGeckoClient, MarketDataSource, MarketListing};
use crate::ranking::{ScoredAsset, rank_portfolio};
use crate::scoring::{AssetMetrics, ScoreError, ScoringPolicy, calculate_score};
use crate::storage_utils::{AppConfig, AsyncStorageManager};
use anyhow::{Context, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Interval, MissedTickBehavior};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    InsufficientData { required: usize, provided: usize },
    InvalidData { message: String },
    Fetch { message: String },
    PreconditionViolation { message: String },
}

impl From<IndicatorError> for FailureReason {
    fn from(err: IndicatorError) -> Self {
        match err {
            IndicatorError::InsufficientData { required, provided } => {
                FailureReason::InsufficientData { required, provided }
            }
            other => FailureReason::InvalidData {
                message: other.to_string(),
            },
        }
    }
}

impl From<ScoreError> for FailureReason {
    fn from(err: ScoreError) -> Self {
        FailureReason::PreconditionViolation {
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::InsufficientData { required, provided } => {
                write!(f, "insufficient data ({} of {} prices)", provided, required)
            }
            FailureReason::InvalidData { message } => write!(f, "invalid data: {}", message),
            FailureReason::Fetch { message } => write!(f, "fetch failed: {}", message),
            FailureReason::PreconditionViolation { message } => f.write_str(message),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AssetFailure {
    pub id: String,
    pub symbol: String,
    pub reason: FailureReason,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RankingReport {
    pub generated_at_ms: i64,
    pub vs_currency: String,
    pub policy: String,
    pub candidates_considered: usize,
    pub ranked: Vec<ScoredAsset>,
    pub failures: Vec<AssetFailure>,
}

impl RankingReport {
    pub fn empty() -> Self {
        Self {
            generated_at_ms: 0,
            vs_currency: String::new(),
            policy: String::new(),
            candidates_considered: 0,
            ranked: Vec::new(),
            failures: Vec::new(),
        }
    }
}

fn listing_metrics(listing: &MarketListing) -> Result<AssetMetrics, FailureReason> {
    let missing = |field: &str| FailureReason::InvalidData {
        message: format!("listing has no {}", field),
    };
    Ok(AssetMetrics {
        total_volume: listing.total_volume.ok_or_else(|| missing("total_volume"))?,
        market_cap: listing.market_cap.ok_or_else(|| missing("market_cap"))?,
    })
}

/// Spaces history requests `delay` apart across every in-flight fetch.
struct RequestPacer {
    interval: Mutex<Interval>,
}

impl RequestPacer {
    fn new(delay_ms: u64) -> Option<Self> {
        if delay_ms == 0 {
            return None;
        }
        let mut interval = tokio::time::interval(Duration::from_millis(delay_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(Self {
            interval: Mutex::new(interval),
        })
    }

    async fn wait_turn(&self) {
        self.interval.lock().await.tick().await;
    }
}

async fn evaluate_asset(
    source: &dyn MarketDataSource,
    listing: &MarketListing,
    config: &AppConfig,
    policy: &ScoringPolicy,
    pacer: Option<&RequestPacer>,
) -> Result<ScoredAsset, FailureReason> {
    let metrics = listing_metrics(listing)?;

    if let Some(pacer) = pacer {
        pacer.wait_turn().await;
    }

    let history = source
        .fetch_price_history(
            &listing.id,
            &config.api.vs_currency,
            config.api.history_days,
            config.api.interval,
        )
        .await
        .map_err(|e| FailureReason::Fetch {
            message: e.to_string(),
        })?;

    let indicators = compute_indicators(&history, &config.indicators)?;
    let score = calculate_score(&indicators, &metrics, policy)?;

    log::debug!(
        "{} scored {} (rsi {:.1}, macd {:.4}, short/long {:.4}/{:.4})",
        listing.id,
        score,
        indicators.rsi,
        indicators.macd,
        indicators.short_ma,
        indicators.long_ma
    );

    Ok(ScoredAsset {
        id: listing.id.clone(),
        name: listing.name.clone(),
        symbol: listing.symbol.to_uppercase(),
        indicators,
        metrics,
        score,
        allocation_pct: None,
        spot_price: None,
    })
}

/// Runs the whole ranking over `source`. Only a failed listing fetch (or an
/// invalid config) fails the run; every per-coin problem ends up in
/// `failures` instead.
pub async fn run_pipeline(source: &dyn MarketDataSource, config: &AppConfig) -> Result<RankingReport> {
    config.validate()?;
    let policy = config.scoring.resolve()?;

    log::info!(
        "Fetching top {} listings in {}",
        config.api.listing_size,
        config.api.vs_currency
    );
    let listings = source
        .fetch_markets(&config.api.vs_currency, config.api.listing_size)
        .await
        .context("failed to fetch the market listing")?;
    let candidates_considered = listings.len();

    log::info!(
        "Scoring {} candidates ({} at a time, policy '{}')",
        candidates_considered,
        config.fetch.concurrency,
        policy.name
    );

    let pacer = RequestPacer::new(config.fetch.request_delay_ms);

    // `buffered` yields in listing order, so ties in the ranking stay in
    // market-cap order no matter which fetch finishes first.
    let outcomes: Vec<(MarketListing, Result<ScoredAsset, FailureReason>)> =
        futures::stream::iter(listings.into_iter().map(|listing| {
            let policy = &policy;
            let pacer = pacer.as_ref();
            async move {
                let outcome = evaluate_asset(source, &listing, config, policy, pacer).await;
                (listing, outcome)
            }
        }))
        .buffered(config.fetch.concurrency)
        .collect()
        .await;

    let mut scored = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for (listing, outcome) in outcomes {
        match outcome {
            Ok(asset) => scored.push(asset),
            Err(reason) => {
                log::warn!("Skipping {}: {}", listing.id, reason);
                failures.push(AssetFailure {
                    id: listing.id,
                    symbol: listing.symbol.to_uppercase(),
                    reason,
                });
            }
        }
    }

    let mut ranked = rank_portfolio(scored, config.portfolio.top_k);
    refresh_spot_prices(source, &mut ranked, &config.api.vs_currency).await;

    log::info!(
        "Ranked {} of {} candidates ({} skipped)",
        ranked.len(),
        candidates_considered,
        failures.len()
    );

    Ok(RankingReport {
        generated_at_ms: chrono::Utc::now().timestamp_millis(),
        vs_currency: config.api.vs_currency.clone(),
        policy: policy.name,
        candidates_considered,
        ranked,
        failures,
    })
}

async fn refresh_spot_prices(source: &dyn MarketDataSource, ranked: &mut [ScoredAsset], vs_currency: &str) {
    let ids: Vec<String> = ranked.iter().map(|a| a.id.clone()).collect();
    match source.fetch_spot_prices(&ids, vs_currency).await {
        Ok(prices) => {
            for asset in ranked.iter_mut() {
                asset.spot_price = prices.get(&asset.id).copied();
            }
        }
        Err(e) => log::warn!("Spot price refresh failed, keeping history prices: {}", e),
    }
}

/// Runs the pipeline against CoinGecko and stores the report as `results.json`.
pub async fn run_analysis_pipeline(
    config: &AppConfig,
    storage: &AsyncStorageManager,
) -> Result<RankingReport> {
    let client = CoinGeckoClient::new(&config.api.base_url)?;
    let report = run_pipeline(&client, config).await?;
    storage.save("results", &report).await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::PricePoint;
    use crate::market_data::{HistoryInterval, MarketDataError};
    use async_trait::async_trait;
    use std::collections::HashMap;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    struct FakeSource {
        listings: Option<Vec<MarketListing>>,
        histories: HashMap<String, Vec<f64>>,
        spot: HashMap<String, f64>,
    }

    fn listing(id: &str, volume: f64, cap: f64) -> MarketListing {
        MarketListing {
            id: id.to_string(),
            name: id.to_string(),
            symbol: id[..3].to_string(),
            current_price: Some(1.0),
            total_volume: Some(volume),
            market_cap: Some(cap),
        }
    }

    #[async_trait]
    impl MarketDataSource for FakeSource {
        async fn fetch_markets(&self, _: &str, _: u32) -> Result<Vec<MarketListing>, MarketDataError> {
            self.listings.clone().ok_or(MarketDataError::Status {
                url: "fake://markets".to_string(),
                status: 500,
            })
        }

        async fn fetch_price_history(
            &self,
            id: &str,
            _: &str,
            _: u32,
            _: HistoryInterval,
        ) -> Result<Vec<PricePoint>, MarketDataError> {
            let closes = self.histories.get(id).ok_or(MarketDataError::Status {
                url: format!("fake://{}", id),
                status: 404,
            })?;
            Ok(closes
                .iter()
                .enumerate()
                .map(|(i, &price)| PricePoint {
                    timestamp_ms: i as i64 * DAY_MS,
                    price,
                })
                .collect())
        }

        async fn fetch_spot_prices(&self, _: &[String], _: &str) -> Result<HashMap<String, f64>, MarketDataError> {
            Ok(self.spot.clone())
        }
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.fetch.request_delay_ms = 0;
        config
    }

    fn rising(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    fn falling(n: usize) -> Vec<f64> {
        (0..n).map(|i| 500.0 - i as f64).collect()
    }

    #[tokio::test]
    async fn failures_are_isolated_and_reported() {
        let source = FakeSource {
            listings: Some(vec![
                listing("bitcoin", 2e10, 1e12),
                listing("shortcoin", 2e10, 1e12),
                listing("missing", 2e10, 1e12),
                listing("dogecoin", 1e3, 1e3),
            ]),
            histories: HashMap::from([
                ("bitcoin".to_string(), rising(90)),
                ("shortcoin".to_string(), rising(10)),
                ("dogecoin".to_string(), falling(90)),
            ]),
            spot: HashMap::from([("bitcoin".to_string(), 190.5)]),
        };

        let report = run_pipeline(&source, &config()).await.unwrap();

        assert_eq!(report.candidates_considered, 4);
        assert_eq!(report.policy, "balanced");

        let ids: Vec<&str> = report.ranked.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["bitcoin", "dogecoin"]);
        // trend 25 + neutral rsi 20 + macd 15 + volume 10 + cap 10; 182 -> 189 is under 5% a week
        assert_eq!(report.ranked[0].score, 80);
        // falling: only oversold rsi
        assert_eq!(report.ranked[1].score, 30);
        assert_eq!(report.ranked[0].spot_price, Some(190.5));
        assert_eq!(report.ranked[1].spot_price, None);

        let total: f64 = report.ranked.iter().filter_map(|a| a.allocation_pct).sum();
        assert!((total - 100.0).abs() < 1e-9);

        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].id, "shortcoin");
        assert_eq!(
            report.failures[0].reason,
            FailureReason::InsufficientData {
                required: 50,
                provided: 10
            }
        );
        assert_eq!(report.failures[1].id, "missing");
        assert!(matches!(report.failures[1].reason, FailureReason::Fetch { .. }));
    }

    #[tokio::test]
    async fn listing_without_market_cap_is_skipped() {
        let mut bare = listing("bareasset", 1.0, 1.0);
        bare.market_cap = None;
        let source = FakeSource {
            listings: Some(vec![bare]),
            histories: HashMap::from([("bareasset".to_string(), rising(90))]),
            spot: HashMap::new(),
        };

        let report = run_pipeline(&source, &config()).await.unwrap();
        assert!(report.ranked.is_empty());
        assert_eq!(
            report.failures[0].reason,
            FailureReason::InvalidData {
                message: "listing has no market_cap".to_string()
            }
        );
    }

    #[tokio::test]
    async fn listing_failure_fails_the_run() {
        let source = FakeSource {
            listings: None,
            histories: HashMap::new(),
            spot: HashMap::new(),
        };
        let err = run_pipeline(&source, &config()).await.unwrap_err();
        assert!(err.to_string().contains("market listing"));
    }

    #[tokio::test]
    async fn sequential_and_concurrent_fetches_agree() {
        let listings: Vec<MarketListing> = (0..12)
            .map(|i| listing(&format!("coin{:02}", i), 1e9 * i as f64, 1e10 * i as f64))
            .collect();
        let histories: HashMap<String, Vec<f64>> = listings
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let series = if i % 2 == 0 { rising(80) } else { falling(80) };
                (l.id.clone(), series)
            })
            .collect();
        let source = FakeSource {
            listings: Some(listings),
            histories,
            spot: HashMap::new(),
        };

        let mut sequential = config();
        sequential.fetch.concurrency = 1;
        let mut concurrent = config();
        concurrent.fetch.concurrency = 6;

        let a = run_pipeline(&source, &sequential).await.unwrap();
        let b = run_pipeline(&source, &concurrent).await.unwrap();
        assert_eq!(a.ranked, b.ranked);
        assert_eq!(a.ranked.len(), 10);
    }

    /// Records when each history request starts.
    struct RecordingSource {
        inner: FakeSource,
        starts: std::sync::Mutex<Vec<tokio::time::Instant>>,
    }

    #[async_trait]
    impl MarketDataSource for RecordingSource {
        async fn fetch_markets(&self, vs: &str, n: u32) -> Result<Vec<MarketListing>, MarketDataError> {
            self.inner.fetch_markets(vs, n).await
        }

        async fn fetch_price_history(
            &self,
            id: &str,
            vs: &str,
            days: u32,
            interval: HistoryInterval,
        ) -> Result<Vec<PricePoint>, MarketDataError> {
            self.starts.lock().unwrap().push(tokio::time::Instant::now());
            self.inner.fetch_price_history(id, vs, days, interval).await
        }

        async fn fetch_spot_prices(&self, ids: &[String], vs: &str) -> Result<HashMap<String, f64>, MarketDataError> {
            self.inner.fetch_spot_prices(ids, vs).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_delay_spaces_out_concurrent_fetches() {
        let listings: Vec<MarketListing> = (0..8)
            .map(|i| listing(&format!("coin{:02}", i), 1e9, 1e10))
            .collect();
        let histories = listings.iter().map(|l| (l.id.clone(), rising(60))).collect();
        let source = RecordingSource {
            inner: FakeSource {
                listings: Some(listings),
                histories,
                spot: HashMap::new(),
            },
            starts: std::sync::Mutex::new(Vec::new()),
        };

        let mut paced = config();
        paced.fetch.concurrency = 4;
        paced.fetch.request_delay_ms = 200;
        let report = run_pipeline(&source, &paced).await.unwrap();
        assert_eq!(report.failures.len(), 0);

        let starts = source.starts.lock().unwrap();
        assert_eq!(starts.len(), 8);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
    }
}
