use crate::indicators::PricePoint;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

// Longest rate-limit pause we are willing to sit through.
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(120);
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// One row of the ranked market listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MarketListing {
    pub id: String,
    pub name: String,
    pub symbol: String,
    #[serde(default, deserialize_with = "deserialize_f64_lenient")]
    pub current_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_lenient")]
    pub total_volume: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_lenient")]
    pub market_cap: Option<f64>,
}

#[derive(Deserialize, Debug)]
struct MarketChart {
    #[serde(default)]
    prices: Vec<(f64, f64)>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryInterval {
    #[default]
    Daily,
    Hourly,
}

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("rate limited by {url}")]
    RateLimited { url: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Where listings and price histories come from.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Coins ordered by market cap, largest first.
    async fn fetch_markets(
        &self,
        vs_currency: &str,
        per_page: u32,
    ) -> Result<Vec<MarketListing>, MarketDataError>;

    async fn fetch_price_history(
        &self,
        id: &str,
        vs_currency: &str,
        days: u32,
        interval: HistoryInterval,
    ) -> Result<Vec<PricePoint>, MarketDataError>;

    async fn fetch_spot_prices(
        &self,
        ids: &[String],
        vs_currency: &str,
    ) -> Result<HashMap<String, f64>, MarketDataError>;
}

pub struct CoinGeckoClient {
    client: Client,
    base_url: String,
}

impl CoinGeckoClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("coin-ranker/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(8)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, MarketDataError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|source| MarketDataError::Http {
                url: url.clone(),
                source,
            })?;

        let status = response.status();

        // Sit out the ban so the next request goes through, but still report
        // this one as failed.
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::IM_A_TEAPOT {
            let wait = retry_after(response.headers())
                .unwrap_or(DEFAULT_RATE_LIMIT_WAIT)
                .min(MAX_RATE_LIMIT_WAIT);
            log::warn!("Rate limited on {}, pausing {:?}", url, wait);
            tokio::time::sleep(wait).await;
            return Err(MarketDataError::RateLimited { url });
        }

        if !status.is_success() {
            return Err(MarketDataError::Status {
                url,
                status: status.as_u16(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|source| MarketDataError::Decode { url, source })
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl MarketDataSource for CoinGeckoClient {
    async fn fetch_markets(
        &self,
        vs_currency: &str,
        per_page: u32,
    ) -> Result<Vec<MarketListing>, MarketDataError> {
        let query = vec![
            ("vs_currency", vs_currency.to_string()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", per_page.to_string()),
            ("page", "1".to_string()),
        ];
        self.get_json("/coins/markets", &query).await
    }

    async fn fetch_price_history(
        &self,
        id: &str,
        vs_currency: &str,
        days: u32,
        interval: HistoryInterval,
    ) -> Result<Vec<PricePoint>, MarketDataError> {
        let mut query = vec![
            ("vs_currency", vs_currency.to_string()),
            ("days", days.to_string()),
        ];
        // Hourly is the API's automatic granularity for 2..=90 days; only
        // daily has to be asked for.
        if interval == HistoryInterval::Daily {
            query.push(("interval", "daily".to_string()));
        }

        let chart: MarketChart = self
            .get_json(&format!("/coins/{}/market_chart", id), &query)
            .await?;
        Ok(chart_to_points(chart))
    }

    async fn fetch_spot_prices(
        &self,
        ids: &[String],
        vs_currency: &str,
    ) -> Result<HashMap<String, f64>, MarketDataError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let query = vec![
            ("ids", ids.join(",")),
            ("vs_currencies", vs_currency.to_string()),
        ];
        let quotes: HashMap<String, HashMap<String, f64>> =
            self.get_json("/simple/price", &query).await?;
        Ok(spot_quotes(quotes, vs_currency))
    }
}

fn chart_to_points(chart: MarketChart) -> Vec<PricePoint> {
    let mut points: Vec<PricePoint> = chart
        .prices
        .into_iter()
        .map(|(ts, price)| PricePoint {
            timestamp_ms: ts as i64,
            price,
        })
        .collect();
    // The latest sample can repeat the final daily timestamp; keep the later quote.
    points.sort_by_key(|p| p.timestamp_ms);
    points.dedup_by(|later, kept| {
        if later.timestamp_ms == kept.timestamp_ms {
            kept.price = later.price;
            true
        } else {
            false
        }
    });
    points
}

fn spot_quotes(
    quotes: HashMap<String, HashMap<String, f64>>,
    vs_currency: &str,
) -> HashMap<String, f64> {
    quotes
        .into_iter()
        .filter_map(|(id, by_currency)| by_currency.get(vs_currency).map(|&price| (id, price)))
        .collect()
}

// --- Lenient number parsing ---

struct LenientF64Visitor;

impl<'de> Visitor<'de> for LenientF64Visitor {
    type Value = Option<f64>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a float, an integer, null, or a string representing a number")
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
        Ok(Some(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
        Ok(Some(v as f64))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Some(v as f64))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.trim().is_empty() {
            Ok(None)
        } else {
            v.trim().parse::<f64>().map(Some).map_err(E::custom)
        }
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_none<E>(self) -> Result<Self::Value, E> {
        Ok(None)
    }
}

fn deserialize_f64_lenient<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(LenientF64Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_tolerates_nulls_and_numeric_strings() {
        let json = r#"[
            {"id": "bitcoin", "name": "Bitcoin", "symbol": "btc",
             "current_price": 67000.5, "total_volume": 25000000000, "market_cap": "1300000000000"},
            {"id": "obscure", "name": "Obscure", "symbol": "obs",
             "current_price": null, "total_volume": "", "image": "https://example.invalid/x.png"}
        ]"#;
        let listings: Vec<MarketListing> = serde_json::from_str(json).unwrap();

        assert_eq!(listings[0].current_price, Some(67000.5));
        assert_eq!(listings[0].total_volume, Some(25_000_000_000.0));
        assert_eq!(listings[0].market_cap, Some(1_300_000_000_000.0));

        assert_eq!(listings[1].current_price, None);
        assert_eq!(listings[1].total_volume, None);
        assert_eq!(listings[1].market_cap, None);
    }

    #[test]
    fn chart_points_are_sorted_and_deduplicated() {
        let chart: MarketChart = serde_json::from_str(
            r#"{"prices": [[1700086400000, 2.0], [1700000000000, 1.0], [1700086400000, 2.5]],
                "market_caps": [], "total_volumes": []}"#,
        )
        .unwrap();
        let points = chart_to_points(chart);
        assert_eq!(
            points,
            vec![
                PricePoint {
                    timestamp_ms: 1_700_000_000_000,
                    price: 1.0
                },
                PricePoint {
                    timestamp_ms: 1_700_086_400_000,
                    price: 2.5
                },
            ]
        );
    }

    #[test]
    fn repeated_final_timestamp_keeps_the_fresh_quote() {
        let chart: MarketChart = serde_json::from_str(
            r#"{"prices": [[1700000000000, 1.0], [1700086400000, 2.0], [1700086400000, 2.1], [1700086400000, 2.2]],
                "market_caps": [], "total_volumes": []}"#,
        )
        .unwrap();
        let points = chart_to_points(chart);
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].price, 2.2);
    }

    #[test]
    fn spot_quotes_pick_the_requested_currency() {
        let quotes: HashMap<String, HashMap<String, f64>> = serde_json::from_str(
            r#"{"bitcoin": {"usd": 67000.0, "eur": 61000.0}, "ethereum": {"eur": 3000.0}}"#,
        )
        .unwrap();
        let prices = spot_quotes(quotes, "usd");
        assert_eq!(prices.len(), 1);
        assert_eq!(prices["bitcoin"], 67000.0);
    }

    #[test]
    fn retry_after_reads_whole_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(reqwest::header::RETRY_AFTER, "17".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(17)));
    }
}
