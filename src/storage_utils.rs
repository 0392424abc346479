use crate::indicators::IndicatorConfig;
use crate::market_data::{DEFAULT_BASE_URL, HistoryInterval};
use crate::scoring::ScoringConfig;
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tokio::fs;

// CONFIGURATION STRUCTS
// Every section falls back to its defaults, so a partial config.json is fine.

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub vs_currency: String,    // e.g., "usd"
    pub listing_size: u32,      // how many coins of the market-cap listing to consider
    pub history_days: u32,      // lookback requested per coin
    pub interval: HistoryInterval,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            vs_currency: "usd".to_string(),
            listing_size: 50,
            history_days: 90,
            interval: HistoryInterval::Daily,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub concurrency: usize,     // 1 fetches histories one after another
    pub request_delay_ms: u64,  // pause before each history request
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            request_delay_ms: 1_500,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PortfolioConfig {
    pub top_k: usize,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self { top_k: 10 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReportConfig {
    pub markdown_path: Option<PathBuf>,
    pub title: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            markdown_path: Some(PathBuf::from("README.md")),
            title: "Crypto Market Report".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub fetch: FetchConfig,
    pub indicators: IndicatorConfig,
    pub scoring: ScoringConfig,
    pub portfolio: PortfolioConfig,
    pub report: ReportConfig,
}

impl AppConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.indicators.validate()?;
        self.scoring.resolve()?;
        if self.portfolio.top_k == 0 {
            bail!("portfolio.top_k must be at least 1");
        }
        if self.fetch.concurrency == 0 {
            bail!("fetch.concurrency must be at least 1");
        }
        if self.api.listing_size == 0 || self.api.listing_size > 250 {
            bail!(
                "api.listing_size must be between 1 and 250, got {}",
                self.api.listing_size
            );
        }
        let needed_days = self.indicators.min_points() as u32;
        if self.api.interval == HistoryInterval::Daily && self.api.history_days < needed_days {
            bail!(
                "api.history_days ({}) is shorter than the {} daily points the indicators need",
                self.api.history_days,
                needed_days
            );
        }
        Ok(())
    }
}

// STORAGE MANAGER

pub struct AsyncStorageManager {
    pub base_dir: PathBuf,
}

impl AsyncStorageManager {
    /// Storage directory relative to the running executable.
    pub async fn new_relative<P: AsRef<Path>>(relative_path: P) -> anyhow::Result<Self> {
        let exe_path = std::env::current_exe()?;
        let base_dir = exe_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not find binary directory"))?
            .join(relative_path);
        Self::new(base_dir).await
    }

    /// Storage rooted at an explicit directory, created if missing.
    pub async fn new<P: Into<PathBuf>>(base_dir: P) -> anyhow::Result<Self> {
        let base_dir = base_dir.into();
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir)
                .await
                .with_context(|| format!("creating storage directory {:?}", base_dir))?;
        }
        Ok(Self { base_dir })
    }

    /// Writes `<filename>.json` through a temp file and a rename so a crash
    /// never leaves a half-written file behind.
    pub async fn save<T: Serialize>(&self, filename: &str, data: &T) -> anyhow::Result<()> {
        let file_name = format!("{}.json", filename);
        let final_path = self.base_dir.join(&file_name);
        let tmp_path = self.base_dir.join(format!("{}.tmp", file_name));

        let json_bytes = serde_json::to_vec_pretty(data)?;
        fs::write(&tmp_path, json_bytes).await?;
        fs::rename(tmp_path, final_path).await?;

        Ok(())
    }

    pub async fn load<T: DeserializeOwned>(&self, filename: &str) -> anyhow::Result<T> {
        let path = self.base_dir.join(format!("{}.json", filename));
        let content = fs::read(&path)
            .await
            .with_context(|| format!("reading {:?}", path))?;
        let data = serde_json::from_slice(&content).with_context(|| format!("parsing {:?}", path))?;
        Ok(data)
    }

    /// Loads `config.json`, writing the defaults there first if it does not exist.
    pub async fn load_or_init_config(&self) -> anyhow::Result<AppConfig> {
        let path = self.base_dir.join("config.json");
        if !path.exists() {
            let config = AppConfig::default();
            self.save("config", &config).await?;
            log::info!("Wrote default config to {:?}", path);
            return Ok(config);
        }
        self.load("config").await
    }
}
