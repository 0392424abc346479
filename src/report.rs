//! Markdown rendering of a ranking, written to the configured report file.

use crate::analysis::RankingReport;
use crate::ranking::ScoredAsset;
use crate::storage_utils::ReportConfig;
use chrono::DateTime;
use std::fmt::Write as _;
use std::path::Path;

pub fn format_timestamp(ts_ms: i64) -> String {
    if ts_ms == 0 {
        return "Never".to_string();
    }
    DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "Unknown Time".to_string())
}

/// Prices keep more decimals the smaller they get.
pub fn format_price(price: f64) -> String {
    if price >= 1.0 {
        format!("{:.2}", price)
    } else if price >= 0.01 {
        format!("{:.4}", price)
    } else {
        format!("{:.8}", price)
    }
}

pub fn format_trend(trend: Option<f64>) -> String {
    trend.map_or_else(|| "n/a".to_string(), |t| format!("{:+.2}%", t))
}

fn trend_label(asset: &ScoredAsset) -> &'static str {
    if asset.indicators.is_uptrend() { "up" } else { "down" }
}

fn headline(top: Option<&ScoredAsset>) -> String {
    match top {
        Some(asset) if asset.indicators.is_uptrend() => format!(
            "Top pick: **{} ({})** with a score of {} and a {:.2}% allocation.",
            asset.name,
            asset.symbol,
            asset.score,
            asset.allocation_pct.unwrap_or(0.0)
        ),
        Some(_) => "No ranked coin is trading above its long-term average; waiting is suggested.".to_string(),
        None => "No coin could be scored in this run.".to_string(),
    }
}

pub fn render_markdown(report: &RankingReport, title: &str) -> String {
    let currency = report.vs_currency.to_uppercase();
    let mut out = String::new();

    let _ = writeln!(out, "# {} - {}", title, format_timestamp(report.generated_at_ms));
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "| # | Coin | Price ({}) | MA short / long | Trend | Score | RSI | MACD | 7d | Allocation |",
        currency
    );
    let _ = writeln!(out, "|---|------|------:|----------------:|:-----:|------:|----:|-----:|---:|-----------:|");
    for (rank, asset) in report.ranked.iter().enumerate() {
        let _ = writeln!(
            out,
            "| {} | {} ({}) | {} | {} / {} | {} | {} | {:.1} | {:.4} | {} | {:.2}% |",
            rank + 1,
            asset.name,
            asset.symbol,
            format_price(asset.display_price()),
            format_price(asset.indicators.short_ma),
            format_price(asset.indicators.long_ma),
            trend_label(asset),
            asset.score,
            asset.indicators.rsi,
            asset.indicators.macd,
            format_trend(asset.indicators.weekly_trend),
            asset.allocation_pct.unwrap_or(0.0)
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "### Result");
    let _ = writeln!(out, "{}", headline(report.ranked.first()));
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Scored with the `{}` policy; {} of {} candidates ranked, {} skipped.",
        report.policy,
        report.ranked.len(),
        report.candidates_considered,
        report.failures.len()
    );

    if !report.failures.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "<details><summary>Skipped coins</summary>");
        let _ = writeln!(out);
        for failure in &report.failures {
            let _ = writeln!(out, "- {} ({}): {}", failure.symbol, failure.id, failure.reason);
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "</details>");
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "> This is a simple heuristic analysis and not financial advice. Always do your own research."
    );
    out
}

pub async fn write_markdown(path: &Path, report: &RankingReport, title: &str) -> anyhow::Result<()> {
    tokio::fs::write(path, render_markdown(report, title)).await?;
    log::info!("Report written to {:?}", path);
    Ok(())
}

/// Writes the markdown report when the config names a path. Returns whether
/// a file was written.
pub async fn publish(config: &ReportConfig, report: &RankingReport) -> anyhow::Result<bool> {
    match &config.markdown_path {
        Some(path) => {
            write_markdown(path, report, &config.title).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AssetFailure, FailureReason};
    use crate::indicators::IndicatorSet;
    use crate::scoring::AssetMetrics;

    fn ranked(uptrend: bool) -> ScoredAsset {
        ScoredAsset {
            id: "bitcoin".to_string(),
            name: "Bitcoin".to_string(),
            symbol: "BTC".to_string(),
            indicators: IndicatorSet {
                short_ma: if uptrend { 110.0 } else { 90.0 },
                long_ma: 100.0,
                rsi: 55.3,
                macd: 1.23457,
                weekly_trend: Some(6.5),
                current_price: 67000.0,
            },
            metrics: AssetMetrics {
                total_volume: 1e10,
                market_cap: 1e12,
            },
            score: 80,
            allocation_pct: Some(100.0),
            spot_price: Some(67123.456),
        }
    }

    fn report(assets: Vec<ScoredAsset>) -> RankingReport {
        RankingReport {
            generated_at_ms: 1_700_000_000_000,
            vs_currency: "usd".to_string(),
            policy: "balanced".to_string(),
            candidates_considered: 2,
            ranked: assets,
            failures: vec![AssetFailure {
                id: "tinycoin".to_string(),
                symbol: "TNY".to_string(),
                reason: FailureReason::InsufficientData {
                    required: 50,
                    provided: 3,
                },
            }],
        }
    }

    #[test]
    fn markdown_contains_rows_headline_and_failures() {
        let md = render_markdown(&report(vec![ranked(true)]), "Crypto Market Report");

        assert!(md.starts_with("# Crypto Market Report - 2023-11-14 22:13\n"));
        assert!(md.contains("| 1 | Bitcoin (BTC) | 67123.46 | 110.00 / 100.00 | up | 80 | 55.3 | 1.2346 | +6.50% | 100.00% |"));
        assert!(md.contains("Top pick: **Bitcoin (BTC)**"));
        assert!(md.contains("- TNY (tinycoin): insufficient data (3 of 50 prices)"));
        assert!(md.contains("not financial advice"));
    }

    #[test]
    fn headline_without_uptrend_suggests_waiting() {
        let md = render_markdown(&report(vec![ranked(false)]), "t");
        assert!(md.contains("waiting is suggested"));
        assert!(md.contains("| 90.00 / 100.00 | down |"));

        let md = render_markdown(&report(Vec::new()), "t");
        assert!(md.contains("No coin could be scored"));
    }

    #[test]
    fn small_prices_keep_precision() {
        assert_eq!(format_price(1234.5), "1234.50");
        assert_eq!(format_price(0.5), "0.5000");
        assert_eq!(format_price(0.00001234), "0.00001234");
        assert_eq!(format_trend(None), "n/a");
        assert_eq!(format_trend(Some(-1.234)), "-1.23%");
    }

    #[tokio::test]
    async fn markdown_is_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("README.md");
        write_markdown(&path, &report(Vec::new()), "Report").await.unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.starts_with("# Report"));
    }

    #[tokio::test]
    async fn publish_follows_the_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");
        let mut config = ReportConfig {
            markdown_path: Some(path.clone()),
            title: "Nightly".to_string(),
        };

        assert!(publish(&config, &report(vec![ranked(true)])).await.unwrap());
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# Nightly"));
        assert!(written.contains("| up |"));

        std::fs::remove_file(&path).unwrap();
        config.markdown_path = None;
        assert!(!publish(&config, &report(vec![ranked(true)])).await.unwrap());
        assert!(!path.exists());
    }
}
