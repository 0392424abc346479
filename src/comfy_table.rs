use crate::analysis::RankingReport;
use crate::report::{format_price, format_timestamp, format_trend};
use comfy_table::{
    Attribute, Cell, CellAlignment, Color, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_BORDERS_ONLY,
};

/// Brightness for a row, from 0.4 for the smallest share up to 1.0 for the leader.
pub(crate) fn get_visibility_ratio(current: f64, top: f64) -> f64 {
    if top <= 0.0 {
        1.0
    } else {
        (0.4 + 0.6 * (current / top)).max(0.4)
    }
}

fn header(label: &str) -> Cell {
    Cell::new(label).add_attribute(Attribute::Bold)
}

pub fn build_table(report: &RankingReport) -> Table {
    let currency = report.vs_currency.to_uppercase();

    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            header("Rank"),
            header("Asset"),
            header(&format!("Price ({})", currency)).set_alignment(CellAlignment::Right),
            header("Score").set_alignment(CellAlignment::Right),
            header("RSI").set_alignment(CellAlignment::Right),
            header("7d").set_alignment(CellAlignment::Right),
            header("Allocation (%)").set_alignment(CellAlignment::Right),
        ]);

    let top_share = report
        .ranked
        .first()
        .and_then(|a| a.allocation_pct)
        .unwrap_or(0.0);

    for (rank, asset) in report.ranked.iter().enumerate() {
        let share = asset.allocation_pct.unwrap_or(0.0);
        let ratio = get_visibility_ratio(share, top_share);

        let cyan_val = (255.0 * ratio) as u8;
        let green_val = (255.0 * ratio) as u8;
        let gray_val = (150.0 * ratio) as u8;
        let gray = Color::Rgb {
            r: gray_val,
            g: gray_val,
            b: gray_val,
        };

        table.add_row(vec![
            Cell::new(rank + 1).fg(Color::DarkGrey),
            Cell::new(format!("{} ({})", asset.name, asset.symbol)).fg(Color::Rgb {
                r: 0,
                g: cyan_val,
                b: cyan_val,
            }),
            Cell::new(format_price(asset.display_price()))
                .fg(gray)
                .set_alignment(CellAlignment::Right),
            Cell::new(asset.score).set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.1}", asset.indicators.rsi))
                .fg(gray)
                .set_alignment(CellAlignment::Right),
            Cell::new(format_trend(asset.indicators.weekly_trend))
                .fg(gray)
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.2}%", share))
                .fg(Color::Rgb {
                    r: 0,
                    g: green_val,
                    b: 0,
                })
                .set_alignment(CellAlignment::Right),
        ]);
    }

    table
}

pub fn print_report(report: &RankingReport) {
    if report.ranked.is_empty() {
        println!("No coins could be ranked.");
    } else {
        let title = format!(
            "(Data taken at {} UTC, policy '{}')",
            format_timestamp(report.generated_at_ms),
            report.policy
        );
        println!("\n{}\n{}", title, build_table(report));
    }

    if !report.failures.is_empty() {
        println!("\nSkipped {} coin(s):", report.failures.len());
        for failure in &report.failures {
            println!("  {:<8} {}", failure.symbol, failure.reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorSet;
    use crate::ranking::ScoredAsset;
    use crate::scoring::AssetMetrics;

    #[test]
    fn visibility_ratio_is_floored() {
        assert_eq!(get_visibility_ratio(50.0, 50.0), 1.0);
        assert_eq!(get_visibility_ratio(0.0, 50.0), 0.4);
        assert_eq!(get_visibility_ratio(10.0, 0.0), 1.0);
    }

    #[test]
    fn table_has_a_row_per_ranked_asset() {
        let asset = ScoredAsset {
            id: "ethereum".to_string(),
            name: "Ethereum".to_string(),
            symbol: "ETH".to_string(),
            indicators: IndicatorSet {
                short_ma: 3100.0,
                long_ma: 3000.0,
                rsi: 61.0,
                macd: 12.0,
                weekly_trend: None,
                current_price: 3200.0,
            },
            metrics: AssetMetrics {
                total_volume: 1e10,
                market_cap: 4e11,
            },
            score: 70,
            allocation_pct: Some(100.0),
            spot_price: None,
        };
        let report = RankingReport {
            ranked: vec![asset.clone(), asset],
            vs_currency: "eur".to_string(),
            ..RankingReport::empty()
        };

        let table = build_table(&report);
        assert_eq!(table.row_iter().count(), 2);

        let rendered = table.to_string();
        assert!(rendered.contains("Price (EUR)"));
        assert!(rendered.contains("Ethereum (ETH)"));
        assert!(rendered.contains("3200.00"));
    }
}
