use anyhow::{Context, Result};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    prelude::*,
    text::Line,
    widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table},
};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::analysis::{self, RankingReport};
use crate::comfy_table::get_visibility_ratio;
use crate::report::{self, format_price, format_timestamp, format_trend};
use crate::storage_utils::{AppConfig, AsyncStorageManager};

// --- App State ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Ranking,
    Indicators,
    Skipped,
}

impl View {
    const ALL: [View; 3] = [View::Ranking, View::Indicators, View::Skipped];

    fn label(self) -> &'static str {
        match self {
            View::Ranking => "Portfolio Ranking",
            View::Indicators => "Indicators",
            View::Skipped => "Skipped Coins",
        }
    }
}

struct App {
    data: RankingReport,
    is_refreshing: bool,
    last_error: Option<String>,
    selected_view_index: usize,
    config: AppConfig,
    storage_dir: PathBuf,
}

impl App {
    fn new(data: RankingReport, config: AppConfig, storage_dir: PathBuf) -> Self {
        Self {
            data,
            is_refreshing: false,
            last_error: None,
            selected_view_index: 0,
            config,
            storage_dir,
        }
    }

    fn view(&self) -> View {
        View::ALL[self.selected_view_index]
    }

    fn set_data(&mut self, new_data: RankingReport) {
        self.data = new_data;
        self.is_refreshing = false;
        self.last_error = None;
    }
}

// --- TUI ---

/// Interactive view over the last stored results; F5 or `r` reruns the pipeline.
pub async fn run_tui(config: AppConfig, storage: &AsyncStorageManager) -> Result<()> {
    let initial = storage
        .load::<RankingReport>("results")
        .await
        .unwrap_or_else(|_| RankingReport::empty());
    let mut app = App::new(initial, config, storage.base_dir.clone());

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, &mut app).await;

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    res
}

async fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<()> {
    let (data_tx, mut data_rx) = mpsc::channel::<Result<RankingReport>>(1);

    loop {
        terminal.draw(|f| ui(f, app))?;

        if let Ok(result) = data_rx.try_recv() {
            match result {
                Ok(new_data) => app.set_data(new_data),
                Err(e) => {
                    app.is_refreshing = false;
                    app.last_error = Some(format!("{:#}", e));
                }
            }
        }

        if event::poll(Duration::from_millis(50))? {
            // Resize events need nothing; the next draw picks up the new size.
            if let Event::Key(key) = event::read()? {
                if !handle_key_event(key, app, &data_tx) {
                    return Ok(());
                }
            }
        }
    }
}

fn spawn_refresh(app: &mut App, tx: &mpsc::Sender<Result<RankingReport>>) {
    app.is_refreshing = true;
    let tx_clone = tx.clone();
    let config = app.config.clone();
    let storage_dir = app.storage_dir.clone();
    tokio::spawn(async move {
        let result = async {
            let storage = AsyncStorageManager::new(storage_dir).await?;
            let ranking = analysis::run_analysis_pipeline(&config, &storage).await?;
            report::publish(&config.report, &ranking)
                .await
                .context("ranking saved but the markdown report could not be written")?;
            Ok(ranking)
        }
        .await;
        let _ = tx_clone.send(result).await;
    });
}

fn handle_key_event(key: KeyEvent, app: &mut App, tx: &mpsc::Sender<Result<RankingReport>>) -> bool {
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => return false,
        KeyCode::F(5) | KeyCode::Char('r') if !app.is_refreshing => spawn_refresh(app, tx),
        KeyCode::Up => {
            app.selected_view_index = app
                .selected_view_index
                .checked_sub(1)
                .unwrap_or(View::ALL.len() - 1);
        }
        KeyCode::Down | KeyCode::Tab => {
            app.selected_view_index = (app.selected_view_index + 1) % View::ALL.len();
        }
        KeyCode::Char(c) => {
            if let Some(digit) = c.to_digit(10) {
                if digit > 0 && digit as usize <= View::ALL.len() {
                    app.selected_view_index = digit as usize - 1;
                }
            }
        }
        _ => {}
    }
    true
}

fn ui(f: &mut Frame, app: &App) {
    let main_layout = Layout::horizontal([Constraint::Percentage(20), Constraint::Percentage(80)])
        .split(f.size());

    let right_chunks =
        Layout::vertical([Constraint::Length(3), Constraint::Min(0)]).split(main_layout[1]);

    // Sidebar
    let sidebar_block = Block::default()
        .borders(Borders::ALL)
        .title("Views")
        .title_alignment(Alignment::Center);
    let inner_sidebar_area = sidebar_block.inner(main_layout[0]);
    f.render_widget(sidebar_block, main_layout[0]);

    let sidebar_chunks = Layout::vertical([
        Constraint::Min(1),    // view list
        Constraint::Length(2), // key help
    ])
    .split(inner_sidebar_area);

    let view_lines: Vec<Line> = View::ALL
        .iter()
        .enumerate()
        .map(|(i, view)| {
            let mut line = Line::from(format!("{}. {}", i + 1, view.label()));
            if i == app.selected_view_index {
                line = line.style(Style::default().fg(Color::Yellow).bg(Color::DarkGray));
            }
            line
        })
        .collect();
    f.render_widget(Paragraph::new(view_lines), sidebar_chunks[0]);
    f.render_widget(
        Paragraph::new("F5/r refresh\nq quit").alignment(Alignment::Center),
        sidebar_chunks[1],
    );

    // Status bar
    let status = match &app.last_error {
        Some(err) => format!("Refresh failed: {}", err),
        None => format!(
            "Last Updated: {} | policy '{}' | {} of {} ranked",
            format_timestamp(app.data.generated_at_ms),
            app.data.policy,
            app.data.ranked.len(),
            app.data.candidates_considered
        ),
    };
    f.render_widget(
        Block::default()
            .borders(Borders::ALL)
            .title_alignment(Alignment::Center)
            .title(status),
        right_chunks[0],
    );

    match app.view() {
        View::Ranking => render_ranking(f, app, right_chunks[1]),
        View::Indicators => render_indicators(f, app, right_chunks[1]),
        View::Skipped => render_skipped(f, app, right_chunks[1]),
    }

    if app.is_refreshing {
        let area = centered_rect(60, 20, main_layout[1]);
        f.render_widget(Clear, area);
        f.render_widget(
            Paragraph::new("Running ranking pipeline...\nPlease wait.")
                .block(Block::default().title("Refreshing").borders(Borders::ALL))
                .alignment(Alignment::Center),
            area,
        );
    }
}

fn render_ranking(f: &mut Frame, app: &App, area: Rect) {
    let header = Row::new([
        Cell::from("Rank"),
        Cell::from("Asset"),
        Cell::from(format!("Price ({})", app.data.vs_currency.to_uppercase())),
        Cell::from("Score"),
        Cell::from("Allocation (%)"),
    ])
    .style(Style::default().bg(Color::DarkGray));

    let top_share = app
        .data
        .ranked
        .first()
        .and_then(|a| a.allocation_pct)
        .unwrap_or(0.0);

    let rows = app.data.ranked.iter().enumerate().map(|(i, asset)| {
        let share = asset.allocation_pct.unwrap_or(0.0);
        let ratio = get_visibility_ratio(share, top_share);
        let cyan_val = (255.0 * ratio) as u8;
        let green_val = (255.0 * ratio) as u8;
        let gray_val = (150.0 * ratio) as u8;

        Row::new([
            Cell::from(format!("{}", i + 1)).style(Style::default().fg(Color::DarkGray)),
            Cell::from(format!("{} ({})", asset.name, asset.symbol))
                .style(Style::default().fg(Color::Rgb(0, cyan_val, cyan_val))),
            Cell::from(format_price(asset.display_price()))
                .style(Style::default().fg(Color::Rgb(gray_val, gray_val, gray_val))),
            Cell::from(format!("{}", asset.score)),
            Cell::from(format!("{:.2}%", share))
                .style(Style::default().fg(Color::Rgb(0, green_val, 0))),
        ])
        .height(1)
    });

    f.render_widget(
        Table::new(
            rows,
            [
                Constraint::Length(6),
                Constraint::Percentage(35),
                Constraint::Percentage(25),
                Constraint::Percentage(15),
                Constraint::Percentage(25),
            ],
        )
        .header(header)
        .block(Block::default().borders(Borders::ALL).title("Top Picks")),
        area,
    );
}

fn render_indicators(f: &mut Frame, app: &App, area: Rect) {
    let header = Row::new([
        Cell::from("Asset"),
        Cell::from("Short MA"),
        Cell::from("Long MA"),
        Cell::from("RSI"),
        Cell::from("MACD"),
        Cell::from("7d"),
    ])
    .style(Style::default().bg(Color::DarkGray));

    let rows = app.data.ranked.iter().map(|asset| {
        let ind = &asset.indicators;
        let trend_color = if ind.is_uptrend() {
            Color::Green
        } else {
            Color::Red
        };
        Row::new([
            Cell::from(asset.symbol.clone()),
            Cell::from(format_price(ind.short_ma)).style(Style::default().fg(trend_color)),
            Cell::from(format_price(ind.long_ma)),
            Cell::from(format!("{:.1}", ind.rsi)),
            Cell::from(format!("{:.4}", ind.macd)),
            Cell::from(format_trend(ind.weekly_trend)),
        ])
    });

    f.render_widget(
        Table::new(rows, [Constraint::Ratio(1, 6); 6])
            .header(header)
            .block(Block::default().borders(Borders::ALL).title("Indicators")),
        area,
    );
}

fn render_skipped(f: &mut Frame, app: &App, area: Rect) {
    let lines: Vec<Line> = if app.data.failures.is_empty() {
        vec![Line::from("Nothing was skipped.")]
    } else {
        app.data
            .failures
            .iter()
            .map(|failure| Line::from(format!("{:<8} {}", failure.symbol, failure.reason)))
            .collect()
    };
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Skipped Coins")),
        area,
    );
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::vertical([
        Constraint::Percentage((100 - percent_y) / 2),
        Constraint::Percentage(percent_y),
        Constraint::Percentage((100 - percent_y) / 2),
    ])
    .split(r);
    Layout::horizontal([
        Constraint::Percentage((100 - percent_x) / 2),
        Constraint::Percentage(percent_x),
        Constraint::Percentage((100 - percent_x) / 2),
    ])
    .split(popup_layout[1])[1]
}
