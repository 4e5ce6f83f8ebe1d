/// rmemsim live visualizer. Attach to any running simulation at any time.
///
/// Run in a separate terminal:
///   cargo run --bin viz
///
/// Polls /tmp/rmemsim_live.json every 200ms and renders a live TUI dashboard:
///
///     ┌ header: status / cycle / PE count ─────────────────────────┐
///     │ per-PE controller rows        │ Fabric: occupancy, totals  │
///     │ q/esc: quit  …footer…                                      │
///
/// Press q or Esc to quit. The simulation keeps running unaffected.
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};
use rmemsim::metrics::{read_metrics, LiveMetrics, PeSnapshot};
use rmemsim::op::Category;
use std::{io, time::Duration};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let metrics = read_metrics();
        terminal.draw(|f| render(f, metrics.as_ref()))?;

        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Top-level layout
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, metrics: Option<&LiveMetrics>) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(0),    // PE table + fabric
            Constraint::Length(1), // footer
        ])
        .split(f.area());

    render_header(f, rows[0], metrics);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(62), Constraint::Percentage(38)])
        .split(rows[1]);

    render_pes(f, cols[0], metrics);
    render_fabric(f, cols[1], metrics);
    render_footer(f, rows[2]);
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn render_header(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default()
        .title(Span::styled(
            " rmemsim live monitor ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (status, cycle, pes) = metrics
        .map(|m| (m.status.as_str(), m.cycle, m.num_pes))
        .unwrap_or(("idle", 0, 0));

    let status_color = match status {
        "running" => Color::Green,
        "drained" => Color::Cyan,
        "stalled" => Color::Red,
        _ => Color::DarkGray,
    };

    let spans = vec![
        Span::styled("  status: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            status.to_uppercase(),
            Style::default().fg(status_color).add_modifier(Modifier::BOLD),
        ),
        Span::styled("   cycle: ", Style::default().fg(Color::DarkGray)),
        Span::styled(cycle.to_string(), Style::default().fg(Color::Yellow)),
        Span::styled("   PEs: ", Style::default().fg(Color::DarkGray)),
        Span::styled(pes.to_string(), Style::default().fg(Color::Cyan)),
    ];
    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

// ---------------------------------------------------------------------------
// Per-PE controller table
// ---------------------------------------------------------------------------

/// One cell per category: solid while requests are in flight.
fn category_cells(pe: &PeSnapshot) -> Vec<Span<'static>> {
    Category::DATA
        .iter()
        .flat_map(|&cat| {
            let n = pe.stats.in_flight.get(cat);
            let color = match cat {
                Category::Read => Color::Green,
                Category::Write => Color::Blue,
                Category::ReadLock => Color::Magenta,
                _ => Color::Yellow,
            };
            let (symbol, style) = if n > 0 {
                ("██", Style::default().fg(color))
            } else {
                ("░░", Style::default().fg(Color::DarkGray))
            };
            vec![Span::styled(symbol, style), Span::raw(format!("{:<4}", n))]
        })
        .collect()
}

fn render_pes(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Controllers ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(m) = metrics else {
        let msg = Paragraph::new(vec![
            Line::raw(""),
            Line::from(Span::styled(
                "  No simulation running.",
                Style::default().fg(Color::DarkGray),
            )),
            Line::from(Span::styled(
                "  Start rmemsim with metrics_every > 0 to see live data.",
                Style::default().fg(Color::DarkGray),
            )),
        ]);
        f.render_widget(msg, inner);
        return;
    };

    let mut lines = vec![
        Line::from(vec![
            Span::styled("██", Style::default().fg(Color::Green)),
            Span::raw(" read  "),
            Span::styled("██", Style::default().fg(Color::Blue)),
            Span::raw(" write  "),
            Span::styled("██", Style::default().fg(Color::Magenta)),
            Span::raw(" readlock  "),
            Span::styled("██", Style::default().fg(Color::Yellow)),
            Span::raw(" writeunlock"),
        ]),
        Line::raw(""),
    ];

    for pe in &m.pes {
        let mut spans = vec![Span::styled(
            format!("  PE {:2}  ", pe.id),
            Style::default().fg(if pe.drained { Color::DarkGray } else { Color::White }),
        )];
        spans.extend(category_cells(pe));
        spans.push(Span::styled(
            format!(
                " queued {:<4} parked {:<3} serving {:<3} done {}",
                pe.stats.pending.data_total(),
                pe.parked_responses,
                pe.serving,
                pe.stats.completions
            ),
            Style::default().fg(Color::DarkGray),
        ));
        lines.push(Line::from(spans));
    }

    f.render_widget(Paragraph::new(lines), inner);
}

// ---------------------------------------------------------------------------
// Fabric panel
// ---------------------------------------------------------------------------

fn render_fabric(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Fabric ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(m) = metrics else {
        return;
    };

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2), // queue occupancy gauge
            Constraint::Length(1), // spacer
            Constraint::Min(0),    // text stats
        ])
        .split(inner);

    let capacity = (m.queue_depth * m.num_pes).max(1);
    let pct = ((m.in_transit as f64 / capacity as f64) * 100.0).clamp(0.0, 100.0) as u16;
    let color = match pct {
        0..=33 => Color::Green,
        34..=66 => Color::Yellow,
        _ => Color::Red,
    };
    let gauge = Gauge::default()
        .block(Block::default().title("Queue occupancy"))
        .gauge_style(Style::default().fg(color))
        .percent(pct)
        .label(format!("{} / {}", m.in_transit, capacity));
    f.render_widget(gauge, rows[0]);

    let sum = |get: fn(&PeSnapshot) -> u64| -> u64 { m.pes.iter().map(get).sum() };
    let label = |s: &'static str| Span::styled(s, Style::default().fg(Color::DarkGray));
    let text = vec![
        Line::from(vec![label("Delivered:   "), Span::raw(m.fabric.packets_delivered.to_string())]),
        Line::from(vec![
            label("Bytes:       "),
            Span::raw(format!("{:.1} KB", m.fabric.bytes_delivered as f64 / 1024.0)),
        ]),
        Line::from(vec![
            label("Refused:     "),
            Span::styled(m.fabric.refused.to_string(), Style::default().fg(Color::Yellow)),
        ]),
        Line::from(vec![label("Budget:      "), Span::raw(format!("{} pkt/cycle", m.packets_per_cycle))]),
        Line::raw(""),
        Line::from(vec![label("Outstanding: "), Span::raw(m.total_outstanding().to_string())]),
        Line::from(vec![label("Completions: "), Span::raw(m.total_completions().to_string())]),
        Line::from(vec![label("AMOs:        "), Span::raw(sum(|pe| pe.stats.amos).to_string())]),
        Line::from(vec![
            label("Fences:      "),
            Span::raw(sum(|pe| pe.stats.fences_retired).to_string()),
        ]),
        Line::from(vec![
            label("Stalls:      "),
            Span::styled(
                sum(|pe| pe.stats.send_stalls).to_string(),
                Style::default().fg(Color::Yellow),
            ),
        ]),
    ];
    f.render_widget(Paragraph::new(text), rows[2]);
}

// ---------------------------------------------------------------------------
// Footer
// ---------------------------------------------------------------------------

fn render_footer(f: &mut Frame, area: Rect) {
    let text = Paragraph::new(Span::styled(
        "  q / esc: quit    auto-refreshes every 200ms    reads /tmp/rmemsim_live.json",
        Style::default().fg(Color::DarkGray),
    ));
    f.render_widget(text, area);
}
