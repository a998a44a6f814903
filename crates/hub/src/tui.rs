use std::collections::VecDeque;

use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Row, Table};

use backbone::{ComponentId, ComponentOrder, ComponentType};

use crate::server::HubStats;

const MAX_LOG_LINES: usize = 200;

#[derive(Debug, Clone)]
pub struct ComponentRow {
    pub component_type: ComponentType,
    pub component_id: ComponentId,
    pub addr: String,
    pub global_order: ComponentOrder,
    pub group_order: ComponentOrder,
    pub idle_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn color(self) -> Color {
        match self {
            LogLevel::Info => Color::White,
            LogLevel::Warn => Color::Yellow,
            LogLevel::Error => Color::Red,
        }
    }
}

pub struct TuiState {
    log: VecDeque<(LogLevel, String)>,
}

impl TuiState {
    pub fn new() -> Self {
        Self {
            log: VecDeque::with_capacity(MAX_LOG_LINES),
        }
    }

    fn push(&mut self, level: LogLevel, message: String) {
        if self.log.len() == MAX_LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back((level, message));
    }

    pub fn log_info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into());
    }

    pub fn log_warn(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message.into());
    }

    pub fn log_error(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Error, message.into());
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }
}

pub fn render(frame: &mut Frame, state: &TuiState, stats: &HubStats, components: &[ComponentRow]) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(7),
            Constraint::Min(6),
            Constraint::Length(10),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], stats);
    render_network(frame, chunks[1], stats);
    render_components(frame, chunks[2], components);
    render_log(frame, chunks[3], state);
    render_help(frame, chunks[4]);
}

fn render_header(frame: &mut Frame, area: Rect, stats: &HubStats) {
    let title = format!(
        " Backbone Hub {} - Uptime: {} ",
        stats.cluster_id,
        format_duration(stats.uptime_secs)
    );

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let text = format!(
        "Tick: {}  |  Components: {}  |  Channels: {}  |  Global data: {} keys",
        stats.tick, stats.component_count, stats.network.channels, stats.global_entries
    );

    let paragraph = Paragraph::new(text)
        .block(block)
        .style(Style::default().fg(Color::White));

    frame.render_widget(paragraph, area);
}

fn label(text: &str) -> Span<'_> {
    Span::styled(text, Style::default().fg(Color::Gray))
}

fn render_network(frame: &mut Frame, area: Rect, stats: &HubStats) {
    let block = Block::default()
        .title(" Network ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let net = &stats.network;
    let total = net.total();
    let lines = vec![
        Line::from(vec![
            label("Messages: "),
            Span::raw(format!(
                "{} sent / {} recv",
                total.messages_sent, total.messages_received
            )),
        ]),
        Line::from(vec![
            label("Bytes: "),
            Span::raw(format!(
                "{} sent / {} recv",
                format_bytes(total.bytes_sent),
                format_bytes(total.bytes_received)
            )),
        ]),
        Line::from(vec![
            label("Channels: "),
            Span::raw(format!(
                "{} accepted / {} rejected / {} condemned",
                net.accepted, net.rejected, net.condemned
            )),
        ]),
        Line::from(vec![
            label("Cross-server calls: "),
            Span::raw(format!("{} forwarded / ", stats.forwarded)),
            Span::styled(
                format!("{} dropped", stats.dropped),
                Style::default().fg(if stats.dropped > 0 {
                    Color::Red
                } else {
                    Color::White
                }),
            ),
        ]),
        Line::from(vec![
            label("Send failures: "),
            Span::raw(format!(
                "{} ({} reported)",
                total.send_failures, stats.reported_errors
            )),
        ]),
    ];

    let paragraph = Paragraph::new(lines).block(block);
    frame.render_widget(paragraph, area);
}

fn render_components(frame: &mut Frame, area: Rect, components: &[ComponentRow]) {
    let block = Block::default()
        .title(" Components ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let header = Row::new(["Cluster", "Type", "Id", "Group", "Address", "Idle"]).style(
        Style::default()
            .fg(Color::Gray)
            .add_modifier(Modifier::BOLD),
    );

    let rows = components.iter().map(|row| {
        let idle = format_duration(row.idle_secs);
        Row::new([
            row.global_order.to_string(),
            row.component_type.to_string(),
            row.component_id.to_string(),
            row.group_order.to_string(),
            row.addr.clone(),
            idle,
        ])
    });

    let widths = [
        Constraint::Length(8),
        Constraint::Length(12),
        Constraint::Length(20),
        Constraint::Length(6),
        Constraint::Min(22),
        Constraint::Length(9),
    ];

    let table = Table::new(rows, widths).header(header).block(block);
    frame.render_widget(table, area);
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default()
        .title(" Log ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Blue));

    let visible = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = state
        .log
        .iter()
        .skip(state.log.len().saturating_sub(visible))
        .map(|(level, text)| {
            Line::from(Span::styled(
                text.as_str(),
                Style::default().fg(level.color()),
            ))
        })
        .collect();

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .title(" Controls ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let text = Paragraph::new("Press 'q' or ESC to quit, 'c' to clear the log")
        .block(block)
        .style(
            Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
        );

    frame.render_widget(text, area);
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, secs)
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1}GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_bounded() {
        let mut state = TuiState::new();
        for i in 0..MAX_LOG_LINES + 5 {
            state.log_info(format!("line {}", i));
        }
        assert_eq!(state.log.len(), MAX_LOG_LINES);
        assert_eq!(state.log.front().map(|(_, text)| text.as_str()), Some("line 5"));
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_duration(3725), "01:02:05");
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.0KB");
    }
}
