//! TUI rendering with ratatui
//!
//! Header with key hints, the device list on the left, the opened device on
//! the right and the activity log along the bottom. Dialogs draw on top.

use common::DeviceBackend;
use protocol::{DeviceSummary, OpenedDeviceSnapshot};
use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{
        Block, Borders, Cell, Clear, List, ListItem, ListState, Paragraph, Row, Table, Tabs, Wrap,
    },
};

use super::app::{App, Dialog};
use crate::log::LogKind;
use crate::session::SessionState;

/// Number of log lines kept on screen
const LOG_LINES: usize = 8;

pub fn render<B: DeviceBackend>(frame: &mut Frame, app: &App<B>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),                    // Header
            Constraint::Min(10),                      // Devices + opened device
            Constraint::Length(LOG_LINES as u16 + 2), // Log
        ])
        .split(frame.area());

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
        .split(chunks[1]);

    render_header(frame, app, chunks[0]);
    render_device_list(frame, app, body[0]);
    render_opened_device(frame, app, body[1]);
    render_log(frame, app, chunks[2]);

    match app.dialog() {
        Dialog::None => {}
        Dialog::Help => render_help_dialog(frame),
        Dialog::Picker { candidates, cursor } => render_picker_dialog(frame, candidates, *cursor),
    }
}

fn key_hint(key: &'static str, label: &'static str) -> [Span<'static>; 2] {
    [
        Span::styled(
            key,
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(label),
    ]
}

fn render_header<B: DeviceBackend>(frame: &mut Frame, app: &App<B>, area: Rect) {
    let session = &app.view().session;
    let (status, status_style) = match (&session.state, &session.device) {
        (SessionState::Open, Some(id)) => {
            (format!("Open: {}", id), Style::default().fg(Color::Green))
        }
        (SessionState::Opening, Some(id)) => {
            (format!("Opening: {}", id), Style::default().fg(Color::Yellow))
        }
        _ => ("Closed".to_string(), Style::default().fg(Color::DarkGray)),
    };

    let mut spans = vec![Span::styled(status, status_style), Span::raw("  |  ")];
    for (key, label) in [
        ("n", " Request  "),
        ("o", " Open  "),
        ("x", " Close  "),
        ("[ ]", " Config  "),
        ("Space", " Claim  "),
        ("r", " Refresh  "),
        ("?", " Help  "),
        ("q", " Quit"),
    ] {
        spans.extend(key_hint(key, label));
    }

    let header = Paragraph::new(Line::from(spans))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" USB Panel ")
                .title_alignment(Alignment::Center)
                .border_style(Style::default().fg(Color::Blue)),
        )
        .alignment(Alignment::Center);

    frame.render_widget(header, area);
}

fn render_device_list<B: DeviceBackend>(frame: &mut Frame, app: &App<B>, area: Rect) {
    let view = app.view();
    let locked = view.is_open();
    let item_style = if locked {
        Style::default().fg(Color::DarkGray)
    } else {
        Style::default()
    };

    let items: Vec<ListItem> = view
        .devices
        .values()
        .map(|device| {
            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{:04x}:{:04x} ", device.vendor_id, device.product_id),
                    Style::default().fg(Color::Cyan),
                ),
                Span::raw(device.display_name()),
            ]))
            .style(item_style)
        })
        .collect();

    let title = if locked {
        format!(" Devices ({}) [locked] ", view.devices.len())
    } else {
        format!(" Devices ({}) ", view.devices.len())
    };

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(title)
                .border_style(Style::default().fg(Color::Blue)),
        )
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    let mut state = ListState::default();
    state.select(app.selected_index());
    frame.render_stateful_widget(list, area, &mut state);
}

fn render_opened_device<B: DeviceBackend>(frame: &mut Frame, app: &App<B>, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Opened Device ")
        .border_style(Style::default().fg(Color::Blue));

    let Some(snapshot) = app.view().session.snapshot.as_ref() else {
        let placeholder = Paragraph::new("No opened device")
            .style(Style::default().fg(Color::DarkGray))
            .alignment(Alignment::Center)
            .block(block);
        frame.render_widget(placeholder, area);
        return;
    };

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(5), // Info
            Constraint::Length(1), // Configuration tabs
            Constraint::Length(3), // Interfaces
            Constraint::Min(3),    // Endpoints
        ])
        .split(inner);

    render_device_info(frame, snapshot, chunks[0]);
    render_configurations(frame, snapshot, chunks[1]);
    render_interfaces(frame, snapshot, app.interface_cursor(), chunks[2]);
    render_endpoints(frame, snapshot, chunks[3]);
}

fn render_device_info(frame: &mut Frame, snapshot: &OpenedDeviceSnapshot, area: Rect) {
    let field = |label: &'static str, value: String| {
        Line::from(vec![
            Span::styled(label, Style::default().fg(Color::DarkGray)),
            Span::raw(value),
        ])
    };
    let optional = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());

    let lines = vec![
        field("Product:      ", optional(&snapshot.product_name)),
        field("Manufacturer: ", optional(&snapshot.manufacturer_name)),
        field("Serial:       ", optional(&snapshot.serial_number)),
        field(
            "VID:PID:      ",
            format!("{}  Class {}", snapshot.vid_pid(), snapshot.class_code()),
        ),
        field(
            "Version:      ",
            format!("{}  USB {}", snapshot.version, snapshot.usb_version),
        ),
    ];

    frame.render_widget(Paragraph::new(lines), area);
}

fn render_configurations(frame: &mut Frame, snapshot: &OpenedDeviceSnapshot, area: Rect) {
    let titles: Vec<String> = snapshot
        .configurations
        .iter()
        .map(|config| config.label())
        .collect();

    let tabs = Tabs::new(titles)
        .select(snapshot.configurations.iter().position(|c| c.active))
        .style(Style::default().fg(Color::DarkGray))
        .highlight_style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        );

    frame.render_widget(tabs, area);
}

fn render_interfaces(
    frame: &mut Frame,
    snapshot: &OpenedDeviceSnapshot,
    cursor: usize,
    area: Rect,
) {
    let block = Block::default()
        .borders(Borders::TOP)
        .title(" Interfaces ");

    let Some(config) = snapshot.active_configuration() else {
        let idle = Paragraph::new("Unconfigured")
            .style(Style::default().fg(Color::DarkGray))
            .block(block);
        frame.render_widget(idle, area);
        return;
    };

    let mut spans = Vec::new();
    for (index, iface) in config.interfaces.iter().enumerate() {
        let mut style = if iface.claimed {
            Style::default()
                .fg(Color::Green)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::Gray)
        };
        if index == cursor {
            style = style.add_modifier(Modifier::REVERSED);
        }
        let label = match &iface.name {
            Some(name) if !name.is_empty() => format!(" {}: {} ", iface.number, name),
            _ => format!(" {} ", iface.number),
        };
        spans.push(Span::styled(label, style));
        spans.push(Span::raw(" "));
    }

    frame.render_widget(Paragraph::new(Line::from(spans)).block(block), area);
}

fn render_endpoints(frame: &mut Frame, snapshot: &OpenedDeviceSnapshot, area: Rect) {
    let header = Row::new(["Interface", "Endpoint", "Direction", "Type", "Packet"].map(|h| {
        Cell::from(h).style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
    }));

    let rows: Vec<Row> = snapshot
        .available_endpoints
        .iter()
        .map(|ep| {
            Row::new(vec![
                Cell::from(ep.interface.to_string()),
                Cell::from(ep.endpoint.to_string()),
                Cell::from(ep.direction.to_string()),
                Cell::from(ep.transfer_type.to_string()),
                Cell::from(ep.packet_size.to_string()),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(10),
            Constraint::Length(9),
            Constraint::Length(10),
            Constraint::Length(12),
            Constraint::Length(7),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::TOP)
            .title(format!(" Endpoints ({}) ", snapshot.available_endpoints.len())),
    );

    frame.render_widget(table, area);
}

fn render_log<B: DeviceBackend>(frame: &mut Frame, app: &App<B>, area: Rect) {
    let lines: Vec<Line> = app
        .log_tail(LOG_LINES)
        .into_iter()
        .map(|entry| {
            let style = match entry.kind {
                LogKind::Info => Style::default(),
                LogKind::Error => Style::default().fg(Color::Red),
            };
            Line::from(vec![
                Span::styled(
                    format!("{} ", entry.timestamp_rfc3339()),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(entry.message, style),
            ])
        })
        .collect();

    let log = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Log ")
            .border_style(Style::default().fg(Color::DarkGray)),
    );

    frame.render_widget(log, area);
}

fn render_help_dialog(frame: &mut Frame) {
    let area = centered_rect(50, 60, frame.area());

    let bindings = [
        ("n", "Request access to a device"),
        ("r", "Refresh devices / opened device"),
        ("Up/Down, j/k", "Select device"),
        ("o, Enter", "Open selected device"),
        ("x", "Close opened device"),
        ("[ / ]", "Previous / next configuration"),
        ("Left/Right", "Move interface cursor"),
        ("Space", "Claim / release interface"),
        ("Esc", "Close dialog"),
        ("q, Ctrl-C", "Quit"),
    ];

    let lines: Vec<Line> = bindings
        .iter()
        .map(|(key, description)| {
            Line::from(vec![
                Span::styled(
                    format!("{:<14}", key),
                    Style::default()
                        .fg(Color::Yellow)
                        .add_modifier(Modifier::BOLD),
                ),
                Span::raw(*description),
            ])
        })
        .collect();

    let paragraph = Paragraph::new(lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Help ")
                .title_alignment(Alignment::Center)
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .wrap(Wrap { trim: false });

    frame.render_widget(Clear, area);
    frame.render_widget(paragraph, area);
}

fn render_picker_dialog(frame: &mut Frame, candidates: &[DeviceSummary], cursor: usize) {
    let area = centered_rect(60, 50, frame.area());

    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Request Device (Enter grant, Esc cancel) ")
        .title_alignment(Alignment::Center)
        .border_style(Style::default().fg(Color::Cyan));

    frame.render_widget(Clear, area);

    if candidates.is_empty() {
        let empty = Paragraph::new("No devices attached")
            .style(Style::default().fg(Color::DarkGray))
            .alignment(Alignment::Center)
            .block(block);
        frame.render_widget(empty, area);
        return;
    }

    let items: Vec<ListItem> = candidates
        .iter()
        .map(|device| {
            ListItem::new(format!(
                "{:04x}:{:04x}  {}  ({})",
                device.vendor_id,
                device.product_id,
                device.display_name(),
                device.id
            ))
        })
        .collect();

    let list = List::new(items)
        .block(block)
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    let mut state = ListState::default();
    state.select(Some(cursor));
    frame.render_stateful_widget(list, area, &mut state);
}

/// Helper to create a centered rectangle
fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
