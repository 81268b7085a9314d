//! TUI application state
//!
//! The only state owned here is the open dialog, the interface cursor and
//! the quit flag. The device list, selection and opened device all come
//! from the [`Panel`] view, refreshed before every draw.

use anyhow::{Context, Result};
use common::DeviceBackend;
use crossterm::{
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use protocol::{ConfigurationView, DeviceId, DeviceSummary};
use ratatui::{Terminal, backend::CrosstermBackend};
use std::io::{self, Stdout};
use std::time::Duration;
use tracing::{debug, error};

use super::events::{Action, Event, EventHandler};
use super::ui;
use crate::log::LogEntry;
use crate::panel::{Panel, PanelView};

/// Current dialog/popup being displayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialog {
    /// No dialog open
    None,
    /// Help dialog showing keybindings
    Help,
    /// Permission prompt listing every attached device
    Picker {
        candidates: Vec<DeviceSummary>,
        cursor: usize,
    },
}

/// Application state
pub struct App<B> {
    panel: Panel<B>,
    /// Last view pulled from the panel
    view: PanelView,
    dialog: Dialog,
    /// Index into the active configuration's interfaces
    interface_cursor: usize,
    should_quit: bool,
}

impl<B: DeviceBackend> App<B> {
    pub fn new(panel: Panel<B>) -> Self {
        let view = panel.view();
        Self {
            panel,
            view,
            dialog: Dialog::None,
            interface_cursor: 0,
            should_quit: false,
        }
    }

    pub fn view(&self) -> &PanelView {
        &self.view
    }

    pub fn dialog(&self) -> &Dialog {
        &self.dialog
    }

    pub fn interface_cursor(&self) -> usize {
        self.interface_cursor
    }

    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    /// Most recent activity log entries, oldest first
    pub fn log_tail(&self, count: usize) -> Vec<LogEntry> {
        self.panel.log().tail(count)
    }

    /// Pull the latest view from the panel
    pub fn sync(&mut self) {
        self.view = self.panel.view();
        let interfaces = self.active_interfaces();
        if interfaces == 0 {
            self.interface_cursor = 0;
        } else if self.interface_cursor >= interfaces {
            self.interface_cursor = interfaces - 1;
        }
    }

    /// Position of the selected identifier in the device list
    pub fn selected_index(&self) -> Option<usize> {
        let selected = self.view.selected.as_ref()?;
        self.view.devices.keys().position(|id| id == selected)
    }

    fn active_configuration(&self) -> Option<&ConfigurationView> {
        self.view
            .session
            .snapshot
            .as_ref()
            .and_then(|snapshot| snapshot.active_configuration())
    }

    fn active_interfaces(&self) -> usize {
        self.active_configuration()
            .map(|config| config.interfaces.len())
            .unwrap_or(0)
    }

    /// Handle an operator action
    pub async fn handle_action(&mut self, action: Action) {
        match action {
            Action::Quit => self.should_quit = true,
            Action::ShowHelp => self.dialog = Dialog::Help,
            Action::CloseDialog => self.close_dialog().await,
            Action::Up => self.move_selection(-1),
            Action::Down => self.move_selection(1),
            Action::Left => {
                self.interface_cursor = self.interface_cursor.saturating_sub(1);
            }
            Action::Right => {
                if self.interface_cursor + 1 < self.active_interfaces() {
                    self.interface_cursor += 1;
                }
            }
            Action::RequestDevice => {
                let candidates = self.panel.request_candidates().await;
                self.dialog = Dialog::Picker {
                    candidates,
                    cursor: 0,
                };
            }
            Action::Refresh => {
                if self.view.is_open() {
                    self.panel.refresh_device().await;
                } else {
                    self.panel.refresh_directory().await;
                }
            }
            Action::Confirm => match &self.dialog {
                Dialog::Picker { candidates, cursor } => {
                    let selection = candidates.get(*cursor).map(|c| c.id.clone());
                    self.dialog = Dialog::None;
                    self.panel.request_device(selection.as_ref()).await;
                }
                Dialog::Help => self.dialog = Dialog::None,
                Dialog::None => self.open().await,
            },
            Action::Open => {
                if self.dialog == Dialog::None {
                    self.open().await;
                }
            }
            Action::Close => {
                if self.view.is_open() {
                    self.panel.close().await;
                }
            }
            Action::PrevConfig => self.step_configuration(-1).await,
            Action::NextConfig => self.step_configuration(1).await,
            Action::ToggleClaim => {
                let interface = self
                    .active_configuration()
                    .and_then(|config| config.interfaces.get(self.interface_cursor))
                    .map(|iface| iface.number);
                if let Some(number) = interface {
                    self.panel.toggle_interface(number).await;
                }
            }
            Action::None => {}
        }
        self.sync();
    }

    async fn close_dialog(&mut self) {
        let cancelled_picker = matches!(self.dialog, Dialog::Picker { .. });
        self.dialog = Dialog::None;
        if cancelled_picker {
            // A dismissed prompt is reported like any other request failure
            self.panel.request_device(None).await;
        }
    }

    async fn open(&mut self) {
        if self.view.is_open() {
            debug!("open ignored, a device is already open");
            return;
        }
        self.interface_cursor = 0;
        self.panel.open_selected().await;
    }

    fn move_selection(&mut self, delta: isize) {
        if let Dialog::Picker { candidates, cursor } = &mut self.dialog {
            *cursor = step(*cursor, delta, candidates.len());
            return;
        }
        if self.view.is_open() || self.view.devices.is_empty() {
            return;
        }

        let next = match self.selected_index() {
            Some(index) => step(index, delta, self.view.devices.len()),
            None => 0,
        };
        let id: Option<DeviceId> = self.view.devices.keys().nth(next).cloned();
        self.panel.select(id);
        self.sync();
    }

    async fn step_configuration(&mut self, delta: isize) {
        let Some(snapshot) = self.view.session.snapshot.as_ref() else {
            return;
        };
        let configurations = &snapshot.configurations;
        if configurations.is_empty() {
            return;
        }

        let target = match configurations.iter().position(|c| c.active) {
            Some(index) => step(index, delta, configurations.len()),
            None => 0,
        };
        let value = configurations[target].value;
        if configurations[target].active {
            return;
        }
        self.interface_cursor = 0;
        self.panel.select_configuration(value).await;
    }
}

/// Move `index` by `delta`, clamped to `0..len`
fn step(index: usize, delta: isize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    index.saturating_add_signed(delta).min(len - 1)
}

/// Terminal wrapper for TUI
pub struct Tui {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl Tui {
    /// Create and initialize the terminal
    pub fn new() -> Result<Self> {
        let backend = CrosstermBackend::new(io::stdout());
        let terminal = Terminal::new(backend)?;
        Ok(Self { terminal })
    }

    /// Enter TUI mode (raw mode, alternate screen)
    pub fn enter(&mut self) -> Result<()> {
        enable_raw_mode()?;
        execute!(io::stdout(), EnterAlternateScreen)?;
        self.terminal.hide_cursor()?;
        self.terminal.clear()?;
        Ok(())
    }

    /// Exit TUI mode (restore terminal state)
    pub fn exit(&mut self) -> Result<()> {
        disable_raw_mode()?;
        execute!(io::stdout(), LeaveAlternateScreen)?;
        self.terminal.show_cursor()?;
        Ok(())
    }

    pub fn draw<B: DeviceBackend>(&mut self, app: &App<B>) -> Result<()> {
        self.terminal.draw(|frame| {
            ui::render(frame, app);
        })?;
        Ok(())
    }
}

impl Drop for Tui {
    fn drop(&mut self) {
        // Best effort cleanup
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}

/// Run the TUI until the operator quits
///
/// Redraws on every key, tick and panel view change. Hotplug events reach
/// the panel elsewhere and show up here as view changes.
pub async fn run<B: DeviceBackend>(panel: Panel<B>) -> Result<()> {
    let mut tui = Tui::new().context("Failed to initialize terminal")?;
    tui.enter().context("Failed to enter TUI mode")?;

    let mut view_rx = panel.watch_view();
    panel.refresh_directory().await;
    let mut app = App::new(panel);

    // 250ms tick so log entries appear without a keypress
    let mut events = EventHandler::new(Duration::from_millis(250));

    loop {
        app.sync();
        if let Err(e) = tui.draw(&app) {
            error!("Failed to draw UI: {:#}", e);
            break;
        }

        tokio::select! {
            event = events.next() => {
                match event {
                    Some(Event::Key(key)) => app.handle_action(Action::from(key)).await,
                    Some(Event::Resize(_, _)) | Some(Event::Tick) => {}
                    None => break,
                }
            }
            changed = view_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        if app.should_quit() {
            break;
        }
    }

    tui.exit()?;
    Ok(())
}
