//! TUI event handling
//!
//! Polls crossterm for key and resize events on a blocking task and feeds
//! them, plus a periodic tick, into a tokio channel.

use crossterm::event::{
    self, Event as CrosstermEvent, KeyCode, KeyEvent, KeyEventKind, KeyModifiers,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Terminal event types
#[derive(Debug, Clone)]
pub enum Event {
    /// Keyboard input event
    Key(KeyEvent),
    /// Terminal resize event
    Resize(u16, u16),
    /// Tick event for periodic redraws
    Tick,
}

/// Operator actions derived from keyboard input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Quit the application
    Quit,
    /// Move the device or picker selection up
    Up,
    /// Move the device or picker selection down
    Down,
    /// Move the interface cursor left
    Left,
    /// Move the interface cursor right
    Right,
    /// Show the permission prompt
    RequestDevice,
    /// Re-list devices, or re-read the opened device
    Refresh,
    /// Open the selected device
    Open,
    /// Close the opened device
    Close,
    /// Select the previous configuration
    PrevConfig,
    /// Select the next configuration
    NextConfig,
    /// Claim or release the interface under the cursor
    ToggleClaim,
    /// Show help dialog
    ShowHelp,
    /// Close dialog/popup
    CloseDialog,
    /// Enter: confirm the dialog, or open the selected device
    Confirm,
    /// No action
    None,
}

impl From<KeyEvent> for Action {
    fn from(key: KeyEvent) -> Self {
        match key.code {
            KeyCode::Char('q') => Action::Quit,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Action::Quit,
            KeyCode::Esc => Action::CloseDialog,

            // Navigation
            KeyCode::Up | KeyCode::Char('k') => Action::Up,
            KeyCode::Down | KeyCode::Char('j') => Action::Down,
            KeyCode::Left | KeyCode::Char('h') => Action::Left,
            KeyCode::Right | KeyCode::Char('l') => Action::Right,

            // Actions
            KeyCode::Char('n') => Action::RequestDevice,
            KeyCode::Char('r') => Action::Refresh,
            KeyCode::Char('o') => Action::Open,
            KeyCode::Enter => Action::Confirm,
            KeyCode::Char('x') => Action::Close,
            KeyCode::Char('[') => Action::PrevConfig,
            KeyCode::Char(']') => Action::NextConfig,
            KeyCode::Char(' ') => Action::ToggleClaim,
            KeyCode::Char('?') => Action::ShowHelp,

            _ => Action::None,
        }
    }
}

/// Event handler that polls terminal events in a background task
pub struct EventHandler {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
    /// Create a new event handler
    ///
    /// The polling loop runs on the blocking pool since crossterm's poll
    /// blocks the calling thread. It exits once the handler is dropped.
    pub fn new(tick_rate: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::task::spawn_blocking(move || {
            let mut last_tick = Instant::now();

            loop {
                let timeout = tick_rate
                    .checked_sub(last_tick.elapsed())
                    .unwrap_or(Duration::ZERO);

                if event::poll(timeout).unwrap_or(false) {
                    let sent = match event::read() {
                        // Ignore key release events on some platforms
                        Ok(CrosstermEvent::Key(key)) if key.kind == KeyEventKind::Press => {
                            tx.send(Event::Key(key))
                        }
                        Ok(CrosstermEvent::Resize(width, height)) => {
                            tx.send(Event::Resize(width, height))
                        }
                        Ok(_) => Ok(()),
                        Err(_) => break,
                    };
                    if sent.is_err() {
                        break;
                    }
                }

                if last_tick.elapsed() >= tick_rate {
                    if tx.send(Event::Tick).is_err() {
                        break;
                    }
                    last_tick = Instant::now();
                }
            }
        });

        Self { rx }
    }

    /// Receive the next event
    ///
    /// Returns None if the event channel is closed.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}
