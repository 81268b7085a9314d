//! Terminal User Interface
//!
//! Interactive operator view over a [`crate::Panel`]: device list, opened
//! device viewer and activity log.

pub mod app;
pub mod events;
pub mod ui;

pub use app::{App, Dialog, Tui, run};
pub use events::{Action, Event, EventHandler};
