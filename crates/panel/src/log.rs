//! Activity log shown in the log pane
//!
//! Append-only and in-memory. Every entry is mirrored to `tracing`.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub kind: LogKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// RFC 3339 timestamp with millisecond precision
    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.timestamp_rfc3339(), self.message)
    }
}

/// Shared handle to the activity log
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries_mut(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.push(LogKind::Info, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.push(LogKind::Error, message);
    }

    fn push(&self, kind: LogKind, message: String) {
        self.entries_mut().push(LogEntry {
            kind,
            message,
            timestamp: Utc::now(),
        });
    }

    /// Copy of every entry, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries_mut().clone()
    }

    /// The most recent `count` entries, oldest first
    pub fn tail(&self, count: usize) -> Vec<LogEntry> {
        let entries = self.entries_mut();
        let start = entries.len().saturating_sub(count);
        entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries_mut().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_keep_order_and_kind() {
        let log = ActivityLog::new();
        log.info("Device opened: 1-2");
        log.error("Error closing the device: Device was disconnected");

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, LogKind::Info);
        assert_eq!(entries[1].kind, LogKind::Error);
        assert!(entries[0].timestamp <= entries[1].timestamp);
    }

    #[test]
    fn test_clones_share_entries() {
        let log = ActivityLog::new();
        let other = log.clone();
        other.info("hello");
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_tail() {
        let log = ActivityLog::new();
        for i in 0..5 {
            log.info(format!("entry {}", i));
        }
        let tail = log.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].message, "entry 4");
        assert_eq!(log.tail(10).len(), 5);
    }

    #[test]
    fn test_display_uses_rfc3339() {
        let entry = LogEntry {
            kind: LogKind::Info,
            message: "Device closed: 1-2".to_string(),
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        assert_eq!(entry.to_string(), "2024-05-01T10:00:00.000Z: Device closed: 1-2");
    }
}
