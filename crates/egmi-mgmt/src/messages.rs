//! Operator-facing message log.
//!
//! Lines narrate what the control plane does, independently of structured
//! logging. Readers poll with a cursor and only get lines they have not seen.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{error, info, warn};

/// Severity of a message line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Normal narration.
    Info,
    /// Inconsistency worth attention.
    Warn,
    /// Failure.
    Error,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Formats a line as `yyyy-MM-dd HH:mm:ss.SSS - LEVEL: text`.
pub fn format_line(at: DateTime<Utc>, level: Level, text: &str) -> String {
    format!("{} - {}: {}", at.format("%Y-%m-%d %H:%M:%S%.3f"), level.label(), text)
}

struct Buffer {
    lines: VecDeque<String>,
    // number of lines ever appended
    total: usize,
}

/// Bounded ring buffer of message lines.
pub struct MessageLog {
    capacity: usize,
    buffer: Mutex<Buffer>,
}

impl MessageLog {
    /// Keeps the last `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffer: Mutex::new(Buffer {
                lines: VecDeque::new(),
                total: 0,
            }),
        }
    }

    fn push(&self, level: Level, text: &str) {
        let line = format_line(Utc::now(), level, text);
        let mut buffer = self.buffer.lock();
        if buffer.lines.len() == self.capacity {
            buffer.lines.pop_front();
        }
        buffer.lines.push_back(line);
        buffer.total += 1;
    }

    /// Records an informational line.
    pub fn info(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        info!("{}", text);
        self.push(Level::Info, text);
    }

    /// Records a warning line.
    pub fn warn(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        warn!("{}", text);
        self.push(Level::Warn, text);
    }

    /// Records an error line.
    pub fn error(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        error!("{}", text);
        self.push(Level::Error, text);
    }

    /// Lines appended after cursor `since`, and the cursor to use next time.
    ///
    /// Lines already evicted from the buffer are skipped.
    pub fn lines_since(&self, since: usize) -> (Vec<String>, usize) {
        let buffer = self.buffer.lock();
        let first_kept = buffer.total - buffer.lines.len();
        let start = since.max(first_kept).min(buffer.total);
        let lines = buffer
            .lines
            .iter()
            .skip(start - first_kept)
            .cloned()
            .collect();
        (lines, buffer.total)
    }

    /// Number of lines ever recorded.
    pub fn total(&self) -> usize {
        self.buffer.lock().total
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_line() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(
            format_line(at, Level::Error, "boom"),
            "2024-03-07 09:05:02.042 - ERROR: boom"
        );
    }

    #[test]
    fn test_cursor_polling() {
        let log = MessageLog::new(10);
        log.info("one");
        log.info("two");
        let (lines, cursor) = log.lines_since(0);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - INFO: one"));
        assert_eq!(cursor, 2);

        log.warn("three");
        let (lines, cursor) = log.lines_since(cursor);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(" - WARN: three"));
        assert_eq!(cursor, 3);

        let (lines, _) = log.lines_since(cursor);
        assert!(lines.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let log = MessageLog::new(3);
        for i in 0..5 {
            log.info(format!("line {}", i));
        }
        let (lines, cursor) = log.lines_since(0);
        assert_eq!(cursor, 5);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("line 2"));
        assert_eq!(log.total(), 5);
    }

    #[test]
    fn test_cursor_beyond_total() {
        let log = MessageLog::new(3);
        log.info("x");
        let (lines, cursor) = log.lines_since(42);
        assert!(lines.is_empty());
        assert_eq!(cursor, 1);
    }
}
