//! Bounded in-memory log storage
//!
//! A `RingLog` keeps the most recent `capacity` lines and silently drops the
//! oldest ones past that, which is what progress pollers want: a rolling tail,
//! not an archive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A single timestamped line in a ring
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LogLine {
  pub timestamp: DateTime<Utc>,
  pub level: String,
  pub message: String,
}

impl LogLine {
  /// Render as `[HH:MM:SS] message`, the way build logs are shown to people
  pub fn render(&self) -> String {
    format!("[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
  }
}

/// Fixed-capacity log that drops its oldest lines first
#[derive(Debug, Clone)]
pub struct RingLog {
  lines: VecDeque<LogLine>,
  capacity: usize,
  dropped: usize,
}

impl RingLog {
  /// Create a ring holding at most `capacity` lines (a capacity of zero is bumped to one)
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self { lines: VecDeque::with_capacity(capacity), capacity, dropped: 0 }
  }

  /// Append a line at the given level
  pub fn push(&mut self, level: &str, message: &str) {
    if self.lines.len() >= self.capacity {
      self.lines.pop_front();
      self.dropped += 1;
    }

    self.lines.push_back(LogLine {
      timestamp: Utc::now(),
      level: level.to_string(),
      message: message.to_string(),
    });
  }

  pub fn info(&mut self, message: &str) {
    self.push("info", message);
  }

  pub fn warn(&mut self, message: &str) {
    self.push("warn", message);
  }

  pub fn error(&mut self, message: &str) {
    self.push("error", message);
  }

  /// Lines currently held, oldest first
  pub fn lines(&self) -> impl Iterator<Item = &LogLine> {
    self.lines.iter()
  }

  /// Messages currently held, oldest first, optionally filtered by level
  pub fn messages(&self, level_filter: Option<&str>) -> Vec<String> {
    self
      .lines
      .iter()
      .filter(|line| level_filter.is_none_or(|filter| filter == "all" || line.level == filter))
      .map(|line| line.message.clone())
      .collect()
  }

  /// Rendered lines, oldest first
  pub fn rendered(&self) -> Vec<String> {
    self.lines.iter().map(LogLine::render).collect()
  }

  pub fn len(&self) -> usize {
    self.lines.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lines.is_empty()
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// How many lines have been evicted since creation
  pub fn dropped(&self) -> usize {
    self.dropped
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ring_keeps_lines_in_order() {
    let mut ring = RingLog::new(4);
    ring.info("one");
    ring.warn("two");

    assert_eq!(ring.len(), 2);
    assert_eq!(ring.messages(None), vec!["one", "two"]);
    assert_eq!(ring.dropped(), 0);
  }

  #[test]
  fn test_ring_drops_oldest_past_capacity() {
    let mut ring = RingLog::new(3);
    for i in 0..5 {
      ring.info(&format!("line {i}"));
    }

    assert_eq!(ring.len(), 3);
    assert_eq!(ring.messages(None), vec!["line 2", "line 3", "line 4"]);
    assert_eq!(ring.dropped(), 2);
  }

  #[test]
  fn test_level_filter() {
    let mut ring = RingLog::new(10);
    ring.info("fine");
    ring.warn("careful");
    ring.error("broken");

    assert_eq!(ring.messages(Some("warn")), vec!["careful"]);
    assert_eq!(ring.messages(Some("all")).len(), 3);
  }

  #[test]
  fn test_zero_capacity_still_holds_latest_line() {
    let mut ring = RingLog::new(0);
    ring.info("first");
    ring.info("second");

    assert_eq!(ring.capacity(), 1);
    assert_eq!(ring.messages(None), vec!["second"]);
  }

  #[test]
  fn test_rendered_lines_carry_timestamp() {
    let mut ring = RingLog::new(2);
    ring.info("scanning");

    let rendered = ring.rendered();
    assert_eq!(rendered.len(), 1);
    assert!(rendered[0].starts_with('['));
    assert!(rendered[0].ends_with("] scanning"));
  }
}
