//! Build session state and its serializable status view

use bentley::ring_log::RingLog;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::catalog_builder::BuildEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
  Pending,
  Running,
  Completed,
  Failed,
}

impl BuildState {
  /// Pending and Running sessions hold the single build slot
  pub fn is_active(self) -> bool {
    matches!(self, BuildState::Pending | BuildState::Running)
  }

  pub fn is_terminal(self) -> bool {
    !self.is_active()
  }
}

impl std::fmt::Display for BuildState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      BuildState::Pending => "pending",
      BuildState::Running => "running",
      BuildState::Completed => "completed",
      BuildState::Failed => "failed",
    };
    write!(f, "{name}")
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPhase {
  Scanning,
  Extracting,
  Indexing,
  Persisting,
}

impl std::fmt::Display for BuildPhase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      BuildPhase::Scanning => "scanning",
      BuildPhase::Extracting => "extracting",
      BuildPhase::Indexing => "indexing",
      BuildPhase::Persisting => "persisting",
    };
    write!(f, "{name}")
  }
}

/// Point-in-time copy of a session, safe to hand out while the build continues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSessionSnapshot {
  pub session_id: Uuid,
  pub owner_id: String,
  pub state: BuildState,
  pub phase: Option<BuildPhase>,
  pub processed_count: usize,
  pub total_count: usize,
  pub warning_count: usize,
  pub entry_count: Option<usize>,
  pub log: Vec<String>,
  pub dropped_log_lines: usize,
  pub error: Option<String>,
  pub start_time: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
}

impl BuildSessionSnapshot {
  pub fn progress_percent(&self) -> f64 {
    if self.total_count == 0 {
      0.0
    } else {
      self.processed_count as f64 / self.total_count as f64 * 100.0
    }
  }

  pub fn elapsed_seconds(&self) -> f64 {
    let end = self.finished_at.unwrap_or_else(Utc::now);
    (end - self.start_time).num_milliseconds() as f64 / 1000.0
  }
}

/// Live session record, owned by the orchestrator's registry
#[derive(Debug)]
pub(crate) struct BuildSession {
  id: Uuid,
  owner_id: String,
  state: BuildState,
  phase: Option<BuildPhase>,
  processed: usize,
  total: usize,
  warnings: usize,
  entry_count: Option<usize>,
  log: RingLog,
  error: Option<String>,
  start_time: DateTime<Utc>,
  finished_at: Option<DateTime<Utc>>,
  cancel: Arc<AtomicBool>,
  state_tx: watch::Sender<BuildState>,
}

impl BuildSession {
  pub fn new(owner_id: impl Into<String>, log_capacity: usize) -> Self {
    let (state_tx, _) = watch::channel(BuildState::Pending);
    Self {
      id: Uuid::new_v4(),
      owner_id: owner_id.into(),
      state: BuildState::Pending,
      phase: None,
      processed: 0,
      total: 0,
      warnings: 0,
      entry_count: None,
      log: RingLog::new(log_capacity),
      error: None,
      start_time: Utc::now(),
      finished_at: None,
      cancel: Arc::new(AtomicBool::new(false)),
      state_tx,
    }
  }

  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn owner_id(&self) -> &str {
    &self.owner_id
  }

  pub fn state(&self) -> BuildState {
    self.state
  }

  pub fn is_active(&self) -> bool {
    self.state.is_active()
  }

  pub fn finished_at(&self) -> Option<DateTime<Utc>> {
    self.finished_at
  }

  /// Flag the build task polls between batches
  pub fn cancel_flag(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.cancel)
  }

  pub fn subscribe(&self) -> watch::Receiver<BuildState> {
    self.state_tx.subscribe()
  }

  /// Pending -> Running. Returns false if the session already left Pending.
  pub fn start(&mut self) -> bool {
    if self.state != BuildState::Pending {
      return false;
    }
    self.set_state(BuildState::Running);
    self.log.info("Build started");
    true
  }

  /// Running -> Completed
  pub fn complete(&mut self, entry_count: usize) -> bool {
    if self.state != BuildState::Running {
      return false;
    }
    self.entry_count = Some(entry_count);
    self.finished_at = Some(Utc::now());
    self.log.info(&format!("Build completed with {entry_count} entries"));
    self.set_state(BuildState::Completed);
    true
  }

  /// Any active state -> Failed. Terminal sessions are left as they are.
  pub fn fail(&mut self, reason: impl Into<String>) -> bool {
    if self.state.is_terminal() {
      return false;
    }
    let reason = reason.into();
    self.cancel.store(true, Ordering::SeqCst);
    self.finished_at = Some(Utc::now());
    self.log.error(&format!("Build failed: {reason}"));
    self.error = Some(reason);
    self.set_state(BuildState::Failed);
    true
  }

  /// Fold one builder event into the counters and the log.
  ///
  /// Log text is stored as-is; only the structured fields move counters.
  pub fn apply(&mut self, event: &BuildEvent) {
    if self.state.is_terminal() {
      return;
    }
    match event {
      BuildEvent::Phase(phase) => {
        self.phase = Some(*phase);
      }
      BuildEvent::Progress { processed, total } => {
        self.processed = *processed;
        self.total = *total;
      }
      BuildEvent::Log(line) => {
        self.log.info(line);
      }
      BuildEvent::Warning { path, reason } => {
        self.warnings += 1;
        self.log.warn(&format!("Skipped {}: {reason}", path.display()));
      }
    }
  }

  pub fn snapshot(&self) -> BuildSessionSnapshot {
    BuildSessionSnapshot {
      session_id: self.id,
      owner_id: self.owner_id.clone(),
      state: self.state,
      phase: self.phase,
      processed_count: self.processed,
      total_count: self.total,
      warning_count: self.warnings,
      entry_count: self.entry_count,
      log: self.log.rendered(),
      dropped_log_lines: self.log.dropped(),
      error: self.error.clone(),
      start_time: self.start_time,
      finished_at: self.finished_at,
    }
  }

  fn set_state(&mut self, state: BuildState) {
    tracing::debug!(session = %self.id, owner = %self.owner_id, from = %self.state, to = %state, "build session transition");
    self.state = state;
    self.state_tx.send_replace(state);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;

  #[test]
  fn test_states_only_move_forward() {
    let mut session = BuildSession::new("10.0.0.1", 10);
    assert_eq!(session.state(), BuildState::Pending);
    assert!(!session.complete(3));

    assert!(session.start());
    assert!(!session.start());
    assert!(session.complete(3));

    assert!(!session.fail("too late"));
    assert_eq!(session.state(), BuildState::Completed);
    assert!(session.snapshot().error.is_none());
  }

  #[test]
  fn test_fail_sets_cancel_flag_and_error() {
    let mut session = BuildSession::new("owner", 10);
    let flag = session.cancel_flag();
    session.start();

    assert!(session.fail("cancelled"));
    assert!(flag.load(Ordering::SeqCst));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, BuildState::Failed);
    assert_eq!(snapshot.error.as_deref(), Some("cancelled"));
    assert!(snapshot.finished_at.is_some());
  }

  #[test]
  fn test_events_update_counters_and_log() {
    let mut session = BuildSession::new("owner", 10);
    session.start();
    session.apply(&BuildEvent::Phase(BuildPhase::Extracting));
    session.apply(&BuildEvent::Progress { processed: 4, total: 8 });
    session.apply(&BuildEvent::Log("Progress: 4/8 images (50.0%)".to_string()));
    session.apply(&BuildEvent::Warning { path: PathBuf::from("ring/bad.png"), reason: "cannot decode".into() });

    let snapshot = session.snapshot();
    assert_eq!(snapshot.phase, Some(BuildPhase::Extracting));
    assert_eq!(snapshot.processed_count, 4);
    assert_eq!(snapshot.total_count, 8);
    assert_eq!(snapshot.warning_count, 1);
    assert!((snapshot.progress_percent() - 50.0).abs() < 1e-9);
    assert!(snapshot.log.iter().any(|line| line.ends_with("Progress: 4/8 images (50.0%)")));
  }

  #[test]
  fn test_log_text_never_moves_counters() {
    let mut session = BuildSession::new("owner", 10);
    session.start();
    session.apply(&BuildEvent::Log("Progress: 99/100 images (99.0%)".to_string()));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.processed_count, 0);
    assert_eq!(snapshot.total_count, 0);
  }

  #[test]
  fn test_log_is_bounded() {
    let mut session = BuildSession::new("owner", 3);
    session.start();
    for i in 0..10 {
      session.apply(&BuildEvent::Log(format!("line {i}")));
    }

    let snapshot = session.snapshot();
    assert_eq!(snapshot.log.len(), 3);
    assert!(snapshot.log[2].ends_with("line 9"));
    assert!(snapshot.dropped_log_lines > 0);
  }

  #[test]
  fn test_watchers_see_terminal_state() {
    let mut session = BuildSession::new("owner", 3);
    let receiver = session.subscribe();
    session.start();
    session.fail("boom");
    assert_eq!(*receiver.borrow(), BuildState::Failed);
  }
}
