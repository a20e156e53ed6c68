//! Single-writer rebuild orchestration
//!
//! At most one session is active (Pending or Running) at a time. A finished
//! build only becomes visible through one registry critical section that
//! checks the session is still Running, renames the staged snapshot into
//! place, swaps the serving catalog and marks the session Completed. A session
//! that was cancelled or superseded first can never get through that check.
//!
//! Build tasks also take turns on a worker lock. A session admitted while a
//! superseded task is still extracting stays Pending until that task returns,
//! so extraction never runs in two tasks at once.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::catalog::{IndexedCatalog, StagedSnapshot};
use crate::catalog_builder::{BuildEvent, BuilderOptions, CatalogBuilder};
use crate::embedding::Embedder;
use crate::error::{LikenessError, Result};
use crate::session::{BuildPhase, BuildSession, BuildSessionSnapshot, BuildState};

/// The catalog searches read from. Replaced wholesale, never mutated in place.
#[derive(Debug, Default)]
pub struct ServingSlot {
  current: RwLock<Option<Arc<IndexedCatalog>>>,
}

impl ServingSlot {
  pub fn new(initial: Option<IndexedCatalog>) -> Self {
    Self { current: RwLock::new(initial.map(Arc::new)) }
  }

  /// The catalog serving right now; holders keep it alive across a swap
  pub fn current(&self) -> Option<Arc<IndexedCatalog>> {
    self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn replace(&self, catalog: IndexedCatalog) {
    *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(catalog));
  }
}

#[derive(Debug, Default)]
struct SessionRegistry {
  /// Admission order, oldest first
  sessions: Vec<BuildSession>,
}

impl SessionRegistry {
  fn get(&self, id: Uuid) -> Option<&BuildSession> {
    self.sessions.iter().find(|s| s.id() == id)
  }

  fn get_mut(&mut self, id: Uuid) -> Option<&mut BuildSession> {
    self.sessions.iter_mut().find(|s| s.id() == id)
  }

  fn active_mut(&mut self) -> Option<&mut BuildSession> {
    self.sessions.iter_mut().find(|s| s.is_active())
  }

  fn prune(&mut self, retention: Duration) {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let now = Utc::now();
    self.sessions.retain(|session| match session.finished_at() {
      Some(finished) => now - finished < retention,
      None => true,
    });
  }
}

/// Settings the orchestrator needs from the engine configuration
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
  pub catalog_root: PathBuf,
  pub data_dir: PathBuf,
  pub snapshot_path: PathBuf,
  pub builder: BuilderOptions,
  pub log_capacity: usize,
  pub session_retention: Duration,
}

pub struct BuildOrchestrator<E> {
  embedder: Arc<E>,
  settings: Arc<OrchestratorSettings>,
  serving: Arc<ServingSlot>,
  registry: Arc<Mutex<SessionRegistry>>,
  worker: Arc<tokio::sync::Mutex<()>>,
}

impl<E> Clone for BuildOrchestrator<E> {
  fn clone(&self) -> Self {
    Self {
      embedder: Arc::clone(&self.embedder),
      settings: Arc::clone(&self.settings),
      serving: Arc::clone(&self.serving),
      registry: Arc::clone(&self.registry),
      worker: Arc::clone(&self.worker),
    }
  }
}

/// What a successful blocking build hands back to the async side
struct StagedBuild {
  indexed: IndexedCatalog,
  staged: StagedSnapshot,
}

impl<E: Embedder + Send + Sync + 'static> BuildOrchestrator<E> {
  pub fn new(embedder: Arc<E>, settings: OrchestratorSettings, serving: Arc<ServingSlot>) -> Self {
    Self {
      embedder,
      settings: Arc::new(settings),
      serving,
      registry: Arc::new(Mutex::new(SessionRegistry::default())),
      worker: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  fn registry(&self) -> MutexGuard<'_, SessionRegistry> {
    self.registry.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Admit a rebuild for `owner_id` and start it in the background.
  ///
  /// Another owner's active session makes this fail with `Busy`. The same
  /// owner's active session is superseded. Must be called from within a tokio
  /// runtime.
  pub fn request_rebuild(&self, owner_id: &str) -> Result<Uuid> {
    let runtime = tokio::runtime::Handle::try_current()
      .map_err(|_| LikenessError::configuration("rebuilds need a running tokio runtime"))?;

    let (session_id, cancel) = {
      let mut registry = self.registry();
      registry.prune(self.settings.session_retention);

      if let Some(active) = registry.active_mut() {
        if active.owner_id() != owner_id {
          tracing::info!(owner = owner_id, holder = active.owner_id(), "rebuild rejected: busy");
          return Err(LikenessError::busy(active.owner_id(), active.id()));
        }
        tracing::info!(session = %active.id(), owner = owner_id, "superseding active rebuild");
        active.fail("superseded by a newer request from the same owner");
      }

      let session = BuildSession::new(owner_id, self.settings.log_capacity);
      let ids = (session.id(), session.cancel_flag());
      registry.sessions.push(session);
      ids
    };

    tracing::info!(session = %session_id, owner = owner_id, "rebuild admitted");
    let orchestrator = self.clone();
    runtime.spawn(async move { orchestrator.run(session_id, cancel).await });

    Ok(session_id)
  }

  async fn run(self, session_id: Uuid, cancel: Arc<AtomicBool>) {
    // Held until the blocking build returns, even if this session is failed meanwhile
    let _turn = Arc::clone(&self.worker).lock_owned().await;

    let started = match self.registry().get_mut(session_id) {
      Some(session) => session.start(),
      None => false,
    };
    if !started {
      return;
    }

    let worker = self.clone();
    let outcome =
      tokio::task::spawn_blocking(move || worker.build_and_stage(session_id, cancel)).await;

    match outcome {
      Ok(Ok(build)) => self.commit(session_id, build),
      Ok(Err(e)) => self.record_failure(session_id, e.to_string()),
      Err(join_error) => self.record_failure(session_id, format!("build task aborted: {join_error}")),
    }
  }

  fn apply_event(&self, session_id: Uuid, event: &BuildEvent) {
    if let BuildEvent::Warning { path, reason } = event {
      tracing::warn!(session = %session_id, path = %path.display(), reason = %reason, "skipped file");
    }
    if let Some(session) = self.registry().get_mut(session_id) {
      session.apply(event);
    }
  }

  fn build_and_stage(&self, session_id: Uuid, cancel: Arc<AtomicBool>) -> Result<StagedBuild> {
    let builder = CatalogBuilder::new(&*self.embedder, self.settings.builder.clone())
      .with_cancel_flag(Arc::clone(&cancel));
    let report = builder
      .build(&self.settings.catalog_root, |event| self.apply_event(session_id, &event))?;

    if !report.diagnostics.is_empty() {
      let line = format!("Skipped {} of {} files", report.diagnostics.len(), report.images_seen);
      self.apply_event(session_id, &BuildEvent::Log(line));
    }

    self.apply_event(session_id, &BuildEvent::Phase(BuildPhase::Indexing));
    let indexed = IndexedCatalog::build(report.catalog)?;

    if cancel.load(std::sync::atomic::Ordering::SeqCst) {
      return Err(LikenessError::cancelled("build was cancelled"));
    }

    self.apply_event(session_id, &BuildEvent::Phase(BuildPhase::Persisting));
    let staged = indexed.catalog().stage(&self.settings.data_dir, &session_id.to_string())?;

    Ok(StagedBuild { indexed, staged })
  }

  /// Install a finished build, unless the session stopped being Running meanwhile
  fn commit(&self, session_id: Uuid, build: StagedBuild) {
    let StagedBuild { indexed, staged } = build;
    let mut registry = self.registry();

    let Some(session) = registry.get_mut(session_id) else {
      return;
    };
    if session.state() != BuildState::Running {
      tracing::info!(session = %session_id, state = %session.state(), "discarding finished build");
      return;
    }

    match staged.commit(&self.settings.snapshot_path) {
      Ok(()) => {
        let entries = indexed.catalog().len();
        self.serving.replace(indexed);
        session.complete(entries);
        tracing::info!(session = %session_id, entries, "serving catalog replaced");
      }
      Err(e) => {
        session.fail(format!("cannot persist catalog: {e}"));
      }
    }
  }

  fn record_failure(&self, session_id: Uuid, reason: String) {
    tracing::warn!(session = %session_id, reason = %reason, "rebuild failed");
    if let Some(session) = self.registry().get_mut(session_id) {
      session.fail(reason);
    }
  }

  pub fn status(&self, session_id: Uuid) -> Result<BuildSessionSnapshot> {
    self
      .registry()
      .get(session_id)
      .map(BuildSession::snapshot)
      .ok_or_else(|| LikenessError::session_not_found(session_id))
  }

  /// Stop a session. It is marked Failed right away and its task can no longer
  /// install a catalog.
  pub fn cancel(&self, session_id: Uuid) -> Result<BuildSessionSnapshot> {
    let mut registry = self.registry();
    let session =
      registry.get_mut(session_id).ok_or_else(|| LikenessError::session_not_found(session_id))?;
    if session.fail("cancelled") {
      tracing::info!(session = %session_id, "rebuild cancelled");
    }
    Ok(session.snapshot())
  }

  /// Resolve once the session reaches Completed or Failed
  pub async fn wait_for(&self, session_id: Uuid) -> Result<BuildSessionSnapshot> {
    let mut receiver = self
      .registry()
      .get(session_id)
      .map(BuildSession::subscribe)
      .ok_or_else(|| LikenessError::session_not_found(session_id))?;

    // An error only means the session was pruned; the status lookup reports that
    let _ = receiver.wait_for(|state| state.is_terminal()).await;
    self.status(session_id)
  }

  /// The owner's most recently admitted session
  pub fn latest_for_owner(&self, owner_id: &str) -> Option<BuildSessionSnapshot> {
    self.registry().sessions.iter().rev().find(|s| s.owner_id() == owner_id).map(BuildSession::snapshot)
  }

  /// The session holding the build slot, if any
  pub fn active_session(&self) -> Option<BuildSessionSnapshot> {
    self.registry().sessions.iter().find(|s| s.is_active()).map(BuildSession::snapshot)
  }

  pub fn active_session_count(&self) -> usize {
    self.registry().sessions.iter().filter(|s| s.is_active()).count()
  }

  /// Forget an owner's finished sessions. Returns how many were removed.
  pub fn clear_owner(&self, owner_id: &str) -> usize {
    let mut registry = self.registry();
    let before = registry.sessions.len();
    registry.sessions.retain(|s| s.owner_id() != owner_id || s.is_active());
    before - registry.sessions.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_prune_keeps_active_and_recent_sessions() {
    let mut registry = SessionRegistry::default();

    let mut finished = BuildSession::new("a", 4);
    finished.start();
    finished.fail("boom");
    let active = BuildSession::new("b", 4);
    let active_id = active.id();
    registry.sessions.push(finished);
    registry.sessions.push(active);

    registry.prune(Duration::from_secs(600));
    assert_eq!(registry.sessions.len(), 2);

    registry.prune(Duration::ZERO);
    assert_eq!(registry.sessions.len(), 1);
    assert_eq!(registry.sessions[0].id(), active_id);
  }

  #[test]
  fn test_serving_slot_swaps_whole_catalogs() {
    use crate::catalog::{Catalog, CatalogEntry};
    use crate::embedding::Embedding;

    let catalog = |label: &str| {
      let entry = CatalogEntry {
        vector: Embedding::normalized(vec![1.0, 0.0]).unwrap(),
        class_label: label.to_string(),
        source_path: PathBuf::from(format!("{label}/1.png")),
      };
      IndexedCatalog::build(Catalog::new(vec![entry]).unwrap()).unwrap()
    };

    let slot = ServingSlot::new(None);
    assert!(slot.current().is_none());

    slot.replace(catalog("old"));
    let held = slot.current().unwrap();
    slot.replace(catalog("new"));

    assert_eq!(held.catalog().entries()[0].class_label, "old");
    assert_eq!(slot.current().unwrap().catalog().entries()[0].class_label, "new");
  }
}
