//! The engine object: searches against the serving catalog and rebuild control

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::catalog::{Catalog, CatalogStatistics, IndexedCatalog, SNAPSHOT_FILE};
use crate::classifier::{aggregate, QueryKind, SearchOutcome};
use crate::config::EngineConfig;
use crate::embedding::{Embedder, Embedding};
use crate::error::{LikenessError, Result};
use crate::fusion::{fuse, validate_image_weight};
use crate::orchestrator::{BuildOrchestrator, OrchestratorSettings, ServingSlot};
use crate::session::BuildSessionSnapshot;

pub struct Engine<E> {
  embedder: Arc<E>,
  config: EngineConfig,
  serving: Arc<ServingSlot>,
  orchestrator: BuildOrchestrator<E>,
}

impl<E: Embedder + Send + Sync + 'static> Engine<E> {
  /// An engine with no catalog yet; searches fail until a rebuild completes
  pub fn new(embedder: E, config: EngineConfig) -> Result<Self> {
    Self::with_catalog(embedder, config, None)
  }

  /// An engine serving the snapshot in the data directory, if there is one
  pub fn open(embedder: E, config: EngineConfig) -> Result<Self> {
    config.validate()?;
    remove_stale_stages(&config.data_dir, STALE_STAGE_AGE);

    let snapshot_path = config.snapshot_path();
    let initial = if snapshot_path.is_file() {
      let catalog = Catalog::load(&snapshot_path)?;
      if let Some(expected) = embedder.dimension() {
        if expected != catalog.dimension() {
          return Err(LikenessError::dimension_mismatch(expected, catalog.dimension()));
        }
      }
      tracing::info!(
        path = %snapshot_path.display(),
        entries = catalog.len(),
        "loaded catalog snapshot"
      );
      Some(IndexedCatalog::build(catalog)?)
    } else {
      tracing::info!(path = %snapshot_path.display(), "no catalog snapshot; a rebuild is needed");
      None
    };

    Self::with_catalog(embedder, config, initial)
  }

  fn with_catalog(embedder: E, config: EngineConfig, initial: Option<IndexedCatalog>) -> Result<Self> {
    config.validate()?;

    let embedder = Arc::new(embedder);
    let serving = Arc::new(ServingSlot::new(initial));
    let settings = OrchestratorSettings {
      catalog_root: config.catalog_root.clone(),
      data_dir: config.data_dir.clone(),
      snapshot_path: config.snapshot_path(),
      builder: config.builder_options(),
      log_capacity: config.log_capacity,
      session_retention: config.session_retention(),
    };
    let orchestrator = BuildOrchestrator::new(Arc::clone(&embedder), settings, Arc::clone(&serving));

    Ok(Self { embedder, config, serving, orchestrator })
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  /// Whether a catalog is serving
  pub fn is_ready(&self) -> bool {
    self.serving.current().is_some()
  }

  pub fn search_by_image(&self, path: &Path, k: usize) -> Result<SearchOutcome> {
    self.search_hybrid(Some(path), None, k, self.config.image_weight)
  }

  pub fn search_by_text(&self, text: &str, k: usize) -> Result<SearchOutcome> {
    self.search_hybrid(None, Some(text), k, self.config.image_weight)
  }

  /// Search with an image, a text description, or both.
  ///
  /// Arguments are checked before the embedder runs, and the whole search
  /// reads one catalog even if a rebuild swaps it meanwhile.
  pub fn search_hybrid(
    &self,
    image: Option<&Path>,
    text: Option<&str>,
    k: usize,
    image_weight: f32,
  ) -> Result<SearchOutcome> {
    if k == 0 {
      return Err(LikenessError::configuration("k must be at least 1"));
    }
    validate_image_weight(image_weight)?;

    let query_kind = match (image, text) {
      (Some(_), Some(_)) => QueryKind::Hybrid,
      (Some(_), None) => QueryKind::Image,
      (None, Some(_)) => QueryKind::Text,
      (None, None) => return Err(LikenessError::MissingQuery),
    };

    let catalog = self.serving.current().ok_or(LikenessError::IndexUnavailable)?;
    let started = Instant::now();

    let image_vector: Option<Embedding> =
      image.map(|path| self.embedder.extract_image(path)).transpose()?;
    let text_vector: Option<Embedding> =
      text.map(|text| self.embedder.extract_text(text)).transpose()?;
    let query = fuse(image_vector.as_ref(), text_vector.as_ref(), image_weight)?;

    let detailed_results = catalog.search(query.as_slice(), k)?;
    let predictions = aggregate(&detailed_results);
    let inference_time_ms = started.elapsed().as_secs_f64() * 1000.0;

    tracing::debug!(
      kind = %query_kind,
      k,
      hits = detailed_results.len(),
      top = predictions.first().map(|p| p.class_label.as_str()).unwrap_or("-"),
      inference_time_ms,
      "search finished"
    );

    Ok(SearchOutcome { predictions, detailed_results, query_kind, inference_time_ms })
  }

  pub fn get_statistics(&self) -> Result<CatalogStatistics> {
    self.serving.current().map(|catalog| catalog.statistics()).ok_or(LikenessError::IndexUnavailable)
  }

  /// Start a background rebuild from the configured catalog root
  pub fn request_rebuild(&self, owner_id: &str) -> Result<Uuid> {
    self.orchestrator.request_rebuild(owner_id)
  }

  pub fn get_build_status(&self, session_id: Uuid) -> Result<BuildSessionSnapshot> {
    self.orchestrator.status(session_id)
  }

  pub fn cancel_rebuild(&self, session_id: Uuid) -> Result<BuildSessionSnapshot> {
    self.orchestrator.cancel(session_id)
  }

  pub async fn wait_for_build(&self, session_id: Uuid) -> Result<BuildSessionSnapshot> {
    self.orchestrator.wait_for(session_id).await
  }

  pub fn latest_build_for(&self, owner_id: &str) -> Option<BuildSessionSnapshot> {
    self.orchestrator.latest_for_owner(owner_id)
  }

  pub fn active_build(&self) -> Option<BuildSessionSnapshot> {
    self.orchestrator.active_session()
  }

  pub fn active_build_count(&self) -> usize {
    self.orchestrator.active_session_count()
  }

  pub fn clear_builds_for(&self, owner_id: &str) -> usize {
    self.orchestrator.clear_owner(owner_id)
  }
}

/// Staged snapshots untouched for this long belong to no live build
const STALE_STAGE_AGE: Duration = Duration::from_secs(60 * 60);

/// Delete temp snapshots left behind by a process that died mid-build.
///
/// Only files last written at least `older_than` ago are removed, so a build
/// staging into a shared data directory keeps its file.
fn remove_stale_stages(data_dir: &Path, older_than: Duration) {
  let Ok(entries) = std::fs::read_dir(data_dir) else {
    return;
  };
  let prefix = format!(".{SNAPSHOT_FILE}.");
  for entry in entries.flatten() {
    let name = entry.file_name();
    let name = name.to_string_lossy();
    if !name.starts_with(&prefix) || !name.ends_with(".tmp") {
      continue;
    }
    let age = entry
      .metadata()
      .and_then(|meta| meta.modified())
      .ok()
      .and_then(|modified| modified.elapsed().ok());
    match age {
      Some(age) if age >= older_than => {
        tracing::debug!(file = %name, "removing stale staged snapshot");
        let _ = std::fs::remove_file(entry.path());
      }
      _ => tracing::debug!(file = %name, "keeping recent staged snapshot"),
    }
  }
}
