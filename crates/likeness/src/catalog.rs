//! Reference catalog, its on-disk snapshot, and the indexed serving unit
//!
//! A catalog is one ordinal-indexed list of entries. Vector, label and source
//! path travel together in a single struct, so they cannot be reordered or
//! truncated independently of each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::embedding::Embedding;
use crate::error::{LikenessError, Result};
use crate::index::{FlatIndex, INDEX_KIND};

/// File name of the persisted catalog inside the data directory
pub const SNAPSHOT_FILE: &str = "catalog.json";

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// One reference rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
  pub vector: Embedding,
  pub class_label: String,
  pub source_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Catalog {
  entries: Vec<CatalogEntry>,
  dimension: usize,
  built_at: DateTime<Utc>,
}

impl Catalog {
  /// Assemble a catalog; entries must be non-empty and share one dimension
  pub fn new(entries: Vec<CatalogEntry>) -> Result<Self> {
    Self::with_build_time(entries, Utc::now())
  }

  fn with_build_time(entries: Vec<CatalogEntry>, built_at: DateTime<Utc>) -> Result<Self> {
    let dimension = entries
      .first()
      .map(|entry| entry.vector.dimension())
      .ok_or_else(|| LikenessError::configuration("a catalog needs at least one entry"))?;

    if let Some(odd) = entries.iter().find(|entry| entry.vector.dimension() != dimension) {
      return Err(LikenessError::dimension_mismatch(dimension, odd.vector.dimension()));
    }

    Ok(Self { entries, dimension, built_at })
  }

  pub fn entries(&self) -> &[CatalogEntry] {
    &self.entries
  }

  pub fn entry(&self, ordinal: usize) -> Option<&CatalogEntry> {
    self.entries.get(ordinal)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn dimension(&self) -> usize {
    self.dimension
  }

  pub fn built_at(&self) -> DateTime<Utc> {
    self.built_at
  }

  /// Entry count per class label
  pub fn per_class_counts(&self) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for entry in &self.entries {
      *counts.entry(entry.class_label.clone()).or_insert(0) += 1;
    }
    counts
  }
}

// Persistence
// ===========

/// On-disk layout: vectors, labels and paths are one unit with the metadata
/// needed to check them against each other on load.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
  format_version: u32,
  dimension: usize,
  count: usize,
  built_at: DateTime<Utc>,
  entries: Vec<CatalogEntry>,
}

impl Catalog {
  /// Persist atomically: write a sibling temp file, then rename over `path`
  pub fn save(&self, path: &Path) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    self.stage(dir, "save")?.commit(path)
  }

  /// Write the snapshot to a temp file in `dir`, ready to be renamed into place
  pub fn stage(&self, dir: &Path, tag: &str) -> Result<StagedSnapshot> {
    fs::create_dir_all(dir)?;
    let temp_path = dir.join(format!(".{SNAPSHOT_FILE}.{tag}.tmp"));
    let staged = StagedSnapshot { temp_path, committed: false };

    let snapshot = SnapshotFile {
      format_version: SNAPSHOT_FORMAT_VERSION,
      dimension: self.dimension,
      count: self.entries.len(),
      built_at: self.built_at,
      entries: self.entries.clone(),
    };

    let file = File::create(&staged.temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &snapshot)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;

    Ok(staged)
  }

  /// Load and validate a snapshot written by [`Catalog::save`]
  pub fn load(path: &Path) -> Result<Self> {
    let file = File::open(path)?;
    let snapshot: SnapshotFile = serde_json::from_reader(BufReader::new(file))
      .map_err(|e| LikenessError::snapshot(path, format!("cannot parse: {e}")))?;

    if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
      return Err(LikenessError::snapshot(
        path,
        format!("unsupported format version {}", snapshot.format_version),
      ));
    }
    if snapshot.count != snapshot.entries.len() {
      return Err(LikenessError::snapshot(
        path,
        format!("header says {} entries, found {}", snapshot.count, snapshot.entries.len()),
      ));
    }
    if let Some(odd) = snapshot.entries.iter().find(|e| e.vector.dimension() != snapshot.dimension)
    {
      return Err(LikenessError::snapshot(
        path,
        format!(
          "entry {} has dimension {}, header says {}",
          odd.source_path.display(),
          odd.vector.dimension(),
          snapshot.dimension
        ),
      ));
    }

    Self::with_build_time(snapshot.entries, snapshot.built_at)
      .map_err(|e| LikenessError::snapshot(path, e.to_string()))
  }
}

/// A fully written snapshot that has not replaced the live one yet.
///
/// Dropping it without [`StagedSnapshot::commit`] deletes the temp file.
#[derive(Debug)]
pub struct StagedSnapshot {
  temp_path: PathBuf,
  committed: bool,
}

impl StagedSnapshot {
  pub fn temp_path(&self) -> &Path {
    &self.temp_path
  }

  /// Rename the staged file over `dest`
  pub fn commit(mut self, dest: &Path) -> Result<()> {
    fs::rename(&self.temp_path, dest)?;
    self.committed = true;
    Ok(())
  }
}

impl Drop for StagedSnapshot {
  fn drop(&mut self) {
    if !self.committed {
      let _ = fs::remove_file(&self.temp_path);
    }
  }
}

// Serving
// =======

/// One ranked search result with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborHit {
  /// 1-based rank within one search
  pub rank: usize,
  /// Position of the entry in the catalog
  pub ordinal: usize,
  /// Inner product with the query, nominally in [-1, 1]
  pub similarity: f32,
  /// `similarity * 100`
  pub confidence: f32,
  pub class_label: String,
  pub source_path: PathBuf,
}

/// Summary of the serving catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogStatistics {
  pub total_entries: usize,
  pub total_classes: usize,
  pub dimension: usize,
  pub per_class_counts: BTreeMap<String, usize>,
  pub index_kind: String,
  pub built_at: DateTime<Utc>,
}

/// A catalog paired with the index built from exactly its vectors.
///
/// This is the unit that gets swapped into the serving slot; it is never
/// modified after construction.
#[derive(Debug)]
pub struct IndexedCatalog {
  catalog: Catalog,
  index: FlatIndex,
}

impl IndexedCatalog {
  pub fn build(catalog: Catalog) -> Result<Self> {
    let vectors: Vec<Embedding> = catalog.entries().iter().map(|e| e.vector.clone()).collect();
    let index = FlatIndex::build(&vectors)?;
    Ok(Self { catalog, index })
  }

  pub fn catalog(&self) -> &Catalog {
    &self.catalog
  }

  pub fn index(&self) -> &FlatIndex {
    &self.index
  }

  /// Top-k neighbors of a unit query vector, ranked from 1
  pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<NeighborHit>> {
    let scored = self.index.search(query, k)?;

    scored
      .into_iter()
      .enumerate()
      .map(|(i, hit)| {
        let entry = self.catalog.entry(hit.ordinal).ok_or_else(|| {
          LikenessError::configuration(format!("index row {} has no catalog entry", hit.ordinal))
        })?;
        Ok(NeighborHit {
          rank: i + 1,
          ordinal: hit.ordinal,
          similarity: hit.similarity,
          confidence: hit.similarity * 100.0,
          class_label: entry.class_label.clone(),
          source_path: entry.source_path.clone(),
        })
      })
      .collect()
  }

  pub fn statistics(&self) -> CatalogStatistics {
    let per_class_counts = self.catalog.per_class_counts();
    CatalogStatistics {
      total_entries: self.catalog.len(),
      total_classes: per_class_counts.len(),
      dimension: self.catalog.dimension(),
      per_class_counts,
      index_kind: INDEX_KIND.to_string(),
      built_at: self.catalog.built_at(),
    }
  }
}
