//! Walk a class-labeled directory tree and embed every reference image
//!
//! Layout: `root/<class_label>/<image files>`. Classes and files are visited in
//! sorted order, so the same tree always produces the same catalog ordinals.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::catalog::{Catalog, CatalogEntry};
use crate::embedding::Embedder;
use crate::error::{LikenessError, Result};
use crate::session::BuildPhase;

/// Structured progress reported while a catalog is built
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
  Phase(BuildPhase),
  Progress { processed: usize, total: usize },
  /// Human-readable line, kept for display only
  Log(String),
  /// A file that was left out of the catalog
  Warning { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct BuilderOptions {
  pub batch_size: usize,
  /// Emit a progress line every this many images
  pub progress_interval: usize,
  /// Lowercase extensions without the dot
  pub allowed_extensions: Vec<String>,
}

impl Default for BuilderOptions {
  fn default() -> Self {
    Self {
      batch_size: 32,
      progress_interval: 10,
      allowed_extensions: ["png", "jpg", "jpeg", "bmp", "gif"].iter().map(|s| s.to_string()).collect(),
    }
  }
}

/// A file skipped during the build and why
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedFile {
  pub path: PathBuf,
  pub reason: String,
}

/// One class directory and its image files, both in visiting order
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDirectory {
  pub label: String,
  pub files: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct BuildReport {
  pub catalog: Catalog,
  pub diagnostics: Vec<SkippedFile>,
  pub class_count: usize,
  pub images_seen: usize,
  pub elapsed_seconds: f64,
}

pub struct CatalogBuilder<'a, E: Embedder + ?Sized> {
  embedder: &'a E,
  options: BuilderOptions,
  cancel: Option<Arc<AtomicBool>>,
}

impl<'a, E: Embedder + ?Sized> CatalogBuilder<'a, E> {
  pub fn new(embedder: &'a E, options: BuilderOptions) -> Self {
    Self { embedder, options, cancel: None }
  }

  /// Stop between batches once this flag is set
  pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
    self.cancel = Some(cancel);
    self
  }

  /// List class directories and their allow-listed images
  pub fn scan(&self, root: &Path) -> Result<Vec<ClassDirectory>> {
    if !root.is_dir() {
      return Err(LikenessError::configuration(format!(
        "catalog root {} is not a directory",
        root.display()
      )));
    }

    let mut class_dirs: Vec<(String, PathBuf)> = fs::read_dir(root)?
      .filter_map(|entry| entry.ok())
      .filter(|entry| entry.path().is_dir())
      .filter_map(|entry| {
        let label = entry.file_name().into_string().ok()?;
        (!label.starts_with('.')).then(|| (label, entry.path()))
      })
      .collect();
    class_dirs.sort_by(|a, b| a.0.cmp(&b.0));

    class_dirs
      .into_iter()
      .map(|(label, dir)| {
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
          .filter_map(|entry| entry.ok())
          .map(|entry| entry.path())
          .filter(|path| path.is_file() && self.is_allowed(path))
          .collect();
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(ClassDirectory { label, files })
      })
      .collect()
  }

  fn is_allowed(&self, path: &Path) -> bool {
    path
      .extension()
      .and_then(|ext| ext.to_str())
      .map(|ext| self.options.allowed_extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
      .unwrap_or(false)
  }

  fn check_cancelled(&self) -> Result<()> {
    match &self.cancel {
      Some(flag) if flag.load(Ordering::SeqCst) => Err(LikenessError::cancelled("build was cancelled")),
      _ => Ok(()),
    }
  }

  /// Embed every image under `root`, reporting progress through `on_event`.
  ///
  /// Extraction failures and vectors of the wrong dimension are skipped and
  /// reported; only an empty result is an error.
  pub fn build(&self, root: &Path, mut on_event: impl FnMut(BuildEvent)) -> Result<BuildReport> {
    let started = Instant::now();
    on_event(BuildEvent::Phase(BuildPhase::Scanning));

    let classes = self.scan(root)?;
    let total: usize = classes.iter().map(|class| class.files.len()).sum();

    let preview: Vec<&str> = classes.iter().take(5).map(|c| c.label.as_str()).collect();
    let more = if classes.len() > 5 { "..." } else { "" };
    on_event(BuildEvent::Log(format!("Found {} classes: {}{more}", classes.len(), preview.join(", "))));
    on_event(BuildEvent::Log(format!("Total images to process: {total} (from {} classes)", classes.len())));

    on_event(BuildEvent::Phase(BuildPhase::Extracting));
    on_event(BuildEvent::Progress { processed: 0, total });

    let batch_size = self.options.batch_size.max(1);
    let interval = self.options.progress_interval.max(1);
    let mut expected_dimension = self.embedder.dimension();
    let mut entries: Vec<CatalogEntry> = Vec::with_capacity(total);
    let mut diagnostics = Vec::new();
    let mut processed = 0usize;

    for (class_index, class) in classes.iter().enumerate() {
      let class_started = Instant::now();
      let mut accepted = 0usize;
      on_event(BuildEvent::Log(format!(
        "Processing class [{}/{}] {}: {} images",
        class_index + 1,
        classes.len(),
        class.label,
        class.files.len()
      )));

      for batch in class.files.chunks(batch_size) {
        self.check_cancelled()?;

        let mut results = self.embedder.extract_image_batch(batch).into_iter();
        for path in batch {
          let outcome = match results.next() {
            Some(Ok(vector)) => match expected_dimension {
              Some(expected) if vector.dimension() != expected => Err(format!(
                "embedding has dimension {}, expected {expected}",
                vector.dimension()
              )),
              _ => {
                expected_dimension = Some(vector.dimension());
                Ok(vector)
              }
            },
            Some(Err(e)) => Err(e.message),
            None => Err("embedder returned no result for this file".to_string()),
          };

          match outcome {
            Ok(vector) => {
              entries.push(CatalogEntry {
                vector,
                class_label: class.label.clone(),
                source_path: path.clone(),
              });
              accepted += 1;
            }
            Err(reason) => {
              on_event(BuildEvent::Warning { path: path.clone(), reason: reason.clone() });
              diagnostics.push(SkippedFile { path: path.clone(), reason });
            }
          }

          processed += 1;
          on_event(BuildEvent::Progress { processed, total });
          if processed % interval == 0 || processed == total {
            on_event(BuildEvent::Log(progress_line(processed, total, started.elapsed().as_secs_f64())));
          }
        }
      }

      on_event(BuildEvent::Log(format!(
        "Class {} done ({accepted}/{} images, {:.1}s) | overall {:.1}%",
        class.label,
        class.files.len(),
        class_started.elapsed().as_secs_f64(),
        (class_index + 1) as f64 / classes.len() as f64 * 100.0
      )));
    }

    self.check_cancelled()?;

    if entries.is_empty() {
      return Err(LikenessError::empty_catalog(root));
    }

    let elapsed_seconds = started.elapsed().as_secs_f64();
    let catalog = Catalog::new(entries)?;
    on_event(BuildEvent::Log(format!(
      "Extracted {} vectors of dimension {} from {} classes in {elapsed_seconds:.1}s ({:.1} images/s)",
      catalog.len(),
      catalog.dimension(),
      classes.len(),
      processed as f64 / elapsed_seconds.max(f64::EPSILON)
    )));

    Ok(BuildReport { catalog, diagnostics, class_count: classes.len(), images_seen: processed, elapsed_seconds })
  }
}

fn progress_line(processed: usize, total: usize, elapsed_seconds: f64) -> String {
  let percent = processed as f64 / total.max(1) as f64 * 100.0;
  let remaining = elapsed_seconds / processed.max(1) as f64 * (total - processed) as f64;
  format!(
    "Progress: {processed}/{total} images ({percent:.1}%) | about {:.1} min left",
    remaining / 60.0
  )
}
