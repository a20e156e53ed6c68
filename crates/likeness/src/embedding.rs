//! Embedding vectors and the embedder seam
//!
//! Everything downstream of an [`Embedder`] assumes unit-length vectors: the
//! index scores by raw inner product, so a vector that is not normalized would
//! silently skew every similarity it takes part in.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ExtractionError;

/// Norms below this are treated as zero
pub const MIN_NORM: f32 = 1e-12;

/// A unit-length embedding vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f32>);

impl Embedding {
  /// Normalize raw model output to unit length.
  ///
  /// Returns `None` for empty input, non-finite components, or a zero vector,
  /// none of which has a direction to compare.
  pub fn normalized(mut values: Vec<f32>) -> Option<Self> {
    if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
      return None;
    }

    let norm = l2_norm(&values);
    if !norm.is_finite() || norm < MIN_NORM {
      return None;
    }

    for value in values.iter_mut() {
      *value /= norm;
    }
    Some(Self(values))
  }

  /// Wrap values already known to be unit length (e.g. read back from a snapshot)
  pub fn from_unit(values: Vec<f32>) -> Self {
    Self(values)
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.0
  }

  pub fn dimension(&self) -> usize {
    self.0.len()
  }

  pub fn norm(&self) -> f32 {
    l2_norm(&self.0)
  }

  /// Inner product with another vector of the same dimension
  pub fn dot(&self, other: &[f32]) -> f32 {
    dot(&self.0, other)
  }

  pub fn into_inner(self) -> Vec<f32> {
    self.0
  }
}

impl AsRef<[f32]> for Embedding {
  fn as_ref(&self) -> &[f32] {
    &self.0
  }
}

/// Euclidean length of a vector
pub fn l2_norm(values: &[f32]) -> f32 {
  values.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Inner product of two vectors; mismatched lengths only cover the shared prefix
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
  a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Turns images and text into vectors in one shared space.
///
/// Implementations must be deterministic for identical input and report every
/// I/O or decode failure as an [`ExtractionError`] instead of panicking.
#[cfg_attr(test, mockall::automock)]
pub trait Embedder {
  fn extract_image(&self, path: &Path) -> Result<Embedding, ExtractionError>;

  fn extract_text(&self, text: &str) -> Result<Embedding, ExtractionError>;

  /// Extract a batch of images. The result holds exactly one entry per input path,
  /// in input order.
  fn extract_image_batch(&self, paths: &[PathBuf]) -> Vec<Result<Embedding, ExtractionError>> {
    paths.iter().map(|path| self.extract_image(path)).collect()
  }

  /// Output dimension, when known up front
  fn dimension(&self) -> Option<usize> {
    None
  }
}

/// Embedder backed by literal vectors, for fixtures and offline tooling.
///
/// Image files hold their vector as comma- or whitespace-separated components.
/// Texts are looked up in a table first and otherwise parsed the same way.
#[derive(Debug, Default, Clone)]
pub struct StaticEmbedder {
  texts: HashMap<String, Vec<f32>>,
  image_delay: Option<Duration>,
}

impl StaticEmbedder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Map a text query to a fixed vector
  pub fn with_text(mut self, text: impl Into<String>, values: Vec<f32>) -> Self {
    self.texts.insert(text.into(), values);
    self
  }

  /// Sleep this long per image, to hold a build open while other calls run
  pub fn with_image_delay(mut self, delay: Duration) -> Self {
    self.image_delay = Some(delay);
    self
  }

  /// Parse `"0.1, 0.2 0.3"` style component lists
  pub fn parse_components(raw: &str) -> Option<Vec<f32>> {
    let values: Result<Vec<f32>, _> = raw
      .split(|c: char| c == ',' || c.is_whitespace())
      .filter(|part| !part.is_empty())
      .map(str::parse::<f32>)
      .collect();

    values.ok().filter(|values| !values.is_empty())
  }

  fn to_embedding(input: &str, values: Vec<f32>) -> Result<Embedding, ExtractionError> {
    Embedding::normalized(values)
      .ok_or_else(|| ExtractionError::new(input, "vector has no direction (zero or non-finite)"))
  }
}

impl Embedder for StaticEmbedder {
  fn extract_image(&self, path: &Path) -> Result<Embedding, ExtractionError> {
    if let Some(delay) = self.image_delay {
      std::thread::sleep(delay);
    }

    let raw = std::fs::read_to_string(path)
      .map_err(|e| ExtractionError::for_path(path, format!("cannot read image: {e}")))?;
    let values = Self::parse_components(&raw)
      .ok_or_else(|| ExtractionError::for_path(path, "cannot decode image"))?;

    Self::to_embedding(&path.display().to_string(), values)
  }

  fn extract_text(&self, text: &str) -> Result<Embedding, ExtractionError> {
    let values = match self.texts.get(text) {
      Some(values) => values.clone(),
      None => Self::parse_components(text)
        .ok_or_else(|| ExtractionError::new(text, "no vector known for this text"))?,
    };

    Self::to_embedding(text, values)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  #[test]
  fn test_normalized_produces_unit_vector() {
    let embedding = Embedding::normalized(vec![3.0, 4.0]).unwrap();
    assert!((embedding.norm() - 1.0).abs() < 1e-6);
    assert!((embedding.as_slice()[0] - 0.6).abs() < 1e-6);
    assert!((embedding.as_slice()[1] - 0.8).abs() < 1e-6);
  }

  #[test]
  fn test_normalized_rejects_directionless_input() {
    assert!(Embedding::normalized(vec![]).is_none());
    assert!(Embedding::normalized(vec![0.0, 0.0, 0.0]).is_none());
    assert!(Embedding::normalized(vec![1.0, f32::NAN]).is_none());
    assert!(Embedding::normalized(vec![f32::INFINITY, 1.0]).is_none());
  }

  #[test]
  fn test_dot_of_unit_vectors_is_cosine() {
    let a = Embedding::normalized(vec![1.0, 0.0]).unwrap();
    let b = Embedding::normalized(vec![1.0, 1.0]).unwrap();
    assert!((a.dot(b.as_slice()) - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
  }

  #[test]
  fn test_parse_components_accepts_commas_and_whitespace() {
    assert_eq!(StaticEmbedder::parse_components("1, 2 3\n4"), Some(vec![1.0, 2.0, 3.0, 4.0]));
    assert_eq!(StaticEmbedder::parse_components("not a vector"), None);
    assert_eq!(StaticEmbedder::parse_components("   "), None);
  }

  #[test]
  fn test_static_embedder_reads_image_fixture() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("front.png");
    fs::write(&path, "0.0, 2.0").unwrap();

    let embedding = StaticEmbedder::new().extract_image(&path).unwrap();
    assert_eq!(embedding.as_slice(), &[0.0, 1.0]);
  }

  #[test]
  fn test_static_embedder_reports_unreadable_images() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.png");
    let garbage = dir.path().join("garbage.png");
    fs::write(&garbage, "\u{89}PNG binary-ish").unwrap();

    let embedder = StaticEmbedder::new();
    assert!(embedder.extract_image(&missing).is_err());
    let err = embedder.extract_image(&garbage).unwrap_err();
    assert!(err.message.contains("cannot decode"));
  }

  #[test]
  fn test_static_embedder_text_table_then_literal() {
    let embedder = StaticEmbedder::new().with_text("a metal ring", vec![0.0, 5.0]);

    assert_eq!(embedder.extract_text("a metal ring").unwrap().as_slice(), &[0.0, 1.0]);
    assert_eq!(embedder.extract_text("4 0").unwrap().as_slice(), &[1.0, 0.0]);
    assert!(embedder.extract_text("a plastic gear").is_err());
  }

  #[test]
  fn test_default_batch_keeps_order_and_failures() {
    let dir = TempDir::new().unwrap();
    let good = dir.path().join("good.png");
    let bad = dir.path().join("bad.png");
    fs::write(&good, "1 0").unwrap();
    fs::write(&bad, "0 0").unwrap();

    let results = StaticEmbedder::new().extract_image_batch(&[bad.clone(), good.clone()]);
    assert_eq!(results.len(), 2);
    assert!(results[0].is_err());
    assert!(results[1].is_ok());
  }
}
