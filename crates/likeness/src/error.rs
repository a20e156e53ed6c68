use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T, E = LikenessError> = std::result::Result<T, E>;

/// An embedder could not turn one input into a vector
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Failed to extract embedding from {input}: {message}")]
pub struct ExtractionError {
  pub input: String,
  pub message: String,
}

impl ExtractionError {
  pub fn new(input: impl Into<String>, message: impl Into<String>) -> Self {
    Self { input: input.into(), message: message.into() }
  }

  pub fn for_path(path: &std::path::Path, message: impl Into<String>) -> Self {
    Self::new(path.display().to_string(), message)
  }
}

#[derive(Error, Debug)]
pub enum LikenessError {
  #[error(transparent)]
  Extraction(#[from] ExtractionError),

  #[error("No usable reference images found under {root}")]
  EmptyCatalog { root: PathBuf },

  #[error("Invalid configuration: {message}")]
  Configuration { message: String },

  #[error("A query needs an image, a text description, or both")]
  MissingQuery,

  #[error("Fused query vector has zero length; image and text embeddings cancel out")]
  DegenerateQuery,

  #[error("A rebuild is already running for {owner_id} (session {session_id})")]
  Busy { owner_id: String, session_id: Uuid },

  #[error("No catalog has been built yet")]
  IndexUnavailable,

  #[error("Dimension mismatch: expected {expected}, got {actual}")]
  DimensionMismatch { expected: usize, actual: usize },

  #[error("Build session {session_id} not found")]
  SessionNotFound { session_id: Uuid },

  #[error("Build cancelled: {reason}")]
  Cancelled { reason: String },

  #[error("Catalog snapshot {path} is unusable: {message}")]
  Snapshot { path: PathBuf, message: String },

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl LikenessError {
  pub fn empty_catalog(root: impl Into<PathBuf>) -> Self {
    Self::EmptyCatalog { root: root.into() }
  }

  pub fn configuration(message: impl Into<String>) -> Self {
    Self::Configuration { message: message.into() }
  }

  pub fn busy(owner_id: impl Into<String>, session_id: Uuid) -> Self {
    Self::Busy { owner_id: owner_id.into(), session_id }
  }

  pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
    Self::DimensionMismatch { expected, actual }
  }

  pub fn session_not_found(session_id: Uuid) -> Self {
    Self::SessionNotFound { session_id }
  }

  pub fn cancelled(reason: impl Into<String>) -> Self {
    Self::Cancelled { reason: reason.into() }
  }

  pub fn snapshot(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
    Self::Snapshot { path: path.into(), message: message.into() }
  }
}
