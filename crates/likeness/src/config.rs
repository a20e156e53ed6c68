//! Engine configuration
//!
//! Looked up in this order, first hit wins:
//! 1. the file named by `LIKENESS_CONFIG`
//! 2. `likeness.yaml` in the working directory
//! 3. `config.yaml` in the data directory
//! 4. built-in defaults
//!
//! `LIKENESS_HOME` always overrides the data directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::SNAPSHOT_FILE;
use crate::catalog_builder::BuilderOptions;
use crate::error::{LikenessError, Result};

pub const CONFIG_ENV: &str = "LIKENESS_CONFIG";
pub const HOME_ENV: &str = "LIKENESS_HOME";
pub const LOCAL_CONFIG_FILE: &str = "likeness.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Directory of class subdirectories holding reference images
  pub catalog_root: PathBuf,
  /// Where the catalog snapshot (and optional config file) live
  pub data_dir: PathBuf,
  pub default_k: usize,
  /// Share of the image vector in hybrid queries
  pub image_weight: f32,
  pub batch_size: usize,
  pub progress_interval: usize,
  /// Lines kept in each build session's log
  pub log_capacity: usize,
  /// How long finished sessions stay queryable
  pub session_retention_secs: u64,
  pub allowed_extensions: Vec<String>,
  #[cfg(feature = "onnx")]
  pub onnx: OnnxConfig,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      catalog_root: PathBuf::from("dataset"),
      data_dir: default_data_dir(),
      default_k: 5,
      image_weight: 0.7,
      batch_size: 32,
      progress_interval: 10,
      log_capacity: 300,
      session_retention_secs: 600,
      allowed_extensions: ["png", "jpg", "jpeg", "bmp", "gif"].iter().map(|s| s.to_string()).collect(),
      #[cfg(feature = "onnx")]
      onnx: OnnxConfig::default(),
    }
  }
}

/// Model files for the ONNX embedder. Relative paths resolve against the data directory.
#[cfg(feature = "onnx")]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnnxConfig {
  pub vision_model: PathBuf,
  pub text_model: PathBuf,
  pub tokenizer: PathBuf,
  pub intra_threads: usize,
}

#[cfg(feature = "onnx")]
impl Default for OnnxConfig {
  fn default() -> Self {
    Self {
      vision_model: PathBuf::from("models/clip-vision.onnx"),
      text_model: PathBuf::from("models/clip-text.onnx"),
      tokenizer: PathBuf::from("models/tokenizer.json"),
      intra_threads: 1,
    }
  }
}

/// `$LIKENESS_HOME`, else `~/.likeness`
pub fn default_data_dir() -> PathBuf {
  if let Ok(home) = std::env::var(HOME_ENV) {
    return PathBuf::from(home);
  }
  dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".likeness")
}

impl EngineConfig {
  /// Resolve configuration from the environment and the usual file locations
  pub fn load() -> Result<Self> {
    let mut config = match Self::locate() {
      Some(path) => {
        tracing::debug!(path = %path.display(), "loading configuration");
        Self::from_file(&path)?
      }
      None => Self::default(),
    };

    if let Ok(home) = std::env::var(HOME_ENV) {
      config.data_dir = PathBuf::from(home);
    }

    config.validate()?;
    Ok(config)
  }

  fn locate() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
      return Some(PathBuf::from(explicit));
    }

    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.is_file() {
      return Some(local);
    }

    let in_data_dir = default_data_dir().join("config.yaml");
    in_data_dir.is_file().then_some(in_data_dir)
  }

  pub fn from_file(path: &Path) -> Result<Self> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
      LikenessError::configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    Self::from_yaml(&raw)
      .map_err(|e| LikenessError::configuration(format!("{}: {e}", path.display())))
  }

  pub fn from_yaml(raw: &str) -> Result<Self> {
    serde_yaml::from_str(raw).map_err(|e| LikenessError::configuration(e.to_string()))
  }

  pub fn validate(&self) -> Result<()> {
    if self.default_k == 0 {
      return Err(LikenessError::configuration("default_k must be at least 1"));
    }
    if self.image_weight.is_nan() || !(0.0..=1.0).contains(&self.image_weight) {
      return Err(LikenessError::configuration(format!(
        "image_weight must be within [0, 1], got {}",
        self.image_weight
      )));
    }
    if self.batch_size == 0 {
      return Err(LikenessError::configuration("batch_size must be at least 1"));
    }
    if self.progress_interval == 0 {
      return Err(LikenessError::configuration("progress_interval must be at least 1"));
    }
    if self.log_capacity == 0 {
      return Err(LikenessError::configuration("log_capacity must be at least 1"));
    }
    if self.allowed_extensions.is_empty() {
      return Err(LikenessError::configuration("allowed_extensions must not be empty"));
    }
    Ok(())
  }

  pub fn snapshot_path(&self) -> PathBuf {
    self.data_dir.join(SNAPSHOT_FILE)
  }

  pub fn session_retention(&self) -> Duration {
    Duration::from_secs(self.session_retention_secs)
  }

  pub fn builder_options(&self) -> BuilderOptions {
    BuilderOptions {
      batch_size: self.batch_size,
      progress_interval: self.progress_interval,
      allowed_extensions: self
        .allowed_extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
        .collect(),
    }
  }

  #[cfg(feature = "onnx")]
  pub fn resolve_model_path(&self, path: &Path) -> PathBuf {
    self.data_dir.join(path)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;
  use tempfile::TempDir;

  #[test]
  fn test_defaults_are_valid() {
    let config = EngineConfig::default();
    assert_eq!(config.default_k, 5);
    assert!((config.image_weight - 0.7).abs() < f32::EPSILON);
    assert_eq!(config.progress_interval, 10);
    assert_eq!(config.log_capacity, 300);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_partial_yaml_keeps_other_defaults() {
    let config = EngineConfig::from_yaml("default_k: 3\ncatalog_root: /srv/renders\n").unwrap();
    assert_eq!(config.default_k, 3);
    assert_eq!(config.catalog_root, PathBuf::from("/srv/renders"));
    assert_eq!(config.batch_size, 32);
  }

  #[test]
  fn test_validate_rejects_out_of_range_values() {
    let bad = [
      EngineConfig { default_k: 0, ..EngineConfig::default() },
      EngineConfig { image_weight: 1.5, ..EngineConfig::default() },
      EngineConfig { image_weight: f32::NAN, ..EngineConfig::default() },
      EngineConfig { batch_size: 0, ..EngineConfig::default() },
      EngineConfig { progress_interval: 0, ..EngineConfig::default() },
      EngineConfig { log_capacity: 0, ..EngineConfig::default() },
      EngineConfig { allowed_extensions: vec![], ..EngineConfig::default() },
    ];
    for config in bad {
      assert!(matches!(config.validate(), Err(LikenessError::Configuration { .. })), "{config:?}");
    }
  }

  #[test]
  fn test_builder_options_normalize_extensions() {
    let config = EngineConfig {
      allowed_extensions: vec![".PNG".into(), "jpg".into()],
      ..EngineConfig::default()
    };
    assert_eq!(config.builder_options().allowed_extensions, vec!["png", "jpg"]);
  }

  #[test]
  #[serial]
  fn test_load_reads_explicit_file_and_home_override() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("custom.yaml");
    std::fs::write(&config_path, "default_k: 7\ndata_dir: /ignored\n").unwrap();

    std::env::set_var(CONFIG_ENV, &config_path);
    std::env::set_var(HOME_ENV, dir.path());
    let config = EngineConfig::load();
    std::env::remove_var(CONFIG_ENV);
    std::env::remove_var(HOME_ENV);

    let config = config.unwrap();
    assert_eq!(config.default_k, 7);
    assert_eq!(config.data_dir, dir.path());
    assert_eq!(config.snapshot_path(), dir.path().join(SNAPSHOT_FILE));
  }

  #[test]
  #[serial]
  fn test_load_reports_missing_explicit_file() {
    let dir = TempDir::new().unwrap();
    std::env::set_var(CONFIG_ENV, dir.path().join("absent.yaml"));
    let result = EngineConfig::load();
    std::env::remove_var(CONFIG_ENV);

    assert!(matches!(result, Err(LikenessError::Configuration { .. })));
  }

  #[test]
  #[serial]
  fn test_load_rejects_invalid_values_from_file() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("bad.yaml");
    std::fs::write(&config_path, "image_weight: 2.0\n").unwrap();

    std::env::set_var(CONFIG_ENV, &config_path);
    let result = EngineConfig::load();
    std::env::remove_var(CONFIG_ENV);

    assert!(matches!(result, Err(LikenessError::Configuration { .. })));
  }

  #[test]
  #[serial]
  fn test_default_data_dir_honors_home_env() {
    std::env::set_var(HOME_ENV, "/tmp/likeness-home");
    let dir = default_data_dir();
    std::env::remove_var(HOME_ENV);

    assert_eq!(dir, PathBuf::from("/tmp/likeness-home"));
  }
}
