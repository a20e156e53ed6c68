//! Likeness - Reference-Image Similarity Classification
//!
//! Identifies a photographed object by nearest-neighbor lookup against a
//! catalog of reference renderings, with optional text descriptions fused into
//! the query, and rebuilds that catalog in the background while searches go on.

pub mod catalog;
pub mod catalog_builder;
pub mod classifier;
pub mod config;
pub mod display;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod index;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod orchestrator;
pub mod session;

pub use catalog::{Catalog, CatalogEntry, CatalogStatistics, IndexedCatalog, NeighborHit};
pub use catalog_builder::{BuildEvent, BuilderOptions, CatalogBuilder};
pub use classifier::{ClassPrediction, QueryKind, SearchOutcome};
pub use config::EngineConfig;
pub use embedding::{Embedder, Embedding, StaticEmbedder};
pub use engine::Engine;
pub use error::{ExtractionError, LikenessError, Result};
#[cfg(feature = "onnx")]
pub use onnx::OnnxClipEmbedder;
pub use session::{BuildPhase, BuildSessionSnapshot, BuildState};
