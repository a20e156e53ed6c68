//! Exact inner-product nearest-neighbor index
//!
//! A flat `N x D` matrix scored against the query in one matrix-vector product.
//! There is no approximate structure and no incremental update: replacing any
//! part of a catalog means building a new index from the whole thing.

use ndarray::{Array2, ArrayView1};
use std::cmp::Ordering;

use crate::embedding::Embedding;
use crate::error::{LikenessError, Result};

/// Name reported in statistics
pub const INDEX_KIND: &str = "flat-inner-product";

/// One scored row of the index
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredOrdinal {
  pub ordinal: usize,
  pub similarity: f32,
}

#[derive(Debug, Clone)]
pub struct FlatIndex {
  matrix: Array2<f32>,
}

impl FlatIndex {
  /// Build an index over unit vectors. Vectors are not renormalized here.
  pub fn build(vectors: &[Embedding]) -> Result<Self> {
    let dimension = match vectors.first() {
      Some(first) => first.dimension(),
      None => return Err(LikenessError::configuration("cannot build an index from zero vectors")),
    };

    let mut data = Vec::with_capacity(vectors.len() * dimension);
    for vector in vectors {
      if vector.dimension() != dimension {
        return Err(LikenessError::dimension_mismatch(dimension, vector.dimension()));
      }
      data.extend_from_slice(vector.as_slice());
    }

    let matrix = Array2::from_shape_vec((vectors.len(), dimension), data)
      .map_err(|e| LikenessError::configuration(format!("index matrix shape: {e}")))?;

    Ok(Self { matrix })
  }

  pub fn len(&self) -> usize {
    self.matrix.nrows()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn dimension(&self) -> usize {
    self.matrix.ncols()
  }

  /// The top `k` rows by inner product with `query`, most similar first.
  ///
  /// Returns exactly `min(k, len)` results. Equal similarities keep ascending
  /// ordinal order so repeated searches are reproducible.
  pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredOrdinal>> {
    if k == 0 {
      return Err(LikenessError::configuration("k must be at least 1"));
    }
    if query.len() != self.dimension() {
      return Err(LikenessError::dimension_mismatch(self.dimension(), query.len()));
    }

    let scores = self.matrix.dot(&ArrayView1::from(query));
    let mut scored: Vec<ScoredOrdinal> = scores
      .iter()
      .enumerate()
      .map(|(ordinal, &similarity)| ScoredOrdinal { ordinal, similarity })
      .collect();

    let take = k.min(scored.len());
    if take < scored.len() {
      scored.select_nth_unstable_by(take - 1, by_similarity_desc);
      scored.truncate(take);
    }
    scored.sort_by(by_similarity_desc);

    Ok(scored)
  }
}

/// Higher similarity first, then lower ordinal. NaN ranks below every number.
fn by_similarity_desc(a: &ScoredOrdinal, b: &ScoredOrdinal) -> Ordering {
  rank_key(b.similarity).total_cmp(&rank_key(a.similarity)).then_with(|| a.ordinal.cmp(&b.ordinal))
}

fn rank_key(similarity: f32) -> f32 {
  if similarity.is_nan() {
    f32::NEG_INFINITY
  } else {
    similarity
  }
}
