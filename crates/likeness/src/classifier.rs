//! Neighbor votes to ranked class predictions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::catalog::NeighborHit;

/// Averages closer than this count as equal when ranking classes
pub const TIE_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassPrediction {
  pub class_label: String,
  /// Number of hits carrying this label
  pub vote_count: usize,
  /// Mean similarity of those hits
  pub avg_confidence: f32,
  /// 1-based position among the predictions
  pub rank: usize,
}

impl ClassPrediction {
  pub fn avg_confidence_percent(&self) -> f32 {
    self.avg_confidence * 100.0
  }
}

/// Which inputs produced the query vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
  Image,
  Text,
  Hybrid,
}

impl std::fmt::Display for QueryKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      QueryKind::Image => "image",
      QueryKind::Text => "text",
      QueryKind::Hybrid => "hybrid",
    };
    write!(f, "{name}")
  }
}

/// Everything one search produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
  pub predictions: Vec<ClassPrediction>,
  /// The ungrouped hits, in rank order
  pub detailed_results: Vec<NeighborHit>,
  pub query_kind: QueryKind,
  pub inference_time_ms: f64,
}

impl SearchOutcome {
  pub fn top_prediction(&self) -> Option<&ClassPrediction> {
    self.predictions.first()
  }

  /// Hits of one class in rank order
  pub fn references_for<'a>(&'a self, class_label: &'a str) -> impl Iterator<Item = &'a NeighborHit> {
    self.detailed_results.iter().filter(move |hit| hit.class_label == class_label)
  }
}

struct Tally<'a> {
  label: &'a str,
  votes: usize,
  similarity_sum: f64,
}

/// Group hits by label and rank the groups.
///
/// Order is by mean similarity, then vote count, then the position at which
/// the label first appears in `hits`.
pub fn aggregate(hits: &[NeighborHit]) -> Vec<ClassPrediction> {
  let mut tallies: Vec<Tally> = Vec::new();
  let mut positions: HashMap<&str, usize> = HashMap::new();

  for hit in hits {
    let index = *positions.entry(hit.class_label.as_str()).or_insert_with(|| {
      tallies.push(Tally { label: &hit.class_label, votes: 0, similarity_sum: 0.0 });
      tallies.len() - 1
    });
    let tally = &mut tallies[index];
    tally.votes += 1;
    tally.similarity_sum += f64::from(hit.similarity);
  }

  // Quantizing the mean gives a total order where near-equal averages tie.
  // `sort_by_key` is stable, so first-seen order survives as the last tie-break.
  let mut ranked: Vec<(i64, &Tally)> = tallies
    .iter()
    .map(|tally| {
      let mean = tally.similarity_sum / tally.votes as f64;
      ((mean / TIE_TOLERANCE).round() as i64, tally)
    })
    .collect();
  ranked.sort_by_key(|(bucket, tally)| (std::cmp::Reverse(*bucket), std::cmp::Reverse(tally.votes)));

  ranked
    .into_iter()
    .enumerate()
    .map(|(i, (_, tally))| ClassPrediction {
      class_label: tally.label.to_string(),
      vote_count: tally.votes,
      avg_confidence: (tally.similarity_sum / tally.votes as f64) as f32,
      rank: i + 1,
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;

  fn hits(raw: &[(&str, f32)]) -> Vec<NeighborHit> {
    raw
      .iter()
      .enumerate()
      .map(|(i, (label, similarity))| NeighborHit {
        rank: i + 1,
        ordinal: i,
        similarity: *similarity,
        confidence: similarity * 100.0,
        class_label: label.to_string(),
        source_path: PathBuf::from(format!("{label}/{i}.png")),
      })
      .collect()
  }

  #[test]
  fn test_equal_average_prefers_more_votes() {
    let predictions = aggregate(&hits(&[("A", 0.90), ("B", 0.80), ("A", 0.70)]));

    assert_eq!(predictions.len(), 2);
    assert_eq!(predictions[0].class_label, "A");
    assert_eq!(predictions[0].vote_count, 2);
    assert!((predictions[0].avg_confidence - 0.80).abs() < 1e-6);
    assert_eq!(predictions[0].rank, 1);
    assert_eq!(predictions[1].class_label, "B");
    assert_eq!(predictions[1].vote_count, 1);
    assert_eq!(predictions[1].rank, 2);
  }

  #[test]
  fn test_higher_average_wins_over_votes() {
    let predictions = aggregate(&hits(&[("A", 0.60), ("B", 0.95), ("A", 0.60), ("A", 0.60)]));
    assert_eq!(predictions[0].class_label, "B");
    assert_eq!(predictions[1].class_label, "A");
  }

  #[test]
  fn test_full_tie_keeps_first_seen_order() {
    let predictions = aggregate(&hits(&[("B", 0.5), ("A", 0.5), ("C", 0.5)]));
    let labels: Vec<&str> = predictions.iter().map(|p| p.class_label.as_str()).collect();
    assert_eq!(labels, vec!["B", "A", "C"]);
  }

  #[test]
  fn test_empty_hits_give_no_predictions() {
    assert!(aggregate(&[]).is_empty());
  }

  #[test]
  fn test_vote_counts_cover_every_hit() {
    let input = hits(&[("A", 0.9), ("B", 0.8), ("C", 0.7), ("A", 0.6), ("B", 0.5)]);
    let predictions = aggregate(&input);
    assert_eq!(predictions.iter().map(|p| p.vote_count).sum::<usize>(), input.len());
  }

  #[test]
  fn test_references_for_filters_by_label() {
    let detailed_results = hits(&[("A", 0.9), ("B", 0.8), ("A", 0.7)]);
    let outcome = SearchOutcome {
      predictions: aggregate(&detailed_results),
      detailed_results,
      query_kind: QueryKind::Image,
      inference_time_ms: 1.0,
    };

    let ranks: Vec<usize> = outcome.references_for("A").map(|h| h.rank).collect();
    assert_eq!(ranks, vec![1, 3]);
    assert_eq!(outcome.top_prediction().map(|p| p.class_label.as_str()), Some("A"));
  }
}
