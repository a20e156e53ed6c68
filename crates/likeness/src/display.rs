//! Terminal rendering for search results, statistics and build status

use colored::*;
use std::fmt::Write;

use crate::catalog::CatalogStatistics;
use crate::classifier::SearchOutcome;
use crate::session::{BuildSessionSnapshot, BuildState};

pub fn format_outcome(outcome: &SearchOutcome) -> String {
  let mut out = String::new();

  match outcome.top_prediction() {
    Some(top) => {
      let _ = writeln!(
        out,
        "{} {} ({:.1}%, {} of {} neighbors)",
        "Prediction:".bold(),
        top.class_label.green().bold(),
        top.avg_confidence_percent(),
        top.vote_count,
        outcome.detailed_results.len()
      );
    }
    None => {
      let _ = writeln!(out, "{}", "No prediction".yellow());
    }
  }

  for prediction in outcome.predictions.iter().skip(1) {
    let _ = writeln!(
      out,
      "  {}. {} ({:.1}%, {} votes)",
      prediction.rank,
      prediction.class_label.cyan(),
      prediction.avg_confidence_percent(),
      prediction.vote_count
    );
  }

  let _ = writeln!(out);
  let _ = writeln!(out, "{}", "Nearest references:".bold());
  for hit in &outcome.detailed_results {
    let _ = writeln!(
      out,
      "  {:>2}. {:<20} {:>6.2}%  {}",
      hit.rank,
      hit.class_label.cyan(),
      hit.confidence,
      hit.source_path.display().to_string().dimmed()
    );
  }

  let _ = write!(
    out,
    "{}",
    format!("{} search in {:.1} ms", outcome.query_kind, outcome.inference_time_ms).dimmed()
  );
  out
}

pub fn format_statistics(stats: &CatalogStatistics) -> String {
  let mut out = String::new();
  let _ = writeln!(out, "{} {}", "Entries:".bold(), stats.total_entries);
  let _ = writeln!(out, "{} {}", "Classes:".bold(), stats.total_classes);
  let _ = writeln!(out, "{} {}", "Dimension:".bold(), stats.dimension);
  let _ = writeln!(out, "{} {}", "Index:".bold(), stats.index_kind);
  let _ = writeln!(out, "{} {}", "Built:".bold(), stats.built_at.format("%Y-%m-%d %H:%M:%S UTC"));
  for (label, count) in &stats.per_class_counts {
    let _ = writeln!(out, "  {:<24} {count}", label.cyan());
  }
  out.trim_end().to_string()
}

pub fn format_build_status(status: &BuildSessionSnapshot) -> String {
  let state = match status.state {
    BuildState::Completed => status.state.to_string().green(),
    BuildState::Failed => status.state.to_string().red(),
    BuildState::Pending | BuildState::Running => status.state.to_string().yellow(),
  };

  let mut out = format!(
    "{} {} [{}] {}/{} ({:.1}%)",
    "Build".bold(),
    status.session_id,
    state,
    status.processed_count,
    status.total_count,
    status.progress_percent()
  );
  if let Some(phase) = status.phase {
    let _ = write!(out, " {phase}");
  }
  if let Some(entries) = status.entry_count {
    let _ = write!(out, ", {entries} entries");
  }
  if status.warning_count > 0 {
    let _ = write!(out, ", {} skipped", status.warning_count);
  }
  if let Some(error) = &status.error {
    let _ = write!(out, "\n{} {}", "Error:".red().bold(), error);
  }
  out
}

#[cfg(not(tarpaulin_include))]
pub fn print_outcome(outcome: &SearchOutcome) {
  println!("{}", format_outcome(outcome));
}

#[cfg(not(tarpaulin_include))]
pub fn print_statistics(stats: &CatalogStatistics) {
  println!("{}", format_statistics(stats));
}

#[cfg(not(tarpaulin_include))]
pub fn print_build_status(status: &BuildSessionSnapshot) {
  println!("{}", format_build_status(status));
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::catalog::NeighborHit;
  use crate::classifier::{aggregate, QueryKind};
  use chrono::Utc;
  use std::collections::BTreeMap;
  use std::path::PathBuf;
  use uuid::Uuid;

  fn plain() {
    colored::control::set_override(false);
  }

  #[test]
  fn test_outcome_shows_top_prediction_and_references() {
    plain();
    let detailed_results: Vec<NeighborHit> = [("ring", 0.9f32), ("gear", 0.5), ("ring", 0.8)]
      .iter()
      .enumerate()
      .map(|(i, (label, similarity))| NeighborHit {
        rank: i + 1,
        ordinal: i,
        similarity: *similarity,
        confidence: similarity * 100.0,
        class_label: label.to_string(),
        source_path: PathBuf::from(format!("dataset/{label}/{i}.png")),
      })
      .collect();
    let outcome = SearchOutcome {
      predictions: aggregate(&detailed_results),
      detailed_results,
      query_kind: QueryKind::Image,
      inference_time_ms: 12.5,
    };

    let text = format_outcome(&outcome);
    assert!(text.starts_with("Prediction: ring (85.0%, 2 of 3 neighbors)"));
    assert!(text.contains("2. gear"));
    assert!(text.contains("dataset/ring/2.png"));
    assert!(text.ends_with("image search in 12.5 ms"));
  }

  #[test]
  fn test_statistics_list_classes() {
    plain();
    let stats = CatalogStatistics {
      total_entries: 10,
      total_classes: 2,
      dimension: 512,
      per_class_counts: BTreeMap::from([("gear".to_string(), 5), ("ring".to_string(), 5)]),
      index_kind: "flat-inner-product".into(),
      built_at: Utc::now(),
    };

    let text = format_statistics(&stats);
    assert!(text.contains("Entries: 10"));
    assert!(text.contains("Dimension: 512"));
    assert!(text.contains("gear"));
  }

  #[test]
  fn test_build_status_includes_error() {
    plain();
    let status = BuildSessionSnapshot {
      session_id: Uuid::nil(),
      owner_id: "cli".into(),
      state: BuildState::Failed,
      phase: None,
      processed_count: 3,
      total_count: 4,
      warning_count: 1,
      entry_count: None,
      log: vec![],
      dropped_log_lines: 0,
      error: Some("cancelled".into()),
      start_time: Utc::now(),
      finished_at: None,
    };

    let text = format_build_status(&status);
    assert!(text.contains("[failed] 3/4 (75.0%)"));
    assert!(text.contains("1 skipped"));
    assert!(text.ends_with("Error: cancelled"));
  }
}
