use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use likeness::display;
use likeness::{BuildSessionSnapshot, BuildState, Engine, EngineConfig, OnnxClipEmbedder};

#[derive(Parser)]
#[command(name = "likeness")]
#[command(about = "Likeness - identify objects by similarity to reference renderings")]
#[command(version)]
struct Cli {
  /// Configuration file (overrides LIKENESS_CONFIG and the default locations)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Data directory holding the catalog snapshot and models
  #[arg(long, global = true, env = "LIKENESS_HOME")]
  data_dir: Option<PathBuf>,

  /// Enable verbose logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Suppress progress and status lines on stderr
  #[arg(short, long, global = true)]
  quiet: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Rebuild the reference catalog and wait for it to finish
  Build {
    /// Directory of class subdirectories (defaults to the configured catalog_root)
    #[arg(long)]
    root: Option<PathBuf>,
    /// Who is asking; a second build from the same owner replaces the first
    #[arg(long, default_value = "cli")]
    owner: String,
  },
  /// Classify a query against the serving catalog
  Search {
    #[command(subcommand)]
    query: SearchQuery,
    /// Number of nearest references to consult
    #[arg(short, long, global = true)]
    k: Option<usize>,
    /// Print the outcome as JSON
    #[arg(long, global = true)]
    json: bool,
  },
  /// Show statistics for the serving catalog
  Stats {
    /// Print statistics as JSON
    #[arg(long)]
    json: bool,
  },
}

#[derive(Subcommand)]
enum SearchQuery {
  /// Search by a photograph
  Image { path: PathBuf },
  /// Search by a text description
  Text {
    #[arg(required = true)]
    words: Vec<String>,
  },
  /// Search by a photograph and a description together
  Hybrid {
    #[arg(long)]
    image: Option<PathBuf>,
    #[arg(long)]
    text: Option<String>,
    /// Share of the image in the fused query, 0 to 1
    #[arg(long)]
    weight: Option<f32>,
  },
}

impl Cli {
  /// Console lines are dropped when asked, and whenever stdout carries JSON
  fn console_quiet(&self) -> bool {
    self.quiet
      || matches!(self.command, Commands::Search { json: true, .. } | Commands::Stats { json: true })
  }
}

#[cfg(not(tarpaulin_include))]
fn init_tracing(verbose: bool) {
  let filter = if verbose {
    EnvFilter::new("likeness=debug,ort=warn,info")
  } else {
    EnvFilter::try_from_default_env()
      .unwrap_or_else(|_| EnvFilter::new("likeness=info,ort=error,warn"))
  };
  tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();
}

#[cfg(not(tarpaulin_include))]
fn load_config(cli: &Cli) -> Result<EngineConfig> {
  let mut config = match &cli.config {
    Some(path) => EngineConfig::from_file(path)?,
    None => EngineConfig::load()?,
  };
  if let Some(data_dir) = &cli.data_dir {
    config.data_dir = data_dir.clone();
  }
  if let Commands::Build { root: Some(root), .. } = &cli.command {
    config.catalog_root = root.clone();
  }
  config.validate()?;
  Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.verbose);
  bentley::set_quiet(cli.console_quiet());

  let config = load_config(&cli)?;
  let embedder = OnnxClipEmbedder::from_config(&config).context("Failed to load embedding models")?;
  let engine = Engine::open(embedder, config).context("Failed to open the catalog")?;

  match cli.command {
    Commands::Build { owner, .. } => run_build(&engine, &owner).await,
    Commands::Search { query, k, json } => {
      let k = k.unwrap_or(engine.config().default_k);
      let outcome = match query {
        SearchQuery::Image { path } => engine.search_by_image(&path, k)?,
        SearchQuery::Text { words } => engine.search_by_text(&words.join(" "), k)?,
        SearchQuery::Hybrid { image, text, weight } => engine.search_hybrid(
          image.as_deref(),
          text.as_deref(),
          k,
          weight.unwrap_or(engine.config().image_weight),
        )?,
      };
      if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
      } else {
        display::print_outcome(&outcome);
      }
      Ok(())
    }
    Commands::Stats { json } => {
      let stats = engine.get_statistics()?;
      if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
      } else {
        display::print_statistics(&stats);
      }
      Ok(())
    }
  }
}

#[cfg(not(tarpaulin_include))]
async fn run_build(engine: &Engine<OnnxClipEmbedder>, owner: &str) -> Result<()> {
  bentley::info!(&format!("Building catalog from {}", engine.config().catalog_root.display()));
  let session_id = engine.request_rebuild(owner)?;

  let wait = engine.wait_for_build(session_id);
  tokio::pin!(wait);
  let mut ticker = tokio::time::interval(Duration::from_millis(500));
  let mut seen = 0usize;

  let status = loop {
    tokio::select! {
      result = &mut wait => {
        let status = result?;
        echo_new_lines(&status, &mut seen);
        break status;
      }
      _ = ticker.tick() => {
        if let Ok(status) = engine.get_build_status(session_id) {
          echo_new_lines(&status, &mut seen);
        }
      }
      _ = tokio::signal::ctrl_c() => {
        bentley::warn!("Interrupted, cancelling build");
        engine.cancel_rebuild(session_id)?;
      }
    }
  };

  display::print_build_status(&status);
  match status.state {
    BuildState::Completed => {
      bentley::success!("Catalog rebuilt");
      Ok(())
    }
    _ => anyhow::bail!("Build did not complete: {}", status.error.unwrap_or_default()),
  }
}

/// Print log lines that appeared since the last poll
#[cfg(not(tarpaulin_include))]
fn echo_new_lines(status: &BuildSessionSnapshot, seen: &mut usize) {
  let total = status.dropped_log_lines + status.log.len();
  let skip = seen.saturating_sub(status.dropped_log_lines);
  for line in status.log.iter().skip(skip) {
    bentley::info!(line);
  }
  *seen = total;
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("likeness").chain(args.iter().copied())).unwrap()
  }

  #[test]
  fn test_console_is_quiet_for_json_output() {
    assert!(parse(&["stats", "--json"]).console_quiet());
    assert!(parse(&["search", "text", "a", "ring", "--json"]).console_quiet());
    assert!(!parse(&["stats"]).console_quiet());
    assert!(!parse(&["build"]).console_quiet());
  }

  #[test]
  fn test_quiet_flag_applies_to_every_command() {
    assert!(parse(&["build", "--quiet"]).console_quiet());
    assert!(parse(&["-q", "search", "image", "photo.png"]).console_quiet());
  }
}
