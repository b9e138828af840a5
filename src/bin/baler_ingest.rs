use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use baler::app;
use baler::config::Settings;
use baler::indexer::cursor::{CursorFile, IngestCursor};
use baler::indexer::pipeline::{PipelineObserver, RunState};

#[derive(Parser, Debug)]
#[command(name = "baler-ingest")]
#[command(about = "Ingest archived reviews into the fragment index")]
struct Args {
    /// Settings file (defaults to ./baler.toml when present)
    #[arg(short, long, env = "BALER_CONFIG")]
    config: Option<PathBuf>,

    /// Archive directory of daily scrape files
    #[arg(short, long)]
    archive: Option<PathBuf>,

    /// Cursor file
    #[arg(long)]
    cursor: Option<PathBuf>,

    /// Ignore the saved cursor and consider every archived review
    #[arg(long)]
    full: bool,
}

struct ProgressObserver {
    bar: ProgressBar,
}

impl PipelineObserver for ProgressObserver {
    fn stage(&self, state: RunState) {
        self.bar.set_message(state.to_string());
        if matches!(state, RunState::Done | RunState::Failed) {
            self.bar.finish_with_message(state.to_string());
        }
    }

    fn documents(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn document_finished(&self, _source_id: &str, _succeeded: bool) {
        self.bar.inc(1);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    baler::logger::init();
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    if let Some(archive) = args.archive {
        settings.ingest.archive_dir = archive;
    }
    if let Some(cursor) = args.cursor {
        settings.ingest.cursor_path = cursor;
    }
    if !settings.ingest.archive_dir.exists() {
        anyhow::bail!("Archive directory does not exist: {}", settings.ingest.archive_dir.display());
    }

    println!("Initializing embedding model and index...");
    let pipeline = app::build_pipeline(&settings).await?;

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    let pipeline = pipeline.with_observer(Arc::new(ProgressObserver { bar }));

    let cursor_file = CursorFile::new(&settings.ingest.cursor_path);
    let cursor = if args.full {
        IngestCursor::default()
    } else {
        cursor_file.load().await?
    };

    println!("Scanning archive: {}", settings.ingest.archive_dir.display());
    let report = pipeline.run(cursor).await;
    if report.is_done() {
        cursor_file.save(&report.cursor).await?;
    }

    let stats = &report.stats;
    println!("\nIngestion {}!", report.state);
    println!("  Documents fetched:   {}", stats.fetched);
    println!("  Skipped (invalid):   {}", stats.skipped_invalid);
    println!("  Unchanged documents: {}", stats.unchanged_documents);
    println!("  Fragments embedded:  {}", stats.embedded);
    println!("  Fragments upserted:  {}", stats.upserted);
    println!("  Superseded removed:  {}", stats.superseded);
    println!("  Elapsed:             {}s", report.elapsed().num_seconds());
    match report.cursor.watermark {
        Some(w) => println!("  Watermark:           {}", w.to_rfc3339()),
        None => println!("  Watermark:           (none)"),
    }

    if !report.document_failures.is_empty() {
        println!("\nFailed documents:");
        for failure in &report.document_failures {
            println!("  [{}] {}: {}", failure.stage, failure.source_id, failure.reason);
        }
    }

    if let Some(error) = &report.error {
        if !report.pending_fragment_ids.is_empty() {
            println!("\n{} fragments were not written.", report.pending_fragment_ids.len());
        }
        anyhow::bail!("ingestion failed: {}", error);
    }
    Ok(())
}
