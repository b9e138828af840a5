use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use baler::app;
use baler::config::Settings;
use baler::indexer::cursor::CursorFile;
use baler::indexer::scheduler::NightlyScheduler;
use baler::rag::filter::{MetadataFilter, TextField};
use baler::rag::session::DiscoverySession;

#[derive(Parser, Debug)]
#[command(name = "baler")]
#[command(about = "Album recommendations from music review text")]
struct Cli {
    /// Settings file (defaults to ./baler.toml when present)
    #[arg(short, long, env = "BALER_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recommend albums for a mood and print them as JSON
    Recommend {
        query: String,

        /// Albums per page
        #[arg(short, long, default_value_t = 5)]
        k: usize,

        /// Pages to fetch; later pages never repeat earlier albums
        #[arg(long, default_value_t = 1)]
        pages: usize,

        /// Only albums by this artist
        #[arg(long)]
        artist: Option<String>,

        /// Earliest publication date (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Latest publication date (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Ask the narrator for a write-up
        #[arg(long)]
        narrate: bool,
    },
    /// Ingest new reviews on the configured interval
    Nightly {
        /// Run once and exit
        #[arg(long)]
        once: bool,
    },
}

fn build_filter(artist: Option<String>, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Option<MetadataFilter> {
    let mut filter = artist.map(|a| MetadataFilter::equals(TextField::Artist, a));
    if from.is_some() || to.is_some() {
        let range = MetadataFilter::published_within(from, to);
        filter = Some(match filter {
            Some(f) => f.and(range),
            None => range,
        });
    }
    filter
}

#[tokio::main]
async fn main() -> Result<()> {
    baler::logger::init();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;

    match cli.command {
        Command::Recommend {
            query,
            k,
            pages,
            artist,
            from,
            to,
            narrate,
        } => {
            let engine = app::build_engine(&settings).await?;
            let mut session = DiscoverySession::new(query, k);
            if let Some(filter) = build_filter(artist, from, to) {
                session = session.with_filter(filter);
            }
            if narrate {
                session = session.with_narrative(settings.narrator.style);
            }

            for page in 1..=pages.max(1) {
                let recs = session.next_page(&engine).await?;
                if recs.albums.is_empty() && page > 1 {
                    break;
                }
                println!("{}", serde_json::to_string_pretty(&recs)?);
            }
        }
        Command::Nightly { once } => {
            let pipeline = app::build_pipeline(&settings).await?;
            let scheduler = Arc::new(NightlyScheduler::new(
                Arc::new(pipeline),
                CursorFile::new(&settings.ingest.cursor_path),
                Duration::from_secs(settings.ingest.interval_hours.max(1) * 3600),
                Duration::from_secs(settings.ingest.initial_delay_secs),
            ));

            if once {
                match scheduler.run_once().await? {
                    Some(report) => {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                        if !report.is_done() {
                            anyhow::bail!("ingestion failed: {}", report.error.unwrap_or_default());
                        }
                    }
                    None => anyhow::bail!("another ingestion run is in progress"),
                }
                return Ok(());
            }

            tracing::info!(
                interval_hours = settings.ingest.interval_hours,
                archive = %settings.ingest.archive_dir.display(),
                "nightly ingestion scheduled"
            );
            let handle = scheduler.start();
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            handle.abort();
        }
    }

    Ok(())
}
