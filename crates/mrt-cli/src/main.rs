use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use mrt_core::{CandidateItem, SourceType};
use mrt_storage::PgDedupStore;
use mrt_sync::{
    build_pipeline, build_scheduler, load_tracker_config, open_store, report_markdown,
    schedule_groups, write_run_reports, GroupRunner, ReleaseClassifier, RunOutcome,
    RuntimeSettings, SourceFilter, StoreBackend,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mrt-cli")]
#[command(about = "Model release tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once and write a report.
    Run {
        /// Restrict the run to these source types (repeatable).
        #[arg(long = "source-type")]
        source_types: Vec<SourceType>,
    },
    /// Run once, then keep running on the configured intervals until Ctrl-C.
    Watch,
    /// Drop dedup records first seen more than N days ago.
    Prune {
        #[arg(long)]
        older_than_days: i64,
    },
    /// Score a piece of text with the configured classifier.
    Classify {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        body: String,
    },
    /// Print a digest of the most recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Apply the Postgres dedup store migrations.
    Migrate,
}

const DEFAULT_LOG_FILTER: &str = "mrt=info";

/// `RUST_LOG` wins when it parses; otherwise only the tracker's own info logs.
fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .filter(|spec| !spec.trim().is_empty())
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn init_tracing() {
    let filter = log_filter(std::env::var("RUST_LOG").ok().as_deref());
    let json = std::env::var("MRT_LOG_JSON").map(|v| v == "1").unwrap_or(false);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_outcome(outcome: &RunOutcome) {
    let s = outcome.summary;
    println!(
        "run complete: run_id={} pairs={} new={} duplicates={} not_release={} malformed={} failed_pairs={}",
        outcome.run_id, s.pairs, s.new_events, s.duplicates, s.not_release, s.malformed_items, s.failed_pairs
    );
    for failure in &outcome.failures {
        println!("  failed {}: {}", failure.pair, failure.cause);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = RuntimeSettings::from_env();

    match cli.command.unwrap_or(Commands::Run { source_types: Vec::new() }) {
        Commands::Run { source_types } => {
            let config = load_tracker_config(&settings)?;
            let pipeline = build_pipeline(&settings, config).await?;
            let filter = if source_types.is_empty() {
                SourceFilter::all()
            } else {
                SourceFilter::only(source_types)
            };
            let outcome = pipeline.run(&filter).await;
            let dir = write_run_reports(&settings.reports_dir, &outcome).await?;
            print_outcome(&outcome);
            println!("reports: {}", dir.display());
        }
        Commands::Watch => {
            let config = load_tracker_config(&settings)?;
            let groups = schedule_groups(&config.schedule, &config.configured_source_types());
            let pipeline = Arc::new(build_pipeline(&settings, config).await?);
            let runners = groups
                .into_iter()
                .map(|group| {
                    Arc::new(GroupRunner::new(
                        pipeline.clone(),
                        group,
                        Some(settings.reports_dir.clone()),
                    ))
                })
                .collect::<Vec<_>>();

            for runner in &runners {
                if let Some(outcome) = runner.tick().await {
                    print_outcome(&outcome);
                }
            }

            let mut sched = build_scheduler(runners).await?;
            sched.start().await.context("starting scheduler")?;
            info!("watching; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Prune { older_than_days } => {
            if older_than_days < settings.retention_floor_days {
                bail!(
                    "refusing to prune records younger than the {}-day retention floor",
                    settings.retention_floor_days
                );
            }
            let store = open_store(&settings).await?;
            let cutoff = Utc::now() - Duration::days(older_than_days);
            let removed = store.prune(cutoff).await.context("pruning dedup store")?;
            let remaining = store.count().await.context("counting dedup records")?;
            println!("pruned {removed} record(s) first seen before {cutoff}; {remaining} remain");
        }
        Commands::Classify { title, body } => {
            let config = load_tracker_config(&settings)?;
            let classifier = ReleaseClassifier::new(&config.classifier)?;
            let title = mrt_adapters::clean_text(&title);
            let body = mrt_adapters::clean_text(&body);
            let item = CandidateItem {
                source_type: SourceType::Website,
                company: "cli".to_string(),
                model_size: mrt_adapters::extract_model_size(&format!("{title} {body}")),
                title,
                body,
                url: String::new(),
                published_at: None,
                raw_ref: String::new(),
            };
            let result = classifier.classify(&item);
            println!(
                "is_release={} confidence={:.2} threshold={:.2} matched=[{}]",
                result.is_release,
                result.confidence,
                classifier.threshold(),
                result.matched_keywords.join(", ")
            );
            if let Some(size) = item.model_size {
                println!("model_size={size}");
            }
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(&settings.reports_dir, runs)?);
        }
        Commands::Migrate => {
            let (StoreBackend::Postgres, Some(url)) = (settings.store_backend, &settings.database_url) else {
                bail!("migrate needs MRT_STORE=postgres and DATABASE_URL");
            };
            let store = PgDedupStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
