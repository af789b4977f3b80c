//! Microdata Ingest - survey extract loader

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use microdata_common::logging::{init_logging, LogConfig, LogLevel};
use microdata_ingest::connection::Session;
use microdata_ingest::{
    run_ingestion, CatalogSource, FileStatus, IngestConfig, PartitionPlan, RunOptions,
    RunSummary, SchemaCatalog, SurveyKey,
};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "microdata-ingest")]
#[command(author, version, about = "Schema-driven survey microdata loader")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest delimited files into the storage table
    Run(RunArgs),

    /// List the levels of a survey's schema catalog
    InspectSchema {
        #[command(flatten)]
        catalog: CatalogArgs,
    },
}

#[derive(Args, Debug)]
struct CatalogArgs {
    /// Survey name
    #[arg(long)]
    survey: Option<String>,

    /// Survey year
    #[arg(long)]
    year: Option<i32>,

    /// Read the catalog from a JSON snapshot instead of the database
    #[arg(long, conflicts_with_all = ["survey", "year"])]
    snapshot: Option<PathBuf>,
}

impl CatalogArgs {
    fn source(&self, config: &mut IngestConfig) -> CatalogSource {
        if let Some(name) = &self.survey {
            config.survey.name = name.clone();
        }
        if let Some(year) = self.year {
            config.survey.year = year;
        }
        match &self.snapshot {
            Some(path) => CatalogSource::Snapshot(path.clone()),
            None => CatalogSource::Database(config.survey.clone()),
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Input files or directories of *.csv files
    #[arg(short, long, required = true, num_args = 1..)]
    input: Vec<PathBuf>,

    /// TOML file mapping file names to levels and read options
    #[arg(short, long)]
    plan: Option<PathBuf>,

    /// Level for files the plan does not map
    #[arg(short, long)]
    level: Option<String>,

    #[command(flatten)]
    catalog: CatalogArgs,

    /// Rows read per chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Commit after this many chunks
    #[arg(long)]
    commit_every: Option<u64>,

    /// Chunks larger than this use COPY
    #[arg(long)]
    copy_threshold: Option<usize>,

    /// Always use batched INSERT
    #[arg(long)]
    no_copy: bool,

    /// Transform every file without writing
    #[arg(long)]
    dry_run: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply_overrides(&self, config: &mut IngestConfig) {
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(commit_every) = self.commit_every {
            config.commit_every = commit_every;
        }
        if let Some(threshold) = self.copy_threshold {
            config.loader.copy_threshold = threshold;
        }
        if self.no_copy {
            config.loader.use_copy = false;
        }
        if let Some(level) = &self.level {
            config.default_level = Some(level.clone());
        }
    }

    fn plan(&self, config: &IngestConfig) -> Result<PartitionPlan> {
        let mut plan = match &self.plan {
            Some(path) => PartitionPlan::from_toml_file(path)?,
            None => PartitionPlan::default(),
        };
        // An explicit --level wins over the plan's default.
        if self.level.is_some() || plan.default_level.is_none() {
            plan.default_level = config.default_level.clone();
        }
        Ok(plan)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("microdata-ingest")
        .build();

    // Merge with environment variables (they take precedence)
    let log_config = log_config.merge_env()?;

    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env().context("Invalid ingestion configuration")?;

    match cli.command {
        Command::Run(args) => {
            args.apply_overrides(&mut config);
            let catalog = args.catalog.source(&mut config);
            let plan = args.plan(&config)?;

            let options = RunOptions {
                inputs: args.input.clone(),
                plan,
                catalog,
                dry_run: args.dry_run,
                progress: Default::default(),
            };

            let summary = run_ingestion(&config, options).await?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary, args.dry_run);
            }
        },
        Command::InspectSchema { catalog } => {
            let catalog = match catalog.source(&mut config) {
                CatalogSource::Snapshot(path) => SchemaCatalog::from_snapshot_file(path)?,
                CatalogSource::Database(survey) => load_catalog(&config, &survey).await?,
            };
            print_catalog(&catalog);
        },
    }

    info!("Done");
    Ok(())
}

async fn load_catalog(config: &IngestConfig, survey: &SurveyKey) -> Result<SchemaCatalog> {
    let session = Session::open(config).await?;
    let catalog = SchemaCatalog::load(session.pool(), survey).await;
    session.close().await;
    Ok(catalog?)
}

fn print_catalog(catalog: &SchemaCatalog) {
    println!("Survey id: {}", catalog.survey_id());
    println!("{:<6} {:<32} {:>9} {:>10}", "ID", "LEVEL", "VARIABLES", "COMMON IDS");
    for level in catalog.levels() {
        println!(
            "{:<6} {:<32} {:>9} {:>10}",
            level.level_id,
            level.level_name,
            level.variables.len(),
            level.common_identifiers.len()
        );
    }
}

fn print_summary(summary: &RunSummary, dry_run: bool) {
    if dry_run {
        println!("Dry run: nothing was written");
    }
    println!(
        "{:<32} {:<20} {:>10} {:>10} {:>8} {:>8}  STATUS",
        "FILE", "LEVEL", "PROCESSED", "INSERTED", "SKIPPED", "DEGRADED"
    );
    for file in &summary.files {
        let name = file
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let status = match &file.status {
            FileStatus::Completed => "completed".to_string(),
            FileStatus::Aborted { reason } => format!("aborted: {}", reason),
        };
        println!(
            "{:<32} {:<20} {:>10} {:>10} {:>8} {:>8}  {}",
            name, file.level, file.processed, file.inserted, file.skipped, file.degraded, status
        );
    }
    println!(
        "{:<32} {:<20} {:>10} {:>10} {:>8} {:>8}",
        "TOTAL",
        "",
        summary.total_processed,
        summary.total_inserted,
        summary.total_skipped,
        summary.total_degraded
    );
    println!(
        "Elapsed: {:.1}s ({})",
        summary.elapsed_secs,
        if summary.is_clean() {
            "clean"
        } else {
            "completed with skips or aborts"
        }
    );
}
