//! Ingestion driver
//!
//! Reads partitions in chunks, transforms rows, hands surviving records to a
//! [`ChunkSink`] and commits at a fixed cadence. A file-scoped failure rolls
//! back that file's uncommitted chunks and the run moves on; a run-scoped
//! failure ends the run.

use crate::config::IngestConfig;
use crate::connection::Session;
use crate::error::{IngestError, Result};
use crate::loader::{ChunkLoader, ChunkSink, DryRunSink, PgChunkSink};
use crate::partition::PartitionReader;
use crate::plan::{discover_inputs, Partition, PartitionPlan};
use crate::schema::{LevelSchema, SchemaCatalog, SurveyKey};
use crate::summary::{FileStatus, FileSummary, ProgressHandle, RunSummary};
use crate::transform::RecordTransformer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Where the schema catalog comes from
#[derive(Debug, Clone)]
pub enum CatalogSource {
    /// `surveys` / `survey_levels` tables of the target database
    Database(SurveyKey),
    /// A JSON snapshot file
    Snapshot(PathBuf),
}

/// Everything a run needs besides the configuration
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub inputs: Vec<PathBuf>,
    pub plan: PartitionPlan,
    pub catalog: CatalogSource,
    /// Transform everything but write nothing
    pub dry_run: bool,
    pub progress: ProgressHandle,
}

/// Counters of chunks applied since the last commit
#[derive(Debug, Default)]
struct Pending {
    inserted: u64,
    chunks: u64,
}

/// Drives partitions through transformer and sink
pub struct IngestionDriver<S: ChunkSink> {
    catalog: SchemaCatalog,
    plan: PartitionPlan,
    chunk_size: usize,
    commit_every: u64,
    sink: S,
    progress: ProgressHandle,
}

impl<S: ChunkSink> IngestionDriver<S> {
    pub fn new(config: &IngestConfig, catalog: SchemaCatalog, plan: PartitionPlan, sink: S) -> Self {
        Self {
            catalog,
            plan,
            chunk_size: config.chunk_size.max(1),
            commit_every: config.commit_every.max(1),
            sink,
            progress: ProgressHandle::new(),
        }
    }

    /// Report progress through an existing handle.
    pub fn with_progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> ProgressHandle {
        self.progress.clone()
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Resolve every file's level before reading any of them.
    fn resolve(&self, files: &[PathBuf]) -> Result<Vec<(Partition, Arc<LevelSchema>)>> {
        files
            .iter()
            .map(|path| {
                let partition = self.plan.resolve(path)?;
                let schema = self.catalog.level(&partition.level)?;
                Ok((partition, schema))
            })
            .collect()
    }

    /// Ingest `files` in order.
    #[tracing::instrument(skip_all, fields(survey_id = self.catalog.survey_id(), files = files.len()))]
    pub async fn run(&mut self, files: &[PathBuf]) -> Result<RunSummary> {
        let started = Instant::now();
        let partitions = self.resolve(files)?;
        let mut summary = RunSummary::new(self.catalog.survey_id());

        info!(files = partitions.len(), chunk_size = self.chunk_size, commit_every = self.commit_every, "Starting ingestion run");

        for (partition, schema) in &partitions {
            let name = partition.file_name();
            self.progress.start_file(&name);

            let mut file = FileSummary::new(partition.path.clone(), schema.level_name.clone());
            let mut pending = Pending::default();

            if let Err(err) = self.ingest_file(partition, schema, &mut file, &mut pending).await {
                if err.is_run_fatal() {
                    error!(file = %name, error = %err, "Run aborted");
                    if let Err(rollback_err) = self.sink.rollback().await {
                        warn!(error = %rollback_err, "Rollback after fatal error failed");
                    }
                    return Err(err);
                }

                error!(
                    file = %name,
                    error = %err,
                    discarded = pending.inserted,
                    "File aborted, rolling back uncommitted chunks"
                );
                self.sink.rollback().await?;
                self.progress.retract_inserted(pending.inserted);
                file.status = FileStatus::Aborted {
                    reason: err.to_string(),
                };
            }

            self.progress.finish_file();
            summary.add_file(file);
        }

        summary.elapsed_secs = started.elapsed().as_secs_f64();

        info!(
            processed = summary.total_processed,
            inserted = summary.total_inserted,
            skipped = summary.total_skipped,
            degraded = summary.total_degraded,
            aborted = summary.aborted_files(),
            elapsed_secs = summary.elapsed_secs,
            "Ingestion run finished"
        );

        Ok(summary)
    }

    #[tracing::instrument(skip_all, fields(file = %partition.file_name(), level = %partition.level))]
    async fn ingest_file(
        &mut self,
        partition: &Partition,
        schema: &LevelSchema,
        file: &mut FileSummary,
        pending: &mut Pending,
    ) -> Result<()> {
        let started = Instant::now();

        // Reject a misaligned file before any of its chunks are written.
        let rows = PartitionReader::open(partition, schema, self.chunk_size)?.scan()?;
        debug!(rows, "Partition aligned with schema");

        let mut reader = PartitionReader::open(partition, schema, self.chunk_size)?;
        let transformer = RecordTransformer::new(schema, self.catalog.survey_id(), reader.layout());
        let mut since_commit = 0u64;

        while let Some(rows) = reader.next_chunk()? {
            let chunk_started = Instant::now();
            let mut records = Vec::with_capacity(rows.len());
            let mut skipped = 0u64;

            for row in &rows {
                match transformer.transform(row) {
                    Ok(transformed) => {
                        file.degraded += transformed.degraded as u64;
                        records.push(transformed.record);
                    },
                    Err(rejection) => {
                        skipped += 1;
                        debug!(
                            line = row.line(),
                            expected = ?rejection.expected,
                            found = ?rejection.found,
                            "Row skipped: incomplete identifier"
                        );
                    },
                }
            }

            file.processed += rows.len() as u64;
            file.skipped += skipped;
            self.progress.record_rows(rows.len() as u64, skipped);

            if records.is_empty() {
                continue;
            }

            let inserted = self.sink.apply(&records).await?;
            pending.inserted += inserted;
            pending.chunks += 1;
            self.progress.record_inserted(inserted);
            since_commit += 1;

            let secs = chunk_started.elapsed().as_secs_f64();
            debug!(
                records = records.len(),
                inserted,
                skipped,
                records_per_sec = if secs > 0.0 { (rows.len() as f64 / secs) as u64 } else { 0 },
                "Chunk done"
            );

            if since_commit >= self.commit_every {
                self.commit(file, pending).await?;
                since_commit = 0;
            }
        }

        self.commit(file, pending).await?;

        info!(
            processed = file.processed,
            inserted = file.inserted,
            skipped = file.skipped,
            degraded = file.degraded,
            chunks = file.chunks,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "File complete"
        );

        Ok(())
    }

    async fn commit(&mut self, file: &mut FileSummary, pending: &mut Pending) -> Result<()> {
        self.sink.commit().await?;
        if pending.chunks > 0 {
            debug!(chunks = pending.chunks, inserted = pending.inserted, "Committed");
        }
        file.inserted += pending.inserted;
        file.chunks += pending.chunks;
        *pending = Pending::default();
        Ok(())
    }
}

/// Run a complete ingestion: discover inputs, open the session when one is
/// needed, load the catalog, drive every file, and close the session on
/// every exit path.
pub async fn run_ingestion(config: &IngestConfig, options: RunOptions) -> Result<RunSummary> {
    config.validate()?;
    let files = discover_inputs(&options.inputs)?;

    let needs_session = !options.dry_run || matches!(options.catalog, CatalogSource::Database(_));
    let session = if needs_session {
        Some(Session::open(config).await?)
    } else {
        None
    };

    let result = run_with_session(config, options, &files, session.as_ref()).await;

    if let Some(session) = session {
        session.close().await;
    }

    result
}

async fn run_with_session(
    config: &IngestConfig,
    options: RunOptions,
    files: &[PathBuf],
    session: Option<&Session>,
) -> Result<RunSummary> {
    let catalog = match (&options.catalog, session) {
        (CatalogSource::Snapshot(path), _) => SchemaCatalog::from_snapshot_file(path)?,
        (CatalogSource::Database(survey), Some(session)) => {
            SchemaCatalog::load(session.pool(), survey).await?
        },
        (CatalogSource::Database(_), None) => {
            return Err(IngestError::Config(
                "A database catalog requires a session".into(),
            ))
        },
    };

    info!(survey_id = catalog.survey_id(), levels = catalog.len(), dry_run = options.dry_run, "Schema catalog loaded");

    match session {
        Some(session) if !options.dry_run => {
            let loader = ChunkLoader::new(config.loader.clone());
            let sink = PgChunkSink::new(session.pool().clone(), loader);
            let mut driver = IngestionDriver::new(config, catalog, options.plan, sink)
                .with_progress(options.progress);
            driver.run(files).await
        },
        _ => {
            let mut driver = IngestionDriver::new(config, catalog, options.plan, DryRunSink::new())
                .with_progress(options.progress);
            driver.run(files).await
        },
    }
}
