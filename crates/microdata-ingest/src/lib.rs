//! Microdata Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Schema-driven loading of survey microdata extracts into an
//! attribute-value table `(survey_id, level_id, unit_identifier,
//! data_payload)`.
//!
//! # Components
//!
//! - [`schema::SchemaCatalog`]: per-level variable schemas, loaded once
//! - [`transform::RecordTransformer`]: raw row to [`record::DataRecord`] or rejection
//! - [`loader::ChunkLoader`]: atomic chunk application via COPY or batched INSERT
//! - [`driver::IngestionDriver`]: chunked reading, commit cadence, failure scope
//! - [`connection::Session`]: the tuned database session of a run
//!
//! # Example
//!
//! ```no_run
//! use microdata_ingest::{run_ingestion, CatalogSource, IngestConfig, PartitionPlan, RunOptions};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let options = RunOptions {
//!         inputs: vec![PathBuf::from("./data/asi")],
//!         plan: PartitionPlan::single_level("ASI_BLOCK_C"),
//!         catalog: CatalogSource::Database(config.survey.clone()),
//!         dry_run: false,
//!         progress: Default::default(),
//!     };
//!     let summary = run_ingestion(&config, options).await?;
//!     println!("inserted {}", summary.total_inserted);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod loader;
pub mod partition;
pub mod plan;
pub mod record;
pub mod schema;
pub mod summary;
pub mod transform;

pub use config::IngestConfig;
pub use driver::{run_ingestion, CatalogSource, IngestionDriver, RunOptions};
pub use error::{ErrorScope, IngestError, Result};
pub use loader::{ChunkLoader, ChunkSink, DryRunSink, PgChunkSink};
pub use plan::PartitionPlan;
pub use record::{CellValue, DataRecord, Payload};
pub use schema::{LevelSchema, SchemaCatalog, SurveyKey, VariableDef, VariableType};
pub use summary::{FileStatus, FileSummary, ProgressHandle, RunProgress, RunSummary};
pub use transform::{RecordTransformer, Rejection, RejectionReason, RowLayout};
