//! Shared helpers for microdata-ingest integration tests
//!
//! - [`MemorySink`]: in-memory [`ChunkSink`] with failure injection
//! - [`TestPostgres`]: PostgreSQL container with the storage tables created
//! - catalog and CSV fixtures

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use microdata_ingest::{
    ChunkSink, DataRecord, IngestError, LevelSchema, SchemaCatalog, VariableDef, VariableType,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;

pub const SURVEY_ID: i32 = 1;
pub const BLOCK_C_ID: i32 = 3;
pub const BLOCK_E_ID: i32 = 5;

// ============================================================================
// Fixtures
// ============================================================================

pub fn block_c() -> LevelSchema {
    LevelSchema {
        level_id: BLOCK_C_ID,
        level_name: "ASI_BLOCK_C".to_string(),
        variables: vec![
            VariableDef::new("STATE", VariableType::Integer, true),
            VariableDef::new("DISTRICT", VariableType::Integer, true),
            VariableDef::new("NAME", VariableType::Text, false),
        ],
        common_identifiers: vec!["STATE".to_string(), "DISTRICT".to_string()],
    }
}

pub fn block_e() -> LevelSchema {
    LevelSchema {
        level_id: BLOCK_E_ID,
        level_name: "ASI_BLOCK_E".to_string(),
        variables: vec![
            VariableDef::new("DSL", VariableType::Text, true),
            VariableDef::new("WORKERS", VariableType::Integer, false),
            VariableDef::new("WAGES", VariableType::Numeric, false),
        ],
        common_identifiers: vec!["DSL".to_string()],
    }
}

pub fn catalog() -> SchemaCatalog {
    SchemaCatalog::from_levels(SURVEY_ID, vec![block_c(), block_e()]).expect("valid catalog")
}

pub fn write_csv(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write fixture");
    path
}

/// `rows` positional block C rows with distinct identifiers
pub fn block_c_rows(start: usize, rows: usize) -> String {
    (start..start + rows)
        .map(|i| format!("{},{},Unit {}\n", i / 100 + 1, i % 100 + 1, i))
        .collect()
}

// ============================================================================
// In-memory sink
// ============================================================================

/// What the sink should do on a given apply call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transfer,
    Connectivity,
}

/// Records chunks in memory with commit/rollback semantics
///
/// Duplicate `(level_id, unit_identifier)` pairs are ignored, as with the
/// conflict-tolerant insert path.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub committed: Vec<DataRecord>,
    pending: Vec<DataRecord>,
    keys: HashSet<(i32, String)>,
    pub applies: usize,
    pub rollbacks: usize,
    /// Rows made durable by each commit that carried any
    pub commit_sizes: Vec<usize>,
    fail_at: Option<(usize, Failure)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `call`-th apply (1-based).
    pub fn failing_at(call: usize, failure: Failure) -> Self {
        Self {
            fail_at: Some((call, failure)),
            ..Self::default()
        }
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.committed
            .iter()
            .map(|r| r.unit_identifier.clone())
            .collect()
    }
}

#[async_trait]
impl ChunkSink for MemorySink {
    async fn apply(&mut self, chunk: &[DataRecord]) -> microdata_ingest::Result<u64> {
        self.applies += 1;
        match self.fail_at {
            Some((call, Failure::Transfer)) if call == self.applies => {
                return Err(IngestError::TransferFailure {
                    attempts: 1,
                    reason: "injected".to_string(),
                });
            },
            Some((call, Failure::Connectivity)) if call == self.applies => {
                return Err(IngestError::ConnectivityLoss("injected".to_string()));
            },
            _ => {},
        }

        let mut inserted = 0;
        for record in chunk {
            let pending_dup = self
                .pending
                .iter()
                .any(|p| p.level_id == record.level_id && p.unit_identifier == record.unit_identifier);
            if pending_dup
                || self
                    .keys
                    .contains(&(record.level_id, record.unit_identifier.clone()))
            {
                continue;
            }
            self.pending.push(record.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn commit(&mut self) -> microdata_ingest::Result<()> {
        if !self.pending.is_empty() {
            self.commit_sizes.push(self.pending.len());
        }
        for record in self.pending.drain(..) {
            self.keys
                .insert((record.level_id, record.unit_identifier.clone()));
            self.committed.push(record);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> microdata_ingest::Result<()> {
        self.rollbacks += 1;
        self.pending.clear();
        Ok(())
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

const STORAGE_DDL: &[&str] = &[
    r#"
    CREATE TABLE surveys (
        survey_id SERIAL PRIMARY KEY,
        survey_name TEXT NOT NULL,
        survey_year INTEGER NOT NULL,
        UNIQUE (survey_name, survey_year)
    )
    "#,
    r#"
    CREATE TABLE survey_levels (
        level_id INTEGER PRIMARY KEY,
        survey_id INTEGER NOT NULL REFERENCES surveys(survey_id),
        level_name TEXT NOT NULL,
        variable_schema JSONB NOT NULL,
        common_identifiers JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE survey_data (
        id BIGSERIAL PRIMARY KEY,
        survey_id INTEGER NOT NULL REFERENCES surveys(survey_id),
        level_id INTEGER NOT NULL REFERENCES survey_levels(level_id),
        unit_identifier TEXT NOT NULL,
        data_payload JSONB NOT NULL,
        UNIQUE (survey_id, level_id, unit_identifier)
    )
    "#,
];

/// PostgreSQL container with the survey tables and the test catalog loaded
pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        for statement in STORAGE_DDL {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("Failed to create storage tables")?;
        }

        let pg = Self {
            container,
            pool,
            connection_string,
        };
        pg.seed_catalog().await?;
        Ok(pg)
    }

    async fn seed_catalog(&self) -> Result<()> {
        sqlx::query("INSERT INTO surveys (survey_id, survey_name, survey_year) VALUES ($1, 'ASI', 2023)")
            .bind(SURVEY_ID)
            .execute(&self.pool)
            .await?;

        for level in [block_c(), block_e()] {
            sqlx::query(
                r#"
                INSERT INTO survey_levels (level_id, survey_id, level_name, variable_schema, common_identifiers)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(level.level_id)
            .bind(SURVEY_ID)
            .bind(&level.level_name)
            .bind(sqlx::types::Json(&level.variables))
            .bind(sqlx::types::Json(&level.common_identifiers))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Stop the server; the container stays allocated until drop.
    pub async fn stop(&self) -> Result<()> {
        self.container
            .stop()
            .await
            .context("Failed to stop PostgreSQL container")
    }

    /// Terminate one backend, as an administrator shutdown would.
    pub async fn terminate_backend(&self, pid: i32) -> Result<()> {
        let terminated: bool = sqlx::query_scalar("SELECT pg_terminate_backend($1, 5000)")
            .bind(pid)
            .fetch_one(&self.pool)
            .await?;
        anyhow::ensure!(terminated, "backend {} was not terminated", pid);
        Ok(())
    }

    pub async fn row_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM survey_data")
            .fetch_one(&self.pool)
            .await?)
    }
}

/// Initialize tracing for tests
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,microdata_ingest=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}
