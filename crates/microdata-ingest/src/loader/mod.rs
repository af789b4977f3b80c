//! Chunk loading
//!
//! [`ChunkLoader`] applies one chunk atomically inside a savepoint of the
//! open file transaction, choosing between COPY and batched INSERT by chunk
//! size. [`ChunkSink`] is the storage capability the driver is given; the
//! production sink wraps a loader and a transaction on the tuned session, and
//! re-establishes the session when its connection drops.

pub mod copy;
pub mod insert;

pub use copy::CopyStrategy;
pub use insert::BatchInsertStrategy;

use crate::config::LoaderConfig;
use crate::error::{IngestError, Result};
use crate::record::DataRecord;
use async_trait::async_trait;
use sqlx::{Connection, PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};

/// Destination columns, in COPY line order
pub const RECORD_COLUMNS: &str = "survey_id, level_id, unit_identifier, data_payload";

/// One way of writing a chunk to the destination table
#[async_trait]
pub trait LoadStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write the chunk, returning the number of rows persisted.
    async fn load(
        &self,
        conn: &mut PgConnection,
        table: &str,
        chunk: &[DataRecord],
    ) -> std::result::Result<u64, sqlx::Error>;
}

/// How a database failure affects the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The connection is gone, and with it the open transaction
    Connectivity,
    /// Worth another attempt on the same chunk
    Transient,
    /// The chunk itself is rejected by the server
    Data,
}

/// Classify a SQLSTATE code.
pub fn classify_code(code: &str) -> ErrorClass {
    match code {
        // serialization_failure, deadlock_detected, lock_not_available, query_canceled
        "40001" | "40P01" | "55P03" | "57014" => ErrorClass::Transient,
        // admin_shutdown, crash_shutdown, cannot_connect_now
        "57P01" | "57P02" | "57P03" => ErrorClass::Connectivity,
        c if c.starts_with("08") => ErrorClass::Connectivity,
        _ => ErrorClass::Data,
    }
}

pub fn classify(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorClass::Connectivity,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| classify_code(&code))
            .unwrap_or(ErrorClass::Data),
        _ => ErrorClass::Data,
    }
}

/// Map an error from session-level statements (begin, commit, rollback).
fn session_error(err: sqlx::Error) -> IngestError {
    match classify(&err) {
        ErrorClass::Connectivity => IngestError::ConnectivityLoss(err.to_string()),
        _ => IngestError::Database(err),
    }
}

/// Applies chunks atomically, with strategy selection, fallback and retry
pub struct ChunkLoader {
    config: LoaderConfig,
    copy: CopyStrategy,
    insert: BatchInsertStrategy,
}

impl ChunkLoader {
    pub fn new(config: LoaderConfig) -> Self {
        let insert = BatchInsertStrategy::new(config.insert_batch_size);
        Self {
            config,
            copy: CopyStrategy,
            insert,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Whether a chunk of `len` records goes through COPY
    pub fn uses_copy(&self, len: usize) -> bool {
        self.config.use_copy && len > self.config.copy_threshold
    }

    fn strategy_for(&self, len: usize) -> &dyn LoadStrategy {
        if self.uses_copy(len) {
            &self.copy
        } else {
            &self.insert
        }
    }

    /// Apply one chunk on a connection that is inside a transaction.
    ///
    /// Either every row of the chunk is written or none is. Transient
    /// failures are retried with linear backoff. A dropped connection is
    /// returned as [`IngestError::ConnectivityLoss`] for the owner of the
    /// session to recover; anything else is reported as
    /// [`IngestError::TransferFailure`].
    pub async fn apply(&self, conn: &mut PgConnection, chunk: &[DataRecord]) -> Result<u64> {
        if chunk.is_empty() {
            return Ok(0);
        }

        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 1;

        loop {
            let err = match self.apply_once(conn, chunk).await {
                Ok(inserted) => return Ok(inserted),
                Err(err) => err,
            };

            match classify(&err) {
                ErrorClass::Connectivity => {
                    return Err(IngestError::ConnectivityLoss(err.to_string()));
                },
                ErrorClass::Transient if attempt < max_attempts => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure applying chunk, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                _ => {
                    return Err(IngestError::TransferFailure {
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                },
            }
        }
    }

    async fn apply_once(
        &self,
        conn: &mut PgConnection,
        chunk: &[DataRecord],
    ) -> std::result::Result<u64, sqlx::Error> {
        let strategy = self.strategy_for(chunk.len());

        match self.load_in_savepoint(conn, strategy, chunk).await {
            Err(err) if strategy.name() == self.copy.name() && classify(&err) == ErrorClass::Data => {
                warn!(
                    records = chunk.len(),
                    error = %err,
                    "COPY rejected chunk, falling back to batched insert"
                );
                self.load_in_savepoint(conn, &self.insert, chunk).await
            },
            other => other,
        }
    }

    async fn load_in_savepoint(
        &self,
        conn: &mut PgConnection,
        strategy: &dyn LoadStrategy,
        chunk: &[DataRecord],
    ) -> std::result::Result<u64, sqlx::Error> {
        let mut savepoint = conn.begin().await?;

        match strategy.load(&mut savepoint, &self.config.target_table, chunk).await {
            Ok(inserted) => {
                savepoint.commit().await?;
                debug!(strategy = strategy.name(), records = chunk.len(), inserted, "Chunk applied");
                Ok(inserted)
            },
            Err(err) => {
                savepoint.rollback().await?;
                Err(err)
            },
        }
    }
}

/// Storage capability used by the driver.
///
/// Chunks applied since the last commit form one unit of work: `commit`
/// makes them durable and `rollback` discards all of them.
#[async_trait]
pub trait ChunkSink: Send {
    /// Apply one chunk atomically, returning the rows written.
    async fn apply(&mut self, chunk: &[DataRecord]) -> Result<u64>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Postgres sink holding at most one open transaction on the session pool.
///
/// When the connection drops, the sink waits for the pool to hand out a
/// fresh, re-tuned connection. A chunk that was the only uncommitted work is
/// retried on it; otherwise the lost chunks are reported as a
/// [`IngestError::TransferFailure`] so the driver aborts the file. Only a
/// session that cannot be re-established ends the run.
pub struct PgChunkSink {
    pool: PgPool,
    loader: ChunkLoader,
    tx: Option<Transaction<'static, Postgres>>,
    /// Chunks applied on the open transaction
    applied: u64,
}

impl PgChunkSink {
    pub fn new(pool: PgPool, loader: ChunkLoader) -> Self {
        Self {
            pool,
            loader,
            tx: None,
            applied: 0,
        }
    }

    async fn apply_in_transaction(&mut self, chunk: &[DataRecord]) -> Result<u64> {
        if self.tx.is_none() {
            self.tx = Some(self.pool.begin().await.map_err(session_error)?);
        }
        match self.tx.as_mut() {
            Some(tx) => self.loader.apply(&mut **tx, chunk).await,
            None => Err(IngestError::ConnectivityLoss("transaction unavailable".into())),
        }
    }

    /// Drop the dead transaction and wait for a working connection.
    ///
    /// Returns the number of uncommitted chunks that were lost with it.
    async fn recover_session(&mut self, reason: &str) -> Result<u64> {
        let lost = self.applied;
        self.tx = None;
        self.applied = 0;

        let config = self.loader.config();
        let max_attempts = config.max_retries.max(1);
        let mut attempt = 1;

        loop {
            let delay = config.retry_delay(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                lost_chunks = lost,
                error = %reason,
                "Database connection lost, reconnecting"
            );
            tokio::time::sleep(delay).await;

            match self.pool.acquire().await {
                Ok(_conn) => {
                    info!(attempt, "Database session re-established");
                    return Ok(lost);
                },
                Err(err) if attempt < max_attempts => {
                    debug!(attempt, error = %err, "Reconnect attempt failed");
                    attempt += 1;
                },
                Err(err) => {
                    return Err(IngestError::ConnectivityLoss(format!(
                        "{}; reconnect failed after {} attempt(s): {}",
                        reason, attempt, err
                    )));
                },
            }
        }
    }
}

#[async_trait]
impl ChunkSink for PgChunkSink {
    async fn apply(&mut self, chunk: &[DataRecord]) -> Result<u64> {
        let max_attempts = self.loader.config().max_retries.max(1);
        let mut attempt = 1;

        loop {
            let reason = match self.apply_in_transaction(chunk).await {
                Ok(inserted) => {
                    self.applied += 1;
                    return Ok(inserted);
                },
                Err(IngestError::ConnectivityLoss(reason)) => reason,
                Err(err) => return Err(err),
            };

            let lost = self.recover_session(&reason).await?;
            if lost > 0 {
                return Err(IngestError::TransferFailure {
                    attempts: attempt,
                    reason: format!(
                        "connection lost with {} uncommitted chunk(s): {}",
                        lost, reason
                    ),
                });
            }
            if attempt >= max_attempts {
                return Err(IngestError::TransferFailure {
                    attempts: attempt,
                    reason: format!("connection lost: {}", reason),
                });
            }
            attempt += 1;
        }
    }

    async fn commit(&mut self) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        self.applied = 0;

        match tx.commit().await {
            Ok(()) => Ok(()),
            Err(err) if classify(&err) == ErrorClass::Connectivity => {
                let reason = err.to_string();
                self.recover_session(&reason).await?;
                Err(IngestError::TransferFailure {
                    attempts: 1,
                    reason: format!("connection lost during commit: {}", reason),
                })
            },
            Err(err) => Err(IngestError::TransferFailure {
                attempts: 1,
                reason: format!("commit failed: {}", err),
            }),
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        self.applied = 0;
        if let Some(tx) = self.tx.take() {
            tx.rollback().await.map_err(session_error)?;
        }
        Ok(())
    }
}

/// Sink that discards records, for dry runs
#[derive(Debug, Default)]
pub struct DryRunSink {
    records: u64,
    chunks: u64,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }
}

#[async_trait]
impl ChunkSink for DryRunSink {
    async fn apply(&mut self, chunk: &[DataRecord]) -> Result<u64> {
        self.records += chunk.len() as u64;
        self.chunks += 1;
        Ok(chunk.len() as u64)
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}
