//! The run's database session
//!
//! A single-connection pool whose connection is tuned for bulk writes as soon
//! as it is opened. Every transaction of the run goes through that one
//! connection.

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::loader::{classify, ErrorClass};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use tracing::{debug, info};

/// Tuned session owned by one run
pub struct Session {
    pool: PgPool,
}

impl Session {
    /// Connect and apply the session settings.
    pub async fn open(config: &IngestConfig) -> Result<Self> {
        config.session.validate()?;
        let statements = config.session.statements();

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .acquire_timeout(config.connect_timeout())
            .after_connect(move |conn, _meta| {
                let statements = statements.clone();
                Box::pin(async move {
                    for statement in &statements {
                        conn.execute(statement.as_str()).await?;
                    }
                    debug!(settings = statements.len(), "Applied session settings");
                    Ok(())
                })
            })
            .connect(&config.database.url)
            .await
            .map_err(|err| match classify(&err) {
                ErrorClass::Connectivity => IngestError::ConnectivityLoss(err.to_string()),
                _ => IngestError::Database(err),
            })?;

        info!(
            synchronous_commit_off = config.session.synchronous_commit_off,
            work_mem = %config.session.work_mem,
            "Database session opened"
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Release the connection. Waits for any checked-out use to finish.
    pub async fn close(self) {
        self.pool.close().await;
        info!("Database session closed");
    }
}
