//! Multi-row INSERT with `ON CONFLICT DO NOTHING`

use super::{LoadStrategy, RECORD_COLUMNS};
use crate::record::DataRecord;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgConnection, Postgres, QueryBuilder};

/// Inserts a chunk in statements of `batch_size` rows; duplicates are skipped
#[derive(Debug, Clone, Copy)]
pub struct BatchInsertStrategy {
    batch_size: usize,
}

impl BatchInsertStrategy {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl LoadStrategy for BatchInsertStrategy {
    fn name(&self) -> &'static str {
        "insert"
    }

    async fn load(
        &self,
        conn: &mut PgConnection,
        table: &str,
        chunk: &[DataRecord],
    ) -> Result<u64, sqlx::Error> {
        let mut inserted = 0;

        for batch in chunk.chunks(self.batch_size) {
            let mut query_builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", table, RECORD_COLUMNS));

            query_builder.push_values(batch, |mut b, record| {
                b.push_bind(record.survey_id)
                    .push_bind(record.level_id)
                    .push_bind(&record.unit_identifier)
                    .push_bind(Json(&record.data_payload));
            });

            query_builder.push(" ON CONFLICT DO NOTHING");

            let result = query_builder.build().execute(&mut *conn).await?;
            inserted += result.rows_affected();
        }

        Ok(inserted)
    }
}
