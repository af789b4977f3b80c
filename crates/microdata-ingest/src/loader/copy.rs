//! `COPY ... FROM STDIN` in text format

use super::{LoadStrategy, RECORD_COLUMNS};
use crate::record::DataRecord;
use async_trait::async_trait;
use sqlx::postgres::PgCopyIn;
use sqlx::PgConnection;
use std::io::Write;
use tracing::warn;

/// Null sentinel of the COPY text format
pub const NULL_SENTINEL: &str = "\\N";

/// Bytes buffered before a frame is sent to the server
pub const FRAME_SIZE: usize = 1024 * 1024;

/// Streams a chunk as tab-separated lines
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyStrategy;

/// Escape a field for the COPY text format.
pub fn escape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

fn push_field(buf: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(v) => buf.extend_from_slice(escape_field(v).as_bytes()),
        None => buf.extend_from_slice(NULL_SENTINEL.as_bytes()),
    }
}

/// Abandon an open COPY, keeping the original error as the one reported.
async fn abort_copy(copy: PgCopyIn<&mut PgConnection>, reason: String) {
    if let Err(err) = copy.abort(reason).await {
        warn!(error = %err, "Aborting COPY failed; the connection may be unusable");
    }
}

/// Append one record as a COPY line.
pub fn encode_line(buf: &mut Vec<u8>, record: &DataRecord) -> serde_json::Result<()> {
    let payload = record.data_payload.to_json()?;
    // Integers never need escaping.
    let _ = write!(buf, "{}\t{}\t", record.survey_id, record.level_id);
    push_field(buf, Some(&record.unit_identifier));
    buf.push(b'\t');
    push_field(buf, Some(&payload));
    buf.push(b'\n');
    Ok(())
}

#[async_trait]
impl LoadStrategy for CopyStrategy {
    fn name(&self) -> &'static str {
        "copy"
    }

    async fn load(
        &self,
        conn: &mut PgConnection,
        table: &str,
        chunk: &[DataRecord],
    ) -> Result<u64, sqlx::Error> {
        let statement = format!("COPY {} ({}) FROM STDIN", table, RECORD_COLUMNS);
        let mut copy = conn.copy_in_raw(&statement).await?;

        let mut buf = Vec::with_capacity(FRAME_SIZE + 4096);
        for record in chunk {
            if let Err(e) = encode_line(&mut buf, record) {
                abort_copy(copy, e.to_string()).await;
                return Err(sqlx::Error::Encode(Box::new(e)));
            }
            if buf.len() >= FRAME_SIZE {
                if let Err(e) = copy.send(buf.as_slice()).await {
                    abort_copy(copy, e.to_string()).await;
                    return Err(e);
                }
                buf.clear();
            }
        }

        if !buf.is_empty() {
            if let Err(e) = copy.send(buf.as_slice()).await {
                abort_copy(copy, e.to_string()).await;
                return Err(e);
            }
        }

        copy.finish().await
    }
}
