//! Chunked reading of one input partition
//!
//! Rows are read with `flexible(true)` so that width problems surface as
//! [`IngestError::ColumnCountMismatch`] with a line number instead of a
//! generic CSV error. Fields are read as bytes; a field that is not valid
//! UTF-8 is decoded with replacement characters and flagged, never fatal.

use crate::error::{IngestError, Result};
use crate::plan::Partition;
use crate::schema::LevelSchema;
use crate::transform::{RawRow, RowLayout};
use csv::{ByteRecord, Reader, ReaderBuilder, StringRecord};
use std::fs::File;
use std::path::PathBuf;
use tracing::{debug, warn};

/// One decoded data row
#[derive(Debug, Clone)]
pub struct PartitionRow {
    record: StringRecord,
    line: u64,
    /// Indexes of fields that were not valid UTF-8
    lossy: Vec<usize>,
}

impl PartitionRow {
    fn decode(bytes: &ByteRecord) -> Self {
        let mut record = StringRecord::with_capacity(bytes.as_slice().len(), bytes.len());
        let mut lossy = Vec::new();
        for (index, field) in bytes.iter().enumerate() {
            match std::str::from_utf8(field) {
                Ok(text) => record.push_field(text),
                Err(_) => {
                    lossy.push(index);
                    record.push_field(&String::from_utf8_lossy(field));
                },
            }
        }
        Self {
            record,
            line: bytes.position().map(|p| p.line()).unwrap_or(0),
            lossy,
        }
    }

    /// 1-based line of the row in its file
    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn lossy_fields(&self) -> &[usize] {
        &self.lossy
    }
}

impl RawRow for PartitionRow {
    fn field(&self, index: usize) -> Option<&str> {
        self.record.get(index)
    }

    fn width(&self) -> usize {
        self.record.len()
    }

    fn is_lossy(&self, index: usize) -> bool {
        self.lossy.contains(&index)
    }
}

/// Reader over the data rows of one partition
pub struct PartitionReader {
    reader: Reader<File>,
    record: ByteRecord,
    path: PathBuf,
    layout: RowLayout,
    expected_width: usize,
    chunk_size: usize,
    exhausted: bool,
}

impl PartitionReader {
    /// Open a partition, skip to its data rows and fix the row layout.
    pub fn open(partition: &Partition, schema: &LevelSchema, chunk_size: usize) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(partition.delimiter)
            .from_path(&partition.path)?;

        let mut record = ByteRecord::new();
        let mut exhausted = false;

        let layout = match partition.header_row {
            None => RowLayout::Positional,
            Some(header_row) => {
                if read_header(&mut reader, &mut record, header_row)? {
                    RowLayout::from_header(&PartitionRow::decode(&record))
                } else {
                    warn!(file = %partition.path.display(), header_row, "File ends before its header row");
                    exhausted = true;
                    RowLayout::Positional
                }
            },
        };

        let expected_width = layout.expected_width(schema);
        debug!(
            file = %partition.path.display(),
            expected_width,
            header = partition.header_row.is_some(),
            "Opened partition"
        );

        Ok(Self {
            reader,
            record,
            path: partition.path.clone(),
            layout,
            expected_width,
            chunk_size: chunk_size.max(1),
            exhausted,
        })
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    /// Read the next row into the internal buffer, checking its width.
    fn read_checked(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        if !self.reader.read_byte_record(&mut self.record)? {
            self.exhausted = true;
            return Ok(false);
        }
        if self.record.len() != self.expected_width {
            return Err(IngestError::ColumnCountMismatch {
                file: self.path.clone(),
                line: self.record.position().map(|p| p.line()).unwrap_or(0),
                expected: self.expected_width,
                found: self.record.len(),
            });
        }
        Ok(true)
    }

    /// Next chunk of at most `chunk_size` rows; `None` once the file is done.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<PartitionRow>>> {
        let mut rows = Vec::with_capacity(self.chunk_size.min(4_096));
        while rows.len() < self.chunk_size && self.read_checked()? {
            rows.push(PartitionRow::decode(&self.record));
        }
        Ok(if rows.is_empty() { None } else { Some(rows) })
    }

    /// Check every remaining row's width and count the rows.
    ///
    /// Used before loading so that a misaligned file is rejected before any
    /// of its chunks reach the store.
    pub fn scan(mut self) -> Result<u64> {
        let mut rows = 0u64;
        while self.read_checked()? {
            rows += 1;
        }
        Ok(rows)
    }
}

/// Advance to record `header_row`, leaving it in `record`.
fn read_header(reader: &mut Reader<File>, record: &mut ByteRecord, header_row: usize) -> Result<bool> {
    for _ in 0..=header_row {
        if !reader.read_byte_record(record)? {
            return Ok(false);
        }
    }
    Ok(true)
}
