//! Row transformation
//!
//! Turns one raw delimited row into a [`DataRecord`] according to a level's
//! schema, or into a [`Rejection`] when the composite identifier cannot be
//! built. Malformed cells never fail a row: they degrade to their trimmed
//! text and are counted.

use crate::record::{CellValue, DataRecord, Payload};
use crate::schema::{LevelSchema, VariableType};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Separator between the parts of a unit identifier
pub const IDENTIFIER_SEPARATOR: &str = "_";

// i64 bounds as f64; the upper bound itself is not representable as i64.
const I64_MIN_F: f64 = -9_223_372_036_854_775_808.0;
const I64_MAX_EXCLUSIVE_F: f64 = 9_223_372_036_854_775_808.0;

/// Result of coercing one cell
#[derive(Debug, Clone, PartialEq)]
pub struct Coerced {
    pub value: CellValue,
    /// The cell did not parse as its declared type and was kept as text
    pub degraded: bool,
}

/// Coerce a raw cell to its declared type.
///
/// Absent, null, or blank cells become [`CellValue::Null`]. INTEGER cells
/// accept anything that parses as a finite number and truncate toward zero;
/// NUMERIC cells accept finite floats. Anything else falls back to the
/// trimmed text.
pub fn coerce(raw: Option<&str>, var_type: VariableType) -> Coerced {
    let trimmed = match raw.map(str::trim) {
        None | Some("") => {
            return Coerced {
                value: CellValue::Null,
                degraded: false,
            }
        },
        Some(t) => t,
    };

    let parsed = match var_type {
        VariableType::Text => Some(CellValue::Text(trimmed.to_string())),
        VariableType::Integer => parse_integer(trimmed).map(CellValue::Integer),
        VariableType::Numeric => parse_numeric(trimmed).map(CellValue::Numeric),
    };

    match parsed {
        Some(value) => Coerced {
            value,
            degraded: false,
        },
        None => Coerced {
            value: CellValue::Text(trimmed.to_string()),
            degraded: true,
        },
    }
}

fn parse_integer(s: &str) -> Option<i64> {
    if let Ok(v) = s.parse::<i64>() {
        return Some(v);
    }
    let f = parse_numeric(s)?;
    if (I64_MIN_F..I64_MAX_EXCLUSIVE_F).contains(&f) {
        Some(f.trunc() as i64)
    } else {
        None
    }
}

fn parse_numeric(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Access to the fields of one raw row
pub trait RawRow {
    fn field(&self, index: usize) -> Option<&str>;
    fn width(&self) -> usize;

    /// Whether the field had to be decoded with replacement characters
    fn is_lossy(&self, _index: usize) -> bool {
        false
    }
}

impl<S: AsRef<str>> RawRow for [S] {
    fn field(&self, index: usize) -> Option<&str> {
        self.get(index).map(AsRef::as_ref)
    }

    fn width(&self) -> usize {
        self.len()
    }
}

impl<S: AsRef<str>, const N: usize> RawRow for [S; N] {
    fn field(&self, index: usize) -> Option<&str> {
        self.get(index).map(AsRef::as_ref)
    }

    fn width(&self) -> usize {
        N
    }
}

/// How row fields line up with schema variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowLayout {
    /// Field `i` holds variable `i`; rows must be exactly as wide as the schema
    Positional,
    /// Fields are matched by the (uppercased) names of a header row
    Header(Vec<String>),
}

impl RowLayout {
    /// Build a header layout from the raw header fields.
    pub fn from_header<R: RawRow + ?Sized>(header: &R) -> Self {
        let names = (0..header.width())
            .map(|i| header.field(i).unwrap_or_default().trim().to_uppercase())
            .collect();
        RowLayout::Header(names)
    }

    /// Number of fields every row must carry
    pub fn expected_width(&self, schema: &LevelSchema) -> usize {
        match self {
            RowLayout::Positional => schema.variables.len(),
            RowLayout::Header(names) => names.len(),
        }
    }
}

#[derive(Debug, Clone)]
struct ColumnPlan {
    name: Arc<str>,
    var_type: VariableType,
    is_common_id: bool,
    source: Option<usize>,
}

/// Why a row was not turned into a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    IncompleteIdentifier,
}

/// A row that cannot be persisted, with the identifier diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectionReason,
    /// Common identifier variables declared by the schema
    pub expected: Vec<String>,
    /// Identifier parts that did resolve
    pub found: Vec<String>,
}

/// A successfully transformed row
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub record: DataRecord,
    /// Cells that fell back to text or were not valid UTF-8
    pub degraded: usize,
}

/// Transforms rows of one level; built once per file
#[derive(Debug, Clone)]
pub struct RecordTransformer {
    survey_id: i32,
    level_id: i32,
    columns: Vec<ColumnPlan>,
    common_identifiers: Vec<String>,
}

impl RecordTransformer {
    pub fn new(schema: &LevelSchema, survey_id: i32, layout: &RowLayout) -> Self {
        let header_index: Option<HashMap<&str, usize>> = match layout {
            RowLayout::Positional => None,
            RowLayout::Header(names) => {
                let mut index = HashMap::with_capacity(names.len());
                for (i, name) in names.iter().enumerate() {
                    if index.insert(name.as_str(), i).is_some() {
                        warn!(column = %name, "Duplicate header column, using the last occurrence");
                    }
                }
                Some(index)
            },
        };

        let columns = schema
            .variables
            .iter()
            .enumerate()
            .map(|(position, var)| {
                let name = var.name.trim().to_uppercase();
                let source = match &header_index {
                    None => Some(position),
                    Some(index) => index.get(name.as_str()).copied(),
                };
                ColumnPlan {
                    name: Arc::from(name),
                    var_type: var.var_type,
                    is_common_id: var.is_common_id,
                    source,
                }
            })
            .collect::<Vec<_>>();

        let unmatched: Vec<&str> = columns
            .iter()
            .filter(|c| c.source.is_none())
            .map(|c| c.name.as_ref())
            .collect();
        if !unmatched.is_empty() {
            warn!(
                level = %schema.level_name,
                missing = ?unmatched,
                "Header does not carry every schema variable; missing values will be null"
            );
        }

        Self {
            survey_id,
            level_id: schema.level_id,
            columns,
            common_identifiers: schema.common_identifiers.clone(),
        }
    }

    /// Transform one row.
    pub fn transform<R: RawRow + ?Sized>(&self, row: &R) -> Result<Transformed, Rejection> {
        let mut payload = Payload::with_capacity(self.columns.len());
        let mut parts: Vec<String> = Vec::with_capacity(self.common_identifiers.len());
        let mut degraded = 0;

        for column in &self.columns {
            let raw = column.source.and_then(|i| row.field(i));
            let coerced = coerce(raw, column.var_type);
            if coerced.degraded || column.source.is_some_and(|i| row.is_lossy(i)) {
                degraded += 1;
            }
            if column.is_common_id {
                if let Some(part) = coerced.value.identifier_part() {
                    parts.push(part);
                }
            }
            payload.push(Arc::clone(&column.name), coerced.value);
        }

        if parts.len() != self.common_identifiers.len() || parts.iter().any(|p| p.is_empty()) {
            return Err(Rejection {
                reason: RejectionReason::IncompleteIdentifier,
                expected: self.common_identifiers.clone(),
                found: parts,
            });
        }

        Ok(Transformed {
            record: DataRecord {
                survey_id: self.survey_id,
                level_id: self.level_id,
                unit_identifier: parts.join(IDENTIFIER_SEPARATOR),
                data_payload: payload,
            },
            degraded,
        })
    }
}
