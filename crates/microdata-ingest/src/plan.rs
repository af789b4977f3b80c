//! Input partitions and their per-file reading options
//!
//! A run reads a set of delimited files. Each file maps to a level (with a
//! default for unmapped files), and may declare a header row and a delimiter.
//!
//! ```toml
//! default_level = "ASI_BLOCK_C"
//!
//! [files."blkC202223.CSV"]
//! header_row = 0
//!
//! [files."blkE202223.csv"]
//! level = "ASI_BLOCK_E"
//! delimiter = "\t"
//! ```

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Options for one input file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOptions {
    #[serde(default)]
    pub level: Option<String>,

    /// Zero-based record index of the header row; rows before it are skipped.
    /// Without a header the file is read positionally.
    #[serde(default)]
    pub header_row: Option<usize>,

    #[serde(default)]
    pub delimiter: Option<char>,
}

/// Filename-to-level mapping plus per-file reading options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    #[serde(default)]
    pub default_level: Option<String>,

    #[serde(default)]
    pub default_delimiter: Option<char>,

    #[serde(default)]
    pub files: HashMap<String, FileOptions>,
}

/// A file ready to be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub path: PathBuf,
    pub level: String,
    pub header_row: Option<usize>,
    pub delimiter: u8,
}

impl Partition {
    pub fn file_name(&self) -> String {
        file_name(&self.path)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl PartitionPlan {
    /// Load a plan from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("Cannot read plan {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| IngestError::Config(format!("Invalid plan {}: {}", path.display(), e)))
    }

    /// A plan that maps every file to `level`.
    pub fn single_level(level: impl Into<String>) -> Self {
        Self {
            default_level: Some(level.into()),
            ..Self::default()
        }
    }

    fn options_for(&self, name: &str) -> Option<&FileOptions> {
        self.files.get(name).or_else(|| {
            self.files
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, options)| options)
        })
    }

    /// Resolve level, header row and delimiter for one file.
    pub fn resolve(&self, path: &Path) -> Result<Partition> {
        let name = file_name(path);
        let options = self.options_for(&name).cloned().unwrap_or_default();

        let level = options
            .level
            .or_else(|| self.default_level.clone())
            .ok_or_else(|| IngestError::LevelNotFound {
                level: format!("<no mapping for {}>", name),
            })?;

        let delimiter = options.delimiter.or(self.default_delimiter).unwrap_or(',');
        if !delimiter.is_ascii() {
            return Err(IngestError::Config(format!(
                "Delimiter for {} must be a single ASCII character",
                name
            )));
        }

        debug!(file = %name, level = %level, header_row = ?options.header_row, "Resolved partition");

        Ok(Partition {
            path: path.to_path_buf(),
            level,
            header_row: options.header_row,
            delimiter: delimiter as u8,
        })
    }
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
}

/// Expand inputs into a stable, de-duplicated list of files.
///
/// Directories contribute their `*.csv` files (any extension case) sorted by
/// name; files are taken as given.
pub fn discover_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for input in inputs {
        if input.is_dir() {
            let mut found = Vec::new();
            for entry in std::fs::read_dir(input)? {
                let path = entry?.path();
                if path.is_file() && is_csv(&path) {
                    found.push(path);
                }
            }
            found.sort();
            files.extend(found);
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            return Err(IngestError::Config(format!(
                "Input not found: {}",
                input.display()
            )));
        }
    }

    let mut seen = std::collections::HashSet::new();
    files.retain(|path| seen.insert(path.clone()));

    if files.is_empty() {
        return Err(IngestError::Config("No CSV files found in inputs".into()));
    }

    Ok(files)
}
