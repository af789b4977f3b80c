//! Schema catalog
//!
//! Per-level variable schemas produced by the metadata extraction step. The
//! catalog is loaded once, before any row is read, and is read-only for the
//! rest of the run.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Declared type of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum VariableType {
    #[default]
    Text,
    Integer,
    Numeric,
}

impl From<&str> for VariableType {
    /// Unrecognised type names are treated as text; the extraction step
    /// emits free-form labels for character fields.
    fn from(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "INTEGER" | "INT" | "BIGINT" => VariableType::Integer,
            "NUMERIC" | "DECIMAL" | "FLOAT" | "REAL" => VariableType::Numeric,
            _ => VariableType::Text,
        }
    }
}

impl<'de> Deserialize<'de> for VariableType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(VariableType::from(raw.as_str()))
    }
}

/// One variable of a level's record layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDef {
    pub name: String,

    #[serde(rename = "type", default)]
    pub var_type: VariableType,

    #[serde(default)]
    pub length: Option<u32>,

    #[serde(default)]
    pub start_position: Option<u32>,

    #[serde(default)]
    pub end_position: Option<u32>,

    #[serde(default)]
    pub is_common_id: bool,
}

impl VariableDef {
    pub fn new(name: impl Into<String>, var_type: VariableType, is_common_id: bool) -> Self {
        Self {
            name: name.into(),
            var_type,
            length: None,
            start_position: None,
            end_position: None,
            is_common_id,
        }
    }
}

/// Schema of one level (record type) within a survey
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSchema {
    pub level_id: i32,

    pub level_name: String,

    #[serde(rename = "variable_schema")]
    pub variables: Vec<VariableDef>,

    pub common_identifiers: Vec<String>,
}

impl LevelSchema {
    /// Check the structural rules a level must satisfy before files are
    /// loaded into it.
    ///
    /// Variable names are unique ignoring case, and the common identifier
    /// list names exactly the variables flagged `is_common_id`.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| IngestError::InvalidSchema {
            level: self.level_name.clone(),
            reason,
        };

        if self.variables.is_empty() {
            return Err(invalid("no variables defined".to_string()));
        }

        let mut seen = HashSet::with_capacity(self.variables.len());
        for var in &self.variables {
            let key = var.name.trim().to_uppercase();
            if key.is_empty() {
                return Err(invalid("variable with empty name".to_string()));
            }
            if !seen.insert(key) {
                return Err(invalid(format!("duplicate variable '{}'", var.name)));
            }
        }

        let flagged: HashSet<String> = self
            .variables
            .iter()
            .filter(|v| v.is_common_id)
            .map(|v| v.name.trim().to_uppercase())
            .collect();
        let listed: HashSet<String> = self
            .common_identifiers
            .iter()
            .map(|n| n.trim().to_uppercase())
            .collect();

        if listed.len() != self.common_identifiers.len() {
            return Err(invalid("duplicate common identifier".to_string()));
        }
        if let Some(missing) = listed.iter().find(|n| !seen.contains(*n)) {
            return Err(invalid(format!("common identifier '{}' is not a variable", missing)));
        }
        if flagged != listed {
            return Err(invalid(
                "common identifier list disagrees with is_common_id flags".to_string(),
            ));
        }

        Ok(())
    }
}

/// Survey identity in the `surveys` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyKey {
    pub name: String,
    pub year: i32,
}

impl std::fmt::Display for SurveyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.year)
    }
}

/// JSON snapshot of a catalog, for runs that do not read the catalog tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub survey_id: i32,
    pub levels: Vec<LevelSchema>,
}

/// Preloaded, read-only mapping from level name to schema
#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    survey_id: i32,
    levels: HashMap<String, Arc<LevelSchema>>,
}

impl SchemaCatalog {
    /// Build a catalog from already-loaded levels.
    ///
    /// Malformed levels are kept and only fail when a file is mapped to them.
    pub fn from_levels(survey_id: i32, levels: Vec<LevelSchema>) -> Result<Self> {
        let mut map = HashMap::with_capacity(levels.len());
        for level in levels {
            if let Err(err) = level.validate() {
                warn!(level = %level.level_name, error = %err, "Level schema is invalid");
            }
            let key = level.level_name.trim().to_uppercase();
            if map.contains_key(&key) {
                return Err(IngestError::InvalidSchema {
                    level: level.level_name,
                    reason: "level name defined twice".to_string(),
                });
            }
            map.insert(key, Arc::new(level));
        }

        Ok(Self {
            survey_id,
            levels: map,
        })
    }

    /// Load the survey id and every level of the survey in one pass.
    pub async fn load(pool: &PgPool, survey: &SurveyKey) -> Result<Self> {
        let survey_id: Option<i32> = sqlx::query_scalar(
            "SELECT survey_id FROM surveys WHERE survey_name = $1 AND survey_year = $2",
        )
        .bind(&survey.name)
        .bind(survey.year)
        .fetch_optional(pool)
        .await?;

        let survey_id = survey_id.ok_or_else(|| IngestError::SchemaNotFound {
            survey: survey.to_string(),
        })?;

        info!(survey = %survey, survey_id, "Resolved survey");

        let rows: Vec<(i32, String, Json<Vec<VariableDef>>, Json<Vec<String>>)> =
            sqlx::query_as(
                r#"
                SELECT level_id, level_name, variable_schema, common_identifiers
                FROM survey_levels
                WHERE survey_id = $1
                ORDER BY level_id
                "#,
            )
            .bind(survey_id)
            .fetch_all(pool)
            .await?;

        let levels = rows
            .into_iter()
            .map(|(level_id, level_name, variables, common)| LevelSchema {
                level_id,
                level_name,
                variables: variables.0,
                common_identifiers: common.0,
            })
            .collect::<Vec<_>>();

        info!(levels = levels.len(), "Loaded level metadata");
        Self::from_levels(survey_id, levels)
    }

    /// Load a catalog from a JSON snapshot file.
    pub fn from_snapshot_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Reading catalog snapshot");
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("Cannot read snapshot {}: {}", path.display(), e))
        })?;
        let snapshot: CatalogSnapshot = serde_json::from_str(&content)?;
        Self::from_levels(snapshot.survey_id, snapshot.levels)
    }

    pub fn survey_id(&self) -> i32 {
        self.survey_id
    }

    /// Look up a level by name, ignoring case, and check that it can be
    /// loaded into.
    pub fn level(&self, name: &str) -> Result<Arc<LevelSchema>> {
        let level = self
            .levels
            .get(&name.trim().to_uppercase())
            .ok_or_else(|| IngestError::LevelNotFound {
                level: name.to_string(),
            })?;
        level.validate()?;
        Ok(Arc::clone(level))
    }

    /// Levels ordered by id
    pub fn levels(&self) -> Vec<Arc<LevelSchema>> {
        let mut levels: Vec<_> = self.levels.values().cloned().collect();
        levels.sort_by_key(|l| l.level_id);
        levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}
