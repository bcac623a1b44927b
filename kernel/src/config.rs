// Prep Configuration
//
// Describes the table set to provision and where consolidated
// metadata is written. Loaded from JSON; a built-in default
// reproduces the standard pipeline tables.

use serde::{Deserialize, Serialize};

use crate::schema::provision::DEFAULT_TEMP_SUFFIX;
use crate::schema::{FailureMode, TableSpec, DEFAULT_CONTEXT};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("table `{table}`: {reason}")]
    InvalidTable { table: String, reason: String },

    #[error("metadata table `{0}` must be declared as a temporary table")]
    MetadataTable(String),

    #[error("job context cannot be empty")]
    EmptyContext,
}

fn default_context() -> String {
    DEFAULT_CONTEXT.into()
}

fn default_temp_suffix() -> String {
    DEFAULT_TEMP_SUFFIX.into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepConfig {
    /// Context applied to every table that does not set its own.
    #[serde(default = "default_context")]
    pub context: String,

    #[serde(default = "default_temp_suffix")]
    pub temp_suffix: String,

    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Logical name of the table the merge writes to.
    pub metadata_table: String,

    pub tables: Vec<TableSpec>,
}

impl PrepConfig {
    /// Standard pipeline tables, each named `{prefix}{table}`.
    ///
    /// On a first run the metadata table is dropped and rebuilt.
    pub fn default_config(prefix: &str, first_run: bool) -> Self {
        let table = |name: &str| TableSpec::named(format!("{prefix}{name}"));

        let metadata_table = format!("{prefix}metadata");
        let tables = vec![
            TableSpec::named(metadata_table.clone())
                .temporary(true)
                .delete_if_exists(first_run),
            table("hypothesis"),
            table("result"),
            table("group_membership"),
            table("group_hypothesis_lookup"),
            table("group_metadata"),
        ];

        Self {
            context: default_context(),
            temp_suffix: default_temp_suffix(),
            failure_mode: FailureMode::Strict,
            metadata_table,
            tables,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Force the metadata table to be rebuilt.
    pub fn with_first_run(mut self, first_run: bool) -> Self {
        if first_run {
            let name = self.metadata_table.clone();
            for spec in self.tables.iter_mut().filter(|s| s.name == name) {
                spec.delete_if_exists = true;
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context.trim().is_empty() {
            return Err(ConfigError::EmptyContext);
        }

        for spec in &self.tables {
            let invalid = |reason: &str| ConfigError::InvalidTable {
                table: spec.name.clone(),
                reason: reason.to_string(),
            };
            if spec.name.trim().is_empty() {
                return Err(invalid("name cannot be empty"));
            }
            if spec.shard_count == 0 {
                return Err(invalid("shard_count must be at least 1"));
            }
            if spec.context.as_deref().is_some_and(|c| c.trim().is_empty()) {
                return Err(invalid("context cannot be empty"));
            }
        }

        match self.tables.iter().find(|s| s.name == self.metadata_table) {
            Some(spec) if spec.temporary => Ok(()),
            _ => Err(ConfigError::MetadataTable(self.metadata_table.clone())),
        }
    }

    /// Physical table the merge writes to.
    pub fn metadata_target(&self) -> String {
        format!("{}{}", self.metadata_table, self.temp_suffix)
    }
}
