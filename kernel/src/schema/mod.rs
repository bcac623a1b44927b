// Table Schema
//
// Declarative description of the tables the pipeline needs, and
// the pure helpers used to provision them: physical name
// resolution and shard split computation.

pub mod aggregation;
pub mod provision;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub use aggregation::{AggregationBinding, AggregationProfile, CompactionPhase};
pub use provision::{
    compact_table, set_property_all, FailureMode, ProvisionError, ProvisionReport,
    SchemaProvisioner, SubStep, TableAction, TableLocks, TableOutcome,
};

/// Property restricting which server-side code may run against a table.
pub const CONTEXT_PROPERTY: &str = "table.classpath.context";

/// Context used when neither the table nor the job names one.
pub const DEFAULT_CONTEXT: &str = "keel";

/// Separator appended to every split marker.
pub const SPLIT_SEPARATOR: char = ':';

fn default_shard_count() -> u32 {
    1
}

/// Desired state of one logical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    /// Overrides the job-wide context when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Explicit split points; replaces the ones derived from `shard_count`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splits: Option<BTreeSet<String>>,
    #[serde(default)]
    pub delete_if_exists: bool,
    #[serde(default)]
    pub temporary: bool,
    #[serde(default)]
    pub aggregation: Option<AggregationProfile>,
    /// Run a flush and full compaction once the table is created.
    #[serde(default)]
    pub compact_after_create: bool,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            context: Some(context.into()),
            ..Self::named(name)
        }
    }

    /// A table that inherits the provisioner's context.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: None,
            shard_count: 1,
            splits: None,
            delete_if_exists: false,
            temporary: false,
            aggregation: None,
            compact_after_create: false,
        }
    }

    pub fn shards(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn splits(mut self, splits: BTreeSet<String>) -> Self {
        self.splits = Some(splits);
        self
    }

    pub fn delete_if_exists(mut self, delete: bool) -> Self {
        self.delete_if_exists = delete;
        self
    }

    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    pub fn aggregation(mut self, profile: AggregationProfile) -> Self {
        self.aggregation = Some(profile);
        self
    }

    pub fn compact_after_create(mut self, compact: bool) -> Self {
        self.compact_after_create = compact;
        self
    }

    /// Split points to add after create.
    pub fn split_points(&self) -> BTreeSet<String> {
        match &self.splits {
            Some(splits) => splits.clone(),
            None => default_splits(self.shard_count),
        }
    }

    /// Name of the table as it exists in the store.
    pub fn physical_name(&self, temp_suffix: &str) -> String {
        if self.temporary {
            format!("{}{}", self.name, temp_suffix)
        } else {
            self.name.clone()
        }
    }
}

/// Split markers partitioning an integer-prefixed keyspace into
/// `shard_count` contiguous ranges.
///
/// Markers are `"1:"`, `"2:"`, ... `"{n-1}:"`. One shard (or zero)
/// yields no splits.
pub fn default_splits(shard_count: u32) -> BTreeSet<String> {
    (1..shard_count)
        .map(|i| format!("{i}{SPLIT_SEPARATOR}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_shard_has_no_splits() {
        assert!(default_splits(1).is_empty());
        assert!(default_splits(0).is_empty());
    }

    #[test]
    fn splits_are_n_minus_one_and_strictly_increasing() {
        for n in [2, 5, 12, 40] {
            let splits = default_splits(n);
            assert_eq!(splits.len(), (n - 1) as usize);

            let ordered: Vec<_> = splits.iter().collect();
            assert!(ordered.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn splits_are_deterministic() {
        assert_eq!(default_splits(12), default_splits(12));
        assert!(default_splits(3).contains("1:"));
        assert!(default_splits(3).contains("2:"));
    }

    #[test]
    fn temporary_tables_get_suffix() {
        let spec = TableSpec::new("meta", "keel").temporary(true);
        assert_eq!(spec.physical_name("_temp"), "meta_temp");
        assert_eq!(TableSpec::new("meta", "keel").physical_name("_temp"), "meta");
    }

    #[test]
    fn table_spec_fills_defaults_when_parsed() {
        let spec: TableSpec =
            serde_json::from_str(r#"{"name": "result", "context": "keel"}"#).unwrap();
        assert_eq!(spec, TableSpec::new("result", "keel"));

        let inherited: TableSpec = serde_json::from_str(r#"{"name": "result"}"#).unwrap();
        assert_eq!(inherited, TableSpec::named("result"));
        assert_eq!(inherited.context, None);
    }

    #[test]
    fn explicit_splits_override_shard_count() {
        let custom: BTreeSet<String> = ["a", "m", "t"].iter().map(|s| s.to_string()).collect();
        let spec = TableSpec::new("result", "keel").shards(8).splits(custom.clone());

        assert_eq!(spec.split_points(), custom);
        assert_eq!(TableSpec::named("result").shards(3).split_points(), default_splits(3));

        let parsed: TableSpec =
            serde_json::from_str(r#"{"name": "result", "splits": ["m", "a", "t"]}"#).unwrap();
        assert_eq!(parsed.split_points(), custom);
    }
}
