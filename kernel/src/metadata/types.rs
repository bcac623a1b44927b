// Concrete Metadata Payloads
//
// Combine rules shared by all payloads:
// - scalar fields keep the earlier non-empty value
// - set fields union
// - counters sum (saturating at u64::MAX), extrema take the extremum

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{Combine, FeatureFactType, MetadataPayload};

fn keep_first(current: &mut String, other: String) {
    if current.is_empty() {
        *current = other;
    }
}

fn keep_first_opt<T>(current: &mut Option<T>, other: Option<T>) {
    if current.is_none() {
        *current = other;
    }
}

fn sum_counts(current: &mut BTreeMap<String, u64>, other: BTreeMap<String, u64>) {
    for (key, count) in other {
        let total = current.entry(key).or_insert(0);
        *total = total.saturating_add(count);
    }
}

/// A bucket (grouping of values) within a datasource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMetadata {
    pub id: String,
    #[serde(default)]
    pub datasource_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub visibility: BTreeSet<String>,
    #[serde(default)]
    pub domain_ids: BTreeSet<String>,
    /// Latest upstream run that touched the bucket.
    #[serde(default)]
    pub timestamp: u64,
}

impl Combine for BucketMetadata {
    fn combine(&mut self, other: Self) {
        keep_first(&mut self.datasource_id, other.datasource_id);
        keep_first(&mut self.name, other.name);
        keep_first_opt(&mut self.display_name, other.display_name);
        self.visibility.extend(other.visibility);
        self.domain_ids.extend(other.domain_ids);
        self.timestamp = self.timestamp.max(other.timestamp);
    }
}

impl MetadataPayload for BucketMetadata {
    type Id = String;

    fn id(&self) -> &String {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceMetadata {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bucket_ids: BTreeSet<String>,
    #[serde(default)]
    pub feature_ids: BTreeSet<String>,
}

impl Combine for DatasourceMetadata {
    fn combine(&mut self, other: Self) {
        keep_first(&mut self.name, other.name);
        keep_first(&mut self.description, other.description);
        self.bucket_ids.extend(other.bucket_ids);
        self.feature_ids.extend(other.feature_ids);
    }
}

impl MetadataPayload for DatasourceMetadata {
    type Id = String;

    fn id(&self) -> &String {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMetadata {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub datasource_ids: BTreeSet<String>,
}

impl Combine for DomainMetadata {
    fn combine(&mut self, other: Self) {
        keep_first(&mut self.name, other.name);
        keep_first(&mut self.description, other.description);
        self.datasource_ids.extend(other.datasource_ids);
    }
}

impl MetadataPayload for DomainMetadata {
    type Id = String;

    fn id(&self) -> &String {
        &self.id
    }
}

/// A feature extracted by one or more jobs, with per-bucket counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMetadata {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub fact_type: FeatureFactType,
    #[serde(default)]
    pub visibility: BTreeSet<String>,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub job_version: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Distinct values seen per bucket.
    #[serde(default)]
    pub bucket_value_count: BTreeMap<String, u64>,
    /// Fact occurrences per bucket.
    #[serde(default)]
    pub feature_fact_count: BTreeMap<String, u64>,
}

impl Combine for FeatureMetadata {
    fn combine(&mut self, other: Self) {
        keep_first(&mut self.name, other.name);
        keep_first(&mut self.api_version, other.api_version);
        keep_first(&mut self.job_version, other.job_version);
        self.visibility.extend(other.visibility);

        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        sum_counts(&mut self.bucket_value_count, other.bucket_value_count);
        sum_counts(&mut self.feature_fact_count, other.feature_fact_count);
    }
}

impl MetadataPayload for FeatureMetadata {
    type Id = String;

    fn id(&self) -> &String {
        &self.id
    }
}
