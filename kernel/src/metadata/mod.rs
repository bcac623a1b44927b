// Metadata Fragments
//
// Typed metadata produced by upstream tasks. Each category has a
// concrete payload type that knows how to combine with another
// fragment of the same identity.

pub mod types;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use types::{BucketMetadata, DatasourceMetadata, DomainMetadata, FeatureMetadata};

/// Closed set of metadata categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetadataKind {
    Bucket,
    Datasource,
    Domain,
    Feature,
}

impl MetadataKind {
    pub const ALL: [MetadataKind; 4] = [
        MetadataKind::Bucket,
        MetadataKind::Datasource,
        MetadataKind::Domain,
        MetadataKind::Feature,
    ];

    /// Type key as it appears on the fragment stream.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataKind::Bucket => "bucket",
            MetadataKind::Datasource => "datasource",
            MetadataKind::Domain => "domain",
            MetadataKind::Feature => "feature",
        }
    }

    /// Returns `None` for type keys outside the known set.
    pub fn parse(type_key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == type_key)
    }
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categories of feature facts. Also the value types that store-side
/// aggregators are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FeatureFactType {
    Nominal,
    Ordinal,
    Interval,
    Ratio,
    Date,
    DateHour,
}

impl FeatureFactType {
    pub const ALL: [FeatureFactType; 6] = [
        FeatureFactType::Nominal,
        FeatureFactType::Ordinal,
        FeatureFactType::Interval,
        FeatureFactType::Ratio,
        FeatureFactType::Date,
        FeatureFactType::DateHour,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FeatureFactType::Nominal => "NOMINAL",
            FeatureFactType::Ordinal => "ORDINAL",
            FeatureFactType::Interval => "INTERVAL",
            FeatureFactType::Ratio => "RATIO",
            FeatureFactType::Date => "DATE",
            FeatureFactType::DateHour => "DATEHOUR",
        }
    }
}

/// In-place semigroup combine.
///
/// Implementations must be associative. Commutativity is not
/// required; `self` is always the earlier fragment.
pub trait Combine {
    fn combine(&mut self, other: Self);
}

/// A metadata payload that can be decoded, combined and written.
pub trait MetadataPayload: Combine + Serialize + DeserializeOwned {
    type Id: Ord + Clone + fmt::Display + fmt::Debug;

    fn id(&self) -> &Self::Id;
}
