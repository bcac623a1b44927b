// Consolidation Merge
//
// Folds a sorted stream of serialized metadata fragments into one
// record per (type key, identity) and hands each record to a
// mutation sink.
//
// Stream contract:
// - fragments are grouped by type key
// - identities ascend within a group, so equal identities are adjacent
//
// The merge holds a single accumulator at a time and combines
// strictly in arrival order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::metadata::{
    BucketMetadata, DatasourceMetadata, DomainMetadata, FeatureMetadata, MetadataKind,
    MetadataPayload,
};
use crate::store::{Mutation, MutationSink, StoreError};

/// Qualifier of the cell holding the serialized record.
pub const RECORD_QUALIFIER: &str = "json";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MergeError {
    /// Only the offending group is skipped.
    #[error("unknown metadata type `{type_key}`")]
    UnknownMetadataType { type_key: String },

    #[error("fragment {position} of type `{type_key}` could not be decoded: {reason}")]
    FragmentDecode {
        position: usize,
        type_key: String,
        reason: String,
    },

    #[error("fragment {position} of type `{type_key}` is out of order")]
    OutOfOrder { position: usize, type_key: String },

    #[error("record `{row}` could not be encoded: {reason}")]
    Encode { row: String, reason: String },

    #[error("write of `{row}` to `{table}` failed: {source}")]
    Write {
        table: String,
        row: String,
        #[source]
        source: StoreError,
    },
}

/// Summary of a completed merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub fragments: usize,
    pub records: BTreeMap<MetadataKind, usize>,
    /// Groups skipped because of an unrecognised type key.
    pub rejected: Vec<MergeError>,
}

impl MergeReport {
    pub fn records_written(&self) -> usize {
        self.records.values().sum()
    }

    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    pub fn rejected_type_keys(&self) -> Vec<String> {
        self.rejected
            .iter()
            .filter_map(|err| match err {
                MergeError::UnknownMetadataType { type_key } => Some(type_key.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Row key for a consolidated record.
pub fn row_key(type_key: &str, id: &impl std::fmt::Display) -> String {
    format!("{type_key}:{id}")
}

/// Single-writer merger targeting one table.
#[derive(Debug, Clone)]
pub struct ConsolidationMerger {
    table: String,
}

impl ConsolidationMerger {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Merge the whole stream into `sink`.
    ///
    /// Decode, ordering and write failures abort the merge. Unknown
    /// type keys abort only their own group and are listed in the
    /// report.
    pub fn merge<I, S>(&self, source: I, sink: &mut S) -> Result<MergeReport, MergeError>
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
        S: MutationSink + ?Sized,
    {
        let mut records = BTreeMap::new();
        let mut rejected = Vec::new();

        let fragments = for_each_group(source, |type_key, group| {
            let Some(kind) = MetadataKind::parse(type_key) else {
                let skipped = group.count();
                warn!(type_key, skipped, "unknown metadata type, group skipped");
                rejected.push(MergeError::UnknownMetadataType {
                    type_key: type_key.to_string(),
                });
                return Ok(());
            };

            let written = match kind {
                MetadataKind::Bucket => {
                    merge_run::<BucketMetadata, _, _>(type_key, group, &self.table, &mut *sink)?
                }
                MetadataKind::Datasource => {
                    merge_run::<DatasourceMetadata, _, _>(type_key, group, &self.table, &mut *sink)?
                }
                MetadataKind::Domain => {
                    merge_run::<DomainMetadata, _, _>(type_key, group, &self.table, &mut *sink)?
                }
                MetadataKind::Feature => {
                    merge_run::<FeatureMetadata, _, _>(type_key, group, &self.table, &mut *sink)?
                }
            };
            debug!(%kind, written, "metadata group merged");
            records.insert(kind, written);
            Ok(())
        })?;

        let report = MergeReport {
            fragments,
            records,
            rejected,
        };
        info!(
            table = %self.table,
            fragments = report.fragments,
            records = report.records_written(),
            rejected = report.rejected.len(),
            "merge complete"
        );
        Ok(report)
    }
}

/// Split the stream into contiguous type-key groups and hand each
/// group to `on_group`. Returns the number of fragments consumed.
///
/// A type key that reappears after its group ended is reported as
/// out of order.
fn for_each_group<I, F>(source: I, mut on_group: F) -> Result<usize, MergeError>
where
    I: IntoIterator<Item = (String, Vec<u8>)>,
    F: FnMut(&str, &mut dyn Iterator<Item = (usize, Vec<u8>)>) -> Result<(), MergeError>,
{
    let mut stream = source.into_iter().enumerate().peekable();
    let mut closed = BTreeSet::new();
    let mut consumed = 0;

    loop {
        let Some((position, type_key)) = stream.peek().map(|(pos, (key, _))| (*pos, key.clone()))
        else {
            break;
        };
        if !closed.insert(type_key.clone()) {
            return Err(MergeError::OutOfOrder { position, type_key });
        }

        let mut group = std::iter::from_fn(|| {
            stream
                .next_if(|(_, (key, _))| *key == type_key)
                .map(|(pos, (_, bytes))| {
                    consumed += 1;
                    (pos, bytes)
                })
        });
        on_group(&type_key, &mut group)?;
        group.for_each(drop);
    }

    Ok(consumed)
}

/// Fold one type-key group of `T` fragments, emitting a record each
/// time the identity changes and once more for the trailing run.
///
/// Returns the number of records written.
pub fn merge_run<T, I, S>(
    type_key: &str,
    fragments: I,
    table: &str,
    sink: &mut S,
) -> Result<usize, MergeError>
where
    T: MetadataPayload,
    I: IntoIterator<Item = (usize, Vec<u8>)>,
    S: MutationSink + ?Sized,
{
    let mut current: Option<T> = None;
    let mut written = 0;

    for (position, bytes) in fragments {
        let fragment: T =
            serde_json::from_slice(&bytes).map_err(|err| MergeError::FragmentDecode {
                position,
                type_key: type_key.to_string(),
                reason: err.to_string(),
            })?;

        current = match current.take() {
            None => Some(fragment),
            Some(mut acc) => match fragment.id().cmp(acc.id()) {
                Ordering::Equal => {
                    acc.combine(fragment);
                    Some(acc)
                }
                Ordering::Greater => {
                    emit(type_key, &acc, table, sink)?;
                    written += 1;
                    Some(fragment)
                }
                Ordering::Less => {
                    return Err(MergeError::OutOfOrder {
                        position,
                        type_key: type_key.to_string(),
                    })
                }
            },
        };
    }

    if let Some(acc) = current {
        emit(type_key, &acc, table, sink)?;
        written += 1;
    }

    Ok(written)
}

/// Build the row mutation for a finalized record.
pub fn to_mutation<T: MetadataPayload>(type_key: &str, record: &T) -> Result<Mutation, MergeError> {
    let row = row_key(type_key, record.id());
    let value = serde_json::to_vec(record).map_err(|err| MergeError::Encode {
        row: row.clone(),
        reason: err.to_string(),
    })?;
    Ok(Mutation::new(row).put(type_key, RECORD_QUALIFIER, value))
}

fn emit<T, S>(type_key: &str, record: &T, table: &str, sink: &mut S) -> Result<(), MergeError>
where
    T: MetadataPayload,
    S: MutationSink + ?Sized,
{
    let mutation = to_mutation(type_key, record)?;
    let row = mutation.row.clone();
    sink.write(table, mutation)
        .map_err(|source| MergeError::Write {
            table: table.to_string(),
            row,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Combine;
    use crate::store::MutationBuffer;
    use serde::{Deserialize, Serialize};

    /// Deliberately non-commutative: combine concatenates.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Note {
        id: u32,
        text: String,
    }

    impl Combine for Note {
        fn combine(&mut self, other: Self) {
            self.text.push_str(&other.text);
        }
    }

    impl MetadataPayload for Note {
        type Id = u32;

        fn id(&self) -> &u32 {
            &self.id
        }
    }

    fn note(key: &str, id: u32, text: &str) -> (String, Vec<u8>) {
        let bytes = serde_json::to_vec(&Note {
            id,
            text: text.into(),
        })
        .unwrap();
        (key.to_string(), bytes)
    }

    fn fragment(key: &str, json: &str) -> (String, Vec<u8>) {
        (key.to_string(), json.as_bytes().to_vec())
    }

    /// Run the grouping loop with every group decoded as `Note`.
    fn merge_notes(stream: Vec<(String, Vec<u8>)>) -> Vec<(String, Note)> {
        let mut buffer = MutationBuffer::new();
        for_each_group(stream, |key, group| {
            merge_run::<Note, _, _>(key, group, "meta_temp", &mut buffer).map(|_| ())
        })
        .unwrap();
        decode(&buffer)
    }

    fn decode<T: serde::de::DeserializeOwned>(buffer: &MutationBuffer) -> Vec<(String, T)> {
        buffer
            .pending()
            .map(|(_, m)| (m.row.clone(), serde_json::from_slice(&m.cells[0].value).unwrap()))
            .collect()
    }

    #[test]
    fn groups_and_combines_adjacent_identities() {
        let out = merge_notes(vec![
            note("A", 1, "x"),
            note("A", 1, "y"),
            note("A", 2, "z"),
            note("B", 1, "w"),
        ]);

        let rows: Vec<_> = out.iter().map(|(row, n)| (row.as_str(), n.text.as_str())).collect();
        assert_eq!(rows, vec![("A:1", "xy"), ("A:2", "z"), ("B:1", "w")]);
    }

    #[test]
    fn trailing_run_is_flushed_once() {
        let out = merge_notes(vec![
            note("A", 1, "a"),
            note("A", 2, "b"),
            note("A", 2, "c"),
        ]);

        assert_eq!(out.len(), 2);
        assert_eq!(out[1].1.text, "bc");
    }

    #[test]
    fn merged_value_equals_left_fold() {
        let (a, b, c) = (
            Note { id: 7, text: "a".into() },
            Note { id: 7, text: "b".into() },
            Note { id: 7, text: "c".into() },
        );
        let mut expected = a.clone();
        expected.combine(b.clone());
        expected.combine(c.clone());

        let stream = [a, b, c]
            .iter()
            .map(|n| ("A".to_string(), serde_json::to_vec(n).unwrap()))
            .collect();
        let out = merge_notes(stream);

        assert_eq!(out, vec![("A:7".to_string(), expected)]);
    }

    #[test]
    fn reordering_equal_identities_changes_non_commutative_output() {
        let forward = merge_notes(vec![note("A", 1, "x"), note("A", 1, "y")]);
        let reversed = merge_notes(vec![note("A", 1, "y"), note("A", 1, "x")]);

        assert_eq!(forward[0].1.text, "xy");
        assert_eq!(reversed[0].1.text, "yx");
        assert_ne!(forward, reversed);
    }

    #[test]
    fn domain_description_depends_on_arrival_order() {
        let first = fragment("domain", r#"{"id": "d1", "description": "people"}"#);
        let second = fragment("domain", r#"{"id": "d1", "description": "places"}"#);

        let merger = ConsolidationMerger::new("meta_temp");
        let mut forward = MutationBuffer::new();
        merger
            .merge(vec![first.clone(), second.clone()], &mut forward)
            .unwrap();
        let mut reversed = MutationBuffer::new();
        merger.merge(vec![second, first], &mut reversed).unwrap();

        let forward: Vec<(String, DomainMetadata)> = decode(&forward);
        let reversed: Vec<(String, DomainMetadata)> = decode(&reversed);
        assert_eq!(forward[0].1.description, "people");
        assert_eq!(reversed[0].1.description, "places");
    }

    #[test]
    fn unknown_type_group_is_isolated() {
        let stream = vec![
            fragment("bucket", r#"{"id": "b1", "name": "zip"}"#),
            fragment("bucket", r#"{"id": "b1", "domain_ids": ["d1"]}"#),
            fragment("hypothesis", r#"{"id": "h1"}"#),
            fragment("hypothesis", r#"not even json"#),
            fragment("domain", r#"{"id": "d1", "name": "geo"}"#),
        ];

        let mut buffer = MutationBuffer::new();
        let report = ConsolidationMerger::new("meta_temp")
            .merge(stream, &mut buffer)
            .unwrap();

        assert_eq!(report.fragments, 5);
        assert_eq!(report.records[&MetadataKind::Bucket], 1);
        assert_eq!(report.records[&MetadataKind::Domain], 1);
        assert_eq!(report.rejected_type_keys(), vec!["hypothesis"]);

        let rows: Vec<_> = buffer.pending().map(|(_, m)| m.row.clone()).collect();
        assert_eq!(rows, vec!["bucket:b1", "domain:d1"]);
    }

    #[test]
    fn feature_counts_near_the_limit_merge_without_panicking() {
        let max = u64::MAX;
        let stream = vec![
            fragment(
                "feature",
                &format!(r#"{{"id": "f1", "fact_type": "Ratio", "feature_fact_count": {{"b": {max}}}}}"#),
            ),
            fragment(
                "feature",
                r#"{"id": "f1", "fact_type": "Ratio", "feature_fact_count": {"b": 1}}"#,
            ),
        ];

        let mut buffer = MutationBuffer::new();
        ConsolidationMerger::new("meta_temp")
            .merge(stream, &mut buffer)
            .unwrap();

        let out: Vec<(String, FeatureMetadata)> = decode(&buffer);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.feature_fact_count["b"], u64::MAX);
    }

    #[test]
    fn records_carry_type_family_and_json_cell() {
        let mut buffer = MutationBuffer::new();
        ConsolidationMerger::new("meta_temp")
            .merge(
                vec![fragment(
                    "feature",
                    r#"{"id": "f1", "fact_type": "Nominal", "feature_fact_count": {"b1": 4}}"#,
                )],
                &mut buffer,
            )
            .unwrap();

        let (table, mutation) = buffer.pending().next().unwrap();
        assert_eq!(table, "meta_temp");
        assert_eq!(mutation.row, "feature:f1");
        assert_eq!(mutation.cells[0].family, "feature");
        assert_eq!(mutation.cells[0].qualifier, RECORD_QUALIFIER);
    }

    #[test]
    fn decode_failure_is_fatal_and_names_position() {
        let stream = vec![
            fragment("domain", r#"{"id": "d1"}"#),
            fragment("feature", r#"{"id": "f1", "fact_type": "Nominal"}"#),
            fragment("feature", r#"null"#),
        ];

        let mut buffer = MutationBuffer::new();
        let err = ConsolidationMerger::new("meta_temp")
            .merge(stream, &mut buffer)
            .unwrap_err();

        match err {
            MergeError::FragmentDecode {
                position, type_key, ..
            } => {
                assert_eq!(position, 2);
                assert_eq!(type_key, "feature");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn descending_identity_is_rejected() {
        let stream = vec![
            fragment("domain", r#"{"id": "d2"}"#),
            fragment("domain", r#"{"id": "d1"}"#),
        ];

        let err = ConsolidationMerger::new("meta_temp")
            .merge(stream, &mut MutationBuffer::new())
            .unwrap_err();

        assert_eq!(
            err,
            MergeError::OutOfOrder {
                position: 1,
                type_key: "domain".into()
            }
        );
    }

    #[test]
    fn reopened_group_is_rejected() {
        let stream = vec![
            fragment("domain", r#"{"id": "d1"}"#),
            fragment("bucket", r#"{"id": "b1"}"#),
            fragment("domain", r#"{"id": "d2"}"#),
        ];

        let err = ConsolidationMerger::new("meta_temp")
            .merge(stream, &mut MutationBuffer::new())
            .unwrap_err();

        assert!(matches!(err, MergeError::OutOfOrder { position: 2, .. }));
    }

    #[test]
    fn empty_stream_writes_nothing() {
        let mut buffer = MutationBuffer::new();
        let report = ConsolidationMerger::new("meta_temp")
            .merge(Vec::new(), &mut buffer)
            .unwrap();

        assert_eq!(report, MergeReport::default());
        assert!(buffer.is_empty());
    }

    #[test]
    fn rerun_produces_identical_records() {
        let stream = vec![
            fragment("datasource", r#"{"id": "ds1", "bucket_ids": ["b2"]}"#),
            fragment("datasource", r#"{"id": "ds1", "bucket_ids": ["b1"]}"#),
            fragment("datasource", r#"{"id": "ds2"}"#),
        ];
        let merger = ConsolidationMerger::new("meta_temp");

        let mut first = MutationBuffer::new();
        merger.merge(stream.clone(), &mut first).unwrap();
        let mut second = MutationBuffer::new();
        merger.merge(stream, &mut second).unwrap();

        let first: Vec<_> = first.pending().cloned().collect();
        let second: Vec<_> = second.pending().cloned().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }
}
