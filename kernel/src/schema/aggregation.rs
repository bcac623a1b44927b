// Store-Side Aggregation Bindings
//
// Declarative description of which combiner the store runs for
// each (compaction phase, value type). Rendered into table
// properties; the kernel never executes these combiners itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metadata::FeatureFactType;

pub const ITERATOR_PREFIX: &str = "table.iterator";
pub const AGGREGATING_ITERATOR: &str = "keel.iterators.AggregatingIterator";
pub const BITMAP_COMBINER: &str = "keel.iterators.BitmapAggregator";
pub const INDEX_COUNT_COMBINER: &str = "keel.iterators.IndexCountAggregator";

/// When the store applies an aggregating iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CompactionPhase {
    MajorCompaction,
    MinorCompaction,
    ScanTime,
}

impl CompactionPhase {
    pub const ALL: [CompactionPhase; 3] = [
        CompactionPhase::MajorCompaction,
        CompactionPhase::MinorCompaction,
        CompactionPhase::ScanTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompactionPhase::MajorCompaction => "majc",
            CompactionPhase::MinorCompaction => "minc",
            CompactionPhase::ScanTime => "scan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationBinding {
    pub phase: CompactionPhase,
    pub value_type: FeatureFactType,
    pub combiner: String,
}

/// Aggregating iterator attachment plus its per-type combiners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationProfile {
    pub group: String,
    pub priority: u32,
    pub iterator: String,
    pub phases: Vec<CompactionPhase>,
    /// Combiner for values that carry no fact type (`<phase>.agg.opt.`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_combiner: Option<String>,
    #[serde(default)]
    pub bindings: Vec<AggregationBinding>,
}

impl AggregationProfile {
    /// Aggregating iterator on every phase, no combiners bound.
    pub fn aggregating() -> Self {
        Self {
            group: "agg".into(),
            priority: 10,
            iterator: AGGREGATING_ITERATOR.into(),
            phases: CompactionPhase::ALL.to_vec(),
            default_combiner: None,
            bindings: Vec::new(),
        }
    }

    /// Every fact type combined as bitmaps, untyped values included.
    pub fn bitmap() -> Self {
        let mut profile = Self::aggregating().bind_all(BITMAP_COMBINER);
        profile.default_combiner = Some(BITMAP_COMBINER.into());
        profile
    }

    /// Every fact type combined as index counts.
    pub fn index_count() -> Self {
        Self::aggregating().bind_all(INDEX_COUNT_COMBINER)
    }

    /// Bind `combiner` for every (phase, type) pair on this profile.
    pub fn bind_all(mut self, combiner: &str) -> Self {
        for phase in self.phases.clone() {
            for value_type in FeatureFactType::ALL {
                self.bind(phase, value_type, combiner);
            }
        }
        self
    }

    /// Bind a combiner, replacing any previous binding for the pair.
    pub fn bind(&mut self, phase: CompactionPhase, value_type: FeatureFactType, combiner: &str) {
        match self
            .bindings
            .iter_mut()
            .find(|b| b.phase == phase && b.value_type == value_type)
        {
            Some(existing) => existing.combiner = combiner.to_string(),
            None => self.bindings.push(AggregationBinding {
                phase,
                value_type,
                combiner: combiner.to_string(),
            }),
        }
    }

    pub fn combiner(&self, phase: CompactionPhase, value_type: FeatureFactType) -> Option<&str> {
        self.bindings
            .iter()
            .rev()
            .find(|b| b.phase == phase && b.value_type == value_type)
            .map(|b| b.combiner.as_str())
    }

    /// Table properties in key order.
    ///
    /// Later bindings for the same pair win, so a hand-written
    /// profile with duplicates still renders one value per key.
    pub fn properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        for phase in &self.phases {
            props.insert(
                self.iterator_key(*phase),
                format!("{},{}", self.priority, self.iterator),
            );
        }
        if let Some(combiner) = &self.default_combiner {
            for phase in &self.phases {
                props.insert(format!("{}.opt.", self.iterator_key(*phase)), combiner.clone());
            }
        }
        for binding in &self.bindings {
            if !self.phases.contains(&binding.phase) {
                continue;
            }
            props.insert(
                format!(
                    "{}.opt.{}",
                    self.iterator_key(binding.phase),
                    binding.value_type.name()
                ),
                binding.combiner.clone(),
            );
        }
        props
    }

    fn iterator_key(&self, phase: CompactionPhase) -> String {
        format!("{ITERATOR_PREFIX}.{}.{}", phase.as_str(), self.group)
    }
}
