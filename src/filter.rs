use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{event::Event, partition::which_partition};

/// Declarative query predicate over the event stream.
///
/// The three clauses are ANDed together:
/// - aggregate types: OR within the set, empty selects any type;
/// - labels: for each key an OR-set of acceptable values, distinct keys are
///   AND-combined (`geo IN (EU, US) AND tier = gold`);
/// - partition range: `[partition_low, partition_hi]` inclusive over
///   `hash % partitions`; `partitions == 0` selects all partitions.
///
/// Backends encode the same semantics into their native queries;
/// [`Filter::matches`] is the consumer-side evaluation used by the CDC paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub aggregate_types: Vec<String>,
    pub labels: BTreeMap<String, Vec<String>>,
    pub partitions: u32,
    pub partition_low: u32,
    pub partition_hi: u32,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_aggregate_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregate_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Adds one acceptable value to the OR-set of `key`.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.entry(key.into()).or_default().push(value.into());
        self
    }

    pub fn with_label_map(mut self, labels: BTreeMap<String, Vec<String>>) -> Self {
        self.labels = labels;
        self
    }

    /// Restricts to the partition range `[low, hi]`. Ignored when
    /// `partitions <= 1`, mirroring the partitioner.
    pub fn with_partitions(mut self, partitions: u32, low: u32, hi: u32) -> Self {
        if partitions <= 1 {
            return self;
        }
        self.partitions = partitions;
        self.partition_low = low;
        self.partition_hi = hi;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.aggregate_types.is_empty() && self.labels.is_empty() && self.partitions == 0
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.aggregate_types.is_empty()
            && !self.aggregate_types.iter().any(|t| *t == event.aggregate_type)
        {
            return false;
        }

        for (key, accepted) in &self.labels {
            match event.labels.get(key) {
                Some(value) if accepted.iter().any(|v| v == value) => {}
                _ => return false,
            }
        }

        self.in_partition_range(event.aggregate_id_hash)
    }

    pub fn in_partition_range(&self, hash: u32) -> bool {
        if self.partitions == 0 {
            return true;
        }
        let part = which_partition(hash, self.partitions);
        part >= self.partition_low && part <= self.partition_hi
    }
}
