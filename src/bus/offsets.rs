//! Commit positions for a consumer group whose deliveries settle out of order.

#![cfg_attr(not(feature = "kafka"), allow(dead_code))]

use std::collections::{BTreeMap, HashMap};

/// Offsets read but not yet committed, per topic partition.
///
/// A partition's commit position only moves past an offset once it and every
/// offset before it have been acknowledged, so a message still in flight (or
/// given back) is read again after a restart.
#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    /// offset -> acknowledged
    partitions: HashMap<(String, i32), BTreeMap<i64, bool>>,
}

impl OffsetTracker {
    pub(crate) fn track(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .insert(offset, false);
    }

    /// Marks `offset` handled and returns the new commit position, if it moved.
    pub(crate) fn ack(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let pending = self.partitions.get_mut(&(topic.to_string(), partition))?;
        if let Some(done) = pending.get_mut(&offset) {
            *done = true;
        }

        let mut next = None;
        while let Some(entry) = pending.first_entry() {
            if !*entry.get() {
                break;
            }
            next = Some(*entry.key() + 1);
            entry.remove();
        }
        next
    }
}
