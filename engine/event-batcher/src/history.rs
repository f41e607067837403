//! Time-bucketed metric history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Start of the bucket `at` falls into
pub fn bucket_start(at: DateTime<Utc>, width: chrono::Duration) -> DateTime<Utc> {
    let width_secs = width.num_seconds().max(1);
    let secs = at.timestamp();
    let start = secs - secs.rem_euclid(width_secs);
    DateTime::<Utc>::from_timestamp(start, 0).unwrap_or(at)
}

/// Contribution of one event to one metric's bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub metric_id: Uuid,
    pub bucket: DateTime<Utc>,
    pub value_pos: i64,
    pub value_neg: i64,
    /// Metric total right after the event was applied
    pub relative_total: i64,
    /// Metric event_count right after the event was applied
    pub relative_event_count: i64,
    /// Sub-metrics the event hit
    pub filter_ids: Vec<Uuid>,
}

/// A stored history row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryBucket {
    pub metric_id: Uuid,
    pub bucket: DateTime<Utc>,
    pub value_pos: i64,
    pub value_neg: i64,
    pub relative_total: i64,
    pub relative_event_count: i64,
    pub event_count: i64,
    pub filter_ids: Vec<Uuid>,
}

impl HistoryBucket {
    pub fn from_entry(entry: &HistoryEntry) -> Self {
        let mut filter_ids = entry.filter_ids.clone();
        filter_ids.sort_unstable();
        filter_ids.dedup();

        Self {
            metric_id: entry.metric_id,
            bucket: entry.bucket,
            value_pos: entry.value_pos,
            value_neg: entry.value_neg,
            relative_total: entry.relative_total,
            relative_event_count: entry.relative_event_count,
            event_count: 1,
            filter_ids,
        }
    }

    /// Fold another event into an existing bucket (increment in place)
    pub fn absorb(&mut self, entry: &HistoryEntry) {
        self.value_pos += entry.value_pos;
        self.value_neg += entry.value_neg;
        self.event_count += 1;

        // Relative values follow the most recent update of the metric row
        if entry.relative_event_count >= self.relative_event_count {
            self.relative_total = entry.relative_total;
            self.relative_event_count = entry.relative_event_count;
        }

        self.filter_ids.extend(entry.filter_ids.iter().copied());
        self.filter_ids.sort_unstable();
        self.filter_ids.dedup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bucket_truncation() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        let minute = bucket_start(at, chrono::Duration::seconds(60));
        assert_eq!(minute, Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 0).unwrap());

        let hour = bucket_start(at, chrono::Duration::hours(1));
        assert_eq!(hour, Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0).unwrap());

        // Already aligned timestamps map onto themselves
        assert_eq!(bucket_start(minute, chrono::Duration::seconds(60)), minute);
    }

    #[test]
    fn test_absorb_increments_in_place() {
        let metric_id = Uuid::new_v4();
        let bucket = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let filter = Uuid::new_v4();

        let first = HistoryEntry {
            metric_id,
            bucket,
            value_pos: 5,
            value_neg: 0,
            relative_total: 5,
            relative_event_count: 1,
            filter_ids: vec![filter],
        };
        let second = HistoryEntry {
            value_pos: 1,
            value_neg: 3,
            relative_total: 3,
            relative_event_count: 2,
            filter_ids: vec![filter],
            ..first.clone()
        };

        let mut row = HistoryBucket::from_entry(&first);
        row.absorb(&second);

        assert_eq!(row.value_pos, 6);
        assert_eq!(row.value_neg, 3);
        assert_eq!(row.event_count, 2);
        assert_eq!(row.relative_total, 3);
        assert_eq!(row.relative_event_count, 2);
        assert_eq!(row.filter_ids, vec![filter]);
    }

    #[test]
    fn test_stale_relative_values_ignored() {
        let entry = HistoryEntry {
            metric_id: Uuid::new_v4(),
            bucket: Utc::now(),
            value_pos: 1,
            value_neg: 0,
            relative_total: 40,
            relative_event_count: 9,
            filter_ids: Vec::new(),
        };
        let mut row = HistoryBucket::from_entry(&entry);
        row.absorb(&HistoryEntry { relative_total: 12, relative_event_count: 4, ..entry.clone() });

        assert_eq!(row.relative_total, 40);
        assert_eq!(row.relative_event_count, 9);
        assert_eq!(row.value_pos, 2);
    }
}
