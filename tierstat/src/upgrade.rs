//! Resampling records into a new span layout.
//!
//! When the configured [`SpanSet`] changes, stored records keep their old
//! layout until they are upgraded. Upgrading builds an empty record with the
//! new layout and replays every occupied bucket of the old one, oldest first,
//! at the last second the bucket covered. Anything older than the new coarsest
//! span ages out during the replay, so migration is best effort.

use tracing::debug;

use crate::record::{MetricRecord, Point};
use crate::rollup::RollupEngine;
use crate::schema::SpanSet;

/// Rebuilds `record` under `spans`.
///
/// Identity, `seq`, expiration and source are carried over unchanged.
pub fn migrate(record: &MetricRecord, spans: &SpanSet, engine: &RollupEngine) -> MetricRecord {
    let mut upgraded = MetricRecord::new(&record.key(), spans);
    upgraded.seq = record.seq;
    upgraded.expires = record.expires;
    upgraded.source.clone_from(&record.source);

    let mut history: Vec<(u64, &Point)> = record
        .spans
        .iter()
        .flat_map(|span| {
            span.points
                .iter()
                .enumerate()
                .filter(|(_, point)| point.count > 0)
                .map(move |(index, point)| (span.closing(index).saturating_sub(1), point))
        })
        .collect();
    history.sort_by_key(|(timestamp, _)| *timestamp);

    for (timestamp, point) in &history {
        let index = RollupEngine::resolve_span(&upgraded, *timestamp)
            .unwrap_or(upgraded.spans.len() - 1);
        engine.add_value(&mut upgraded, *timestamp, point, index, None);
    }

    debug!(
        key = %record.key(),
        buckets = history.len(),
        before = record.total_count(),
        after = upgraded.total_count(),
        "upgraded record layout"
    );

    upgraded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKey;
    use crate::schema::SpanConfig;

    const T0: u64 = 1_700_000_100;

    fn two_tier() -> SpanSet {
        SpanSet::new(vec![
            SpanConfig::new(300, 10).unwrap(),
            SpanConfig::new(3600, 12).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn test_migrate_preserves_counts_and_identity() {
        let engine = RollupEngine::default();
        let key = RecordKey::new("acme", "api", "latency", &Default::default());
        let mut record = MetricRecord::new(&key, &SpanSet::default());
        record.seq = 7;
        record.source = Some("svc".to_string());

        for i in 0..40u64 {
            let ts = T0 + i * 45;
            let index = RollupEngine::resolve_span(&record, ts).unwrap();
            engine.add_value(&mut record, ts, &Point::value(2.0), index, None);
        }

        let upgraded = migrate(&record, &two_tier(), &engine);

        assert_eq!(upgraded.spans.len(), 2);
        assert!(upgraded.matches_spans(&two_tier()));
        assert_eq!(upgraded.seq, 7);
        assert_eq!(upgraded.source.as_deref(), Some("svc"));
        assert_eq!(upgraded.total_count(), 40);
        let total: f64 = upgraded
            .spans
            .iter()
            .flat_map(|s| s.points.iter())
            .map(|p| p.sum)
            .sum();
        assert_eq!(total, 80.0);
    }

    #[test]
    fn test_migrate_keeps_fine_buckets_when_interval_matches() {
        let engine = RollupEngine::default();
        let key = RecordKey::new("acme", "api", "latency", &Default::default());
        let mut record = MetricRecord::new(&key, &two_tier());

        for i in 0..5u64 {
            engine.add_value(&mut record, T0 + i * 30, &Point::value(3.0), 0, None);
        }

        let upgraded = migrate(&record, &SpanSet::default(), &engine);

        let fine = &upgraded.spans[0];
        assert_eq!(fine.points.len(), 5);
        assert!(fine.points.iter().all(|p| p.count == 1 && p.sum == 3.0));
        assert_eq!(fine.end, record.spans[0].end);
        assert!(upgraded.spans[1..].iter().all(|s| s.points.is_empty()));
    }
}
