//! Property-Based Tests for Shard Routing
//!
//! **Property: Period Routing**
//!
//! Two timestamps in the same calendar month SHALL route to the same shard
//! file; timestamps in different months SHALL NOT.
//!
//! **Property: Bounded Fan-Out**
//!
//! `period_keys` SHALL return one key per month for ranges up to the span
//! limit, in chronological order, and SHALL reject wider ranges.

use chrono::{Datelike, FixedOffset};
use ember_core::Timestamp;
use ember_storage::{ArchiveTool, ConnectionManager, ShardLayout, ShardedStore, StorageTuning};
use ember_test_utils::assertions::assert_span_exceeded;
use ember_test_utils::generators::{arb_time_range, arb_timestamp};
use proptest::prelude::*;

fn store_with_offset(dir: &std::path::Path, offset_hours: i32) -> ShardedStore {
    let offset = FixedOffset::east_opt(offset_hours * 3600).unwrap();
    ShardedStore::new(
        ConnectionManager::new(StorageTuning::default()),
        dir,
        ShardLayout::new("log", "log").with_utc_offset(offset),
        ArchiveTool::default(),
    )
    .unwrap()
}

fn months_between(offset_hours: i32, start: Timestamp, end: Timestamp) -> i32 {
    let offset = FixedOffset::east_opt(offset_hours * 3600).unwrap();
    let s = start.with_timezone(&offset);
    let e = end.with_timezone(&offset);
    (e.year() - s.year()) * 12 + e.month() as i32 - s.month() as i32 + 1
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_same_month_same_shard(
        a in arb_timestamp(),
        b in arb_timestamp(),
        offset in -12i32..=14,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_offset(dir.path(), offset);
        let tz = FixedOffset::east_opt(offset * 3600).unwrap();

        let la = a.with_timezone(&tz);
        let lb = b.with_timezone(&tz);
        let same_month = la.year() == lb.year() && la.month() == lb.month();

        let pa = store.shard_paths(&store.shard_key(a)).db;
        let pb = store.shard_paths(&store.shard_key(b)).db;
        prop_assert_eq!(same_month, pa == pb);
    }

    #[test]
    fn prop_period_keys_respect_span(
        (start, end) in arb_time_range(),
        offset in -12i32..=14,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_offset(dir.path(), offset);
        let months = months_between(offset, start, end);

        let result = store.period_keys(start, end);
        if months > 6 {
            assert_span_exceeded(&result, months as u32);
        } else {
            let keys = result.unwrap();
            prop_assert_eq!(keys.len() as i32, months);
            prop_assert_eq!(keys.first().cloned(), Some(store.shard_key(start)));
            prop_assert_eq!(keys.last().cloned(), Some(store.shard_key(end)));
            let mut sorted = keys.clone();
            sorted.sort();
            prop_assert_eq!(sorted, keys);
        }
    }
}
