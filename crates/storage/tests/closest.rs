//! Closest-to lookup against a brute-force model.

use std::sync::Arc;
use std::time::Duration;

use foursight_interchange::{CheckResult, CheckStatus, RunId};
use foursight_storage::{closest_run, MemoryObjectStore, ResultStore};
use proptest::prelude::*;
use time::OffsetDateTime;

const BASE: i64 = 1_704_067_200; // 2024-01-01T00:00:00Z

fn at(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(BASE + secs).unwrap()
}

fn model(times: &[i64], target: i64, tolerance: i64) -> Option<i64> {
    let mut best: Option<(i64, i64)> = None;
    for &t in times {
        let d = (t - target).abs();
        if d > tolerance {
            continue;
        }
        match best {
            Some((_, bd)) if bd <= d => {}
            _ => best = Some((t, d)),
        }
    }
    best.map(|(t, _)| t)
}

proptest! {
    #[test]
    fn closest_matches_model(
        times in prop::collection::btree_set(0i64..10_000, 1..30),
        target in -500i64..10_500,
        tolerance in 0i64..2_000,
    ) {
        let times: Vec<i64> = times.into_iter().collect();
        let ids: Vec<RunId> = times.iter().map(|&t| RunId::from_datetime(at(t))).collect();
        let got = closest_run(&ids, at(target), Duration::from_secs(tolerance as u64));
        let expected = model(&times, target, tolerance).map(|t| RunId::from_datetime(at(t)));
        prop_assert_eq!(got.cloned(), expected);
    }
}

#[tokio::test]
async fn closest_through_store_matches_model() {
    let results = ResultStore::new(Arc::new(MemoryObjectStore::new()));
    let times = [0i64, 60, 125, 600, 3_600];
    for t in times {
        let mut r = CheckResult::new("x", RunId::from_datetime(at(t)));
        r.status = CheckStatus::Pass;
        results.put(&r, false).await.unwrap();
    }
    for (target, tolerance) in [(30, 30), (92, 40), (92, 10), (1_000, 500), (5_000, 60)] {
        let got: Option<CheckResult> = results
            .get_closest("x", at(target), Duration::from_secs(tolerance as u64))
            .await
            .unwrap();
        let expected = model(&times, target, tolerance).map(|t| RunId::from_datetime(at(t)));
        assert_eq!(got.map(|r| r.uuid), expected, "target {target} tolerance {tolerance}");
    }
}
