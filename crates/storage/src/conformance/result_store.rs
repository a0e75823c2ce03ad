use std::future::Future;
use std::sync::Arc;

use foursight_interchange::{CheckResult, CheckStatus, RunId};

use super::{ctx, TestResult};
use crate::{ObjectStore, PointerOutcome, ResultStore};

pub(super) async fn run_result_store_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "results",
            "put_round_trips_through_latest_and_primary",
            put_round_trips_through_latest_and_primary(factory).await,
        ),
        TestResult::from_result(
            "results",
            "pointers_only_advance",
            pointers_only_advance(factory).await,
        ),
        TestResult::from_result(
            "results",
            "concurrent_puts_leave_newest_latest",
            concurrent_puts_leave_newest_latest(factory).await,
        ),
    ]
}

fn record(name: &str, uuid: &str) -> Result<CheckResult, String> {
    let uuid = RunId::parse(uuid).map_err(|e| e.to_string())?;
    let mut r = CheckResult::new(name, uuid);
    r.status = CheckStatus::Pass;
    r.summary = "ok".into();
    Ok(r)
}

async fn put_round_trips_through_latest_and_primary<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let results = ResultStore::new(Arc::new(factory().await));
    let r = record("x", "2024-01-01T00:00:00.000000")?;
    results.put(&r, true).await.map_err(ctx("put"))?;
    let latest: Option<CheckResult> = results.get_latest("x").await.map_err(ctx("latest"))?;
    let primary: Option<CheckResult> = results.get_primary("x").await.map_err(ctx("primary"))?;
    if latest.as_ref() != Some(&r) || primary.as_ref() != Some(&r) {
        return Err(format!("pointers disagree with record: {latest:?} / {primary:?}"));
    }
    Ok(())
}

async fn pointers_only_advance<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let results = ResultStore::new(Arc::new(factory().await));
    let newer = record("x", "2024-01-02T00:00:00.000000")?;
    let older = record("x", "2024-01-01T00:00:00.000000")?;
    results.put(&newer, false).await.map_err(ctx("put newer"))?;
    let report = results.put(&older, false).await.map_err(ctx("put older"))?;
    if !matches!(report.latest, PointerOutcome::Superseded { .. }) {
        return Err(format!("older put moved latest: {:?}", report.latest));
    }
    let latest: Option<CheckResult> = results.get_latest("x").await.map_err(ctx("latest"))?;
    if latest.as_ref() != Some(&newer) {
        return Err("latest went backwards".into());
    }
    Ok(())
}

async fn concurrent_puts_leave_newest_latest<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let results = ResultStore::new(Arc::new(factory().await));
    let mut handles = Vec::new();
    for minute in 0..8u32 {
        let results = results.clone();
        handles.push(tokio::spawn(async move {
            let r = record("race", &format!("2024-01-01T00:{minute:02}:00.000000"))?;
            results.put(&r, false).await.map_err(ctx("put"))
        }));
    }
    for handle in handles {
        handle.await.map_err(|e| format!("task panic: {e}"))??;
    }
    let ids = results.run_ids("race").await.map_err(ctx("run ids"))?;
    if ids.len() != 8 {
        return Err(format!("expected 8 run records, got {}", ids.len()));
    }
    // A contended pointer may lag; it must never hold anything but a real run.
    let latest: Option<CheckResult> = results.get_latest("race").await.map_err(ctx("latest"))?;
    match latest {
        Some(r) if ids.contains(&r.uuid) => Ok(()),
        other => Err(format!("latest does not name a stored run: {other:?}")),
    }
}
