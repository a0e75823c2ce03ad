use std::future::Future;

use super::{body, ctx, TestResult};
use crate::{ObjectStore, Precondition, WriteOutcome};

pub(super) async fn run_precondition_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "precondition",
        "does_not_exist_creates",
        does_not_exist_creates(factory).await,
    ));
    results.push(TestResult::from_result(
        "precondition",
        "does_not_exist_fails_on_existing",
        does_not_exist_fails_on_existing(factory).await,
    ));
    results.push(TestResult::from_result(
        "precondition",
        "matches_version_succeeds_with_current",
        matches_version_succeeds_with_current(factory).await,
    ));
    results.push(TestResult::from_result(
        "precondition",
        "matches_version_fails_with_stale",
        matches_version_fails_with_stale(factory).await,
    ));
    results.push(TestResult::from_result(
        "precondition",
        "matches_version_fails_on_absent",
        matches_version_fails_on_absent(factory).await,
    ));

    results
}

async fn does_not_exist_creates<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let out = s
        .put("p/new", body("a"), Precondition::DoesNotExist)
        .await
        .map_err(ctx("put"))?;
    if !out.is_written() {
        return Err(format!("expected Written, got {out:?}"));
    }
    Ok(())
}

async fn does_not_exist_fails_on_existing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.put("p/k", body("a"), Precondition::None)
        .await
        .map_err(ctx("seed"))?;
    let out = s
        .put("p/k", body("b"), Precondition::DoesNotExist)
        .await
        .map_err(ctx("put"))?;
    match out {
        WriteOutcome::PreconditionFailed { current: Some(_) } => {}
        other => return Err(format!("expected PreconditionFailed with a version, got {other:?}")),
    }
    let obj = s.get("p/k").await.map_err(ctx("get"))?.ok_or("missing")?;
    if &obj.data[..] != b"a" {
        return Err("failed precondition still overwrote the object".into());
    }
    Ok(())
}

async fn matches_version_succeeds_with_current<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let version = match s
        .put("p/k", body("a"), Precondition::None)
        .await
        .map_err(ctx("seed"))?
    {
        WriteOutcome::Written { version } => version,
        other => return Err(format!("seed not written: {other:?}")),
    };
    let out = s
        .put("p/k", body("b"), Precondition::MatchesVersion(version))
        .await
        .map_err(ctx("cas"))?;
    if !out.is_written() {
        return Err(format!("expected Written, got {out:?}"));
    }
    Ok(())
}

async fn matches_version_fails_with_stale<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.put("p/k", body("a"), Precondition::None)
        .await
        .map_err(ctx("seed"))?;
    let stale = s.head("p/k").await.map_err(ctx("head"))?.ok_or("missing")?.version;
    s.put("p/k", body("b"), Precondition::None)
        .await
        .map_err(ctx("overwrite"))?;
    let out = s
        .put("p/k", body("c"), Precondition::MatchesVersion(stale))
        .await
        .map_err(ctx("cas"))?;
    if out.is_written() {
        return Err("write with stale version succeeded".into());
    }
    let obj = s.get("p/k").await.map_err(ctx("get"))?.ok_or("missing")?;
    if &obj.data[..] != b"b" {
        return Err("stale write clobbered the object".into());
    }
    Ok(())
}

async fn matches_version_fails_on_absent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let out = s
        .put("p/none", body("a"), Precondition::MatchesVersion("1".into()))
        .await
        .map_err(ctx("cas"))?;
    match out {
        WriteOutcome::PreconditionFailed { current: None } => Ok(()),
        other => Err(format!("expected PreconditionFailed without version, got {other:?}")),
    }
}
