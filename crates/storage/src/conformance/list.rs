use std::future::Future;

use super::{body, ctx, TestResult};
use crate::{ObjectStore, Precondition};

pub(super) async fn run_list_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "list",
            "list_empty_store",
            list_empty_store(factory).await,
        ),
        TestResult::from_result(
            "list",
            "list_filters_by_prefix",
            list_filters_by_prefix(factory).await,
        ),
        TestResult::from_result(
            "list",
            "list_is_sorted_by_key",
            list_is_sorted_by_key(factory).await,
        ),
    ]
}

async fn list_empty_store<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let all = s.list("").await.map_err(ctx("list"))?;
    if !all.is_empty() {
        return Err(format!("expected empty listing, got {} entries", all.len()));
    }
    Ok(())
}

async fn list_filters_by_prefix<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for key in ["check/1.json", "check/2.json", "checkmate/1.json", "other/1.json"] {
        s.put(key, body("{}"), Precondition::None)
            .await
            .map_err(ctx("put"))?;
    }
    let keys: Vec<String> = s
        .list("check/")
        .await
        .map_err(ctx("list"))?
        .into_iter()
        .map(|m| m.path)
        .collect();
    if keys != ["check/1.json", "check/2.json"] {
        return Err(format!("unexpected keys for prefix check/: {keys:?}"));
    }
    let all = s.list("").await.map_err(ctx("list all"))?;
    if all.len() != 4 {
        return Err(format!("expected 4 keys in total, got {}", all.len()));
    }
    Ok(())
}

async fn list_is_sorted_by_key<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for key in [
        "x/2024-01-01T00:20:00.000000.json",
        "x/latest.json",
        "x/2024-01-01T00:00:00.000000.json",
        "x/2024-01-01T00:10:00.000000.json",
    ] {
        s.put(key, body("{}"), Precondition::None)
            .await
            .map_err(ctx("put"))?;
    }
    let keys: Vec<String> = s
        .list("x/")
        .await
        .map_err(ctx("list"))?
        .into_iter()
        .map(|m| m.path)
        .collect();
    let mut sorted = keys.clone();
    sorted.sort();
    if keys != sorted {
        return Err(format!("listing not sorted: {keys:?}"));
    }
    Ok(())
}
