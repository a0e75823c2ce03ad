use std::future::Future;

use super::{body, ctx, TestResult};
use crate::{ObjectStore, Precondition, StorageError};

pub(super) async fn run_basic_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "basic",
        "get_absent_returns_none",
        get_absent_returns_none(factory).await,
    ));
    results.push(TestResult::from_result(
        "basic",
        "put_then_get_round_trips",
        put_then_get_round_trips(factory).await,
    ));
    results.push(TestResult::from_result(
        "basic",
        "overwrite_changes_version",
        overwrite_changes_version(factory).await,
    ));
    results.push(TestResult::from_result(
        "basic",
        "head_matches_get",
        head_matches_get(factory).await,
    ));
    results.push(TestResult::from_result(
        "basic",
        "delete_is_idempotent",
        delete_is_idempotent(factory).await,
    ));
    results.push(TestResult::from_result(
        "basic",
        "invalid_keys_rejected",
        invalid_keys_rejected(factory).await,
    ));

    results
}

async fn get_absent_returns_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get("missing/key.json").await {
        Ok(None) => {}
        other => return Err(format!("expected Ok(None), got {:?}", other.map(|o| o.is_some()))),
    }
    match s.head("missing/key.json").await {
        Ok(None) => Ok(()),
        other => Err(format!("expected head Ok(None), got {other:?}")),
    }
}

async fn put_then_get_round_trips<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.put("a/b.json", body("{\"v\":1}"), Precondition::None)
        .await
        .map_err(ctx("put"))?;
    let obj = s
        .get("a/b.json")
        .await
        .map_err(ctx("get"))?
        .ok_or("object missing after put")?;
    if &obj.data[..] != b"{\"v\":1}" {
        return Err(format!("body mismatch: {:?}", obj.data));
    }
    Ok(())
}

async fn overwrite_changes_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.put("k", body("one"), Precondition::None)
        .await
        .map_err(ctx("put one"))?;
    let v1 = s.head("k").await.map_err(ctx("head"))?.ok_or("missing")?.version;
    s.put("k", body("two"), Precondition::None)
        .await
        .map_err(ctx("put two"))?;
    let obj = s.get("k").await.map_err(ctx("get"))?.ok_or("missing")?;
    if obj.version == v1 {
        return Err("version unchanged after overwrite with new content".into());
    }
    if &obj.data[..] != b"two" {
        return Err("overwrite not visible".into());
    }
    Ok(())
}

async fn head_matches_get<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.put("h/x.json", body("12345"), Precondition::None)
        .await
        .map_err(ctx("put"))?;
    let meta = s.head("h/x.json").await.map_err(ctx("head"))?.ok_or("missing")?;
    let obj = s.get("h/x.json").await.map_err(ctx("get"))?.ok_or("missing")?;
    if meta.size != 5 || meta.path != "h/x.json" || meta.version != obj.version {
        return Err(format!("head disagrees with get: {meta:?} vs {}", obj.version));
    }
    Ok(())
}

async fn delete_is_idempotent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.put("d/x", body("x"), Precondition::None)
        .await
        .map_err(ctx("put"))?;
    s.delete("d/x").await.map_err(ctx("delete"))?;
    s.delete("d/x").await.map_err(ctx("second delete"))?;
    if s.get("d/x").await.map_err(ctx("get"))?.is_some() {
        return Err("object visible after delete".into());
    }
    Ok(())
}

async fn invalid_keys_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for key in ["", "/abs", "a/../b"] {
        match s.put(key, body("x"), Precondition::None).await {
            Err(StorageError::InvalidKey { .. }) => {}
            other => return Err(format!("key {key:?}: expected InvalidKey, got {other:?}")),
        }
    }
    Ok(())
}
