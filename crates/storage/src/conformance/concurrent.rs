use std::future::Future;
use std::sync::Arc;

use super::{ctx, TestResult};
use crate::{ObjectStore, Precondition, StorageError, WriteOutcome};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "concurrent_create_exactly_one_wins",
            concurrent_create_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_cas_exactly_one_wins",
            concurrent_cas_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_writes_to_distinct_keys_all_land",
            concurrent_writes_to_distinct_keys_all_land(factory).await,
        ),
    ]
}

// ── Racing DoesNotExist: exactly one create ─────────────────────────────────

async fn concurrent_create_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = Arc::new(factory().await);
    let mut handles = Vec::new();
    for i in 0..N {
        let s = store.clone();
        handles.push(tokio::spawn(async move {
            s.put(
                "race/create",
                bytes::Bytes::from(format!("writer-{i}")),
                Precondition::DoesNotExist,
            )
            .await
        }));
    }
    count_winners(handles, 1).await
}

// ── Racing MatchesVersion on one token: exactly one swap ────────────────────

async fn concurrent_cas_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = Arc::new(factory().await);
    let version = match store
        .put("race/cas", bytes::Bytes::from_static(b"seed"), Precondition::None)
        .await
        .map_err(ctx("seed"))?
    {
        WriteOutcome::Written { version } => version,
        other => return Err(format!("seed not written: {other:?}")),
    };

    let mut handles = Vec::new();
    for i in 0..N {
        let s = store.clone();
        let v = version.clone();
        handles.push(tokio::spawn(async move {
            s.put(
                "race/cas",
                bytes::Bytes::from(format!("writer-{i}")),
                Precondition::MatchesVersion(v),
            )
            .await
        }));
    }
    count_winners(handles, 1).await
}

async fn concurrent_writes_to_distinct_keys_all_land<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ObjectStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = Arc::new(factory().await);
    let mut handles = Vec::new();
    for i in 0..N {
        let s = store.clone();
        handles.push(tokio::spawn(async move {
            s.put(
                &format!("many/{i:03}.json"),
                bytes::Bytes::from(format!("{i}")),
                Precondition::DoesNotExist,
            )
            .await
        }));
    }
    count_winners(handles, N).await?;
    let listed = store.list("many/").await.map_err(ctx("list"))?;
    if listed.len() != N {
        return Err(format!("expected {N} keys, listed {}", listed.len()));
    }
    Ok(())
}

async fn count_winners(
    handles: Vec<tokio::task::JoinHandle<Result<WriteOutcome, StorageError>>>,
    expected: usize,
) -> Result<(), String> {
    let mut winners = 0usize;
    for handle in handles {
        let outcome = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if outcome.is_written() {
            winners += 1;
        }
    }
    if winners != expected {
        return Err(format!("expected {expected} winning writes, got {winners}"));
    }
    Ok(())
}
