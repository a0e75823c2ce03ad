use std::sync::atomic::{AtomicUsize, Ordering};

use foursight_storage::conformance::run_conformance_suite;
use foursight_storage::{FsObjectStore, MemoryObjectStore};

#[tokio::test]
async fn memory_backend_conforms() {
    let report = run_conformance_suite(|| async { MemoryObjectStore::new() }).await;
    assert!(report.failed == 0, "{report}");
    assert!(report.total > 15);
}

#[tokio::test]
async fn fs_backend_conforms() {
    let dir = tempfile::tempdir().unwrap();
    let counter = AtomicUsize::new(0);
    let report = run_conformance_suite(|| {
        let root = dir
            .path()
            .join(format!("bucket-{}", counter.fetch_add(1, Ordering::SeqCst)));
        async move { FsObjectStore::open(root).await.unwrap() }
    })
    .await;
    assert!(report.failed == 0, "{report}");
}
