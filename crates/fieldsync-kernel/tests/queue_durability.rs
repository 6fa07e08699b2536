use fieldsync_kernel::{AssetStatus, LocalStore, MutationOp, Table};
use serde_json::json;

#[test]
fn enqueued_assets_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("IMG_0042.jpg");
    std::fs::write(&capture, b"jpeg").unwrap();

    let id = {
        let store = LocalStore::open(dir.path()).unwrap();
        store
            .with(|s| s.assets().enqueue("area-7", &capture))
            .unwrap()
    };

    // a fresh handle stands in for a restarted process
    let store = LocalStore::open(dir.path()).unwrap();
    let pending = store
        .with(|s| s.assets().list_pending(&[AssetStatus::Queued]))
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].local_path, capture);
}

#[tokio::test]
async fn edits_from_separate_sessions_share_one_log() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open(dir.path()).unwrap();

    store
        .call(|s| {
            s.rows().upsert(
                Table::Issues,
                json!({"id": "i1", "area_id": "a1", "title": "Leak"})
                    .as_object()
                    .unwrap(),
            )
        })
        .await
        .unwrap();
    store
        .call(|s| {
            s.rows().update(
                Table::Issues,
                "i1",
                json!({"resolved": true}).as_object().unwrap(),
            )
        })
        .await
        .unwrap();

    let log = store.call(|s| s.mutations().peek(10)).await.unwrap();
    let ops: Vec<MutationOp> = log.iter().map(|m| m.op).collect();
    assert_eq!(ops, vec![MutationOp::Upsert, MutationOp::Update]);
    assert_eq!(log[1].payload["resolved"], true);
}
