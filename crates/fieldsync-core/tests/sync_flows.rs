use std::sync::Arc;
use std::time::Duration;

use fieldsync_core::config::SyncConfig;
use fieldsync_core::remote::RemoteCall;
use fieldsync_core::{
    parse_config, AssetUploadWorker, MemoryRemote, MutationUploadConnector, RemoteError,
    RemoteStore, StatusChange, SyncEngine, TemplateItem,
};
use fieldsync_events::Bus;
use fieldsync_kernel::{
    AssetStatus, ConfirmedAsset, LeafStatus, Level, LocalStore, MutationOp, Record, Table,
};
use serde_json::{json, Value};

fn rec(v: Value) -> Record {
    v.as_object().cloned().unwrap()
}

fn connector(store: &LocalStore, remote: &MemoryRemote) -> MutationUploadConnector {
    MutationUploadConnector::new(
        store.clone(),
        Arc::new(remote.clone()),
        Bus::default(),
        &SyncConfig::default(),
    )
}

fn worker(store: &LocalStore, remote: &MemoryRemote, dir: &std::path::Path) -> AssetUploadWorker {
    AssetUploadWorker::new(
        store.clone(),
        Arc::new(remote.clone()),
        Arc::new(remote.clone()),
        Bus::default(),
        dir.to_path_buf(),
    )
}

#[tokio::test]
async fn asset_is_retired_only_after_confirmed_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open(&dir.path().join("state")).unwrap();
    let remote = MemoryRemote::new();
    let assets = worker(&store, &remote, dir.path());

    let path = dir.path().join("slab.jpg");
    std::fs::write(&path, b"bytes").unwrap();
    let id = assets.enqueue("area-7", &path).unwrap();

    remote.fail_next(RemoteError::Unavailable("connection reset".into()));
    assets.sweep().await.unwrap();
    let entry = store.with(|s| s.assets().get(&id)).unwrap().unwrap();
    assert_eq!(entry.status, AssetStatus::Failed);
    assert!(store
        .with(|s| s.rows().get(Table::Photos, &id))
        .unwrap()
        .is_none());

    let report = assets.sweep().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert!(store.with(|s| s.assets().get(&id)).unwrap().is_none());
    let photo = store
        .with(|s| s.rows().get(Table::Photos, &id))
        .unwrap()
        .and_then(|r| ConfirmedAsset::from_record(&r))
        .unwrap();
    assert_eq!(photo.parent_entity_id, "area-7");
    assert_eq!(remote.blob(&photo.storage_path).unwrap(), b"bytes");
}

#[tokio::test]
async fn resweeping_a_synced_asset_creates_no_duplicate_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open(&dir.path().join("state")).unwrap();
    let remote = MemoryRemote::new();
    let assets = worker(&store, &remote, dir.path());

    let path = dir.path().join("beam.jpg");
    std::fs::write(&path, b"beam").unwrap();
    let id = assets.enqueue("area-1", &path).unwrap();

    // state left by a run that stopped after writing metadata but before retiring
    let confirmed = ConfirmedAsset {
        id: id.clone(),
        parent_entity_id: "area-1".into(),
        storage_path: "photos/area-1/beam.jpg".into(),
        url: "memory://photos/area-1/beam.jpg".into(),
        filename: "beam.jpg".into(),
        created_at: "2026-01-01T00:00:00.000Z".into(),
    };
    store
        .with(|s| {
            s.rows().upsert(Table::Photos, &confirmed.to_record())?;
            s.assets().update_status(&id, AssetStatus::Uploading)
        })
        .unwrap();
    remote.insert("photos", &confirmed.to_record()).await.unwrap();

    let report = assets.sweep().await.unwrap();
    assert_eq!(report.uploaded, 1);
    connector(&store, &remote).drain().await.unwrap();
    assets.sweep().await.unwrap();

    assert_eq!(remote.rows("photos").len(), 1);
    assert_eq!(
        store.with(|s| s.assets().count_by_status(AssetStatus::Queued)).unwrap(),
        0
    );
}

#[tokio::test]
async fn offline_edits_arrive_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open(dir.path()).unwrap();
    let remote = MemoryRemote::new();
    let conn = connector(&store, &remote);

    store
        .with(|s| {
            s.rows().upsert(
                Table::Issues,
                &rec(json!({"id": "i1", "area_id": "a1", "title": "Crack"})),
            )?;
            s.rows().update(
                Table::Issues,
                "i1",
                &rec(json!({"title": "Crack in slab", "is_blocking": true})),
            )?;
            s.rows()
                .update(Table::Issues, "i1", &rec(json!({"title": "Crack repaired"})))
        })
        .unwrap();

    remote.set_offline(true);
    assert!(conn.drain().await.unwrap_err().is_transient());
    assert_eq!(store.with(|s| s.mutations().len()).unwrap(), 3);

    remote.set_offline(false);
    let report = conn.drain().await.unwrap();
    assert_eq!(report.applied, 3);
    let row = remote.row("issues", "i1").unwrap();
    assert_eq!(row["title"], "Crack repaired");
    assert_eq!(row["is_blocking"], json!(1));
}

#[tokio::test]
async fn local_only_mutations_drain_without_remote_calls() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open(dir.path()).unwrap();
    let remote = MemoryRemote::new();
    let conn = connector(&store, &remote);

    store
        .with(|s| {
            s.mutations().append(
                "provisional_checklist_items",
                MutationOp::Upsert,
                "tmp-1",
                &rec(json!({"label": "Frame"})),
            )?;
            s.mutations()
                .append("pending_assets", MutationOp::Delete, "asset-1", &Record::new())?;
            s.rows()
                .upsert(Table::Jobs, &rec(json!({"id": "j1", "name": "Tower"})))
        })
        .unwrap();

    let report = conn.drain().await.unwrap();
    assert_eq!(report.skipped, 2);
    assert_eq!(report.applied, 1);
    assert_eq!(
        remote.calls(),
        vec![RemoteCall::Upsert {
            table: "jobs".into(),
            id: "j1".into()
        }]
    );
}

fn seed_job(store: &LocalStore) {
    store
        .with(|s| {
            let rows = s.rows();
            rows.apply_remote(Table::Jobs, &[rec(json!({"id": "j1", "name": "Tower"}))])?;
            rows.apply_remote(Table::Floors, &[rec(json!({"id": "f1", "job_id": "j1"}))])?;
            rows.apply_remote(Table::Units, &[rec(json!({"id": "u1", "floor_id": "f1"}))])?;
            rows.apply_remote(Table::Areas, &[rec(json!({"id": "a1", "unit_id": "u1"}))])?;
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn engine_merges_provisional_checklist_and_rolls_up() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = parse_config(&format!(
        "[store]\nstate_dir = {:?}\n[sync]\nsweep_interval_secs = 3600\ndrain_interval_secs = 3600\n",
        dir.path().join("state").to_string_lossy()
    ))
    .unwrap();
    let store = LocalStore::open(&cfg.state_dir()).unwrap();
    seed_job(&store);
    let remote = MemoryRemote::new();
    remote.seed("jobs", rec(json!({"id": "j1", "name": "Tower"})));
    let engine = SyncEngine::start(
        &cfg,
        store.clone(),
        Arc::new(remote.clone()),
        Arc::new(remote.clone()),
        Bus::default(),
    )
    .unwrap();

    let template: Vec<TemplateItem> = ["Frame", "Insulate", "Drywall"]
        .into_iter()
        .map(TemplateItem::new)
        .collect();
    let view = engine.reconciler().render("a1", &template).await.unwrap();
    assert!(view.provisional);
    let change = engine
        .set_checklist_status(&view.items[1].id, LeafStatus::Completed)
        .await
        .unwrap();
    assert_eq!(change, StatusChange::Provisional);

    let report = engine.reconciler().reconcile("a1", &template).await.unwrap();
    assert_eq!((report.created, report.merged), (3, 1));

    let view = engine.reconciler().render("a1", &template).await.unwrap();
    assert!(!view.provisional);
    assert_eq!(view.items[1].status, LeafStatus::Completed);

    // confirmed edits roll up immediately
    let change = engine
        .set_checklist_status(&view.items[0].id, LeafStatus::Na)
        .await
        .unwrap();
    let StatusChange::Confirmed(rollup) = change else {
        panic!("expected confirmed edit");
    };
    assert_eq!(rollup.percent(Level::Area, "a1"), Some(50));
    assert_eq!(rollup.percent(Level::Job, "j1"), Some(50));

    // the edit woke the drain; wait for it to land remotely
    let real_first = view.items[0].id.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let item_done = remote
                .row("checklist_items", &real_first)
                .is_some_and(|r| r["status"] == "NA");
            let job_done = remote
                .row("jobs", "j1")
                .is_some_and(|r| r["progress"] == json!(50));
            if item_done && job_done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("edits drained");
    engine.shutdown().await;
}

#[tokio::test]
async fn engine_uploads_captured_bytes_on_wake() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = parse_config(&format!(
        "[store]\nstate_dir = {:?}\n[sync]\nsweep_interval_secs = 3600\n",
        dir.path().join("state").to_string_lossy()
    ))
    .unwrap();
    let store = LocalStore::open(&cfg.state_dir()).unwrap();
    let remote = MemoryRemote::new();
    let engine = SyncEngine::start(
        &cfg,
        store.clone(),
        Arc::new(remote.clone()),
        Arc::new(remote.clone()),
        Bus::default(),
    )
    .unwrap();

    let id = engine
        .capture_bytes("area-3", "column.jpg", b"img".to_vec())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let gone = store.with(|s| s.assets().get(&id)).unwrap().is_none();
            if gone {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("asset uploaded");
    assert!(remote.row("photos", &id).is_some());
    engine.shutdown().await;
}

#[tokio::test]
async fn direct_leaf_write_rolls_up_through_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = parse_config(&format!(
        "[store]\nstate_dir = {:?}\n[sync]\nsweep_interval_secs = 3600\ndrain_interval_secs = 3600\n",
        dir.path().join("state").to_string_lossy()
    ))
    .unwrap();
    let store = LocalStore::open(&cfg.state_dir()).unwrap();
    seed_job(&store);
    store
        .with(|s| {
            s.rows().apply_remote(
                Table::ChecklistItems,
                &[rec(json!({"id": "c1", "area_id": "a1", "label": "Frame"}))],
            )
        })
        .unwrap();
    let remote = MemoryRemote::new();
    let engine = SyncEngine::start(
        &cfg,
        store.clone(),
        Arc::new(remote.clone()),
        Arc::new(remote.clone()),
        Bus::default(),
    )
    .unwrap();

    store
        .with(|s| {
            s.rows()
                .update(Table::ChecklistItems, "c1", &rec(json!({"status": "COMPLETED"})))
        })
        .unwrap();
    let stored = |level: Level, id: &str| {
        store
            .with(|s| s.progress().stored_progress(level, id))
            .unwrap()
    };
    assert_eq!(stored(Level::Area, "a1"), Some(0));

    let rollup = engine.checklist_item_changed("c1").await.unwrap();
    assert_eq!(rollup.percent(Level::Area, "a1"), Some(100));
    assert_eq!(stored(Level::Area, "a1"), Some(100));
    assert_eq!(stored(Level::Job, "j1"), Some(100));
    engine.shutdown().await;
}
