mod common;

use std::{sync::Arc, time::Duration};

use common::Replica;
use oplog_connector_local_process::LocalSyncServer;
use oplog_core::{storage::OpLogStorage, OpLogConfig};
use oplog_storage_sled::SledOpLogStorage;

fn eager_compaction() -> OpLogConfig {
    let mut config = OpLogConfig::default();
    config.compaction.retention = Duration::ZERO;
    config.compaction.emergency_retention = Duration::ZERO;
    config
}

#[tokio::test]
async fn compacted_log_hydrates_after_restart() -> anyhow::Result<()> {
    let server = LocalSyncServer::new();
    let storage: Arc<dyn OpLogStorage> = Arc::new(SledOpLogStorage::new_test()?);

    let first = Replica::with_storage("alice", &server, storage.clone(), eager_compaction()).await?;
    for (id, title) in [("t1", "one"), ("t2", "two"), ("t3", "three")] {
        first.create_task(id, title).await?;
    }
    first.sync().await?;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = first.client.compact().await?;
    assert_eq!(report.deleted, 3);
    assert!(first.client.store().entries().await?.is_empty());

    // written after the snapshot, so it has to come back through replay
    first.create_task("t4", "four").await?;
    first.rename_task("t1", "one, edited").await?;
    let expected = first.snapshot()?;
    first.client.shutdown().await?;

    let second = Replica::with_storage("alice", &server, storage, eager_compaction()).await?;
    assert!(second.hydration.snapshot_loaded);
    assert_eq!(second.hydration.replayed, 2);
    assert_eq!(second.snapshot()?, expected);
    assert_eq!(second.title("t1")?.as_deref(), Some("one, edited"));
    assert_eq!(second.client.store().get_unsynced().await?.len(), 2);

    second.sync().await?;
    assert_eq!(server.latest_seq()?, 5);
    Ok(())
}

#[tokio::test]
async fn hydration_reports_what_it_restored() -> anyhow::Result<()> {
    let server = LocalSyncServer::new();
    let storage: Arc<dyn OpLogStorage> = Arc::new(SledOpLogStorage::new_test()?);

    let first = Replica::with_storage("alice", &server, storage.clone(), OpLogConfig::default()).await?;
    first.create_task("t1", "one").await?;
    first.create_task("t2", "two").await?;
    first.client.shutdown().await?;

    let second = Replica::with_storage("alice", &server, storage, OpLogConfig::default()).await?;
    assert!(!second.hydration.snapshot_loaded);
    assert_eq!(second.hydration.replayed, 2);
    assert_eq!(second.snapshot()?, first.snapshot()?);
    Ok(())
}
