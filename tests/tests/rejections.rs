mod common;

use common::Replica;
use oplog_connector_local_process::LocalSyncServer;
use oplog_core::notify::Notice;
use oplog_proto::RejectionCode;

#[tokio::test]
async fn stale_rejection_is_rebuilt_from_server_clocks() -> anyhow::Result<()> {
    let server = LocalSyncServer::new();
    let alice = Replica::new("alice", &server).await?;
    let bob = Replica::new("bob", &server).await?;
    alice.create_task("t1", "draft").await?;
    alice.sync().await?;
    bob.sync().await?;
    bob.create_task("t2", "bob's").await?;
    bob.sync().await?;
    alice.sync().await?;

    alice.rename_task("t1", "renamed").await?;
    let pending = alice.client.store().get_unsynced().await?;
    assert_eq!(pending.len(), 1);
    server.inject_rejection(pending[0].op.id, RejectionCode::ConflictStale)?;

    let report = alice.sync().await?;
    assert_eq!(report.upload.rejected, 1);
    assert_eq!(report.upload.local_win_ops_created, 1);
    assert_eq!(report.follow_up.map(|f| f.accepted), Some(1));
    assert!(alice.client.store().get_op_by_id(&pending[0].op.id).await?.is_some_and(|e| e.is_rejected()));

    bob.sync().await?;
    assert_eq!(bob.title("t1")?.as_deref(), Some("renamed"));
    assert_eq!(alice.snapshot()?, bob.snapshot()?);
    Ok(())
}

#[tokio::test]
async fn stale_rejection_without_any_clocks_is_dropped() -> anyhow::Result<()> {
    let server = LocalSyncServer::new();
    let alice = Replica::new("alice", &server).await?;
    alice.create_task("t1", "draft").await?;
    alice.sync().await?;

    alice.rename_task("t1", "renamed").await?;
    let pending = alice.client.store().get_unsynced().await?;
    server.inject_rejection(pending[0].op.id, RejectionCode::ConflictStale)?;

    let report = alice.sync().await?;
    assert_eq!(report.upload.local_win_ops_created, 0);
    assert!(report.follow_up.is_none());
    assert!(alice.client.store().get_unsynced().await?.is_empty());
    assert!(alice.notifier.notices().contains(&Notice::ConflictResolutionFailed { count: 1 }));
    // the local edit stays visible even though the server never took it
    assert_eq!(alice.title("t1")?.as_deref(), Some("renamed"));
    Ok(())
}

#[tokio::test]
async fn validation_rejection_is_permanent() -> anyhow::Result<()> {
    let server = LocalSyncServer::new();
    let alice = Replica::new("alice", &server).await?;
    alice.create_task("t1", "draft").await?;
    let pending = alice.client.store().get_unsynced().await?;
    server.inject_rejection(pending[0].op.id, RejectionCode::ValidationError)?;

    let report = alice.sync().await?;
    assert_eq!(report.upload.rejected, 1);
    assert!(alice.client.store().get_unsynced().await?.is_empty());
    assert_eq!(server.latest_seq()?, 0);

    // below the warning threshold nothing is surfaced
    assert!(!alice.notifier.notices().iter().any(|n| matches!(n, Notice::OpsRejected { .. })));
    Ok(())
}
