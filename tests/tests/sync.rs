mod common;

use std::time::Duration;

use common::Replica;
use oplog_connector_local_process::LocalSyncServer;
use oplog_core::{error::OpLogError, notify::Notice};
use oplog_proto::OpType;

#[tokio::test]
async fn created_entity_reaches_other_client() -> anyhow::Result<()> {
    let server = LocalSyncServer::new();
    let alice = Replica::new("alice", &server).await?;
    let bob = Replica::new("bob", &server).await?;

    alice.create_task("t1", "write docs").await?;
    let report = alice.sync().await?;
    assert_eq!(report.upload.accepted, 1);
    assert_eq!(server.latest_seq()?, 1);

    let report = bob.sync().await?;
    assert!(report.upload.blocked_fresh_client);
    assert_eq!(report.download.new_ops, 1);
    assert_eq!(bob.title("t1")?.as_deref(), Some("write docs"));
    assert_eq!(bob.client.store().last_server_seq().await?, 1);
    Ok(())
}

#[tokio::test]
async fn later_concurrent_edit_wins_when_synced_last() -> anyhow::Result<()> {
    let server = LocalSyncServer::new();
    let alice = Replica::new("alice", &server).await?;
    let bob = Replica::new("bob", &server).await?;
    alice.create_task("t1", "draft").await?;
    alice.sync().await?;
    bob.sync().await?;

    alice.rename_task("t1", "alice title").await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    bob.rename_task("t1", "bob title").await?;

    alice.sync().await?;
    let report = bob.sync().await?;
    assert_eq!(report.upload.rejected, 1);
    assert_eq!(report.upload.local_win_ops_created, 1);
    assert_eq!(report.follow_up.map(|f| f.accepted), Some(1));

    alice.sync().await?;
    assert_eq!(alice.title("t1")?.as_deref(), Some("bob title"));
    assert_eq!(bob.title("t1")?.as_deref(), Some("bob title"));
    Ok(())
}

#[tokio::test]
async fn earlier_concurrent_edit_loses_when_synced_last() -> anyhow::Result<()> {
    let server = LocalSyncServer::new();
    let alice = Replica::new("alice", &server).await?;
    let bob = Replica::new("bob", &server).await?;
    alice.create_task("t1", "draft").await?;
    alice.sync().await?;
    bob.sync().await?;

    alice.rename_task("t1", "alice title").await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    bob.rename_task("t1", "bob title").await?;

    bob.sync().await?;
    let report = alice.sync().await?;
    assert_eq!(report.upload.rejected, 1);
    assert_eq!(report.upload.local_win_ops_created, 0);
    assert!(report.follow_up.is_none());
    assert!(alice.client.store().get_unsynced().await?.is_empty());

    bob.sync().await?;
    assert_eq!(alice.title("t1")?.as_deref(), Some("bob title"));
    assert_eq!(bob.title("t1")?.as_deref(), Some("bob title"));
    assert_eq!(server.latest_seq()?, 2);
    Ok(())
}

#[tokio::test]
async fn wiped_server_is_reseeded_with_full_state() -> anyhow::Result<()> {
    let server = LocalSyncServer::new();
    let alice = Replica::new("alice", &server).await?;
    alice.create_task("t1", "one").await?;
    alice.create_task("t2", "two").await?;
    alice.sync().await?;

    server.reset()?;
    let report = alice.sync().await?;
    assert!(report.download.server_migration_handled);
    assert!(report.follow_up.is_some_and(|f| f.accepted == 1));

    let ops = server.ops()?;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].op.op_type, OpType::SyncImport);
    assert_eq!(alice.client.store().last_server_seq().await?, 1);
    assert!(alice.client.store().get_unsynced().await?.is_empty());

    // a client joining afterwards gets everything from the import alone
    let carol = Replica::new("carol", &server).await?;
    carol.sync().await?;
    assert_eq!(carol.snapshot()?, alice.snapshot()?);
    Ok(())
}

#[tokio::test]
async fn offline_sync_fails_and_retries_cleanly() -> anyhow::Result<()> {
    let server = LocalSyncServer::new();
    let alice = Replica::new("alice", &server).await?;
    alice.create_task("t1", "offline").await?;

    alice.transport.set_offline(true);
    assert!(matches!(alice.sync().await, Err(OpLogError::Transport(_))));
    assert_eq!(alice.client.store().get_unsynced().await?.len(), 1);

    alice.transport.set_offline(false);
    let report = alice.sync().await?;
    assert_eq!(report.upload.accepted, 1);
    assert!(alice.client.store().get_unsynced().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn declined_fresh_sync_leaves_client_untouched() -> anyhow::Result<()> {
    let server = LocalSyncServer::new();
    let alice = Replica::new("alice", &server).await?;
    alice.create_task("t1", "one").await?;
    alice.sync().await?;

    let bob = Replica::declining("bob", &server).await?;
    let report = bob.sync().await?;
    assert!(report.download.cancelled);
    assert!(bob.snapshot()?.is_empty());
    assert!(bob.notifier.notices().contains(&Notice::FreshClientSyncCancelled { op_count: 1 }));
    Ok(())
}
