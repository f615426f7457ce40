use std::{str::FromStr, sync::Arc};

use oplog_connector_local_process::{LocalProcessTransport, LocalSyncServer};
use oplog_core::{
    capture::Intent,
    error::OpLogError,
    hydrator::HydrationReport,
    notify::MemoryNotifier,
    state::{AppState, MemoryStateStore},
    storage::{MemoryOpLogStorage, OpLogStorage},
    sync::SyncReport,
    OpLogClient, OpLogConfig,
};
use serde_json::{json, Value};
use tracing::Level;

#[ctor::ctor]
fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").ok().and_then(|l| Level::from_str(&l).ok()).unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt().with_max_level(level).with_test_writer().try_init();
}

/// One replica wired to the shared in-process server
#[allow(unused)]
pub struct Replica {
    pub client: OpLogClient,
    pub state: Arc<MemoryStateStore>,
    pub transport: Arc<LocalProcessTransport>,
    pub notifier: Arc<MemoryNotifier>,
    pub hydration: HydrationReport,
}

#[allow(unused)]
impl Replica {
    pub async fn new(client_id: &str, server: &Arc<LocalSyncServer>) -> anyhow::Result<Self> {
        Self::with_storage(client_id, server, Arc::new(MemoryOpLogStorage::new()), OpLogConfig::default()).await
    }

    /// A fresh replica whose user declines the first remote batch
    pub async fn declining(client_id: &str, server: &Arc<LocalSyncServer>) -> anyhow::Result<Self> {
        Self::build(client_id, server, Arc::new(MemoryOpLogStorage::new()), OpLogConfig::default(), MemoryNotifier::new(false)).await
    }

    pub async fn with_storage(
        client_id: &str,
        server: &Arc<LocalSyncServer>,
        storage: Arc<dyn OpLogStorage>,
        config: OpLogConfig,
    ) -> anyhow::Result<Self> {
        Self::build(client_id, server, storage, config, MemoryNotifier::default()).await
    }

    async fn build(
        client_id: &str,
        server: &Arc<LocalSyncServer>,
        storage: Arc<dyn OpLogStorage>,
        config: OpLogConfig,
        notifier: MemoryNotifier,
    ) -> anyhow::Result<Self> {
        let state = Arc::new(MemoryStateStore::new(AppState::new()));
        let transport = LocalProcessTransport::new(server.clone(), client_id.into());
        let notifier = Arc::new(notifier);
        let client = OpLogClient::new(client_id.into(), config, storage, state.clone(), transport.clone(), notifier.clone())?;
        let hydration = client.start().await?;
        Ok(Self { client, state, transport, notifier, hydration })
    }

    /// Mutate local state the way an app reducer would, then wait for the op to reach the log
    pub async fn edit(&self, action: &str, f: impl FnOnce(&mut AppState)) -> anyhow::Result<()> {
        let (before, after) = self.state.mutate(f)?;
        self.client.capture(Intent::diff(action), &before, &after);
        self.client.flush().await?;
        Ok(())
    }

    pub async fn create_task(&self, id: &str, title: &str) -> anyhow::Result<()> {
        self.edit("[Task] Create", |s| s.upsert_entity("TASK", id, task(id, title))).await
    }

    pub async fn rename_task(&self, id: &str, title: &str) -> anyhow::Result<()> {
        self.edit("[Task] Update", |s| s.upsert_entity("TASK", id, task(id, title))).await
    }

    pub async fn sync(&self) -> Result<SyncReport, OpLogError> { self.client.sync().await }

    pub fn task(&self, id: &str) -> anyhow::Result<Option<Value>> { Ok(self.state.snapshot()?.entity("TASK", id).map(|v| (*v).clone())) }

    pub fn title(&self, id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.task(id)?.and_then(|t| t.get("title").and_then(Value::as_str).map(str::to_string)))
    }

    pub fn snapshot(&self) -> anyhow::Result<AppState> { Ok(self.state.snapshot()?) }
}

pub fn task(id: &str, title: &str) -> Value { json!({"id": id, "title": title}) }
