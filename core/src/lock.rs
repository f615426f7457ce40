//! Named mutual exclusion.
//!
//! [`InProcessLock`] serializes holders within one process using a fair (FIFO) mutex per name.
//! [`FileLock`] extends that across processes sharing a lock directory. The backend is chosen once
//! at construction time via [`lock_provider_from_config`].

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use oplog_proto::OpId;
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, OwnedMutexGuard},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    config::{LockBackend, LockConfig},
    error::LockError,
    util::SafeMap,
};

/// Releases the lock when dropped, including on early return or unwinding.
pub struct LockGuard {
    name: String,
    _held: Vec<Box<dyn Send + Sync>>,
}

impl LockGuard {
    pub fn name(&self) -> &str { &self.name }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "LockGuard({})", self.name) }
}

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Wait until the named lock is free and take it
    async fn acquire(&self, name: &str) -> Result<LockGuard, LockError>;
}

pub fn lock_provider_from_config(config: &LockConfig) -> Arc<dyn LockProvider> {
    match &config.backend {
        LockBackend::InProcess => Arc::new(InProcessLock::new()),
        LockBackend::File { dir } => Arc::new(FileLock::new(dir.clone(), config)),
    }
}

#[derive(Default)]
pub struct InProcessLock {
    locks: SafeMap<String, Arc<Mutex<()>>>,
}

impl InProcessLock {
    pub fn new() -> Self { Self::default() }

    async fn acquire_owned(&self, name: &str) -> OwnedMutexGuard<()> {
        let mutex = self.locks.get_or_insert_with(name.to_string(), || Arc::new(Mutex::new(())));
        mutex.lock_owned().await
    }
}

#[async_trait]
impl LockProvider for InProcessLock {
    async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        let guard = self.acquire_owned(name).await;
        Ok(LockGuard { name: name.to_string(), _held: vec![Box::new(guard)] })
    }
}

/// Cross-process lock built on exclusive creation of `<dir>/<name>.lock`.
///
/// The file holds an owner token. While held, the token is rewritten every third of
/// `stale_after` so other providers only break locks whose holder has gone away.
pub struct FileLock {
    dir: PathBuf,
    local: InProcessLock,
    poll_interval: Duration,
    stale_after: Duration,
    acquire_timeout: Duration,
}

struct LockFile {
    path: PathBuf,
    token: String,
    heartbeat: JoinHandle<()>,
}

impl LockFile {
    fn owned_by(path: &Path, token: &str) -> bool { std::fs::read_to_string(path).map(|c| c.trim_end() == token).unwrap_or(false) }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.heartbeat.abort();
        // the file may have been broken as stale and retaken by someone else
        if !Self::owned_by(&self.path, &self.token) {
            warn!("lock file {} no longer ours, leaving it", self.path.display());
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to release lock file {}: {}", self.path.display(), e);
        }
    }
}

impl FileLock {
    pub fn new(dir: PathBuf, config: &LockConfig) -> Self {
        Self {
            dir,
            local: InProcessLock::new(),
            poll_interval: config.poll_interval,
            stale_after: config.stale_after,
            acquire_timeout: config.acquire_timeout,
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf { self.dir.join(format!("{}.lock", name)) }

    fn try_create(&self, path: &Path, token: &str) -> Result<bool, LockError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}", token)?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Keep the file fresh while it still carries `token`. Never recreates a removed file.
    fn spawn_heartbeat(&self, path: PathBuf, token: String) -> JoinHandle<()> {
        let period = (self.stale_after / 3).max(Duration::from_millis(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) if content.trim_end() == token => {}
                    _ => {
                        warn!("lock file {} lost, heartbeat stopped", path.display());
                        return;
                    }
                }
                // same bytes written in place: the content is never observed empty
                let refreshed = async {
                    let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
                    file.write_all(format!("{}\n", token).as_bytes()).await?;
                    file.flush().await
                };
                if let Err(e) = refreshed.await {
                    warn!("failed to refresh lock file {}: {}", path.display(), e);
                    return;
                }
                trace!("refreshed lock file {}", path.display());
            }
        })
    }

    /// Remove the lock file if its holder has not refreshed it within `stale_after`
    fn clear_if_stale(&self, path: &Path) -> Result<(), LockError> {
        let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age > self.stale_after {
            warn!("removing stale lock file {} (age {:?})", path.display(), age);
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LockProvider for FileLock {
    async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        // in-process waiters queue fairly here instead of racing on the file
        let local = self.local.acquire_owned(name).await;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.lock_path(name);
        let deadline = tokio::time::Instant::now() + self.acquire_timeout;
        let token = format!("{}:{}", std::process::id(), OpId::new());

        loop {
            if self.try_create(&path, &token)? {
                debug!("acquired file lock {}", path.display());
                let heartbeat = self.spawn_heartbeat(path.clone(), token.clone());
                let file = LockFile { path, token, heartbeat };
                return Ok(LockGuard { name: name.to_string(), _held: vec![Box::new(file), Box::new(local)] });
            }
            self.clear_if_stale(&path)?;
            if tokio::time::Instant::now() >= deadline {
                return Err(LockError::Timeout(name.to_string()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn in_process_lock_serializes_holders_in_request_order() -> anyhow::Result<()> {
        let lock = Arc::new(InProcessLock::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = lock.acquire("a").await?;
        let mut handles = Vec::new();
        for i in 0..5 {
            let lock = lock.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire("a").await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // let each task enqueue before spawning the next
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(first);
        for h in handles {
            h.await?;
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    #[tokio::test]
    async fn independent_names_do_not_block() -> anyhow::Result<()> {
        let lock = InProcessLock::new();
        let _a = lock.acquire("a").await?;
        let b = tokio::time::timeout(Duration::from_millis(100), lock.acquire("b")).await;
        assert!(b.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn guard_releases_on_error_path() -> anyhow::Result<()> {
        let lock = InProcessLock::new();
        let result: Result<(), &str> = async {
            let _guard = lock.acquire("a").await.unwrap();
            Err("boom")
        }
        .await;
        assert!(result.is_err());
        let again = tokio::time::timeout(Duration::from_millis(100), lock.acquire("a")).await;
        assert!(again.is_ok());
        Ok(())
    }

    fn file_config(dir: PathBuf) -> LockConfig {
        LockConfig {
            backend: LockBackend::File { dir },
            poll_interval: Duration::from_millis(5),
            stale_after: Duration::from_secs(60),
            acquire_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn file_lock_excludes_a_second_provider() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = file_config(dir.path().to_path_buf());
        // two providers stand in for two processes sharing the directory
        let a = FileLock::new(dir.path().to_path_buf(), &config);
        let b = FileLock::new(dir.path().to_path_buf(), &config);

        let guard = a.acquire("sp_op_log").await?;
        assert!(dir.path().join("sp_op_log.lock").exists());
        assert!(matches!(b.acquire("sp_op_log").await, Err(LockError::Timeout(_))));

        drop(guard);
        assert!(!dir.path().join("sp_op_log.lock").exists());
        let _guard = b.acquire("sp_op_log").await?;
        Ok(())
    }

    #[tokio::test]
    async fn file_lock_breaks_stale_lock_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = file_config(dir.path().to_path_buf());
        config.stale_after = Duration::from_millis(20);
        std::fs::write(dir.path().join("sp_op_log.lock"), "12345\n")?;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let lock = FileLock::new(dir.path().to_path_buf(), &config);
        let _guard = lock.acquire("sp_op_log").await?;
        Ok(())
    }

    #[tokio::test]
    async fn live_holder_outlasts_the_stale_window() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = file_config(dir.path().to_path_buf());
        config.poll_interval = Duration::from_millis(10);
        config.stale_after = Duration::from_millis(50);
        config.acquire_timeout = Duration::from_millis(300);
        let a = FileLock::new(dir.path().to_path_buf(), &config);
        let b = FileLock::new(dir.path().to_path_buf(), &config);

        let guard = a.acquire("sp_op_log").await?;
        // b keeps polling well past stale_after while a is still alive
        assert!(matches!(b.acquire("sp_op_log").await, Err(LockError::Timeout(_))));
        assert!(dir.path().join("sp_op_log.lock").exists());

        drop(guard);
        let _guard = b.acquire("sp_op_log").await?;
        Ok(())
    }

    #[tokio::test]
    async fn released_guard_leaves_a_new_owners_file_alone() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = file_config(dir.path().to_path_buf());
        let path = dir.path().join("sp_op_log.lock");
        let lock = FileLock::new(dir.path().to_path_buf(), &config);

        let guard = lock.acquire("sp_op_log").await?;
        // someone else broke the lock and took it over
        std::fs::write(&path, "999:other\n")?;
        drop(guard);

        assert_eq!(std::fs::read_to_string(&path)?, "999:other\n");
        Ok(())
    }

    #[tokio::test]
    async fn file_lock_counts_holders_one_at_a_time() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = file_config(dir.path().to_path_buf());
        config.acquire_timeout = Duration::from_secs(5);
        let lock = Arc::new(FileLock::new(dir.path().to_path_buf(), &config));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let (lock, inside, max_inside) = (lock.clone(), inside.clone(), max_inside.clone());
            handles.push(tokio::spawn(async move {
                let _g = lock.acquire("x").await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await?;
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
