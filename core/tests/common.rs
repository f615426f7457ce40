use std::sync::Arc;

use async_trait::async_trait;
use oplog_core::{error::TransportError, transport::Transport};
use oplog_proto::{DownloadRequest, DownloadResponse, OpUploadResult, SnapshotUpload, UploadRequest, UploadResponse};
use tracing::Level;

#[ctor::ctor]
fn init_tracing() { let _ = tracing_subscriber::fmt().with_max_level(Level::INFO).with_test_writer().try_init(); }

/// A transport with no server behind it
pub struct Unreachable;

#[async_trait]
impl Transport for Unreachable {
    async fn upload_ops(&self, _request: UploadRequest) -> Result<UploadResponse, TransportError> { Err(TransportError::Unavailable("no server".into())) }

    async fn download_ops(&self, _request: DownloadRequest) -> Result<DownloadResponse, TransportError> {
        Err(TransportError::Unavailable("no server".into()))
    }

    async fn upload_snapshot(&self, _snapshot: SnapshotUpload) -> Result<OpUploadResult, TransportError> {
        Err(TransportError::Unavailable("no server".into()))
    }
}

#[allow(unused)]
pub fn unreachable() -> Arc<dyn Transport> { Arc::new(Unreachable) }
