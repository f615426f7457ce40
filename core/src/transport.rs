use async_trait::async_trait;
use oplog_proto::{DownloadRequest, DownloadResponse, OpUploadResult, SnapshotUpload, UploadRequest, UploadResponse};

use crate::error::TransportError;

/// Connection to a sync server. Backends live in connector crates.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Upload regular ops. The response carries per-op results plus any remote ops the server
    /// piggybacks onto it.
    async fn upload_ops(&self, request: UploadRequest) -> Result<UploadResponse, TransportError>;

    /// One page of remote ops after `since_seq`
    async fn download_ops(&self, request: DownloadRequest) -> Result<DownloadResponse, TransportError>;

    /// Upload a full-state operation
    async fn upload_snapshot(&self, snapshot: SnapshotUpload) -> Result<OpUploadResult, TransportError>;
}
