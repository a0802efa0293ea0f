//! Source for replicas hosted on the same node as their primary

use crate::primary::SegmentReplicationSourceService;
use crate::progress::FileProgressTracker;
use crate::protocol::{
    CheckpointInfoRequest, CheckpointInfoResponse, CheckpointSelector, GetSegmentFilesRequest,
    GetSegmentFilesResponse,
};
use crate::source::{SegmentReplicationSource, StagingWriter};
use async_trait::async_trait;
use shardsync_common::{NodeId, ReplicationId, Result};
use shardsync_storage::{ReplicationCheckpoint, StagingArea, StoreFileMetadata};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Pulls straight from the local primary service, skipping the transport
#[derive(Debug, Clone)]
pub struct LocalPrimarySource {
    primary: Arc<SegmentReplicationSourceService>,
    local_node: NodeId,
}

impl LocalPrimarySource {
    pub fn new(primary: Arc<SegmentReplicationSourceService>, local_node: NodeId) -> Self {
        Self {
            primary,
            local_node,
        }
    }
}

#[async_trait]
impl SegmentReplicationSource for LocalPrimarySource {
    async fn get_checkpoint_metadata(
        &self,
        replication_id: ReplicationId,
        checkpoint: &ReplicationCheckpoint,
        selector: CheckpointSelector,
    ) -> Result<CheckpointInfoResponse> {
        self.primary.get_checkpoint_info(&CheckpointInfoRequest {
            replication_id,
            target_node: self.local_node.clone(),
            checkpoint: checkpoint.clone(),
            selector,
        })
    }

    async fn get_segment_files(
        &self,
        replication_id: ReplicationId,
        checkpoint: &ReplicationCheckpoint,
        files_to_fetch: &[StoreFileMetadata],
        staging: &mut StagingArea,
        progress: &FileProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<GetSegmentFilesResponse> {
        let request = GetSegmentFilesRequest {
            replication_id,
            target_node: self.local_node.clone(),
            checkpoint: checkpoint.clone(),
            files_to_fetch: files_to_fetch.to_vec(),
        };
        let mut writer = StagingWriter::new(replication_id, files_to_fetch, staging, progress, cancel);
        self.primary.send_segment_files(&request, &mut writer).await?;
        writer.finish()
    }

    async fn cancel(&self, replication_id: ReplicationId, reason: &str) -> Result<()> {
        self.primary.cancel(replication_id, reason);
        Ok(())
    }

    fn description(&self) -> String {
        format!("local primary on {}", self.local_node)
    }
}
