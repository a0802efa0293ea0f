//! Source backed by a primary on another node

use crate::progress::FileProgressTracker;
use crate::protocol::{
    CANCEL_REPLICATION_ACTION, CancelReplicationRequest, CancelReplicationResponse,
    CheckpointInfoRequest, CheckpointInfoResponse, CheckpointSelector, FileChunk, GET_CHECKPOINT_INFO_ACTION,
    GET_SEGMENT_FILES_ACTION, GetSegmentFilesRequest, GetSegmentFilesResponse,
};
use crate::source::{SegmentReplicationSource, StagingWriter};
use async_trait::async_trait;
use shardsync_common::{DiscoveryNode, Error, NodeId, ReplicationId, Result};
use shardsync_storage::{ReplicationCheckpoint, StagingArea, StoreFileMetadata};
use shardsync_transport::{TransportClient, decode_payload, encode_payload};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct RemoteSegmentReplicationSource {
    client: Arc<TransportClient>,
    primary: DiscoveryNode,
    local_node: NodeId,
}

impl RemoteSegmentReplicationSource {
    pub fn new(client: Arc<TransportClient>, primary: DiscoveryNode, local_node: NodeId) -> Self {
        Self {
            client,
            primary,
            local_node,
        }
    }

    pub fn primary(&self) -> &DiscoveryNode {
        &self.primary
    }
}

#[async_trait]
impl SegmentReplicationSource for RemoteSegmentReplicationSource {
    async fn get_checkpoint_metadata(
        &self,
        replication_id: ReplicationId,
        checkpoint: &ReplicationCheckpoint,
        selector: CheckpointSelector,
    ) -> Result<CheckpointInfoResponse> {
        let request = CheckpointInfoRequest {
            replication_id,
            target_node: self.local_node.clone(),
            checkpoint: checkpoint.clone(),
            selector,
        };
        self.client
            .request(self.primary.address, GET_CHECKPOINT_INFO_ACTION, &request)
            .await
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
        let payload = encode_payload(&request)?;

        let mut writer = StagingWriter::new(replication_id, files_to_fetch, staging, progress, cancel);
        let transfer = self.client.send_streaming_request(
            self.primary.address,
            GET_SEGMENT_FILES_ACTION,
            payload,
            |raw| {
                let chunk: FileChunk = decode_payload(&raw)?;
                writer.apply(chunk)
            },
        );
        // Dropping the transfer closes the connection, which stops the
        // primary at its next chunk
        let reply = tokio::select! {
            () = cancel.cancelled() => {
                return Err(Error::cancelled(replication_id, "cancelled while fetching files"));
            }
            reply = transfer => reply?,
        };

        let sent: GetSegmentFilesResponse = decode_payload(&reply)?;
        let received = writer.finish()?;
        if sent.files.len() != received.files.len() {
            return Err(Error::protocol(format!(
                "primary reported {} files but {} were received",
                sent.files.len(),
                received.files.len()
            )));
        }
        Ok(received)
    }

    async fn cancel(&self, replication_id: ReplicationId, reason: &str) -> Result<()> {
        let request = CancelReplicationRequest {
            replication_id,
            reason: reason.to_string(),
        };
        let response: CancelReplicationResponse = self
            .client
            .request(self.primary.address, CANCEL_REPLICATION_ACTION, &request)
            .await?;
        debug!(
            "Primary {} acknowledged cancel of {} (ongoing: {})",
            self.primary, replication_id, response.cancelled
        );
        Ok(())
    }

    fn description(&self) -> String {
        format!("remote primary {}", self.primary)
    }
}
