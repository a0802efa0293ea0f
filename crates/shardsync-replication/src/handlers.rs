//! Transport handlers for the replication actions

use crate::primary::SegmentReplicationSourceService;
use crate::protocol::{
    CANCEL_REPLICATION_ACTION, CancelReplicationRequest, CancelReplicationResponse,
    CheckpointInfoRequest, FileChunk, GET_CHECKPOINT_INFO_ACTION, GET_SEGMENT_FILES_ACTION,
    GetSegmentFilesRequest, PUBLISH_CHECKPOINT_ACTION, PublishCheckpointRequest,
    PublishCheckpointResponse,
};
use crate::service::SegmentReplicationTargetService;
use crate::source::ChunkSink;
use async_trait::async_trait;
use bytes::Bytes;
use shardsync_common::Result;
use shardsync_transport::{
    InboundRequest, RequestHandler, ResponseChannel, TransportServer, encode_payload,
};
use std::sync::Arc;
use tracing::debug;

/// Sends file chunks as response chunk frames
struct ChannelSink<'a> {
    channel: &'a mut ResponseChannel,
}

#[async_trait]
impl ChunkSink for ChannelSink<'_> {
    async fn send(&mut self, chunk: FileChunk) -> Result<()> {
        self.channel.send_message(&chunk).await
    }
}

pub struct GetCheckpointInfoHandler {
    primary: Arc<SegmentReplicationSourceService>,
}

#[async_trait]
impl RequestHandler for GetCheckpointInfoHandler {
    async fn handle(&self, request: InboundRequest, _: &mut ResponseChannel) -> Result<Bytes> {
        let req: CheckpointInfoRequest = request.decode()?;
        debug!(
            "Checkpoint info for replication {} from {} ({})",
            req.replication_id, req.target_node, request.peer
        );
        encode_payload(&self.primary.get_checkpoint_info(&req)?)
    }
}

pub struct GetSegmentFilesHandler {
    primary: Arc<SegmentReplicationSourceService>,
}

#[async_trait]
impl RequestHandler for GetSegmentFilesHandler {
    async fn handle(&self, request: InboundRequest, channel: &mut ResponseChannel) -> Result<Bytes> {
        let req: GetSegmentFilesRequest = request.decode()?;
        let mut sink = ChannelSink { channel };
        let response = self.primary.send_segment_files(&req, &mut sink).await?;
        encode_payload(&response)
    }
}

pub struct CancelReplicationHandler {
    primary: Arc<SegmentReplicationSourceService>,
}

#[async_trait]
impl RequestHandler for CancelReplicationHandler {
    async fn handle(&self, request: InboundRequest, _: &mut ResponseChannel) -> Result<Bytes> {
        let req: CancelReplicationRequest = request.decode()?;
        let cancelled = self.primary.cancel(req.replication_id, &req.reason);
        encode_payload(&CancelReplicationResponse { cancelled })
    }
}

pub struct PublishCheckpointHandler {
    target: SegmentReplicationTargetService,
}

#[async_trait]
impl RequestHandler for PublishCheckpointHandler {
    async fn handle(&self, request: InboundRequest, _: &mut ResponseChannel) -> Result<Bytes> {
        let req: PublishCheckpointRequest = request.decode()?;
        let accepted = self.target.on_new_checkpoint(req.checkpoint)?;
        encode_payload(&PublishCheckpointResponse { accepted })
    }
}

/// Serve checkpoint info, file transfers and cancellation for local primaries
pub fn register_primary_handlers(
    server: &mut TransportServer,
    primary: &Arc<SegmentReplicationSourceService>,
) {
    server.register(
        GET_CHECKPOINT_INFO_ACTION,
        Arc::new(GetCheckpointInfoHandler {
            primary: Arc::clone(primary),
        }),
    );
    server.register(
        GET_SEGMENT_FILES_ACTION,
        Arc::new(GetSegmentFilesHandler {
            primary: Arc::clone(primary),
        }),
    );
    // Cancelling frees a pinned view, so it is never turned away
    server.register_ungated(
        CANCEL_REPLICATION_ACTION,
        Arc::new(CancelReplicationHandler {
            primary: Arc::clone(primary),
        }),
    );
}

/// Accept checkpoint notifications for local replicas
pub fn register_replica_handlers(
    server: &mut TransportServer,
    target: &SegmentReplicationTargetService,
) {
    server.register(
        PUBLISH_CHECKPOINT_ACTION,
        Arc::new(PublishCheckpointHandler {
            target: target.clone(),
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardsync_transport::DEFAULT_MAX_FRAME_SIZE;

    #[test]
    fn test_registers_actions() {
        let mut server = TransportServer::new(DEFAULT_MAX_FRAME_SIZE, None);
        register_primary_handlers(&mut server, &Arc::new(SegmentReplicationSourceService::new(64)));
        assert_eq!(
            server.actions(),
            vec![
                CANCEL_REPLICATION_ACTION,
                GET_CHECKPOINT_INFO_ACTION,
                GET_SEGMENT_FILES_ACTION,
            ]
        );
    }
}
