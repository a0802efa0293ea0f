//! Replication wire messages
//!
//! Request and response payloads for the `replication/*` transport
//! actions. All of them travel as bincode inside transport frames.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use shardsync_common::{NodeId, ReplicationId};
use shardsync_storage::{MetadataSnapshot, ReplicationCheckpoint, StoreFileMetadata};

/// Replica asks the primary for the file list of a checkpoint
pub const GET_CHECKPOINT_INFO_ACTION: &str = "replication/getCheckpointInfo";

/// Replica pulls file contents; answered with chunk frames
pub const GET_SEGMENT_FILES_ACTION: &str = "replication/getSegmentFiles";

/// Replica tells the primary to stop an attempt
pub const CANCEL_REPLICATION_ACTION: &str = "replication/cancel";

/// Primary notifies a replica of a new checkpoint
pub const PUBLISH_CHECKPOINT_ACTION: &str = "replication/publishCheckpoint";

/// Which checkpoint a checkpoint-info request asks the primary to pin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointSelector {
    /// Exactly the requested checkpoint. Fails once the primary has moved
    /// past it.
    #[default]
    Exact,
    /// Whatever the primary holds now, as long as it is not behind the
    /// requested checkpoint
    Latest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfoRequest {
    pub replication_id: ReplicationId,
    pub target_node: NodeId,
    pub checkpoint: ReplicationCheckpoint,
    pub selector: CheckpointSelector,
}

/// Authoritative file list for the checkpoint the primary will serve.
///
/// `checkpoint` echoes what the primary pinned for this replication. It is
/// the requested checkpoint, or a newer one when the request selected
/// `Latest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfoResponse {
    pub checkpoint: ReplicationCheckpoint,
    pub metadata: MetadataSnapshot,
}

impl CheckpointInfoResponse {
    pub fn new(checkpoint: ReplicationCheckpoint) -> Self {
        let metadata = checkpoint.files().clone();
        Self {
            checkpoint,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSegmentFilesRequest {
    pub replication_id: ReplicationId,
    pub target_node: NodeId,
    pub checkpoint: ReplicationCheckpoint,
    pub files_to_fetch: Vec<StoreFileMetadata>,
}

/// Files actually transferred, in transfer order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetSegmentFilesResponse {
    pub files: Vec<StoreFileMetadata>,
}

impl GetSegmentFilesResponse {
    pub fn bytes(&self) -> u64 {
        self.files.iter().map(StoreFileMetadata::length).sum()
    }
}

/// One slice of a file being transferred. Chunks of a file arrive in
/// offset order and the last one is flagged; an empty file is a single
/// empty chunk with `last` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    pub file: String,
    pub offset: u64,
    pub data: Bytes,
    pub last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelReplicationRequest {
    pub replication_id: ReplicationId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelReplicationResponse {
    /// False when the primary had no such replication
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishCheckpointRequest {
    pub checkpoint: ReplicationCheckpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishCheckpointResponse {
    /// False when the replica discarded the checkpoint as stale
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardsync_common::ShardId;
    use shardsync_transport::{decode_payload, encode_payload};

    fn checkpoint() -> ReplicationCheckpoint {
        let shard: ShardId = "logs/0".parse().unwrap();
        ReplicationCheckpoint::new(
            shard,
            2,
            7,
            vec![
                StoreFileMetadata::for_contents("_0.cfs", b"segment zero"),
                StoreFileMetadata::for_contents("segments_7", b"commit point"),
            ],
        )
    }

    #[test]
    fn test_checkpoint_info_response_carries_file_list() {
        let response = CheckpointInfoResponse::new(checkpoint());
        assert_eq!(response.metadata.len(), 2);
        assert!(response.metadata.contains_key("segments_7"));

        let decoded: CheckpointInfoResponse =
            decode_payload(&encode_payload(&response).unwrap()).unwrap();
        assert_eq!(decoded.checkpoint.version(), (2, 7));
        assert_eq!(decoded.metadata, response.metadata);
    }

    #[test]
    fn test_file_chunk_keeps_payload() {
        let chunk = FileChunk {
            file: "_0.cfs".into(),
            offset: 4096,
            data: Bytes::from_static(b"abcdef"),
            last: true,
        };
        let decoded: FileChunk = decode_payload(&encode_payload(&chunk).unwrap()).unwrap();
        assert_eq!(decoded.offset, 4096);
        assert_eq!(&decoded.data[..], b"abcdef");
        assert!(decoded.last);
    }

    #[test]
    fn test_segment_files_response_bytes() {
        let response = GetSegmentFilesResponse {
            files: checkpoint().files().values().cloned().collect(),
        };
        assert_eq!(response.bytes(), checkpoint().size());
    }
}
