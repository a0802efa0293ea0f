//! ShardSync Replication - Segment replication from primaries to replicas
//!
//! This crate moves segment files from a primary shard to its replicas:
//! - Primary side: pinned views per replication, chunked file streaming, cancellation
//! - Replica side: a per-attempt state machine that diffs, fetches, verifies
//!   and atomically commits a checkpoint
//! - A per-shard driver that discards stale checkpoints, cancels outdated
//!   attempts and restarts failed ones
//! - Sources for local and remote primaries, plus an in-memory one for tests
//! - Checkpoint publishing and static cluster membership

pub mod factory;
pub mod handlers;
pub mod local;
pub mod membership;
pub mod primary;
pub mod progress;
pub mod protocol;
pub mod publisher;
pub mod remote;
pub mod retry;
pub mod service;
pub mod source;
pub mod state;
pub mod target;
pub mod testing;

// Re-exports
pub use factory::{FixedSourceResolver, SegmentReplicationSourceFactory, SourceResolver};
pub use handlers::{register_primary_handlers, register_replica_handlers};
pub use local::LocalPrimarySource;
pub use membership::{ClusterMembership, StaticMembership};
pub use primary::{SegmentReplicationSourceService, SourceStats};
pub use progress::{FileProgress, FileProgressTracker, ProgressListener, ProgressSummary};
pub use protocol::{
    CheckpointInfoRequest, CheckpointInfoResponse, CheckpointSelector, FileChunk,
    GetSegmentFilesRequest, GetSegmentFilesResponse,
};
pub use publisher::CheckpointPublisher;
pub use remote::RemoteSegmentReplicationSource;
pub use retry::RetryPolicy;
pub use service::{
    ReplicaStats, ReplicaStatus, ReplicationEvent, ReplicationOutcome,
    SegmentReplicationTargetService,
};
pub use shardsync_storage::{MetadataDiff, MetadataSnapshot, ReplicationCheckpoint, StoreFileMetadata};
pub use source::{ChunkSink, SegmentReplicationSource, StagingWriter};
pub use state::{ReplicationStage, ReplicationState};
pub use target::{ReplicationSummary, SegmentReplicationTarget};
pub use testing::InMemorySource;
