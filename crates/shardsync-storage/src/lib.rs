//! ShardSync Storage - Segment cache and shard stores
//!
//! This crate implements node-local storage for ShardSync including:
//! - A reference-counted, capacity-bounded segment cache shared by all shards
//! - Segment file metadata, replication checkpoints and file set diffing
//! - Per-shard segment directories with staging, atomic commit and pinned views

pub mod cache;
pub mod metadata;
pub mod store;

// Re-exports
pub use cache::{
    CacheHandle, CacheStats, CacheUsage, EvictionPolicy, LargestFirst, Lru, RefCountedCache,
    RemovalCause, RemovalListener, Weighted, eviction_policy,
};
pub use metadata::{MetadataDiff, MetadataSnapshot, ReplicationCheckpoint, StoreFileMetadata};
pub use store::{
    SegmentCache, SegmentCacheKey, SegmentHandle, SegmentView, ShardStore, StagedFileWriter,
    StagingArea,
};
