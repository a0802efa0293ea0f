//! Replication sources
//!
//! A `SegmentReplicationSource` is what a replica pulls a checkpoint from.
//! The variant is chosen when the source is resolved for a shard:
//! - `LocalPrimarySource` when the primary lives on the same node
//! - `RemoteSegmentReplicationSource` over the transport otherwise
//! - `testing::InMemorySource` in tests
//!
//! Whatever the variant, file contents are written chunk by chunk into the
//! attempt's staging area through a `StagingWriter`, which verifies every
//! file on its last chunk.

use crate::progress::FileProgressTracker;
use crate::protocol::{
    CheckpointInfoResponse, CheckpointSelector, FileChunk, GetSegmentFilesResponse,
};
use async_trait::async_trait;
use shardsync_common::{Error, ReplicationId, Result};
use shardsync_storage::{ReplicationCheckpoint, StagedFileWriter, StagingArea, StoreFileMetadata};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[async_trait]
pub trait SegmentReplicationSource: Send + Sync {
    /// Fetch the authoritative file list for `checkpoint`. With
    /// `CheckpointSelector::Exact` a source that no longer holds that
    /// checkpoint fails with `ReplicationFailed`; with `Latest` the response
    /// may describe a newer one. Never an older one.
    async fn get_checkpoint_metadata(
        &self,
        replication_id: ReplicationId,
        checkpoint: &ReplicationCheckpoint,
        selector: CheckpointSelector,
    ) -> Result<CheckpointInfoResponse>;

    /// Transfer `files_to_fetch` into `staging`, reporting progress per
    /// chunk. Stops with a cancellation error once `cancel` fires.
    async fn get_segment_files(
        &self,
        replication_id: ReplicationId,
        checkpoint: &ReplicationCheckpoint,
        files_to_fetch: &[StoreFileMetadata],
        staging: &mut StagingArea,
        progress: &FileProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<GetSegmentFilesResponse>;

    /// Tell the source side an attempt is over, releasing whatever it
    /// pinned for it. Best effort.
    async fn cancel(&self, _replication_id: ReplicationId, _reason: &str) -> Result<()> {
        Ok(())
    }

    /// Identifies the source in logs
    fn description(&self) -> String;
}

/// Receives the chunks a primary produces for one transfer
#[async_trait]
pub trait ChunkSink: Send {
    async fn send(&mut self, chunk: FileChunk) -> Result<()>;
}

/// Applies a stream of chunks to a staging area
pub struct StagingWriter<'a> {
    replication_id: ReplicationId,
    staging: &'a mut StagingArea,
    progress: &'a FileProgressTracker,
    cancel: &'a CancellationToken,
    expected: HashMap<String, StoreFileMetadata>,
    current: Option<StagedFileWriter>,
    received: Vec<StoreFileMetadata>,
}

impl<'a> StagingWriter<'a> {
    pub fn new(
        replication_id: ReplicationId,
        files: &[StoreFileMetadata],
        staging: &'a mut StagingArea,
        progress: &'a FileProgressTracker,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            replication_id,
            staging,
            progress,
            cancel,
            expected: files
                .iter()
                .map(|meta| (meta.name().to_string(), meta.clone()))
                .collect(),
            current: None,
            received: Vec::with_capacity(files.len()),
        }
    }

    /// Write one chunk. Files are sent one after another with chunks in
    /// offset order; anything else is a protocol error.
    pub fn apply(&mut self, chunk: FileChunk) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(
                self.replication_id,
                "cancelled during file transfer",
            ));
        }

        let switching = self
            .current
            .as_ref()
            .is_none_or(|writer| writer.meta().name() != chunk.file);
        if switching {
            if let Some(writer) = &self.current {
                return Err(Error::protocol(format!(
                    "chunk for {} before {} was finished",
                    chunk.file,
                    writer.meta().name()
                )));
            }
            let Some(meta) = self.expected.remove(&chunk.file) else {
                return Err(Error::protocol(format!(
                    "unexpected or repeated file {} in transfer",
                    chunk.file
                )));
            };
            self.progress.reset(meta.name());
            self.current = Some(self.staging.create_file(&meta)?);
        }

        let Some(writer) = self.current.as_mut() else {
            return Err(Error::internal("no staged file open"));
        };
        writer.write_chunk(chunk.offset, &chunk.data)?;
        self.progress.update(&chunk.file, writer.written());
        trace!(
            "Staged {} bytes of {} at offset {}",
            chunk.data.len(),
            chunk.file,
            chunk.offset
        );

        if chunk.last
            && let Some(writer) = self.current.take()
        {
            let meta = self.staging.finish_file(writer)?;
            self.progress.complete(meta.name());
            self.received.push(meta);
        }
        Ok(())
    }

    /// Check that every expected file arrived and was verified
    pub fn finish(self) -> Result<GetSegmentFilesResponse> {
        if let Some(writer) = &self.current {
            return Err(Error::protocol(format!(
                "transfer ended in the middle of {}",
                writer.meta().name()
            )));
        }
        if !self.expected.is_empty() {
            let mut missing: Vec<&str> = self.expected.keys().map(String::as_str).collect();
            missing.sort_unstable();
            return Err(Error::protocol(format!(
                "transfer ended without files {}",
                missing.join(", ")
            )));
        }
        Ok(GetSegmentFilesResponse {
            files: self.received,
        })
    }
}

#[async_trait]
impl ChunkSink for StagingWriter<'_> {
    async fn send(&mut self, chunk: FileChunk) -> Result<()> {
        self.apply(chunk)
    }
}
