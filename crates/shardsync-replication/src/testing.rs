//! In-memory replication source for tests
//!
//! Serves checkpoints published straight into it, with knobs to inject
//! transient failures, corrupt a transfer, or hold a transfer open until
//! the test releases it.

use crate::progress::FileProgressTracker;
use crate::protocol::{
    CheckpointInfoResponse, CheckpointSelector, FileChunk, GetSegmentFilesResponse,
};
use crate::source::{SegmentReplicationSource, StagingWriter};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use shardsync_common::{Checksum, Error, ReplicationId, Result, ShardId};
use shardsync_storage::{ReplicationCheckpoint, StagingArea, StoreFileMetadata};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct InMemorySourceStats {
    pub checkpoint_requests: AtomicU64,
    pub file_requests: AtomicU64,
    pub files_sent: AtomicU64,
    pub cancels: AtomicU64,
}

#[derive(Default)]
struct Faults {
    /// Fail this many file requests after sending their first file
    transient: u32,
    /// Flip a byte in the first file of this many file requests
    corrupt: u32,
}

pub struct InMemorySource {
    shard: ShardId,
    latest: Mutex<ReplicationCheckpoint>,
    contents: Mutex<HashMap<(String, Checksum), Bytes>>,
    faults: Mutex<Faults>,
    chunk_size: usize,
    paused: watch::Sender<bool>,
    transfer_started: Notify,
    stats: InMemorySourceStats,
}

impl InMemorySource {
    pub fn new(shard: ShardId) -> Self {
        Self {
            latest: Mutex::new(ReplicationCheckpoint::empty(shard.clone())),
            shard,
            contents: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            chunk_size: 8,
            paused: watch::Sender::new(false),
            transfer_started: Notify::new(),
            stats: InMemorySourceStats::default(),
        }
    }

    /// Make a checkpoint with exactly `files` the latest one
    pub fn publish(
        &self,
        primary_term: u64,
        segments_gen: u64,
        files: &[(&str, &[u8])],
    ) -> ReplicationCheckpoint {
        let mut contents = self.contents.lock();
        let metas: Vec<StoreFileMetadata> = files
            .iter()
            .map(|(name, data)| {
                let meta = StoreFileMetadata::for_contents(*name, data);
                contents.insert(
                    (meta.name().to_string(), meta.checksum()),
                    Bytes::copy_from_slice(data),
                );
                meta
            })
            .collect();
        let checkpoint =
            ReplicationCheckpoint::new(self.shard.clone(), primary_term, segments_gen, metas);
        *self.latest.lock() = checkpoint.clone();
        checkpoint
    }

    pub fn latest(&self) -> ReplicationCheckpoint {
        self.latest.lock().clone()
    }

    pub fn fail_transiently(&self, times: u32) {
        self.faults.lock().transient = times;
    }

    pub fn corrupt_transfers(&self, times: u32) {
        self.faults.lock().corrupt = times;
    }

    /// Hold transfers after their first chunk until `resume`
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Wait until a transfer has sent its first chunk
    pub async fn transfer_started(&self) {
        self.transfer_started.notified().await;
    }

    pub fn stats(&self) -> &InMemorySourceStats {
        &self.stats
    }

    fn contents_of(&self, meta: &StoreFileMetadata) -> Result<Bytes> {
        self.contents
            .lock()
            .get(&(meta.name().to_string(), meta.checksum()))
            .cloned()
            .ok_or_else(|| Error::FileNotFound {
                shard: self.shard.to_string(),
                file: meta.name().to_string(),
            })
    }

    async fn wait_while_paused(
        &self,
        replication_id: ReplicationId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut paused = self.paused.subscribe();
        loop {
            if !*paused.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(Error::cancelled(replication_id, "cancelled while paused"));
                }
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl SegmentReplicationSource for InMemorySource {
    async fn get_checkpoint_metadata(
        &self,
        replication_id: ReplicationId,
        checkpoint: &ReplicationCheckpoint,
        selector: CheckpointSelector,
    ) -> Result<CheckpointInfoResponse> {
        self.stats.checkpoint_requests.fetch_add(1, Ordering::SeqCst);
        let latest = self.latest();
        let superseded = selector == CheckpointSelector::Exact && latest.is_ahead_of(checkpoint);
        if superseded || checkpoint.is_ahead_of(&latest) {
            return Err(Error::replication_failed(
                replication_id,
                format!("source is at {}", latest),
            ));
        }
        Ok(CheckpointInfoResponse::new(latest))
    }

    async fn get_segment_files(
        &self,
        replication_id: ReplicationId,
        _checkpoint: &ReplicationCheckpoint,
        files_to_fetch: &[StoreFileMetadata],
        staging: &mut StagingArea,
        progress: &FileProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<GetSegmentFilesResponse> {
        self.stats.file_requests.fetch_add(1, Ordering::SeqCst);
        let (fail_after_first, corrupt) = {
            let mut faults = self.faults.lock();
            let fail = faults.transient > 0;
            faults.transient = faults.transient.saturating_sub(u32::from(fail));
            let corrupt = faults.corrupt > 0;
            faults.corrupt = faults.corrupt.saturating_sub(u32::from(corrupt));
            (fail, corrupt)
        };

        let mut writer = StagingWriter::new(replication_id, files_to_fetch, staging, progress, cancel);
        let mut started = false;
        for (index, meta) in files_to_fetch.iter().enumerate() {
            let mut data = self.contents_of(meta)?;
            if corrupt && index == 0 && !data.is_empty() {
                let mut flipped = data.to_vec();
                flipped[0] ^= 0xFF;
                data = Bytes::from(flipped);
            }

            let mut offset = 0usize;
            loop {
                let end = (offset + self.chunk_size).min(data.len());
                writer.apply(FileChunk {
                    file: meta.name().to_string(),
                    offset: offset as u64,
                    data: data.slice(offset..end),
                    last: end == data.len(),
                })?;
                if !started {
                    started = true;
                    self.transfer_started.notify_one();
                    self.wait_while_paused(replication_id, cancel).await?;
                }
                offset = end;
                if offset == data.len() {
                    break;
                }
            }
            self.stats.files_sent.fetch_add(1, Ordering::SeqCst);

            if fail_after_first {
                return Err(Error::ConnectionFailed("injected transient failure".into()));
            }
        }
        writer.finish()
    }

    async fn cancel(&self, _replication_id: ReplicationId, _reason: &str) -> Result<()> {
        self.stats.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn description(&self) -> String {
        format!("in-memory source for {}", self.shard)
    }
}
