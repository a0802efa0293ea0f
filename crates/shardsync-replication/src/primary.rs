//! Primary side of segment replication
//!
//! Answers checkpoint-info and file requests for the shards this node is
//! primary for. Each replication id maps to the `SegmentView` that answered
//! its checkpoint-info request; holding the view keeps its files on disk
//! while they are transferred, even if the primary commits again.
//!
//! An ongoing replication is released when its transfer completes, when
//! the replica cancels it, or when a newer attempt from the same replica
//! for the same shard starts. A transfer that fails for other reasons keeps
//! its entry so the replica can retry under the same id. A replica with
//! nothing to fetch cancels its entry once it has read the checkpoint.

use crate::protocol::{
    CheckpointInfoRequest, CheckpointInfoResponse, CheckpointSelector, FileChunk,
    GetSegmentFilesRequest, GetSegmentFilesResponse,
};
use crate::source::ChunkSink;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use shardsync_common::{Error, NodeId, ReplicationId, Result, ShardId};
use shardsync_storage::{SegmentView, ShardStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Primary-side counters
#[derive(Debug, Default)]
pub struct SourceStats {
    pub checkpoint_requests: AtomicU64,
    pub transfers_completed: AtomicU64,
    pub transfers_failed: AtomicU64,
    pub transfers_cancelled: AtomicU64,
    pub files_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
}

struct OngoingReplication {
    shard: ShardId,
    target: NodeId,
    view: Arc<SegmentView>,
    cancel: CancellationToken,
    started: Instant,
}

pub struct SegmentReplicationSourceService {
    shards: RwLock<HashMap<ShardId, Arc<ShardStore>>>,
    ongoing: Mutex<HashMap<ReplicationId, OngoingReplication>>,
    chunk_size: usize,
    stats: SourceStats,
}

impl SegmentReplicationSourceService {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            ongoing: Mutex::new(HashMap::new()),
            chunk_size: chunk_size.max(1),
            stats: SourceStats::default(),
        }
    }

    /// Serve replication requests for a shard this node is primary for
    pub fn add_primary_shard(&self, store: Arc<ShardStore>) {
        info!("Serving replication for primary {}", store.shard_id());
        self.shards
            .write()
            .insert(store.shard_id().clone(), store);
    }

    /// Stop serving a shard and cancel its transfers
    pub fn remove_primary_shard(&self, shard: &ShardId) -> Option<Arc<ShardStore>> {
        let removed = self.shards.write().remove(shard);
        let mut ongoing = self.ongoing.lock();
        ongoing.retain(|id, replication| {
            if &replication.shard == shard {
                debug!("Cancelling replication {} of removed primary {}", id, shard);
                replication.cancel.cancel();
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn primary_shard(&self, shard: &ShardId) -> Option<Arc<ShardStore>> {
        self.shards.read().get(shard).cloned()
    }

    /// Pin the current view of the shard for this replication and describe
    /// its files.
    ///
    /// Fails with `ReplicationFailed` if the primary is behind the requested
    /// checkpoint, or if it has moved past it and the request selected
    /// `Exact`.
    pub fn get_checkpoint_info(
        &self,
        request: &CheckpointInfoRequest,
    ) -> Result<CheckpointInfoResponse> {
        self.stats.checkpoint_requests.fetch_add(1, Ordering::Relaxed);
        let shard = request.checkpoint.shard_id();
        let Some(store) = self.primary_shard(shard) else {
            return Err(Error::replication_failed(
                request.replication_id,
                format!("this node is not primary for {}", shard),
            ));
        };

        let view = store.current_view();
        if request.checkpoint.is_ahead_of(view.checkpoint()) {
            return Err(Error::replication_failed(
                request.replication_id,
                format!(
                    "primary {} is at {:?}, behind requested {:?}",
                    shard,
                    view.checkpoint().version(),
                    request.checkpoint.version()
                ),
            ));
        }
        if request.selector == CheckpointSelector::Exact
            && view.checkpoint().is_ahead_of(&request.checkpoint)
        {
            return Err(Error::replication_failed(
                request.replication_id,
                format!(
                    "checkpoint {:?} of {} is superseded by {:?}",
                    request.checkpoint.version(),
                    shard,
                    view.checkpoint().version()
                ),
            ));
        }

        let response = CheckpointInfoResponse::new(view.checkpoint().clone());
        let mut ongoing = self.ongoing.lock();
        ongoing.retain(|id, existing| {
            let superseded = *id != request.replication_id
                && &existing.shard == shard
                && existing.target == request.target_node;
            if superseded {
                debug!(
                    "Replication {} to {} superseded by {}",
                    id, existing.target, request.replication_id
                );
                existing.cancel.cancel();
            }
            !superseded
        });
        ongoing.insert(
            request.replication_id,
            OngoingReplication {
                shard: shard.clone(),
                target: request.target_node.clone(),
                view,
                cancel: CancellationToken::new(),
                started: Instant::now(),
            },
        );
        debug!(
            "Replication {} of {} to {} pinned {}",
            request.replication_id, shard, request.target_node, response.checkpoint
        );
        Ok(response)
    }

    /// Stream the requested files of the pinned view into `sink`
    pub async fn send_segment_files(
        &self,
        request: &GetSegmentFilesRequest,
        sink: &mut dyn ChunkSink,
    ) -> Result<GetSegmentFilesResponse> {
        let id = request.replication_id;
        let (view, cancel) = {
            let ongoing = self.ongoing.lock();
            let Some(replication) = ongoing.get(&id) else {
                return Err(Error::replication_failed(
                    id,
                    "no ongoing replication; checkpoint info must be requested first",
                ));
            };
            (Arc::clone(&replication.view), replication.cancel.clone())
        };
        if view.checkpoint().version() != request.checkpoint.version() {
            return Err(Error::replication_failed(
                id,
                format!(
                    "files requested for {:?} but {:?} is pinned",
                    request.checkpoint.version(),
                    view.checkpoint().version()
                ),
            ));
        }

        let result = self.stream_files(id, &view, request, &cancel, sink).await;
        match &result {
            Ok(response) => {
                self.stats.transfers_completed.fetch_add(1, Ordering::Relaxed);
                let started = self.release(id).map(|r| r.started.elapsed());
                info!(
                    "Sent {} files ({} bytes) of {} to {} for replication {} in {:?}",
                    response.files.len(),
                    response.bytes(),
                    view.checkpoint(),
                    request.target_node,
                    id,
                    started.unwrap_or_default()
                );
            }
            Err(e) if e.is_cancellation() => {
                self.stats.transfers_cancelled.fetch_add(1, Ordering::Relaxed);
                self.release(id);
                debug!("Replication {} cancelled: {}", id, e);
            }
            Err(e) => {
                self.stats.transfers_failed.fetch_add(1, Ordering::Relaxed);
                warn!("Replication {} to {} failed: {}", id, request.target_node, e);
            }
        }
        result
    }

    async fn stream_files(
        &self,
        id: ReplicationId,
        view: &SegmentView,
        request: &GetSegmentFilesRequest,
        cancel: &CancellationToken,
        sink: &mut dyn ChunkSink,
    ) -> Result<GetSegmentFilesResponse> {
        let mut sent = Vec::with_capacity(request.files_to_fetch.len());
        for meta in &request.files_to_fetch {
            match view.file(meta.name()) {
                Some(served) if served.is_same(meta) => {}
                _ => {
                    return Err(Error::replication_failed(
                        id,
                        format!("{} is not part of {}", meta, view.checkpoint()),
                    ));
                }
            }

            let handle = view.read_file(meta.name()).await?;
            let data: &Bytes = &handle;
            let len = data.len();
            let mut offset = 0usize;
            loop {
                if cancel.is_cancelled() {
                    return Err(Error::cancelled(id, "cancelled on the primary"));
                }
                let end = (offset + self.chunk_size).min(len);
                sink.send(FileChunk {
                    file: meta.name().to_string(),
                    offset: offset as u64,
                    data: data.slice(offset..end),
                    last: end == len,
                })
                .await?;
                self.stats
                    .bytes_sent
                    .fetch_add((end - offset) as u64, Ordering::Relaxed);
                offset = end;
                if offset == len {
                    break;
                }
            }
            self.stats.files_sent.fetch_add(1, Ordering::Relaxed);
            debug!("Sent {} for replication {}", meta, id);
            sent.push(meta.clone());
        }
        Ok(GetSegmentFilesResponse { files: sent })
    }

    /// Cancel a replication and release its pinned view
    pub fn cancel(&self, replication_id: ReplicationId, reason: &str) -> bool {
        match self.release(replication_id) {
            Some(replication) => {
                replication.cancel.cancel();
                info!(
                    "Cancelled replication {} of {} to {}: {}",
                    replication_id, replication.shard, replication.target, reason
                );
                true
            }
            None => false,
        }
    }

    /// Cancel every ongoing replication
    pub fn cancel_all(&self, reason: &str) {
        let drained: Vec<_> = self.ongoing.lock().drain().collect();
        for (id, replication) in drained {
            replication.cancel.cancel();
            debug!("Cancelled replication {}: {}", id, reason);
        }
    }

    pub fn ongoing_count(&self) -> usize {
        self.ongoing.lock().len()
    }

    pub fn is_ongoing(&self, replication_id: ReplicationId) -> bool {
        self.ongoing.lock().contains_key(&replication_id)
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    fn release(&self, replication_id: ReplicationId) -> Option<OngoingReplication> {
        self.ongoing.lock().remove(&replication_id)
    }
}

impl std::fmt::Debug for SegmentReplicationSourceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReplicationSourceService")
            .field("shards", &self.shards.read().len())
            .field("ongoing", &self.ongoing_count())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shardsync_storage::{Lru, RefCountedCache, ReplicationCheckpoint, StoreFileMetadata};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collect {
        chunks: Vec<FileChunk>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    #[async_trait]
    impl ChunkSink for Collect {
        async fn send(&mut self, chunk: FileChunk) -> Result<()> {
            self.chunks.push(chunk);
            if let Some((n, token)) = &self.cancel_after
                && self.chunks.len() == *n
            {
                token.cancel();
            }
            Ok(())
        }
    }

    fn shard() -> ShardId {
        "logs/0".parse().unwrap()
    }

    fn primary(dir: &TempDir) -> (Arc<ShardStore>, SegmentReplicationSourceService) {
        let store = Arc::new(
            ShardStore::open(
                dir.path(),
                shard(),
                RefCountedCache::new(1 << 20, Arc::new(Lru)),
            )
            .unwrap(),
        );
        let service = SegmentReplicationSourceService::new(4);
        service.add_primary_shard(Arc::clone(&store));
        (store, service)
    }

    fn info_request(id: u64, target: &str, checkpoint: ReplicationCheckpoint) -> CheckpointInfoRequest {
        CheckpointInfoRequest {
            replication_id: ReplicationId::new(id),
            target_node: NodeId::new(target),
            checkpoint,
            selector: CheckpointSelector::Exact,
        }
    }

    fn latest_request(id: u64, target: &str, checkpoint: ReplicationCheckpoint) -> CheckpointInfoRequest {
        CheckpointInfoRequest {
            selector: CheckpointSelector::Latest,
            ..info_request(id, target, checkpoint)
        }
    }

    fn files_request(
        id: u64,
        checkpoint: ReplicationCheckpoint,
        files: Vec<StoreFileMetadata>,
    ) -> GetSegmentFilesRequest {
        GetSegmentFilesRequest {
            replication_id: ReplicationId::new(id),
            target_node: NodeId::new("replica-1"),
            checkpoint,
            files_to_fetch: files,
        }
    }

    #[test]
    fn test_not_primary_fails() {
        let service = SegmentReplicationSourceService::new(4);
        let err = service
            .get_checkpoint_info(&info_request(1, "r", ReplicationCheckpoint::empty(shard())))
            .unwrap_err();
        assert!(matches!(err, Error::ReplicationFailed { .. }));
    }

    #[test]
    fn test_superseded_checkpoint_fails_unless_latest_selected() {
        let dir = TempDir::new().unwrap();
        let (store, service) = primary(&dir);
        let c1 = store
            .commit_segments(1, vec![("a".into(), Bytes::from_static(b"aaaa"))], &[])
            .unwrap();
        let c2 = store
            .commit_segments(1, vec![("b".into(), Bytes::from_static(b"bb"))], &[])
            .unwrap();

        let err = service
            .get_checkpoint_info(&info_request(1, "r", c1.clone()))
            .unwrap_err();
        assert!(matches!(err, Error::ReplicationFailed { .. }));
        assert_eq!(service.ongoing_count(), 0);

        let response = service.get_checkpoint_info(&info_request(2, "r", c2.clone())).unwrap();
        assert_eq!(response.checkpoint, c2);

        let response = service.get_checkpoint_info(&latest_request(3, "r", c1)).unwrap();
        assert_eq!(response.checkpoint.version(), c2.version());
        assert_eq!(response.metadata.len(), 2);

        let future = ReplicationCheckpoint::new(shard(), 1, 9, Vec::new());
        for request in [info_request(4, "r", future.clone()), latest_request(5, "r", future)] {
            let err = service.get_checkpoint_info(&request).unwrap_err();
            assert!(matches!(err, Error::ReplicationFailed { .. }));
        }
    }

    #[tokio::test]
    async fn test_streams_files_in_chunks() {
        let dir = TempDir::new().unwrap();
        let (store, service) = primary(&dir);
        let checkpoint = store
            .commit_segments(
                1,
                vec![
                    ("a".into(), Bytes::from_static(b"0123456789")),
                    ("empty".into(), Bytes::new()),
                ],
                &[],
            )
            .unwrap();
        service
            .get_checkpoint_info(&info_request(5, "replica-1", checkpoint.clone()))
            .unwrap();

        let files: Vec<_> = checkpoint.files().values().cloned().collect();
        let mut sink = Collect::default();
        let response = service
            .send_segment_files(&files_request(5, checkpoint, files), &mut sink)
            .await
            .unwrap();

        assert_eq!(response.files.len(), 2);
        // 10 bytes in chunks of 4, then the empty file
        assert_eq!(sink.chunks.len(), 4);
        assert_eq!(sink.chunks[2].offset, 8);
        assert!(sink.chunks[2].last);
        assert!(sink.chunks[3].data.is_empty() && sink.chunks[3].last);
        assert!(!service.is_ongoing(ReplicationId::new(5)));
        assert_eq!(service.stats().bytes_sent.load(Ordering::Relaxed), 10);
    }

    #[tokio::test]
    async fn test_files_require_checkpoint_info() {
        let dir = TempDir::new().unwrap();
        let (store, service) = primary(&dir);
        let checkpoint = store
            .commit_segments(1, vec![("a".into(), Bytes::from_static(b"aaaa"))], &[])
            .unwrap();
        let files: Vec<_> = checkpoint.files().values().cloned().collect();
        let err = service
            .send_segment_files(&files_request(9, checkpoint, files), &mut Collect::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReplicationFailed { .. }));
    }

    #[tokio::test]
    async fn test_pinned_view_survives_new_commit() {
        let dir = TempDir::new().unwrap();
        let (store, service) = primary(&dir);
        let c1 = store
            .commit_segments(1, vec![("a".into(), Bytes::from_static(b"first"))], &[])
            .unwrap();
        service
            .get_checkpoint_info(&info_request(1, "replica-1", c1.clone()))
            .unwrap();

        // Replace `a` on the primary while replication 1 still holds c1
        store
            .commit_segments(1, vec![("a".into(), Bytes::from_static(b"second"))], &[])
            .unwrap();

        let files: Vec<_> = c1.files().values().cloned().collect();
        let mut sink = Collect::default();
        service
            .send_segment_files(&files_request(1, c1, files), &mut sink)
            .await
            .unwrap();
        assert_eq!(&sink.chunks[0].data[..], b"firs");
        assert_eq!(&sink.chunks[1].data[..], b"t");
    }

    #[tokio::test]
    async fn test_cancel_stops_between_chunks() {
        let dir = TempDir::new().unwrap();
        let (store, service) = primary(&dir);
        let checkpoint = store
            .commit_segments(1, vec![("a".into(), Bytes::from(vec![7u8; 64]))], &[])
            .unwrap();
        service
            .get_checkpoint_info(&info_request(3, "replica-1", checkpoint.clone()))
            .unwrap();

        let token = service.ongoing.lock().get(&ReplicationId::new(3)).unwrap().cancel.clone();
        let mut sink = Collect {
            chunks: Vec::new(),
            cancel_after: Some((2, token)),
        };
        let files: Vec<_> = checkpoint.files().values().cloned().collect();
        let err = service
            .send_segment_files(&files_request(3, checkpoint, files), &mut sink)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(sink.chunks.len(), 2);
        assert_eq!(service.ongoing_count(), 0);
    }

    #[test]
    fn test_newer_attempt_supersedes_older() {
        let dir = TempDir::new().unwrap();
        let (store, service) = primary(&dir);
        let checkpoint = store
            .commit_segments(1, vec![("a".into(), Bytes::from_static(b"aaaa"))], &[])
            .unwrap();
        service
            .get_checkpoint_info(&info_request(1, "replica-1", checkpoint.clone()))
            .unwrap();
        service
            .get_checkpoint_info(&info_request(2, "replica-2", checkpoint.clone()))
            .unwrap();
        service
            .get_checkpoint_info(&info_request(3, "replica-1", checkpoint))
            .unwrap();

        assert!(!service.is_ongoing(ReplicationId::new(1)));
        assert!(service.is_ongoing(ReplicationId::new(2)));
        assert!(service.is_ongoing(ReplicationId::new(3)));
        assert!(service.cancel(ReplicationId::new(2), "test"));
        assert!(!service.cancel(ReplicationId::new(2), "test"));
        assert_eq!(service.ongoing_count(), 1);
    }
}
