//! One replication attempt on a replica shard
//!
//! A target walks one checkpoint through the replication stages: fetch the
//! checkpoint's file list, diff it against the local store, pull the
//! missing files into a staging area and commit. Transient failures inside
//! the attempt are retried under the same replication id; files already
//! verified in staging are not fetched again. Anything else ends the
//! attempt, and the caller decides whether to start a new one.
//!
//! By default the attempt asks for exactly its checkpoint and fails if the
//! source has moved past it. `with_selector(CheckpointSelector::Latest)`
//! accepts whatever newer checkpoint the source holds instead.

use crate::progress::{FileProgressTracker, ProgressSummary};
use crate::protocol::{CheckpointInfoResponse, CheckpointSelector};
use crate::retry::RetryPolicy;
use crate::source::SegmentReplicationSource;
use crate::state::{ReplicationStage, ReplicationState};
use parking_lot::Mutex;
use shardsync_common::{Error, ReplicationId, Result};
use shardsync_storage::{MetadataDiff, ReplicationCheckpoint, ShardStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a finished attempt did
#[derive(Debug, Clone)]
pub struct ReplicationSummary {
    pub replication_id: ReplicationId,
    /// The checkpoint the shard is at after the attempt
    pub checkpoint: ReplicationCheckpoint,
    /// False when the shard was already at (or past) the source's checkpoint
    pub applied: bool,
    pub files_fetched: usize,
    pub bytes_fetched: u64,
    pub files_reused: usize,
    pub retries: u32,
    pub elapsed: Duration,
    pub timings: Vec<(ReplicationStage, Duration)>,
}

pub struct SegmentReplicationTarget {
    replication_id: ReplicationId,
    store: Arc<ShardStore>,
    checkpoint: ReplicationCheckpoint,
    selector: CheckpointSelector,
    source: Arc<dyn SegmentReplicationSource>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    state: Arc<Mutex<ReplicationState>>,
    progress: Mutex<Option<Arc<FileProgressTracker>>>,
}

impl SegmentReplicationTarget {
    /// Create an attempt for `checkpoint`, already in `CheckpointReceived`
    pub fn new(
        replication_id: ReplicationId,
        store: Arc<ShardStore>,
        checkpoint: ReplicationCheckpoint,
        source: Arc<dyn SegmentReplicationSource>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let mut state = ReplicationState::new();
        // Idle -> CheckpointReceived is always legal
        let _ = state.transition(ReplicationStage::CheckpointReceived);
        Self {
            replication_id,
            store,
            checkpoint,
            selector: CheckpointSelector::default(),
            source,
            retry,
            cancel,
            state: Arc::new(Mutex::new(state)),
            progress: Mutex::new(None),
        }
    }

    pub fn with_selector(mut self, selector: CheckpointSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn replication_id(&self) -> ReplicationId {
        self.replication_id
    }

    pub fn checkpoint(&self) -> &ReplicationCheckpoint {
        &self.checkpoint
    }

    pub fn stage(&self) -> ReplicationStage {
        self.state.lock().stage()
    }

    /// Shared handle on the attempt's state, for observers
    pub fn state(&self) -> Arc<Mutex<ReplicationState>> {
        Arc::clone(&self.state)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Transfer progress once files are being fetched
    pub fn progress(&self) -> Option<ProgressSummary> {
        self.progress.lock().as_ref().map(|p| p.summary())
    }

    /// Run the attempt to a terminal stage
    pub async fn run(self) -> Result<ReplicationSummary> {
        let result = match self.execute().await {
            Err(e) if self.cancel.is_cancelled() && !e.is_cancellation() => {
                Err(Error::cancelled(self.replication_id, e.to_string()))
            }
            other => other,
        };

        match &result {
            Err(e) => {
                let terminal = if e.is_cancellation() {
                    ReplicationStage::Cancelled
                } else {
                    ReplicationStage::Failed
                };
                let _ = self.state.lock().transition(terminal);
                self.release_source(&e.to_string()).await;
            }
            // The source only lets go of its pin once files are fetched
            Ok(summary) if summary.files_fetched == 0 => {
                self.release_source("nothing to fetch").await;
            }
            Ok(_) => {}
        }
        result
    }

    /// Let the source drop whatever it holds for this attempt
    async fn release_source(&self, reason: &str) {
        if let Err(e) = self.source.cancel(self.replication_id, reason).await {
            debug!(
                "Could not release replication {} on {}: {}",
                self.replication_id,
                self.source.description(),
                e
            );
        }
    }

    async fn execute(&self) -> Result<ReplicationSummary> {
        let id = self.replication_id;
        self.transition(ReplicationStage::GettingCheckpointInfo)?;
        let info = self.fetch_checkpoint_info().await?;

        self.transition(ReplicationStage::FileDiff)?;
        let applied = self.store.applied_checkpoint();
        if !info.checkpoint.is_ahead_of(&applied) {
            debug!(
                "Replication {}: {} already at {:?}, source offers {:?}",
                id,
                self.store.shard_id(),
                applied.version(),
                info.checkpoint.version()
            );
            self.enter_finalizing()?;
            self.transition(ReplicationStage::Done)?;
            return Ok(self.summary(applied, false, 0, 0, 0, 0));
        }

        let diff = MetadataDiff::compute(&self.store.metadata_snapshot(), &info.metadata);
        let files_to_fetch = diff.files_to_fetch();
        let bytes_to_fetch = diff.bytes_to_fetch();
        let files_reused = diff.identical.len();
        debug!(
            "Replication {}: {} to fetch ({} bytes), {} reused, {} local files differ",
            id,
            files_to_fetch.len(),
            bytes_to_fetch,
            files_reused,
            diff.different.len()
        );

        let mut staging = self.store.staging(id.to_string())?;
        let mut retries = 0u32;
        if !files_to_fetch.is_empty() {
            self.transition(ReplicationStage::GettingFiles)?;
            let progress = Arc::new(FileProgressTracker::new(&files_to_fetch));
            *self.progress.lock() = Some(Arc::clone(&progress));

            let mut tries = 0u32;
            loop {
                tries += 1;
                let remaining: Vec<_> = files_to_fetch
                    .iter()
                    .filter(|meta| !staging.is_complete(meta))
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    break;
                }

                let transfer = self.source.get_segment_files(
                    id,
                    &info.checkpoint,
                    &remaining,
                    &mut staging,
                    &progress,
                    &self.cancel,
                );
                let result = tokio::select! {
                    () = self.cancel.cancelled() => Err(self.cancelled("cancelled while fetching files")),
                    result = transfer => result,
                };
                match result {
                    Ok(_) => break,
                    Err(e) if !self.cancel.is_cancelled() && self.retry.should_retry(&e, tries) => {
                        let backoff = self.retry.backoff(tries - 1);
                        warn!(
                            "Replication {}: fetching {} files from {} failed: {}, retrying in {:?}",
                            id,
                            remaining.len(),
                            self.source.description(),
                            e,
                            backoff
                        );
                        retries += 1;
                        self.retry
                            .sleep(backoff, &self.cancel, &|| {
                                self.cancelled("cancelled during retry backoff")
                            })
                            .await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.enter_finalizing()?;
        let store = Arc::clone(&self.store);
        let checkpoint = info.checkpoint.clone();
        let view = tokio::task::spawn_blocking(move || store.commit(staging, checkpoint))
            .await
            .map_err(|e| Error::internal(format!("commit task failed: {}", e)))??;
        self.transition(ReplicationStage::Done)?;

        let summary = self.summary(
            view.checkpoint().clone(),
            true,
            files_to_fetch.len(),
            bytes_to_fetch,
            files_reused,
            retries,
        );
        info!(
            "Replicated {} from {} (replication {}): {} files fetched ({} bytes), {} reused in {:?}",
            summary.checkpoint,
            self.source.description(),
            id,
            summary.files_fetched,
            summary.bytes_fetched,
            summary.files_reused,
            summary.elapsed
        );
        Ok(summary)
    }

    async fn fetch_checkpoint_info(&self) -> Result<CheckpointInfoResponse> {
        let id = self.replication_id;
        let info = self
            .retry
            .run(
                "get checkpoint info",
                &self.cancel,
                || self.cancelled("cancelled during retry backoff"),
                || async {
                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            Err(self.cancelled("cancelled while getting checkpoint info"))
                        }
                        info = self.source.get_checkpoint_metadata(id, &self.checkpoint, self.selector) => info,
                    }
                },
            )
            .await?;

        if info.checkpoint.shard_id() != self.store.shard_id() {
            return Err(Error::replication_failed(
                id,
                format!(
                    "source answered for {} instead of {}",
                    info.checkpoint.shard_id(),
                    self.store.shard_id()
                ),
            ));
        }
        if self.selector == CheckpointSelector::Exact
            && info.checkpoint.version() != self.checkpoint.version()
        {
            return Err(Error::replication_failed(
                id,
                format!(
                    "source answered with {:?} for exactly {:?}",
                    info.checkpoint.version(),
                    self.checkpoint.version()
                ),
            ));
        }
        if self.checkpoint.is_ahead_of(&info.checkpoint) {
            return Err(Error::replication_failed(
                id,
                format!(
                    "source answered with {:?}, older than requested {:?}",
                    info.checkpoint.version(),
                    self.checkpoint.version()
                ),
            ));
        }
        if &info.metadata != info.checkpoint.files() {
            return Err(Error::protocol(format!(
                "file list of replication {} does not match its checkpoint",
                id
            )));
        }
        Ok(info)
    }

    fn transition(&self, next: ReplicationStage) -> Result<()> {
        self.state.lock().transition(next)
    }

    /// Past this point the attempt no longer honours cancellation. The
    /// check and the transition happen under the state lock, which is also
    /// held by anyone deciding whether to cancel.
    fn enter_finalizing(&self) -> Result<()> {
        let mut state = self.state.lock();
        if self.cancel.is_cancelled() {
            return Err(self.cancelled("cancelled before finalizing"));
        }
        state.transition(ReplicationStage::Finalizing)
    }

    fn cancelled(&self, reason: &str) -> Error {
        Error::cancelled(self.replication_id, reason)
    }

    fn summary(
        &self,
        checkpoint: ReplicationCheckpoint,
        applied: bool,
        files_fetched: usize,
        bytes_fetched: u64,
        files_reused: usize,
        retries: u32,
    ) -> ReplicationSummary {
        let state = self.state.lock();
        ReplicationSummary {
            replication_id: self.replication_id,
            checkpoint,
            applied,
            files_fetched,
            bytes_fetched,
            files_reused,
            retries,
            elapsed: state.elapsed(),
            timings: state.timings().to_vec(),
        }
    }
}

impl std::fmt::Debug for SegmentReplicationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReplicationTarget")
            .field("replication_id", &self.replication_id)
            .field("shard", self.store.shard_id())
            .field("checkpoint", &self.checkpoint.version())
            .field("stage", &self.stage())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemorySource;
    use shardsync_common::ShardId;
    use shardsync_storage::{Lru, RefCountedCache};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn shard() -> ShardId {
        "logs/0".parse().unwrap()
    }

    fn replica(dir: &TempDir) -> Arc<ShardStore> {
        Arc::new(
            ShardStore::open(
                dir.path(),
                shard(),
                RefCountedCache::new(1 << 20, Arc::new(Lru)),
            )
            .unwrap(),
        )
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    fn target(
        id: u64,
        store: &Arc<ShardStore>,
        checkpoint: ReplicationCheckpoint,
        source: &Arc<InMemorySource>,
    ) -> SegmentReplicationTarget {
        SegmentReplicationTarget::new(
            ReplicationId::new(id),
            Arc::clone(store),
            checkpoint,
            Arc::clone(source) as Arc<dyn SegmentReplicationSource>,
            fast_retry(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_replicates_into_empty_replica() {
        let dir = TempDir::new().unwrap();
        let store = replica(&dir);
        let source = Arc::new(InMemorySource::new(shard()));
        let seg1 = vec![5u8; 100];
        let checkpoint = source.publish(1, 1, &[("seg1", &seg1)]);

        let target = target(1, &store, checkpoint.clone(), &source);
        let state = target.state();
        let summary = target.run().await.unwrap();

        assert!(summary.applied);
        assert_eq!(summary.files_fetched, 1);
        assert_eq!(summary.bytes_fetched, 100);
        assert_eq!(state.lock().stage(), ReplicationStage::Done);
        assert_eq!(store.applied_checkpoint(), checkpoint);
        let file = store.read_file("seg1").await.unwrap();
        assert_eq!(&file[..], &seg1[..]);

        // Same file list under a newer generation: nothing to transfer
        let next = source.publish(1, 2, &[("seg1", &seg1)]);
        let summary = target_run(2, &store, next.clone(), &source).await;
        assert!(summary.applied);
        assert_eq!(summary.files_fetched, 0);
        assert_eq!(summary.files_reused, 1);
        assert_eq!(source.stats().file_requests.load(Ordering::SeqCst), 1);
        assert_eq!(store.applied_checkpoint().version(), (1, 2));
        // Only the empty transfer had to release its pin explicitly
        assert_eq!(source.stats().cancels.load(Ordering::SeqCst), 1);
        assert!(
            summary
                .timings
                .iter()
                .all(|(stage, _)| *stage != ReplicationStage::GettingFiles)
        );
    }

    async fn target_run(
        id: u64,
        store: &Arc<ShardStore>,
        checkpoint: ReplicationCheckpoint,
        source: &Arc<InMemorySource>,
    ) -> ReplicationSummary {
        target(id, store, checkpoint, source).run().await.unwrap()
    }

    #[tokio::test]
    async fn test_superseded_checkpoint_fails_unless_latest_selected() {
        let dir = TempDir::new().unwrap();
        let store = replica(&dir);
        let source = Arc::new(InMemorySource::new(shard()));
        let c1 = source.publish(1, 1, &[("a", b"aaaa")]);
        source.publish(1, 2, &[("a", b"aaaa"), ("b", b"bbbb")]);

        let target1 = target(1, &store, c1.clone(), &source);
        let state = target1.state();
        let err = target1.run().await.unwrap_err();
        assert!(matches!(err, Error::ReplicationFailed { .. }));
        assert_eq!(state.lock().stage(), ReplicationStage::Failed);
        assert_eq!(store.applied_checkpoint().version(), (0, 0));
        assert_eq!(source.stats().file_requests.load(Ordering::SeqCst), 0);

        let summary = target(2, &store, c1, &source)
            .with_selector(CheckpointSelector::Latest)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.checkpoint.version(), (1, 2));
        assert_eq!(store.metadata_snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_transfer_releases_primary_pin() {
        use crate::local::LocalPrimarySource;
        use crate::primary::SegmentReplicationSourceService;
        use shardsync_common::NodeId;

        let primary_dir = TempDir::new().unwrap();
        let primary_store = Arc::new(
            ShardStore::open(
                primary_dir.path(),
                shard(),
                RefCountedCache::new(1 << 20, Arc::new(Lru)),
            )
            .unwrap(),
        );
        let primary = Arc::new(SegmentReplicationSourceService::new(4));
        primary.add_primary_shard(Arc::clone(&primary_store));
        let source: Arc<dyn SegmentReplicationSource> = Arc::new(LocalPrimarySource::new(
            Arc::clone(&primary),
            NodeId::new("replica-1"),
        ));

        let dir = TempDir::new().unwrap();
        let store = replica(&dir);
        let c1 = primary_store
            .commit_segments(1, vec![("a".into(), bytes::Bytes::from_static(b"aaaa"))], &[])
            .unwrap();
        let run = |id: u64, checkpoint: ReplicationCheckpoint| {
            SegmentReplicationTarget::new(
                ReplicationId::new(id),
                Arc::clone(&store),
                checkpoint,
                Arc::clone(&source),
                fast_retry(),
                CancellationToken::new(),
            )
            .run()
        };

        let summary = run(1, c1).await.unwrap();
        assert_eq!(summary.files_fetched, 1);
        assert_eq!(primary.ongoing_count(), 0);

        // A new generation with the same files
        let c2 = primary_store.commit_segments(1, vec![], &[]).unwrap();
        let summary = run(2, c2.clone()).await.unwrap();
        assert!(summary.applied);
        assert_eq!(summary.files_fetched, 0);
        assert_eq!(store.applied_checkpoint(), c2);
        assert_eq!(primary.ongoing_count(), 0);

        // Already up to date
        let summary = run(3, c2).await.unwrap();
        assert!(!summary.applied);
        assert_eq!(primary.ongoing_count(), 0);
    }

    #[tokio::test]
    async fn test_up_to_date_replica_commits_nothing() {
        let dir = TempDir::new().unwrap();
        let store = replica(&dir);
        let source = Arc::new(InMemorySource::new(shard()));
        let c1 = source.publish(1, 1, &[("a", b"aaaa")]);
        target_run(1, &store, c1.clone(), &source).await;

        let summary = target_run(2, &store, c1, &source).await;
        assert!(!summary.applied);
        assert_eq!(store.applied_checkpoint().version(), (1, 1));
    }

    #[tokio::test]
    async fn test_transient_failure_resumes_without_refetching() {
        let dir = TempDir::new().unwrap();
        let store = replica(&dir);
        let source = Arc::new(InMemorySource::new(shard()));
        let checkpoint = source.publish(1, 1, &[("a", b"first file"), ("b", b"second file")]);
        source.fail_transiently(1);

        let summary = target_run(1, &store, checkpoint, &source).await;
        assert_eq!(summary.retries, 1);
        assert_eq!(summary.files_fetched, 2);
        // `a` went through before the failure and was not sent again
        assert_eq!(source.stats().files_sent.load(Ordering::SeqCst), 2);
        assert_eq!(source.stats().file_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_attempt() {
        let dir = TempDir::new().unwrap();
        let store = replica(&dir);
        let source = Arc::new(InMemorySource::new(shard()));
        let checkpoint = source.publish(1, 1, &[("a", b"some bytes")]);
        source.corrupt_transfers(1);

        let target = target(1, &store, checkpoint, &source);
        let state = target.state();
        let err = target.run().await.unwrap_err();
        assert!(err.is_integrity_failure());
        assert_eq!(state.lock().stage(), ReplicationStage::Failed);
        assert_eq!(source.stats().file_requests.load(Ordering::SeqCst), 1);
        assert_eq!(store.applied_checkpoint().version(), (0, 0));
        assert!(!store.dir().join(".staging").join("1").exists());
    }

    #[tokio::test]
    async fn test_cancel_during_transfer() {
        let dir = TempDir::new().unwrap();
        let store = replica(&dir);
        let source = Arc::new(InMemorySource::new(shard()));
        let checkpoint = source.publish(1, 1, &[("a", &[1u8; 64])]);
        source.pause();

        let target = target(1, &store, checkpoint, &source);
        let state = target.state();
        let cancel = target.cancel_token();
        let run = tokio::spawn(target.run());

        source.transfer_started().await;
        assert_eq!(state.lock().stage(), ReplicationStage::GettingFiles);
        cancel.cancel();

        let err = run.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(state.lock().stage(), ReplicationStage::Cancelled);
        assert_eq!(source.stats().cancels.load(Ordering::SeqCst), 1);
        assert_eq!(store.applied_checkpoint().version(), (0, 0));
    }

    #[tokio::test]
    async fn test_source_behind_request_fails() {
        let dir = TempDir::new().unwrap();
        let store = replica(&dir);
        let source = Arc::new(InMemorySource::new(shard()));
        source.publish(1, 1, &[("a", b"aaaa")]);
        let future = ReplicationCheckpoint::new(shard(), 1, 5, Vec::new());

        let err = target(1, &store, future, &source).run().await.unwrap_err();
        assert!(matches!(err, Error::ReplicationFailed { .. }));
    }
}
