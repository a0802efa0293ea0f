//! Replica-side replication driver
//!
//! One driver task per replica shard runs replication attempts one at a
//! time. Checkpoint notifications may arrive out of order; the driver keeps
//! only the newest one:
//!
//! - a checkpoint not newer than both the applied one and the newest
//!   already received is discarded
//! - a newer checkpoint cancels an attempt still fetching an older one
//!   (attempts past `Finalizing` run to completion) and is replicated next
//! - a failed attempt is restarted with a fresh replication id, up to
//!   `max_attempt_restarts` times, unless a newer checkpoint is waiting
//!
//! A first attempt asks the primary for exactly the notified checkpoint.
//! Sync requests and restarts take whatever the primary holds now, so an
//! attempt that failed because the primary moved on picks up its newest
//! checkpoint.
//!
//! Outcomes are published on a broadcast channel of `ReplicationEvent`s.

use crate::factory::SourceResolver;
use crate::protocol::CheckpointSelector;
use crate::retry::RetryPolicy;
use crate::state::{ReplicationStage, ReplicationState};
use crate::target::{ReplicationSummary, SegmentReplicationTarget};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use shardsync_common::config::ReplicationConfig;
use shardsync_common::{Error, NodeId, ReplicationId, Result, ShardId};
use shardsync_storage::{ReplicationCheckpoint, ShardStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How a checkpoint notification or attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    Done {
        applied: bool,
        files_fetched: usize,
        bytes_fetched: u64,
        files_reused: usize,
    },
    Cancelled {
        reason: String,
    },
    Failed {
        reason: String,
        will_restart: bool,
    },
    /// The checkpoint was stale on arrival
    Discarded,
}

#[derive(Debug, Clone)]
pub struct ReplicationEvent {
    pub shard: ShardId,
    /// None for discarded notifications, which never start an attempt
    pub replication_id: Option<ReplicationId>,
    pub checkpoint: ReplicationCheckpoint,
    pub outcome: ReplicationOutcome,
}

/// Per-shard replication counters
#[derive(Debug, Default)]
pub struct ReplicaStats {
    pub checkpoints_received: AtomicU64,
    pub checkpoints_discarded: AtomicU64,
    pub attempts: AtomicU64,
    pub completed: AtomicU64,
    pub cancelled: AtomicU64,
    pub failed: AtomicU64,
    pub restarts: AtomicU64,
    pub files_fetched: AtomicU64,
    pub bytes_fetched: AtomicU64,
    pub files_reused: AtomicU64,
}

/// Point-in-time view of one replica shard
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    pub shard: String,
    pub applied: (u64, u64),
    pub latest_received: Option<(u64, u64)>,
    /// Generations between the newest known checkpoint and the applied one
    pub lag_generations: u64,
    pub replication_id: Option<u64>,
    pub stage: Option<ReplicationStage>,
    pub attempts: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub discarded: u64,
    pub files_fetched: u64,
    pub bytes_fetched: u64,
    pub files_reused: u64,
}

#[derive(Debug, Clone)]
struct PendingCheckpoint {
    checkpoint: ReplicationCheckpoint,
    /// Replicate even if the checkpoint is not ahead of the applied one
    force: bool,
}

struct CurrentAttempt {
    replication_id: ReplicationId,
    checkpoint: ReplicationCheckpoint,
    cancel: CancellationToken,
    state: Arc<Mutex<ReplicationState>>,
}

impl CurrentAttempt {
    /// Cancel unless the attempt is already finalizing. Holding the state
    /// lock keeps the attempt from entering `Finalizing` meanwhile.
    fn cancel_if_cancellable(&self) -> bool {
        let state = self.state.lock();
        if state.stage().is_cancellable() {
            self.cancel.cancel();
            true
        } else {
            false
        }
    }
}

struct ReplicaShard {
    store: Arc<ShardStore>,
    pending: watch::Sender<Option<PendingCheckpoint>>,
    latest_received: Mutex<Option<ReplicationCheckpoint>>,
    current: Mutex<Option<CurrentAttempt>>,
    stats: ReplicaStats,
    stop: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaShard {
    fn shard_id(&self) -> &ShardId {
        self.store.shard_id()
    }

    /// The newest checkpoint this shard knows of, applied or received
    fn newest_known(&self) -> ReplicationCheckpoint {
        let applied = self.store.applied_checkpoint();
        match &*self.latest_received.lock() {
            Some(latest) if latest.is_ahead_of(&applied) => latest.clone(),
            _ => applied,
        }
    }
}

struct TargetInner {
    local_node: NodeId,
    resolver: Arc<dyn SourceResolver>,
    retry: RetryPolicy,
    max_attempt_restarts: u32,
    shards: RwLock<HashMap<ShardId, Arc<ReplicaShard>>>,
    next_replication_id: AtomicU64,
    events: broadcast::Sender<ReplicationEvent>,
    shutdown: CancellationToken,
}

/// Drives replication for every replica shard on this node
#[derive(Clone)]
pub struct SegmentReplicationTargetService {
    inner: Arc<TargetInner>,
}

impl SegmentReplicationTargetService {
    pub fn new(
        local_node: NodeId,
        config: &ReplicationConfig,
        resolver: Arc<dyn SourceResolver>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        Self::with_retry_policy(local_node, config, resolver, retry)
    }

    /// Like `new`, with an explicit retry policy instead of `config.retry`
    pub fn with_retry_policy(
        local_node: NodeId,
        config: &ReplicationConfig,
        resolver: Arc<dyn SourceResolver>,
        retry: RetryPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TargetInner {
                local_node,
                resolver,
                retry,
                max_attempt_restarts: config.max_attempt_restarts,
                shards: RwLock::new(HashMap::new()),
                next_replication_id: AtomicU64::new(1),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.inner.local_node
    }

    /// Start replicating into `store`. Must be called within a Tokio runtime.
    pub fn add_replica_shard(&self, store: Arc<ShardStore>) -> Result<()> {
        let shard_id = store.shard_id().clone();
        let mut shards = self.inner.shards.write();
        if shards.contains_key(&shard_id) {
            return Err(Error::invalid_argument(format!(
                "{} is already a replica on this node",
                shard_id
            )));
        }

        let (pending, rx) = watch::channel(None);
        let shard = Arc::new(ReplicaShard {
            store,
            pending,
            latest_received: Mutex::new(None),
            current: Mutex::new(None),
            stats: ReplicaStats::default(),
            stop: self.inner.shutdown.child_token(),
            driver: Mutex::new(None),
        });
        let driver = tokio::spawn(drive(Arc::clone(&self.inner), Arc::clone(&shard), rx));
        *shard.driver.lock() = Some(driver);
        info!(
            "Replica {} started at {:?}",
            shard_id,
            shard.store.applied_checkpoint().version()
        );
        shards.insert(shard_id, shard);
        Ok(())
    }

    /// Stop replicating a shard, cancelling any attempt in flight
    pub fn remove_replica_shard(&self, shard: &ShardId) -> Option<Arc<ShardStore>> {
        let removed = self.inner.shards.write().remove(shard)?;
        removed.stop.cancel();
        info!("Replica {} removed", shard);
        Some(Arc::clone(&removed.store))
    }

    pub fn replica_shard(&self, shard: &ShardId) -> Option<Arc<ShardStore>> {
        self.inner
            .shards
            .read()
            .get(shard)
            .map(|s| Arc::clone(&s.store))
    }

    /// Handle a checkpoint notification from the primary. Returns false if
    /// the checkpoint was discarded as stale.
    pub fn on_new_checkpoint(&self, checkpoint: ReplicationCheckpoint) -> Result<bool> {
        let shard = self.shard(checkpoint.shard_id())?;
        shard.stats.checkpoints_received.fetch_add(1, Ordering::Relaxed);

        let accepted = {
            let mut latest = shard.latest_received.lock();
            let applied = shard.store.applied_checkpoint();
            let newest = match &*latest {
                Some(received) if received.is_ahead_of(&applied) => received,
                _ => &applied,
            };
            if checkpoint.is_ahead_of(newest) {
                *latest = Some(checkpoint.clone());
                true
            } else {
                false
            }
        };

        if !accepted {
            shard.stats.checkpoints_discarded.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Discarding stale checkpoint {:?} for {}",
                checkpoint.version(),
                shard.shard_id()
            );
            self.inner.emit(ReplicationEvent {
                shard: shard.shard_id().clone(),
                replication_id: None,
                checkpoint,
                outcome: ReplicationOutcome::Discarded,
            });
            return Ok(false);
        }

        if let Some(current) = &*shard.current.lock()
            && checkpoint.is_ahead_of(&current.checkpoint)
            && current.cancel_if_cancellable()
        {
            info!(
                "Cancelling replication {} of {:?} for newer checkpoint {:?} of {}",
                current.replication_id,
                current.checkpoint.version(),
                checkpoint.version(),
                shard.shard_id()
            );
        }

        debug!(
            "Received checkpoint {:?} for {}",
            checkpoint.version(),
            shard.shard_id()
        );
        shard.pending.send_replace(Some(PendingCheckpoint {
            checkpoint,
            force: false,
        }));
        Ok(true)
    }

    /// Ask the primary for its latest checkpoint and replicate it if it is
    /// ahead of the shard
    pub fn request_sync(&self, shard: &ShardId) -> Result<()> {
        let shard = self.shard(shard)?;
        shard.pending.send_replace(Some(PendingCheckpoint {
            checkpoint: shard.newest_known(),
            force: true,
        }));
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self, shard: &ShardId) -> Option<ReplicaStatus> {
        let shard = self.inner.shards.read().get(shard).cloned()?;
        Some(status_of(&shard))
    }

    /// Status of every replica shard, ordered by shard
    pub fn statuses(&self) -> Vec<ReplicaStatus> {
        let shards: Vec<Arc<ReplicaShard>> =
            self.inner.shards.read().values().cloned().collect();
        let mut statuses: Vec<ReplicaStatus> = shards.iter().map(|s| status_of(s)).collect();
        statuses.sort_by(|a, b| a.shard.cmp(&b.shard));
        statuses
    }

    /// Cancel every attempt and wait for the drivers to stop
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drivers: Vec<JoinHandle<()>> = self
            .inner
            .shards
            .read()
            .values()
            .filter_map(|shard| shard.driver.lock().take())
            .collect();
        let count = drivers.len();
        join_all(drivers).await;
        info!("Stopped {} replication drivers", count);
    }

    fn shard(&self, shard: &ShardId) -> Result<Arc<ReplicaShard>> {
        self.inner
            .shards
            .read()
            .get(shard)
            .cloned()
            .ok_or_else(|| Error::shard_not_found(shard))
    }
}

impl std::fmt::Debug for SegmentReplicationTargetService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReplicationTargetService")
            .field("local_node", &self.inner.local_node)
            .field("shards", &self.inner.shards.read().len())
            .finish_non_exhaustive()
    }
}

fn status_of(shard: &ReplicaShard) -> ReplicaStatus {
    let applied = shard.store.applied_checkpoint();
    let latest_received = shard.latest_received.lock().as_ref().map(|c| c.version());
    let newest = shard.newest_known();
    let lag_generations = if newest.primary_term() == applied.primary_term() {
        newest.segments_gen().saturating_sub(applied.segments_gen())
    } else {
        // Generations restart meaning across terms; count one step
        u64::from(newest.is_ahead_of(&applied))
    };
    let (replication_id, stage) = shard
        .current
        .lock()
        .as_ref()
        .map(|c| (Some(c.replication_id.get()), Some(c.state.lock().stage())))
        .unwrap_or_default();
    let stats = &shard.stats;
    ReplicaStatus {
        shard: shard.shard_id().to_string(),
        applied: applied.version(),
        latest_received,
        lag_generations,
        replication_id,
        stage,
        attempts: stats.attempts.load(Ordering::Relaxed),
        completed: stats.completed.load(Ordering::Relaxed),
        cancelled: stats.cancelled.load(Ordering::Relaxed),
        failed: stats.failed.load(Ordering::Relaxed),
        discarded: stats.checkpoints_discarded.load(Ordering::Relaxed),
        files_fetched: stats.files_fetched.load(Ordering::Relaxed),
        bytes_fetched: stats.bytes_fetched.load(Ordering::Relaxed),
        files_reused: stats.files_reused.load(Ordering::Relaxed),
    }
}

async fn drive(
    inner: Arc<TargetInner>,
    shard: Arc<ReplicaShard>,
    mut pending: watch::Receiver<Option<PendingCheckpoint>>,
) {
    loop {
        tokio::select! {
            () = shard.stop.cancelled() => break,
            changed = pending.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let Some(next) = pending.borrow_and_update().clone() else {
            continue;
        };
        inner.replicate(&shard, next, &pending).await;
    }
    debug!("Replication driver for {} stopped", shard.shard_id());
}

impl TargetInner {
    fn emit(&self, event: ReplicationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn next_replication_id(&self) -> ReplicationId {
        ReplicationId::new(self.next_replication_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn replicate(
        &self,
        shard: &ReplicaShard,
        pending: PendingCheckpoint,
        newer: &watch::Receiver<Option<PendingCheckpoint>>,
    ) {
        let checkpoint = pending.checkpoint;
        if !pending.force && !checkpoint.is_ahead_of(&shard.store.applied_checkpoint()) {
            shard.stats.checkpoints_discarded.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Checkpoint {:?} of {} already applied",
                checkpoint.version(),
                shard.shard_id()
            );
            self.emit(ReplicationEvent {
                shard: shard.shard_id().clone(),
                replication_id: None,
                checkpoint,
                outcome: ReplicationOutcome::Discarded,
            });
            return;
        }

        let mut restarts = 0u32;
        loop {
            let replication_id = self.next_replication_id();
            let selector = if pending.force || restarts > 0 {
                CheckpointSelector::Latest
            } else {
                CheckpointSelector::Exact
            };
            let result = match self.resolver.resolve(shard.shard_id()) {
                Ok(source) => {
                    self.run_attempt(shard, replication_id, &checkpoint, selector, source, newer)
                        .await
                }
                Err(e) => Err(e),
            };

            let reason = match result {
                Ok(summary) => {
                    self.record_done(shard, &checkpoint, &summary);
                    return;
                }
                Err(e) if e.is_cancellation() => {
                    shard.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Replication {} of {} cancelled: {}",
                        replication_id,
                        shard.shard_id(),
                        e
                    );
                    self.emit(ReplicationEvent {
                        shard: shard.shard_id().clone(),
                        replication_id: Some(replication_id),
                        checkpoint,
                        outcome: ReplicationOutcome::Cancelled {
                            reason: e.to_string(),
                        },
                    });
                    return;
                }
                Err(e) => e,
            };

            shard.stats.failed.fetch_add(1, Ordering::Relaxed);
            let superseded = newer.has_changed().unwrap_or(true);
            let will_restart =
                !superseded && !shard.stop.is_cancelled() && restarts < self.max_attempt_restarts;
            self.emit(ReplicationEvent {
                shard: shard.shard_id().clone(),
                replication_id: Some(replication_id),
                checkpoint: checkpoint.clone(),
                outcome: ReplicationOutcome::Failed {
                    reason: reason.to_string(),
                    will_restart,
                },
            });

            if !will_restart {
                if superseded {
                    info!(
                        "Replication {} of {} failed with a newer checkpoint pending: {}",
                        replication_id,
                        shard.shard_id(),
                        reason
                    );
                } else {
                    error!(
                        "Replication of {:?} for {} failed after {} restarts, waiting for the next checkpoint: {}",
                        checkpoint.version(),
                        shard.shard_id(),
                        restarts,
                        reason
                    );
                }
                return;
            }

            restarts += 1;
            shard.stats.restarts.fetch_add(1, Ordering::Relaxed);
            let backoff = self.retry.backoff(restarts - 1);
            warn!(
                "Replication {} of {} failed: {}, restarting ({}/{}) in {:?}",
                replication_id,
                shard.shard_id(),
                reason,
                restarts,
                self.max_attempt_restarts,
                backoff
            );
            tokio::select! {
                () = shard.stop.cancelled() => return,
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn run_attempt(
        &self,
        shard: &ReplicaShard,
        replication_id: ReplicationId,
        checkpoint: &ReplicationCheckpoint,
        selector: CheckpointSelector,
        source: Arc<dyn crate::source::SegmentReplicationSource>,
        newer: &watch::Receiver<Option<PendingCheckpoint>>,
    ) -> Result<ReplicationSummary> {
        let cancel = shard.stop.child_token();
        let target = SegmentReplicationTarget::new(
            replication_id,
            Arc::clone(&shard.store),
            checkpoint.clone(),
            Arc::clone(&source),
            self.retry.clone(),
            cancel.clone(),
        )
        .with_selector(selector);
        {
            let mut current = shard.current.lock();
            *current = Some(CurrentAttempt {
                replication_id,
                checkpoint: checkpoint.clone(),
                cancel,
                state: target.state(),
            });
            // A newer checkpoint may have slipped in before the attempt was
            // visible to `on_new_checkpoint`
            if newer.has_changed().unwrap_or(false)
                && let Some(attempt) = &*current
            {
                attempt.cancel_if_cancellable();
            }
        }
        shard.stats.attempts.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Starting replication {} of {:?} ({:?}) for {} from {}",
            replication_id,
            checkpoint.version(),
            selector,
            shard.shard_id(),
            source.description()
        );

        let result = target.run().await;
        *shard.current.lock() = None;
        result
    }

    fn record_done(
        &self,
        shard: &ReplicaShard,
        requested: &ReplicationCheckpoint,
        summary: &ReplicationSummary,
    ) {
        let stats = &shard.stats;
        stats.completed.fetch_add(1, Ordering::Relaxed);
        stats
            .files_fetched
            .fetch_add(summary.files_fetched as u64, Ordering::Relaxed);
        stats
            .bytes_fetched
            .fetch_add(summary.bytes_fetched, Ordering::Relaxed);
        stats
            .files_reused
            .fetch_add(summary.files_reused as u64, Ordering::Relaxed);
        if !summary.applied {
            debug!(
                "Replication {} of {}: already up to date at {:?}",
                summary.replication_id,
                shard.shard_id(),
                summary.checkpoint.version()
            );
        }
        if summary.checkpoint.version() != requested.version() {
            debug!(
                "Replication {} of {} applied {:?} for requested {:?}",
                summary.replication_id,
                shard.shard_id(),
                summary.checkpoint.version(),
                requested.version()
            );
        }
        self.emit(ReplicationEvent {
            shard: shard.shard_id().clone(),
            replication_id: Some(summary.replication_id),
            checkpoint: summary.checkpoint.clone(),
            outcome: ReplicationOutcome::Done {
                applied: summary.applied,
                files_fetched: summary.files_fetched,
                bytes_fetched: summary.bytes_fetched,
                files_reused: summary.files_reused,
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::FixedSourceResolver;
    use crate::testing::InMemorySource;
    use shardsync_storage::{Lru, RefCountedCache};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn shard() -> ShardId {
        "logs/0".parse().unwrap()
    }

    fn setup(dir: &TempDir) -> (Arc<InMemorySource>, SegmentReplicationTargetService) {
        let source = Arc::new(InMemorySource::new(shard()));
        let config = ReplicationConfig {
            max_attempt_restarts: 2,
            ..ReplicationConfig::default()
        };
        let service = SegmentReplicationTargetService::with_retry_policy(
            NodeId::new("replica-1"),
            &config,
            Arc::new(FixedSourceResolver::new(Arc::clone(&source) as _)),
            RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                multiplier: 2.0,
            },
        );
        let store = ShardStore::open(
            dir.path(),
            shard(),
            RefCountedCache::new(1 << 20, Arc::new(Lru)),
        )
        .unwrap();
        service.add_replica_shard(Arc::new(store)).unwrap();
        (source, service)
    }

    async fn next_event(events: &mut broadcast::Receiver<ReplicationEvent>) -> ReplicationEvent {
        timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for a replication event")
            .unwrap()
    }

    #[tokio::test]
    async fn test_replicates_published_checkpoint() {
        let dir = TempDir::new().unwrap();
        let (source, service) = setup(&dir);
        let mut events = service.subscribe();

        let checkpoint = source.publish(1, 1, &[("seg1", &[9u8; 100])]);
        assert!(service.on_new_checkpoint(checkpoint.clone()).unwrap());

        let event = next_event(&mut events).await;
        assert_eq!(event.checkpoint, checkpoint);
        assert!(matches!(
            event.outcome,
            ReplicationOutcome::Done {
                applied: true,
                files_fetched: 1,
                bytes_fetched: 100,
                ..
            }
        ));
        let status = service.status(&shard()).unwrap();
        assert_eq!(status.applied, (1, 1));
        assert_eq!(status.lag_generations, 0);
        assert_eq!(status.completed, 1);
        assert!(status.stage.is_none());
    }

    #[tokio::test]
    async fn test_stale_checkpoint_discarded() {
        let dir = TempDir::new().unwrap();
        let (source, service) = setup(&dir);
        let mut events = service.subscribe();

        let c1 = source.publish(1, 1, &[("a", b"aaaa")]);
        let c2 = source.publish(1, 2, &[("a", b"aaaa"), ("b", b"bbbb")]);

        // Delivered newest first
        assert!(service.on_new_checkpoint(c2.clone()).unwrap());
        assert!(!service.on_new_checkpoint(c1).unwrap());

        let mut done = None;
        while done.is_none() {
            let event = next_event(&mut events).await;
            match event.outcome {
                ReplicationOutcome::Discarded => assert_eq!(event.checkpoint.version(), (1, 1)),
                ReplicationOutcome::Done { .. } => done = Some(event),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(done.unwrap().checkpoint, c2);
        assert_eq!(service.status(&shard()).unwrap().discarded, 1);

        // Re-delivering an applied checkpoint is also stale
        assert!(!service.on_new_checkpoint(c2).unwrap());
    }

    #[tokio::test]
    async fn test_newer_checkpoint_cancels_transfer() {
        let dir = TempDir::new().unwrap();
        let (source, service) = setup(&dir);
        let mut events = service.subscribe();

        source.pause();
        let c1 = source.publish(1, 1, &[("a", &[1u8; 64])]);
        service.on_new_checkpoint(c1.clone()).unwrap();
        source.transfer_started().await;
        assert_eq!(
            service.status(&shard()).unwrap().stage,
            Some(ReplicationStage::GettingFiles)
        );

        let c2 = source.publish(1, 2, &[("a", &[1u8; 64]), ("b", &[2u8; 16])]);
        service.on_new_checkpoint(c2.clone()).unwrap();
        source.resume();

        let first = next_event(&mut events).await;
        assert_eq!(first.checkpoint, c1);
        assert!(matches!(first.outcome, ReplicationOutcome::Cancelled { .. }));

        let second = next_event(&mut events).await;
        assert_eq!(second.checkpoint, c2);
        assert!(matches!(second.outcome, ReplicationOutcome::Done { applied: true, .. }));
        assert_ne!(first.replication_id, second.replication_id);
        assert_eq!(
            service.replica_shard(&shard()).unwrap().applied_checkpoint(),
            c2
        );
    }

    #[tokio::test]
    async fn test_integrity_failure_restarts_with_new_id() {
        let dir = TempDir::new().unwrap();
        let (source, service) = setup(&dir);
        let mut events = service.subscribe();

        let checkpoint = source.publish(1, 1, &[("a", b"payload bytes")]);
        source.corrupt_transfers(1);
        service.on_new_checkpoint(checkpoint.clone()).unwrap();

        let failed = next_event(&mut events).await;
        assert!(matches!(
            failed.outcome,
            ReplicationOutcome::Failed {
                will_restart: true,
                ..
            }
        ));
        let done = next_event(&mut events).await;
        assert!(matches!(done.outcome, ReplicationOutcome::Done { .. }));
        assert_ne!(failed.replication_id, done.replication_id);
        // The restart went back to the checkpoint info
        assert_eq!(source.stats().checkpoint_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_restarts() {
        let dir = TempDir::new().unwrap();
        let (source, service) = setup(&dir);
        let mut events = service.subscribe();

        let checkpoint = source.publish(1, 1, &[("a", b"payload bytes")]);
        source.corrupt_transfers(10);
        service.on_new_checkpoint(checkpoint).unwrap();

        // First attempt plus two restarts
        for attempt in 0..3 {
            let event = next_event(&mut events).await;
            match event.outcome {
                ReplicationOutcome::Failed { will_restart, .. } => {
                    assert_eq!(will_restart, attempt < 2);
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        let status = service.status(&shard()).unwrap();
        assert_eq!(status.attempts, 3);
        assert_eq!(status.applied, (0, 0));
    }

    #[tokio::test]
    async fn test_superseded_notification_restarts_at_latest() {
        let dir = TempDir::new().unwrap();
        let (source, service) = setup(&dir);
        let mut events = service.subscribe();

        let c1 = source.publish(1, 1, &[("a", b"aaaa")]);
        source.publish(1, 2, &[("a", b"aaaa"), ("b", b"bbbb")]);
        service.on_new_checkpoint(c1.clone()).unwrap();

        let failed = next_event(&mut events).await;
        assert_eq!(failed.checkpoint, c1);
        assert!(matches!(
            failed.outcome,
            ReplicationOutcome::Failed {
                will_restart: true,
                ..
            }
        ));
        let done = next_event(&mut events).await;
        assert_eq!(done.checkpoint.version(), (1, 2));
        assert!(matches!(done.outcome, ReplicationOutcome::Done { applied: true, .. }));
    }

    #[tokio::test]
    async fn test_request_sync_pulls_latest() {
        let dir = TempDir::new().unwrap();
        let (source, service) = setup(&dir);
        let mut events = service.subscribe();

        source.publish(3, 4, &[("a", b"aaaa")]);
        service.request_sync(&shard()).unwrap();

        let event = next_event(&mut events).await;
        assert_eq!(event.checkpoint.version(), (3, 4));
        assert!(matches!(event.outcome, ReplicationOutcome::Done { applied: true, .. }));

        // Nothing newer: the sync completes without applying anything
        service.request_sync(&shard()).unwrap();
        let event = next_event(&mut events).await;
        assert!(matches!(event.outcome, ReplicationOutcome::Done { applied: false, .. }));
    }

    #[tokio::test]
    async fn test_unknown_shard_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let (_source, service) = setup(&dir);
        let other: ShardId = "metrics/0".parse().unwrap();
        let err = service
            .on_new_checkpoint(ReplicationCheckpoint::empty(other))
            .unwrap_err();
        assert!(matches!(err, Error::ShardNotFound(_)));

        timeout(Duration::from_secs(5), service.shutdown())
            .await
            .unwrap();
    }
}
