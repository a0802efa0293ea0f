//! A ShardSync node: the shards it hosts and the services around them

use bytes::Bytes;
use parking_lot::Mutex;
use shardsync_common::{Config, Error, NodeId, Result, ShardId};
use shardsync_replication::{
    CheckpointPublisher, ClusterMembership, SegmentReplicationSourceFactory,
    SegmentReplicationSourceService, SegmentReplicationTargetService, StaticMembership,
    register_primary_handlers, register_replica_handlers,
};
use shardsync_storage::{ReplicationCheckpoint, SegmentCache, ShardStore};
use shardsync_transport::{
    ActionCategory, AdmissionControl, TransportClient, TransportServer, TransportStats,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Node {
    id: NodeId,
    cache: SegmentCache,
    primary_shards: Vec<ShardId>,
    primary: Arc<SegmentReplicationSourceService>,
    target: SegmentReplicationTargetService,
    publisher: CheckpointPublisher,
    admission: Arc<AdmissionControl>,
    transport_stats: Arc<TransportStats>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    server: Mutex<Option<JoinHandle<Result<()>>>>,
    started_at: Instant,
}

impl Node {
    /// Open every shard routed to this node and start serving on `listener`.
    ///
    /// Primaries announce their committed checkpoint and replicas ask their
    /// primary for its latest one, so a restarted node catches up without
    /// waiting for the next commit.
    pub async fn start(config: Config, listener: TcpListener) -> Result<Self> {
        config.validate()?;
        let id = config.node.node_id();
        let membership = Arc::new(StaticMembership::from_config(&config.cluster)?);
        if membership.node(&id).is_none() {
            return Err(Error::Configuration(format!(
                "node {} is not listed in cluster.nodes",
                id
            )));
        }
        let local_addr = listener.local_addr()?;

        let cache = SegmentCache::from_config(&config.cache);
        let primary_shards = membership.primary_shards(&id);
        let replica_shards = membership.replica_shards(&id);
        if let Some(shard) = primary_shards.iter().find(|s| replica_shards.contains(s)) {
            return Err(Error::Configuration(format!(
                "both the primary and a replica of {} are routed to {}",
                shard, id
            )));
        }

        let primary = Arc::new(SegmentReplicationSourceService::new(
            config.replication.chunk_size,
        ));
        for shard in &primary_shards {
            let store = ShardStore::open(&config.node.data_dir, shard.clone(), cache.clone())?;
            info!(
                "Primary {} opened at {:?}",
                shard,
                store.applied_checkpoint().version()
            );
            primary.add_primary_shard(Arc::new(store));
        }

        let client = Arc::new(TransportClient::new(&config.network));
        let factory = SegmentReplicationSourceFactory::new(
            Arc::clone(&client),
            membership.clone(),
            id.clone(),
        )
        .with_local_primary(Arc::clone(&primary));
        let target =
            SegmentReplicationTargetService::new(id.clone(), &config.replication, Arc::new(factory));
        for shard in &replica_shards {
            let store = ShardStore::open(&config.node.data_dir, shard.clone(), cache.clone())?;
            target.add_replica_shard(Arc::new(store))?;
        }

        let admission = Arc::new(AdmissionControl::new(&config.admission));
        let threshold = config.admission.cache_pressure_threshold;
        if threshold > 0.0 {
            let probe_cache = cache.clone();
            admission.add_pressure_probe(
                ActionCategory::Replication,
                "segment_cache",
                Arc::new(move || {
                    let capacity = probe_cache.capacity();
                    if capacity == 0 {
                        return None;
                    }
                    let active = probe_cache.usage().active_usage;
                    #[allow(clippy::cast_precision_loss)]
                    let ratio = active as f64 / capacity as f64;
                    (ratio > threshold).then(|| {
                        format!(
                            "segment cache active usage {} of {} bytes is above {:.0}%",
                            active,
                            capacity,
                            threshold * 100.0
                        )
                    })
                }),
            );
        }

        let mut server =
            TransportServer::new(config.network.max_frame_size, Some(Arc::clone(&admission)));
        register_primary_handlers(&mut server, &primary);
        register_replica_handlers(&mut server, &target);
        let transport_stats = server.stats();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(listener, shutdown.clone()));

        let publisher = CheckpointPublisher::new(client, membership, id.clone())
            .with_local_replicas(target.clone());

        info!(
            "Node {} serving {} primaries and {} replicas on {}",
            id,
            primary_shards.len(),
            replica_shards.len(),
            local_addr
        );

        let node = Self {
            id,
            cache,
            primary_shards,
            primary,
            target,
            publisher,
            admission,
            transport_stats,
            local_addr,
            shutdown,
            server: Mutex::new(Some(handle)),
            started_at: Instant::now(),
        };
        node.announce(&replica_shards).await;
        Ok(node)
    }

    async fn announce(&self, replica_shards: &[ShardId]) {
        for shard in &self.primary_shards {
            let Some(store) = self.primary.primary_shard(shard) else {
                continue;
            };
            let checkpoint = store.applied_checkpoint();
            if checkpoint.segments_gen() == 0 {
                continue;
            }
            let accepted = self.publisher.publish(&checkpoint).await;
            debug!("Announced {} to {} replicas", checkpoint, accepted);
        }
        for shard in replica_shards {
            if let Err(e) = self.target.request_sync(shard) {
                warn!("Failed to request sync of {}: {}", shard, e);
            }
        }
    }

    /// Commit segment changes on a local primary and publish the resulting
    /// checkpoint. Returns the checkpoint and how many replicas accepted it.
    pub async fn commit_and_publish(
        &self,
        shard: &ShardId,
        primary_term: u64,
        add: Vec<(String, Bytes)>,
        remove: Vec<String>,
    ) -> Result<(ReplicationCheckpoint, usize)> {
        let store = self
            .primary
            .primary_shard(shard)
            .ok_or_else(|| Error::shard_not_found(shard))?;
        let checkpoint =
            tokio::task::spawn_blocking(move || store.commit_segments(primary_term, add, &remove))
                .await
                .map_err(|e| Error::internal(format!("commit task failed: {}", e)))??;
        let accepted = self.publisher.publish(&checkpoint).await;
        info!("Committed {} and published to {} replicas", checkpoint, accepted);
        Ok((checkpoint, accepted))
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cache(&self) -> &SegmentCache {
        &self.cache
    }

    pub fn primary_shards(&self) -> &[ShardId] {
        &self.primary_shards
    }

    pub fn primary(&self) -> &Arc<SegmentReplicationSourceService> {
        &self.primary
    }

    pub fn target(&self) -> &SegmentReplicationTargetService {
        &self.target
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    pub fn transport_stats(&self) -> &TransportStats {
        &self.transport_stats
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn is_healthy(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.cache.is_closed()
    }

    /// Cancel ongoing replications, stop the transport and drain the cache
    pub async fn shutdown(&self) {
        info!("Shutting down node {}", self.id);
        self.primary.cancel_all("node shutting down");
        self.target.shutdown().await;
        self.shutdown.cancel();

        let server = self.server.lock().take();
        if let Some(server) = server {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Transport server stopped with error: {}", e),
                Err(e) => warn!("Transport server task failed: {}", e),
            }
        }
        self.cache.close();
        info!("Node {} shut down", self.id);
    }
}
