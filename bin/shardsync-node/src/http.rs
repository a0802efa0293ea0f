//! Metrics and health endpoints

use crate::node::Node;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use shardsync_transport::ActionCategory;
use std::fmt::{self, Write};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/replication", get(replication_handler))
        .with_state(node)
}

/// Serve the HTTP endpoints until `shutdown` fires
pub async fn serve(
    node: Arc<Node>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Metrics server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(node))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn metrics_handler(State(node): State<Arc<Node>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render_metrics(&node),
    )
}

async fn health_handler(State(node): State<Arc<Node>>) -> impl IntoResponse {
    if node.is_healthy() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "UNHEALTHY")
    }
}

async fn replication_handler(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(node.target().statuses())
}

/// Prometheus text exposition of every node counter
pub fn render_metrics(node: &Node) -> String {
    let mut out = String::with_capacity(8 * 1024);
    // Writing into a String does not fail
    let _ = write_metrics(&mut out, node);
    out
}

fn describe(out: &mut String, name: &str, kind: &str, help: &str) -> fmt::Result {
    writeln!(out, "# HELP {} {}", name, help)?;
    writeln!(out, "# TYPE {} {}", name, kind)
}

fn write_metrics(out: &mut String, node: &Node) -> fmt::Result {
    let id = node.id();

    describe(out, "shardsync_node_info", "gauge", "Node information")?;
    writeln!(out, "shardsync_node_info{{node=\"{}\"}} 1", id)?;
    describe(out, "shardsync_node_uptime_seconds", "counter", "Node uptime in seconds")?;
    writeln!(out, "shardsync_node_uptime_seconds {}", node.uptime_secs())?;

    // Segment cache
    let cache = node.cache();
    let usage = cache.usage();
    let stats = cache.stats();
    describe(out, "shardsync_cache_capacity_bytes", "gauge", "Segment cache capacity")?;
    writeln!(out, "shardsync_cache_capacity_bytes {}", cache.capacity())?;
    describe(out, "shardsync_cache_usage_bytes", "gauge", "Bytes held by cached segments")?;
    writeln!(out, "shardsync_cache_usage_bytes {}", usage.usage)?;
    describe(
        out,
        "shardsync_cache_active_usage_bytes",
        "gauge",
        "Bytes held by cached segments with open handles",
    )?;
    writeln!(out, "shardsync_cache_active_usage_bytes {}", usage.active_usage)?;
    describe(out, "shardsync_cache_entries", "gauge", "Cached segments")?;
    writeln!(out, "shardsync_cache_entries {}", cache.len())?;
    for (name, help, value) in [
        ("hits", "Cache acquires served without a load", &stats.hits),
        ("misses", "Cache acquires that started a load", &stats.misses),
        ("load_failures", "Failed or abandoned cache loads", &stats.load_failures),
        ("evictions", "Entries evicted for capacity", &stats.evictions),
        ("invalidations", "Entries removed by invalidation", &stats.invalidations),
    ] {
        let metric = format!("shardsync_cache_{}_total", name);
        describe(out, &metric, "counter", help)?;
        writeln!(out, "{} {}", metric, value.load(Ordering::Relaxed))?;
    }

    // Transport and admission
    let transport = node.transport_stats();
    for (name, help, value) in [
        ("connections_accepted", "Accepted transport connections", &transport.connections_accepted),
        ("requests_received", "Transport requests received", &transport.requests_received),
        ("requests_failed", "Transport requests answered with an error", &transport.requests_failed),
        ("chunks_sent", "Streamed response chunks sent", &transport.chunks_sent),
    ] {
        let metric = format!("shardsync_transport_{}_total", name);
        describe(out, &metric, "counter", help)?;
        writeln!(out, "{} {}", metric, value.load(Ordering::Relaxed))?;
    }

    describe(out, "shardsync_admission_in_flight", "gauge", "Admitted requests still executing")?;
    describe(out, "shardsync_admission_admitted_total", "counter", "Admitted requests")?;
    describe(out, "shardsync_admission_rejected_total", "counter", "Rejected requests")?;
    describe(
        out,
        "shardsync_admission_monitored_total",
        "counter",
        "Requests that would have been rejected in enforced mode",
    )?;
    for category in [ActionCategory::Replication, ActionCategory::Internal] {
        let snapshot = node.admission().snapshot(category);
        writeln!(
            out,
            "shardsync_admission_in_flight{{category=\"{}\"}} {}",
            category, snapshot.in_flight
        )?;
        writeln!(
            out,
            "shardsync_admission_admitted_total{{category=\"{}\"}} {}",
            category, snapshot.admitted
        )?;
        writeln!(
            out,
            "shardsync_admission_rejected_total{{category=\"{}\"}} {}",
            category, snapshot.rejected
        )?;
        writeln!(
            out,
            "shardsync_admission_monitored_total{{category=\"{}\"}} {}",
            category, snapshot.monitored
        )?;
    }

    // Primary side
    let primary = node.primary();
    let source = primary.stats();
    describe(out, "shardsync_primary_ongoing_replications", "gauge", "Replications pinning a view")?;
    writeln!(out, "shardsync_primary_ongoing_replications {}", primary.ongoing_count())?;
    for (name, help, value) in [
        ("checkpoint_requests", "Checkpoint info requests served", &source.checkpoint_requests),
        ("transfers_completed", "File transfers completed", &source.transfers_completed),
        ("transfers_failed", "File transfers failed", &source.transfers_failed),
        ("transfers_cancelled", "File transfers cancelled", &source.transfers_cancelled),
        ("files_sent", "Segment files sent", &source.files_sent),
        ("bytes_sent", "Segment bytes sent", &source.bytes_sent),
    ] {
        let metric = format!("shardsync_primary_{}_total", name);
        describe(out, &metric, "counter", help)?;
        writeln!(out, "{} {}", metric, value.load(Ordering::Relaxed))?;
    }
    describe(out, "shardsync_primary_segments_gen", "gauge", "Committed generation of a primary")?;
    for shard in node.primary_shards() {
        if let Some(store) = primary.primary_shard(shard) {
            let checkpoint = store.applied_checkpoint();
            writeln!(
                out,
                "shardsync_primary_segments_gen{{shard=\"{}\",term=\"{}\"}} {}",
                shard,
                checkpoint.primary_term(),
                checkpoint.segments_gen()
            )?;
        }
    }

    // Replica side
    let statuses = node.target().statuses();
    describe(out, "shardsync_replica_segments_gen", "gauge", "Applied generation of a replica")?;
    for status in &statuses {
        writeln!(
            out,
            "shardsync_replica_segments_gen{{shard=\"{}\",term=\"{}\"}} {}",
            status.shard, status.applied.0, status.applied.1
        )?;
    }
    describe(
        out,
        "shardsync_replica_lag_generations",
        "gauge",
        "Generations between the newest known and the applied checkpoint",
    )?;
    for status in &statuses {
        writeln!(
            out,
            "shardsync_replica_lag_generations{{shard=\"{}\"}} {}",
            status.shard, status.lag_generations
        )?;
    }
    let counters: [(&str, &str, fn(&shardsync_replication::ReplicaStatus) -> u64); 8] = [
        ("attempts", "Replication attempts started", |s| s.attempts),
        ("completed", "Replication attempts completed", |s| s.completed),
        ("cancelled", "Replication attempts cancelled", |s| s.cancelled),
        ("failed", "Replication attempts failed", |s| s.failed),
        ("discarded", "Stale checkpoints discarded", |s| s.discarded),
        ("files_fetched", "Segment files fetched", |s| s.files_fetched),
        ("bytes_fetched", "Segment bytes fetched", |s| s.bytes_fetched),
        ("files_reused", "Segment files already present locally", |s| s.files_reused),
    ];
    for (name, help, value) in counters {
        let metric = format!("shardsync_replica_{}_total", name);
        describe(out, &metric, "counter", help)?;
        for status in &statuses {
            writeln!(out, "{}{{shard=\"{}\"}} {}", metric, status.shard, value(status))?;
        }
    }
    Ok(())
}
