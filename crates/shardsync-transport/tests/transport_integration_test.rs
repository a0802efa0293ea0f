//! Transport integration tests
//!
//! Runs a real server on 127.0.0.1 and exercises:
//! - Unary and streamed request/response
//! - Unknown actions and handler errors crossing the wire
//! - Admission rejection reaching the caller before the handler runs

use async_trait::async_trait;
use bytes::Bytes;
use shardsync_common::config::{AdmissionConfig, AdmissionMode, CategoryLimits, NetworkConfig};
use shardsync_common::{Error, ReplicationId, Result};
use shardsync_transport::{
    ActionCategory, AdmissionControl, InboundRequest, RequestHandler, ResponseChannel,
    TransportClient, TransportServer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Echo {
    calls: AtomicU64,
}

#[async_trait]
impl RequestHandler for Echo {
    async fn handle(&self, request: InboundRequest, _: &mut ResponseChannel) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(request.payload)
    }
}

/// Streams `n` chunks of `i` repeated, then reports the count
struct Counter;

#[async_trait]
impl RequestHandler for Counter {
    async fn handle(&self, request: InboundRequest, channel: &mut ResponseChannel) -> Result<Bytes> {
        let n: u32 = request.decode()?;
        for i in 0..n {
            channel.send_chunk(Bytes::from(vec![i as u8; 16])).await?;
        }
        Ok(Bytes::from(channel.chunks_sent().to_le_bytes().to_vec()))
    }
}

struct Failing;

#[async_trait]
impl RequestHandler for Failing {
    async fn handle(&self, _: InboundRequest, _: &mut ResponseChannel) -> Result<Bytes> {
        Err(Error::cancelled(ReplicationId::new(11), "newer checkpoint"))
    }
}

/// Holds the request open until released
struct Blocking {
    entered: Arc<Notify>,
    release: Arc<Notify>,
    calls: AtomicU64,
}

#[async_trait]
impl RequestHandler for Blocking {
    async fn handle(&self, _: InboundRequest, _: &mut ResponseChannel) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Bytes::new())
    }
}

async fn start(server: TransportServer) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(listener, shutdown.clone()));
    (addr, shutdown)
}

fn client() -> TransportClient {
    TransportClient::new(&NetworkConfig::default()).with_request_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_unary_and_streaming_requests() {
    let mut server = TransportServer::new(1 << 20, None);
    let echo = Arc::new(Echo {
        calls: AtomicU64::new(0),
    });
    server.register("internal/echo", echo.clone());
    server.register("internal/count", Arc::new(Counter));
    let (addr, shutdown) = start(server).await;
    let client = client();

    let reply = client
        .send_request(addr, "internal/echo", Bytes::from_static(b"ping"))
        .await
        .unwrap();
    assert_eq!(&reply[..], b"ping");
    assert_eq!(echo.calls.load(Ordering::SeqCst), 1);

    let mut chunks = Vec::new();
    let reply = client
        .send_streaming_request(
            addr,
            "internal/count",
            shardsync_transport::encode_payload(&5u32).unwrap(),
            |chunk| {
                chunks.push(chunk);
                Ok(())
            },
        )
        .await
        .unwrap();
    assert_eq!(chunks.len(), 5);
    assert_eq!(chunks[3][0], 3);
    assert_eq!(u64::from_le_bytes(reply[..8].try_into().unwrap()), 5);

    // Chunks are a protocol error on a unary request
    let err = client
        .send_request(
            addr,
            "internal/count",
            shardsync_transport::encode_payload(&1u32).unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    shutdown.cancel();
}

#[tokio::test]
async fn test_errors_cross_the_wire() {
    let mut server = TransportServer::new(1 << 20, None);
    server.register("replication/fail", Arc::new(Failing));
    let (addr, shutdown) = start(server).await;
    let client = client();

    let err = client
        .send_request(addr, "replication/fail", Bytes::new())
        .await
        .unwrap_err();
    assert!(err.is_cancellation());

    let err = client
        .send_request(addr, "replication/missing", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownAction(_)));

    shutdown.cancel();
}

#[tokio::test]
async fn test_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client()
        .send_request(addr, "internal/echo", Bytes::new())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_admission_rejects_before_handler() {
    let admission = Arc::new(AdmissionControl::new(&AdmissionConfig {
        mode: AdmissionMode::Enforced,
        replication: CategoryLimits {
            max_in_flight: 1,
            ..Default::default()
        },
        internal: CategoryLimits::default(),
        cache_pressure_threshold: 0.0,
    }));

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let blocking = Arc::new(Blocking {
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
        calls: AtomicU64::new(0),
    });

    let mut server = TransportServer::new(1 << 20, Some(Arc::clone(&admission)));
    server.register("replication/getSegmentFiles", blocking.clone());
    let (addr, shutdown) = start(server).await;
    let client = Arc::new(client());

    // First request occupies the only in-flight slot
    let first = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .send_request(addr, "replication/getSegmentFiles", Bytes::new())
                .await
        })
    };
    entered.notified().await;

    // Second is rejected quickly, and the handler never sees it
    let started = std::time::Instant::now();
    let err = client
        .send_request(addr, "replication/getSegmentFiles", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AdmissionRejected { .. }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(blocking.calls.load(Ordering::SeqCst), 1);

    release.notify_one();
    first.await.unwrap().unwrap();

    let snapshot = admission.snapshot(ActionCategory::Replication);
    assert_eq!(snapshot.rejected, 1);
    assert_eq!(snapshot.in_flight, 0);

    shutdown.cancel();
}
