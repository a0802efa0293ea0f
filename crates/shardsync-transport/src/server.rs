//! Transport server
//!
//! Accepts TCP connections and dispatches request frames to the handler
//! registered for their action name. Handlers may stream any number of
//! chunk frames before the final response. Requests on one connection run
//! concurrently; a single writer task per connection serializes the frames
//! they produce.

use crate::admission::{AdmissionControl, AdmissionControlledHandler};
use crate::frame::{Frame, FrameKind, decode_payload, encode_payload};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use shardsync_common::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frames queued per connection before handlers wait on the socket
const WRITE_QUEUE_DEPTH: usize = 32;

/// A decoded inbound request
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub request_id: u64,
    pub action: String,
    pub payload: Bytes,
    pub peer: SocketAddr,
}

impl InboundRequest {
    /// Decode the payload as a request struct
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        decode_payload(&self.payload)
    }
}

/// Streams intermediate replies back to the caller
pub struct ResponseChannel {
    request_id: u64,
    tx: mpsc::Sender<Frame>,
    chunks_sent: u64,
}

impl ResponseChannel {
    fn new(request_id: u64, tx: mpsc::Sender<Frame>) -> Self {
        Self {
            request_id,
            tx,
            chunks_sent: 0,
        }
    }

    /// Send one chunk frame. Fails once the caller has gone away, which
    /// is how a streaming handler learns to stop.
    pub async fn send_chunk(&mut self, payload: Bytes) -> Result<()> {
        self.tx
            .send(Frame::chunk(self.request_id, payload))
            .await
            .map_err(|_| Error::ConnectionFailed("peer closed the connection".into()))?;
        self.chunks_sent += 1;
        Ok(())
    }

    /// Encode and send one chunk
    pub async fn send_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        self.send_chunk(encode_payload(message)?).await
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }
}

/// Handles one action
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle a request, streaming chunks on `channel` if needed. The
    /// returned bytes become the response payload; an error becomes an
    /// error frame carrying its wire code.
    async fn handle(&self, request: InboundRequest, channel: &mut ResponseChannel)
    -> Result<Bytes>;
}

/// Transport statistics
#[derive(Debug, Default)]
pub struct TransportStats {
    pub connections_accepted: AtomicU64,
    pub requests_received: AtomicU64,
    pub requests_failed: AtomicU64,
    pub chunks_sent: AtomicU64,
}

type HandlerMap = HashMap<String, Arc<dyn RequestHandler>>;

/// Action-dispatching TCP server
pub struct TransportServer {
    handlers: HandlerMap,
    admission: Option<Arc<AdmissionControl>>,
    max_frame_size: usize,
    stats: Arc<TransportStats>,
}

impl TransportServer {
    /// Create a server. With admission control, every handler added through
    /// `register` is gated by it.
    pub fn new(max_frame_size: usize, admission: Option<Arc<AdmissionControl>>) -> Self {
        Self {
            handlers: HashMap::new(),
            admission,
            max_frame_size,
            stats: Arc::new(TransportStats::default()),
        }
    }

    /// Register the handler for an action, replacing any previous one
    pub fn register(&mut self, action: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        let action = action.into();
        let handler: Arc<dyn RequestHandler> = match &self.admission {
            Some(admission) => Arc::new(AdmissionControlledHandler::new(
                Arc::clone(admission),
                handler,
            )),
            None => handler,
        };
        debug!("Registered handler for {}", action);
        self.handlers.insert(action, handler);
    }

    /// Register a handler that admission control never gates. For actions
    /// that release resources, which must get through while the node is
    /// under pressure.
    pub fn register_ungated(
        &mut self,
        action: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) {
        let action = action.into();
        debug!("Registered ungated handler for {}", action);
        self.handlers.insert(action, handler);
    }

    /// Registered action names, sorted
    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            "Transport listening on {} ({} actions)",
            local_addr,
            self.handlers.len()
        );

        let handlers = Arc::new(self.handlers);
        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
            let _ = stream.set_nodelay(true);

            tokio::spawn(handle_connection(
                stream,
                peer,
                Arc::clone(&handlers),
                self.max_frame_size,
                Arc::clone(&self.stats),
                shutdown.clone(),
            ));
        }

        info!("Transport on {} stopped", local_addr);
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handlers: Arc<HandlerMap>,
    max_frame_size: usize,
    stats: Arc<TransportStats>,
    shutdown: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Frame>(WRITE_QUEUE_DEPTH);

    let writer_stats = Arc::clone(&stats);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let is_chunk = frame.kind == FrameKind::Chunk;
            if let Err(e) = frame.write_to(&mut writer).await {
                debug!("Write to {} failed: {}", peer, e);
                break;
            }
            if is_chunk {
                writer_stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = Frame::read_from(&mut reader, max_frame_size) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping connection from {}: {}", peer, e);
                break;
            }
        };

        if frame.kind != FrameKind::Request {
            let err = Error::protocol(format!("expected a request frame, got {:?}", frame.kind));
            let _ = tx.send(Frame::error(frame.request_id, &err)).await;
            continue;
        }

        stats.requests_received.fetch_add(1, Ordering::Relaxed);
        let handler = handlers.get(&frame.action).cloned();
        let tx = tx.clone();
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            let request_id = frame.request_id;
            let action = frame.action.clone();
            let outcome = match handler {
                Some(handler) => {
                    let request = InboundRequest {
                        request_id,
                        action: frame.action,
                        payload: frame.payload,
                        peer,
                    };
                    let mut channel = ResponseChannel::new(request_id, tx.clone());
                    handler.handle(request, &mut channel).await
                }
                None => Err(Error::UnknownAction(frame.action)),
            };

            let reply = match outcome {
                Ok(payload) => Frame::response(request_id, payload),
                Err(e) => {
                    stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                    if e.is_cancellation() {
                        debug!("{} from {} cancelled: {}", action, peer, e);
                    } else {
                        debug!("{} from {} failed: {}", action, peer, e);
                    }
                    Frame::error(request_id, &e)
                }
            };
            let _ = tx.send(reply).await;
        });
    }

    drop(tx);
    let _ = writer_task.await;
    debug!("Connection from {} closed", peer);
}
