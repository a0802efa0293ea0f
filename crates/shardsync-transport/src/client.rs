//! Transport client
//!
//! One TCP connection per request. The request timeout bounds the wait for
//! each frame rather than the whole exchange, so a long stream of chunks
//! keeps a request alive while it makes progress.

use crate::frame::{Frame, FrameKind, decode_payload, encode_payload};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use shardsync_common::config::NetworkConfig;
use shardsync_common::{Error, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// Client side of the transport
#[derive(Debug)]
pub struct TransportClient {
    connect_timeout: Duration,
    request_timeout: Duration,
    max_frame_size: usize,
    next_request_id: AtomicU64,
}

impl TransportClient {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            max_frame_size: config.max_frame_size,
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Override the per-frame request timeout
    #[must_use]
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Send a request and wait for its response. Chunk frames are a
    /// protocol error here.
    pub async fn send_request(
        &self,
        addr: SocketAddr,
        action: &str,
        payload: Bytes,
    ) -> Result<Bytes> {
        self.send_streaming_request(addr, action, payload, |_| {
            Err(Error::protocol("unexpected chunk on a unary request"))
        })
        .await
    }

    /// Send a request, passing each chunk frame to `on_chunk` as it arrives.
    /// An error from `on_chunk` aborts the request and closes the connection.
    pub async fn send_streaming_request<F>(
        &self,
        addr: SocketAddr,
        action: &str,
        payload: Bytes,
        mut on_chunk: F,
    ) -> Result<Bytes>
    where
        F: FnMut(Bytes) -> Result<()> + Send,
    {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut stream = self.connect(addr).await?;

        Frame::request(request_id, action, payload)
            .write_to(&mut stream)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", addr, e)))?;
        trace!("Sent {} (request {}) to {}", action, request_id, addr);

        loop {
            let frame = timeout(
                self.request_timeout,
                Frame::read_from(&mut stream, self.max_frame_size),
            )
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| match e {
                Error::DiskIo(io) => Error::ConnectionFailed(format!("{}: {}", addr, io)),
                other => other,
            })?;

            let Some(frame) = frame else {
                return Err(Error::ConnectionFailed(format!(
                    "{} closed the connection before responding to {}",
                    addr, action
                )));
            };
            if frame.request_id != request_id {
                return Err(Error::protocol(format!(
                    "response for request {} on request {}",
                    frame.request_id, request_id
                )));
            }

            match frame.kind {
                FrameKind::Chunk => on_chunk(frame.payload)?,
                FrameKind::Response => return Ok(frame.payload),
                FrameKind::Error => return Err(frame.into_error()),
                FrameKind::Request => {
                    return Err(Error::protocol("server sent a request frame"));
                }
            }
        }
    }

    /// Send a typed request and decode the typed response
    pub async fn request<Req, Resp>(&self, addr: SocketAddr, action: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload = self.send_request(addr, action, encode_payload(request)?).await?;
        decode_payload(&payload)
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}
