//! ShardSync Transport - Framed request/response over TCP
//!
//! This crate provides the node-to-node transport:
//! - A length-prefixed, CRC-protected frame codec with bincode payloads
//! - An action-dispatching server with streamed (chunked) responses
//! - A client with connect and per-frame timeouts
//! - Admission control in front of every registered handler

pub mod admission;
pub mod client;
pub mod frame;
pub mod server;

pub use admission::{
    ActionCategory, AdmissionControl, AdmissionControlledHandler, AdmissionPermit,
    CategorySnapshot, PressureProbe, TokenBucket,
};
pub use client::TransportClient;
pub use frame::{DEFAULT_MAX_FRAME_SIZE, Frame, FrameKind, decode_payload, encode_payload};
pub use server::{InboundRequest, RequestHandler, ResponseChannel, TransportServer, TransportStats};
