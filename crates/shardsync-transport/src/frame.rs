//! Wire frame codec
//!
//! Every message on a transport connection is one frame:
//! ```text
//! +-------+------+------------+------------+--------+-------------+---------+--------+
//! | Magic | Kind | Request ID | Action len | Action | Payload len | Payload | CRC32C |
//! | 4B    | 1B   | 8B         | 2B         | var    | 4B          | var     | 4B     |
//! +-------+------+------------+------------+--------+-------------+---------+--------+
//! ```
//!
//! Integers are little-endian; the CRC covers everything before it.
//! Payloads are bincode-encoded request and response structs.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shardsync_common::checksum::compute_crc32c;
use shardsync_common::{Error, Result};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame magic number
pub const FRAME_MAGIC: u32 = 0x5353_594E; // "SSYN"

/// Fixed header before the action name (magic + kind + request ID + action length)
const HEADER_SIZE: usize = 15;

/// Bytes of framing around action and payload
const FRAME_OVERHEAD: usize = HEADER_SIZE + 4 + 4;

/// Default upper bound on a single frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64 MB

fn le_u16(bytes: &[u8]) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[..2]);
    u16::from_le_bytes(buf)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Frame kind enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Request naming an action
    Request = 1,
    /// Final, successful reply to a request
    Response = 2,
    /// Intermediate streamed reply; zero or more precede the final reply
    Chunk = 3,
    /// Final, failed reply to a request
    Error = 4,
}

impl FrameKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Chunk),
            4 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Payload of an [`FrameKind::Error`] frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

/// A single transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub request_id: u64,
    /// Action name; empty on everything but requests
    pub action: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(request_id: u64, action: impl Into<String>, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Request,
            request_id,
            action: action.into(),
            payload,
        }
    }

    pub fn response(request_id: u64, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Response,
            request_id,
            action: String::new(),
            payload,
        }
    }

    pub fn chunk(request_id: u64, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Chunk,
            request_id,
            action: String::new(),
            payload,
        }
    }

    /// Error reply carrying the error's wire code and message
    pub fn error(request_id: u64, err: &Error) -> Self {
        let payload = ErrorPayload {
            code: err.wire_code(),
            message: err.to_string(),
        };
        // A two-field struct of a u16 and a String always encodes
        let payload = bincode::serialize(&payload).map(Bytes::from).unwrap_or_default();
        Self {
            kind: FrameKind::Error,
            request_id,
            action: String::new(),
            payload,
        }
    }

    /// Rebuild the error carried by an error frame
    pub fn into_error(self) -> Error {
        match bincode::deserialize::<ErrorPayload>(&self.payload) {
            Ok(payload) => Error::from_wire(payload.code, payload.message),
            Err(e) => Error::protocol(format!("undecodable error frame: {}", e)),
        }
    }

    /// Size of this frame on the wire
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.action.len() + self.payload.len()
    }

    /// Serialize a frame to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let action_len = u16::try_from(self.action.len())
            .map_err(|_| Error::protocol(format!("action name too long: {}", self.action.len())))?;
        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| Error::protocol(format!("payload too large: {}", self.payload.len())))?;

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&action_len.to_le_bytes());
        buf.extend_from_slice(self.action.as_bytes());
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(&self.payload);

        let crc = compute_crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Parse a frame from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_OVERHEAD {
            return Err(Error::protocol("frame too small"));
        }

        let magic = le_u32(&data[0..4]);
        if magic != FRAME_MAGIC {
            return Err(Error::protocol(format!("invalid frame magic {:#010x}", magic)));
        }
        let kind = FrameKind::from_u8(data[4])
            .ok_or_else(|| Error::protocol(format!("invalid frame kind {}", data[4])))?;
        let request_id = le_u64(&data[5..13]);
        let action_len = le_u16(&data[13..15]) as usize;

        let action_end = HEADER_SIZE + action_len;
        if data.len() < action_end + 8 {
            return Err(Error::protocol("frame action truncated"));
        }
        let payload_len = le_u32(&data[action_end..action_end + 4]) as usize;
        let payload_start = action_end + 4;
        let payload_end = payload_start + payload_len;
        if data.len() != payload_end + 4 {
            return Err(Error::protocol(format!(
                "frame length {} does not match header ({})",
                data.len(),
                payload_end + 4
            )));
        }

        let stored_crc = le_u32(&data[payload_end..]);
        let computed_crc = compute_crc32c(&data[..payload_end]);
        if stored_crc != computed_crc {
            return Err(Error::protocol(format!(
                "frame CRC mismatch: stored {:08x}, computed {:08x}",
                stored_crc, computed_crc
            )));
        }

        let action = std::str::from_utf8(&data[HEADER_SIZE..action_end])
            .map_err(|_| Error::protocol("action name is not UTF-8"))?
            .to_string();

        Ok(Self {
            kind,
            request_id,
            action,
            payload: Bytes::copy_from_slice(&data[payload_start..payload_end]),
        })
    }

    /// Write frame to async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next frame from an async stream.
    ///
    /// Returns `None` if the stream ends at a frame boundary. Frames larger
    /// than `max_frame_size` are rejected before their payload is read.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_frame_size: usize,
    ) -> Result<Option<Self>> {
        let mut header = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let magic = le_u32(&header[0..4]);
        if magic != FRAME_MAGIC {
            return Err(Error::protocol(format!("invalid frame magic {:#010x}", magic)));
        }
        let action_len = le_u16(&header[13..15]) as usize;

        // Action name plus the payload length that follows it
        let mut action = vec![0u8; action_len + 4];
        reader.read_exact(&mut action).await?;
        let payload_len = le_u32(&action[action_len..]) as usize;

        let frame_len = FRAME_OVERHEAD + action_len + payload_len;
        if frame_len > max_frame_size {
            return Err(Error::protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                frame_len, max_frame_size
            )));
        }

        let mut buf = Vec::with_capacity(frame_len);
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&action);
        buf.resize(frame_len, 0);
        reader.read_exact(&mut buf[HEADER_SIZE + action_len + 4..]).await?;

        Self::decode(&buf).map(Some)
    }
}

/// Encode a payload struct
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

/// Decode a payload struct
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| Error::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardsync_common::ReplicationId;

    #[test]
    fn test_frame_encode_decode() {
        let frame = Frame::request(42, "replication/getCheckpointInfo", Bytes::from_static(b"payload"));
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), frame.encoded_len());

        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_frame_crc_detects_corruption() {
        let frame = Frame::chunk(7, Bytes::from(vec![9u8; 128]));
        let mut encoded = frame.encode().unwrap();
        encoded[40] ^= 0xFF;

        assert!(matches!(Frame::decode(&encoded), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_frame_rejects_bad_magic_and_kind() {
        let mut encoded = Frame::response(1, Bytes::new()).encode().unwrap();
        encoded[0] = 0;
        assert!(Frame::decode(&encoded).is_err());

        let mut encoded = Frame::response(1, Bytes::new()).encode().unwrap();
        encoded[4] = 99;
        assert!(Frame::decode(&encoded).is_err());
    }

    #[test]
    fn test_error_frame_preserves_classification() {
        let err = Error::cancelled(ReplicationId::new(5), "superseded by newer checkpoint");
        let frame = Frame::error(9, &err);
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, FrameKind::Error);
        let rebuilt = decoded.into_error();
        assert!(rebuilt.is_cancellation());
        assert!(rebuilt.to_string().contains("superseded"));
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let frames = vec![
            Frame::request(1, "a", Bytes::from_static(b"one")),
            Frame::chunk(1, Bytes::from(vec![1u8; 1000])),
            Frame::response(1, Bytes::new()),
        ];
        for frame in &frames {
            frame.write_to(&mut client).await.unwrap();
        }
        drop(client);

        for expected in &frames {
            let frame = Frame::read_from(&mut server, DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&frame, expected);
        }
        assert!(Frame::read_from(&mut server, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1 << 16);
        Frame::chunk(1, Bytes::from(vec![0u8; 4096]))
            .write_to(&mut client)
            .await
            .unwrap();

        let err = Frame::read_from(&mut server, 1024).await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[test]
    fn test_payload_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Probe {
            id: u64,
            name: String,
        }

        let probe = Probe {
            id: 3,
            name: "x".into(),
        };
        let bytes = encode_payload(&probe).unwrap();
        assert_eq!(decode_payload::<Probe>(&bytes).unwrap(), probe);
        assert!(matches!(
            decode_payload::<Probe>(&bytes[..2]),
            Err(Error::Deserialization(_))
        ));
    }
}
