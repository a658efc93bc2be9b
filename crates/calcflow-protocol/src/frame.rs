// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for broker messages.
//!
//! Every message that crosses the broker is wrapped in a frame:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type
//! - N bytes: JSON payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes type)
pub const HEADER_SIZE: usize = 6;

/// Message types carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Fire-and-forget announcement
    Broadcast = 1,
    /// Control call addressed to one process
    Rpc = 2,
    /// Reply to an RPC or task
    Response = 3,
    /// Work item for exactly one consumer
    Task = 4,
    /// Subscription management between a broker client and server
    Control = 5,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageType::Broadcast),
            2 => Ok(MessageType::Rpc),
            3 => Ok(MessageType::Response),
            4 => Ok(MessageType::Task),
            5 => Ok(MessageType::Control),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON payload error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with type and payload
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    /// Serialize `msg` as JSON into a frame of the given type.
    pub fn new<M: Serialize>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(msg)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload: Bytes::from(payload),
        })
    }

    /// Decode the JSON payload.
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let message_type = MessageType::try_from(bytes.get_u16())?;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self {
            message_type,
            payload,
        })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.encode()).await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let message_type = MessageType::try_from(u16::from_be_bytes([header[4], header[5]]))?;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        message_type,
        payload: Bytes::from(payload),
    })
}

/// Drain queued frames into `writer` until the queue closes or a write fails.
pub(crate) async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, "Connection write failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip_preserves_type() {
        let frame = Frame::new(MessageType::Rpc, &json!({"method": "pause"})).unwrap();
        let decoded = Frame::decode_from_bytes(frame.encode()).unwrap();

        assert_eq!(decoded.message_type, MessageType::Rpc);
        let body: serde_json::Value = decoded.decode().unwrap();
        assert_eq!(body["method"], "pause");
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(MessageType::Task, &"x").unwrap();
        let bytes = frame.encode();

        // "x" serializes to three bytes including quotes
        assert_eq!(&bytes[..4], &3u32.to_be_bytes());
        assert_eq!(&bytes[4..6], &4u16.to_be_bytes());
        assert_eq!(bytes.len(), HEADER_SIZE + 3);
    }

    #[test]
    fn test_invalid_message_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u16(99);
        let err = Frame::decode_from_bytes(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::InvalidMessageType(99)));
    }

    #[test]
    fn test_truncated_payload() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_u16(1);
        buf.put_slice(b"{}");
        let err = Frame::decode_from_bytes(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_u16(1);
        let err = Frame::decode_from_bytes(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = Frame::new(MessageType::Broadcast, &json!({"subject": "state_changed"})).unwrap();

        write_frame(&mut client, &frame).await.unwrap();
        let read = read_frame(&mut server).await.unwrap();
        assert_eq!(read, frame);

        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(FrameError::ConnectionClosed)
        ));
    }
}
