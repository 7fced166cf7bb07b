//! Framed RPC messages.
//!
//! Every unit on the wire is a fixed 24-byte little-endian header followed by
//! a length-prefixed payload. The header carries the correlation id, the
//! addressed `(service, object, function)` triple and the message kind; the
//! payload is opaque to the transport and routing layers.

use crate::codec;
use crate::error::{BusError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire protocol version stamped into every header.
pub const PROTOCOL_VERSION: u16 = 0;

/// Well-known service id of the service directory.
pub const SERVICE_DIRECTORY: u32 = 1;

/// Well-known object id addressing a service's main object.
pub const OBJECT_MAIN: u32 = 0;

/// Directory function resolving a service id to a `ServiceInfo` record.
pub const DIRECTORY_FUNCTION_SERVICE: u32 = 100;

/// Hard ceiling on a single frame, header included.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

static MESSAGE_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Allocate a process-unique message id for an originated request.
pub fn next_message_id() -> u32 {
    MESSAGE_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Message kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    None = 0,
    Call = 1,
    Reply = 2,
    Error = 3,
    Post = 4,
    Event = 5,
}

impl TryFrom<u8> for MessageKind {
    type Error = BusError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageKind::None),
            1 => Ok(MessageKind::Call),
            2 => Ok(MessageKind::Reply),
            3 => Ok(MessageKind::Error),
            4 => Ok(MessageKind::Post),
            5 => Ok(MessageKind::Event),
            other => Err(BusError::protocol(format!(
                "unknown message kind {}",
                other
            ))),
        }
    }
}

/// A framed RPC unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: u32,
    pub version: u16,
    pub kind: MessageKind,
    pub flags: u8,
    pub service: u32,
    pub object: u32,
    pub function: u32,
    pub payload: Bytes,
}

impl Message {
    /// Header size in bytes.
    pub const HEADER_SIZE: usize = 24;

    /// Build a call addressed to `(service, object, function)` with a fresh
    /// id from the process-wide allocator.
    pub fn call(service: u32, object: u32, function: u32, payload: Bytes) -> Self {
        Self {
            id: next_message_id(),
            version: PROTOCOL_VERSION,
            kind: MessageKind::Call,
            flags: 0,
            service,
            object,
            function,
            payload,
        }
    }

    /// Build a reply to `request`: same id and address, kind `Reply`, empty
    /// payload until the caller fills it.
    pub fn reply_from(request: &Message) -> Self {
        Self {
            id: request.id,
            version: PROTOCOL_VERSION,
            kind: MessageKind::Reply,
            flags: request.flags,
            service: request.service,
            object: request.object,
            function: request.function,
            payload: Bytes::new(),
        }
    }

    /// Build an error reply to `request` carrying a description string.
    pub fn error_from(request: &Message, description: &str) -> Self {
        Self {
            id: request.id,
            version: PROTOCOL_VERSION,
            kind: MessageKind::Error,
            flags: request.flags,
            service: request.service,
            object: request.object,
            function: request.function,
            payload: codec::encode_string(description),
        }
    }

    /// Build a forwarded copy of `original` under a caller-supplied id.
    ///
    /// A forwarder owns its own id space; everything but the id is preserved
    /// so the receiving side cannot tell the message was relayed.
    pub fn forward_from(original: &Message, new_id: u32) -> Self {
        Self {
            id: new_id,
            ..original.clone()
        }
    }

    /// Copy of this message with a rewritten id (restoring an original id
    /// when a reply crosses back over a forwarding hop).
    pub fn with_id(&self, id: u32) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }

    /// Encode header and payload into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        buf.put_u32_le(self.id);
        buf.put_u16_le(self.version);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags);
        buf.put_u32_le(self.service);
        buf.put_u32_le(self.object);
        buf.put_u32_le(self.function);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode one message from a buffer containing at least one whole frame.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < Self::HEADER_SIZE {
            return Err(BusError::protocol(format!(
                "truncated header: {} bytes",
                buf.remaining()
            )));
        }
        let id = buf.get_u32_le();
        let version = buf.get_u16_le();
        let kind = MessageKind::try_from(buf.get_u8())?;
        let flags = buf.get_u8();
        let service = buf.get_u32_le();
        let object = buf.get_u32_le();
        let function = buf.get_u32_le();
        let payload_size = buf.get_u32_le() as usize;
        if buf.remaining() < payload_size {
            return Err(BusError::protocol(format!(
                "truncated payload: need {} bytes, have {}",
                payload_size,
                buf.remaining()
            )));
        }
        let payload = buf.split_to(payload_size);
        Ok(Self {
            id,
            version,
            kind,
            flags,
            service,
            object,
            function,
            payload,
        })
    }

    /// Write one frame to an async stream.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let frame = self.encode();
        writer
            .write_all(&frame)
            .await
            .map_err(|e| BusError::network_with_source("failed to write message frame", e))?;
        writer
            .flush()
            .await
            .map_err(|e| BusError::network_with_source("failed to flush message frame", e))?;
        Ok(())
    }

    /// Read one frame from an async stream, bounding the payload size.
    ///
    /// An EOF before the first header byte returns `Ok(None)` (orderly close);
    /// an EOF mid-frame is a network error.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_message_size: usize,
    ) -> Result<Option<Self>> {
        let mut header = [0u8; Self::HEADER_SIZE];
        let mut filled = 0;
        while filled < header.len() {
            let n = reader
                .read(&mut header[filled..])
                .await
                .map_err(|e| BusError::network_with_source("failed to read message header", e))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(BusError::network("connection closed mid-header"));
            }
            filled += n;
        }

        let payload_size = u32::from_le_bytes([header[20], header[21], header[22], header[23]]) as usize;
        if Self::HEADER_SIZE + payload_size > max_message_size {
            return Err(BusError::protocol(format!(
                "message size {} exceeds maximum {}",
                Self::HEADER_SIZE + payload_size,
                max_message_size
            )));
        }

        let mut payload = vec![0u8; payload_size];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| BusError::network_with_source("failed to read message payload", e))?;

        let mut frame = BytesMut::with_capacity(Self::HEADER_SIZE + payload_size);
        frame.put_slice(&header);
        frame.put_slice(&payload);
        let mut frame = frame.freeze();
        Message::decode(&mut frame).map(Some)
    }
}
