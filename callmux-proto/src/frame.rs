//! Frame encoding/decoding.
//!
//! Every frame has a fixed 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                    |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+------...------+
//! |R|                 Stream Identifier (31)       |
//! +-+---------------------------------------------+
//! |                   Frame Payload ...            |
//! +-----------------------------------------------+
//! ```
//!
//! Stream id 0 addresses the connection itself (Ping, Settings, GoAway and
//! connection-level WindowUpdate).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, ErrorCode};
use crate::metadata::Metadata;
use crate::settings::{MAX_FRAME_SIZE_LIMIT, Settings};
use crate::status::{Code, Status};

/// Frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 9;

// Frame type constants.
pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_TRAILERS: u8 = 0x2;
pub const FRAME_WINDOW_UPDATE: u8 = 0x3;
pub const FRAME_RESET: u8 = 0x4;
pub const FRAME_PING: u8 = 0x5;
pub const FRAME_SETTINGS: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;

// Flag constants.
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_END_MESSAGE: u8 = 0x2;
pub const FLAG_ACK: u8 = 0x1;

/// A logical frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opens a stream (or carries the responder's initial metadata).
    Headers {
        stream_id: u32,
        metadata: Metadata,
        end_stream: bool,
    },
    /// A chunk of message payload. `end_message` marks the last chunk of a
    /// message; `end_stream` half-closes the sender.
    Data {
        stream_id: u32,
        payload: Bytes,
        end_message: bool,
        end_stream: bool,
    },
    /// Final status plus trailing metadata; half-closes the sender.
    Trailers {
        stream_id: u32,
        status: Status,
        metadata: Metadata,
    },
    /// Flow-control window increment (stream 0 = connection window).
    WindowUpdate { stream_id: u32, increment: u32 },
    /// Abnormal stream termination.
    Reset {
        stream_id: u32,
        error_code: ErrorCode,
    },
    /// Liveness check.
    Ping { ack: bool, opaque_data: [u8; 8] },
    /// Configuration parameters.
    Settings { ack: bool, settings: Settings },
    /// Connection is going away; streams above `last_stream_id` were not
    /// processed.
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
}

impl Frame {
    /// Stream this frame addresses; 0 for connection-level frames.
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Headers { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::Trailers { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Reset { stream_id, .. } => *stream_id,
            Frame::Ping { .. } | Frame::Settings { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// Encode this frame into `buf` (header + payload).
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Headers {
                stream_id,
                metadata,
                end_stream,
            } => {
                let flags = if *end_stream { FLAG_END_STREAM } else { 0 };
                let len = metadata.encoded_len() as u32;
                encode_frame_header(buf, len, FRAME_HEADERS, flags, *stream_id);
                metadata.encode(buf);
            }
            Frame::Data {
                stream_id,
                payload,
                end_message,
                end_stream,
            } => {
                let mut flags = 0u8;
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                if *end_message {
                    flags |= FLAG_END_MESSAGE;
                }
                encode_frame_header(buf, payload.len() as u32, FRAME_DATA, flags, *stream_id);
                buf.put_slice(payload);
            }
            Frame::Trailers {
                stream_id,
                status,
                metadata,
            } => {
                let len = trailers_len(status, metadata);
                encode_frame_header(buf, len as u32, FRAME_TRAILERS, 0, *stream_id);
                buf.put_u8(status.code as u8);
                buf.put_u32(status.message.len() as u32);
                buf.put_slice(status.message.as_bytes());
                metadata.encode(buf);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                encode_frame_header(buf, 4, FRAME_WINDOW_UPDATE, 0, *stream_id);
                buf.put_u32(*increment & 0x7fff_ffff);
            }
            Frame::Reset {
                stream_id,
                error_code,
            } => {
                encode_frame_header(buf, 4, FRAME_RESET, 0, *stream_id);
                buf.put_u32(*error_code as u32);
            }
            Frame::Ping { ack, opaque_data } => {
                let flags = if *ack { FLAG_ACK } else { 0 };
                encode_frame_header(buf, 8, FRAME_PING, flags, 0);
                buf.put_slice(opaque_data);
            }
            Frame::Settings { ack, settings } => {
                if *ack {
                    encode_frame_header(buf, 0, FRAME_SETTINGS, FLAG_ACK, 0);
                } else {
                    encode_frame_header(buf, 24, FRAME_SETTINGS, 0, 0);
                    settings.encode(buf);
                }
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                let len = 8 + debug_data.len() as u32;
                encode_frame_header(buf, len, FRAME_GOAWAY, 0, 0);
                buf.put_u32(*last_stream_id & 0x7fff_ffff);
                buf.put_u32(*error_code as u32);
                buf.put_slice(debug_data);
            }
        }
    }
}

/// Payload size of a Trailers frame carrying `status` and `metadata`.
pub fn trailers_len(status: &Status, metadata: &Metadata) -> usize {
    1 + 4 + status.message.len() + metadata.encoded_len()
}

// -- Frame header encoding/decoding --

/// Encode a 9-byte frame header.
pub fn encode_frame_header(
    buf: &mut BytesMut,
    payload_len: u32,
    frame_type: u8,
    flags: u8,
    stream_id: u32,
) {
    debug_assert!(payload_len <= MAX_FRAME_SIZE_LIMIT, "frame length overflows 24 bits");
    buf.reserve(FRAME_HEADER_LEN + payload_len as usize);
    buf.put_uint(u64::from(payload_len), 3);
    buf.put_u8(frame_type);
    buf.put_u8(flags);
    buf.put_u32(stream_id & 0x7fff_ffff);
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

/// Decode a 9-byte frame header from the start of `buf`.
/// Returns `None` if the buffer is too short.
pub fn decode_frame_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let length = (u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2]);
    let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
    Some(FrameHeader {
        length,
        frame_type: buf[3],
        flags: buf[4],
        stream_id,
    })
}

/// Stateless frame codec bounded by a maximum accepted payload size.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: u32,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) {
        frame.encode(buf);
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` without consuming anything if `buf` does not yet
    /// hold a complete frame. An oversized length is rejected as soon as the
    /// header is readable, without waiting for the payload.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, Error> {
        let header = match decode_frame_header(buf) {
            Some(h) => h,
            None => return Ok(None),
        };
        if header.length > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                length: header.length,
                max: self.max_frame_size,
            });
        }
        let total_len = FRAME_HEADER_LEN + header.length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }
        let mut payload = buf.split_to(total_len).freeze();
        payload.advance(FRAME_HEADER_LEN);
        decode_payload(header, payload).map(Some)
    }
}

fn decode_payload(header: FrameHeader, mut payload: Bytes) -> Result<Frame, Error> {
    let FrameHeader {
        frame_type,
        flags,
        stream_id,
        ..
    } = header;

    let frame = match frame_type {
        FRAME_DATA => {
            require_stream(stream_id, "DATA")?;
            Frame::Data {
                stream_id,
                payload,
                end_message: flags & FLAG_END_MESSAGE != 0,
                end_stream: flags & FLAG_END_STREAM != 0,
            }
        }
        FRAME_HEADERS => {
            require_stream(stream_id, "HEADERS")?;
            Frame::Headers {
                stream_id,
                metadata: Metadata::decode(payload)?,
                end_stream: flags & FLAG_END_STREAM != 0,
            }
        }
        FRAME_TRAILERS => {
            require_stream(stream_id, "TRAILERS")?;
            if payload.len() < 5 {
                return Err(Error::Malformed("TRAILERS shorter than status".into()));
            }
            let code = Code::from_u8(payload.get_u8());
            let msg_len = payload.get_u32() as usize;
            if payload.len() < msg_len {
                return Err(Error::Malformed("TRAILERS status message overruns frame".into()));
            }
            let message = String::from_utf8(payload.split_to(msg_len).to_vec())
                .map_err(|_| Error::Malformed("TRAILERS status message not UTF-8".into()))?;
            Frame::Trailers {
                stream_id,
                status: Status { code, message },
                metadata: Metadata::decode(payload)?,
            }
        }
        FRAME_WINDOW_UPDATE => {
            exact_len(&payload, 4, "WINDOW_UPDATE")?;
            let increment = payload.get_u32() & 0x7fff_ffff;
            if increment == 0 {
                return Err(Error::Malformed("WINDOW_UPDATE with 0 increment".into()));
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
        }
        FRAME_RESET => {
            require_stream(stream_id, "RESET")?;
            exact_len(&payload, 4, "RESET")?;
            Frame::Reset {
                stream_id,
                error_code: ErrorCode::from_u32(payload.get_u32()),
            }
        }
        FRAME_PING => {
            require_connection(stream_id, "PING")?;
            exact_len(&payload, 8, "PING")?;
            let mut opaque_data = [0u8; 8];
            payload.copy_to_slice(&mut opaque_data);
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                opaque_data,
            }
        }
        FRAME_SETTINGS => {
            require_connection(stream_id, "SETTINGS")?;
            if flags & FLAG_ACK != 0 {
                exact_len(&payload, 0, "SETTINGS ACK")?;
                Frame::Settings {
                    ack: true,
                    settings: Settings::provisional(),
                }
            } else {
                Frame::Settings {
                    ack: false,
                    settings: Settings::decode(payload)?,
                }
            }
        }
        FRAME_GOAWAY => {
            require_connection(stream_id, "GOAWAY")?;
            if payload.len() < 8 {
                return Err(Error::Malformed("GOAWAY shorter than 8 bytes".into()));
            }
            let last_stream_id = payload.get_u32() & 0x7fff_ffff;
            let error_code = ErrorCode::from_u32(payload.get_u32());
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data: payload,
            }
        }
        other => {
            return Err(Error::Malformed(format!("unknown frame type {other:#04x}")));
        }
    };
    Ok(frame)
}

fn require_stream(stream_id: u32, name: &str) -> Result<(), Error> {
    if stream_id == 0 {
        return Err(Error::Malformed(format!("{name} on stream 0")));
    }
    Ok(())
}

fn require_connection(stream_id: u32, name: &str) -> Result<(), Error> {
    if stream_id != 0 {
        return Err(Error::Malformed(format!("{name} on non-zero stream")));
    }
    Ok(())
}

fn exact_len(payload: &Bytes, len: usize, name: &str) -> Result<(), Error> {
    if payload.len() != len {
        return Err(Error::Malformed(format!(
            "{name} payload is {} bytes, expected {len}",
            payload.len()
        )));
    }
    Ok(())
}
