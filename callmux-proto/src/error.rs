use thiserror::Error;

/// Reset and GoAway error codes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    StreamClosed = 0x4,
    FrameSizeError = 0x5,
    RefusedStream = 0x6,
    Cancel = 0x7,
    EnhanceYourCalm = 0x8,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::StreamClosed,
            0x5 => Self::FrameSizeError,
            0x6 => Self::RefusedStream,
            0x7 => Self::Cancel,
            0x8 => Self::EnhanceYourCalm,
            _ => Self::InternalError,
        }
    }
}

/// Closed taxonomy of failures, independent of the payload each error carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Malformed,
    FrameTooLarge,
    ProtocolViolation,
    FlowControlViolation,
    StreamClosed,
    InvalidState,
    ResourceExhausted,
}

/// Errors produced by the sans-IO layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Frame bytes could not be decoded (bad type tag, bad payload size, etc.).
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Frame length field exceeds the negotiated maximum.
    #[error("frame of {length} bytes exceeds maximum of {max}")]
    FrameTooLarge { length: u32, max: u32 },
    /// Peer broke the protocol in a way that invalidates the connection.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A window was overrun or an increment overflowed it.
    /// `stream_id == 0` means the connection-level window.
    #[error("flow control violation on stream {stream_id}")]
    FlowControlViolation { stream_id: u32 },
    /// Operation attempted on a stream that can no longer carry it.
    #[error("stream {0} is closed")]
    StreamClosed(u32),
    /// Operation is not valid in the stream's current state.
    #[error("stream {stream_id}: {reason}")]
    InvalidState { stream_id: u32, reason: &'static str },
    /// The 31-bit stream id space for this connection is used up.
    #[error("stream ids exhausted")]
    StreamIdsExhausted,
    /// Opening another stream would exceed the peer's concurrency limit.
    #[error("concurrent stream limit of {limit} reached")]
    TooManyStreams { limit: u32 },
    /// An inbound message grew past the receive limit.
    #[error("stream {stream_id}: message exceeds limit of {limit} bytes")]
    MessageTooLarge { stream_id: u32, limit: usize },
    /// Headers or trailers do not fit in a single frame.
    #[error("stream {stream_id}: metadata of {length} bytes exceeds frame limit of {max}")]
    MetadataTooLarge {
        stream_id: u32,
        length: usize,
        max: u32,
    },
    /// The peer keeps pinging faster than the ping policy allows.
    #[error("too_many_pings")]
    TooManyPings,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Malformed(_) => ErrorKind::Malformed,
            Self::FrameTooLarge { .. } => ErrorKind::FrameTooLarge,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::FlowControlViolation { .. } => ErrorKind::FlowControlViolation,
            Self::StreamClosed(_) => ErrorKind::StreamClosed,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::StreamIdsExhausted
            | Self::TooManyStreams { .. }
            | Self::MessageTooLarge { .. }
            | Self::MetadataTooLarge { .. }
            | Self::TooManyPings => ErrorKind::ResourceExhausted,
        }
    }

    /// Whether this error must tear down the whole connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Malformed(_)
            | Self::FrameTooLarge { .. }
            | Self::ProtocolViolation(_)
            | Self::TooManyPings => true,
            Self::FlowControlViolation { stream_id } => *stream_id == 0,
            _ => false,
        }
    }

    /// Wire code to send in a GoAway or Reset caused by this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Malformed(_) | Self::ProtocolViolation(_) => ErrorCode::ProtocolError,
            Self::FrameTooLarge { .. } => ErrorCode::FrameSizeError,
            Self::FlowControlViolation { .. } => ErrorCode::FlowControlError,
            Self::StreamClosed(_) => ErrorCode::StreamClosed,
            Self::TooManyStreams { .. } => ErrorCode::RefusedStream,
            Self::MessageTooLarge { .. } | Self::TooManyPings => ErrorCode::EnhanceYourCalm,
            Self::InvalidState { .. }
            | Self::StreamIdsExhausted
            | Self::MetadataTooLarge { .. } => ErrorCode::InternalError,
        }
    }
}
