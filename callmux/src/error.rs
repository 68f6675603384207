use std::io;

use callmux_proto::{Code, ErrorCode, ErrorKind, Status};
use thiserror::Error;

/// Errors returned by the call engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Framing, flow-control or stream-state error.
    #[error(transparent)]
    Protocol(#[from] callmux_proto::Error),
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The connection has been shut down, failed, or is going away.
    #[error("connection closed")]
    ConnectionClosed,
    /// A keepalive ping went unanswered.
    #[error("keepalive watchdog timeout")]
    KeepaliveTimeout,
}

impl Error {
    /// Status reported to streams affected by this error.
    pub fn status(&self) -> Status {
        match self {
            Error::Io(e) => Status::new(Code::Unavailable, format!("transport error: {e}")),
            Error::ConnectionClosed => Status::new(Code::Unavailable, "connection closed"),
            Error::KeepaliveTimeout => Status::new(Code::Unavailable, self.to_string()),
            Error::Protocol(e) => protocol_status(e),
            Error::InvalidConfig(msg) => Status::new(Code::Internal, msg.clone()),
        }
    }

    /// Error code carried in a GOAWAY sent because of this error.
    pub(crate) fn go_away_code(&self) -> ErrorCode {
        match self {
            Error::Protocol(e) => e.code(),
            Error::ConnectionClosed => ErrorCode::NoError,
            _ => ErrorCode::InternalError,
        }
    }
}

/// Status for a stream or connection terminated by a protocol error.
pub(crate) fn protocol_status(e: &callmux_proto::Error) -> Status {
    let code = match e.kind() {
        ErrorKind::FlowControlViolation | ErrorKind::ResourceExhausted => Code::ResourceExhausted,
        _ => Code::Internal,
    };
    Status::new(code, e.to_string())
}
