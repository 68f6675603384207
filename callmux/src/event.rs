use bytes::Bytes;
use callmux_proto::{Metadata, Status};

/// Asynchronous notification of call progress, delivered through a
/// [`CompletionDispatcher`](crate::CompletionDispatcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    /// A complete inbound message met an outstanding read.
    MessageReceived { stream_id: u32, payload: Bytes },
    /// The stream finished. Posted exactly once per stream, carrying its
    /// final status and any trailing metadata the peer sent.
    StreamClosed {
        stream_id: u32,
        status: Status,
        trailers: Metadata,
    },
    /// A queued outbound message has been fully written to the transport.
    /// Never posted after the stream's final-status event.
    WriteDone { stream_id: u32 },
    /// The connection failed. Each active stream receives one of these with
    /// its id (as its final status), followed by one with `stream_id: None`.
    ConnectionError {
        stream_id: Option<u32>,
        status: Status,
    },
    /// The peer opened a stream.
    IncomingStream { stream_id: u32, metadata: Metadata },
    /// The peer sent initial metadata on a stream we opened.
    HeadersReceived { stream_id: u32, metadata: Metadata },
    /// The peer half-closed the stream. Messages already buffered can still
    /// be read; no more will arrive.
    InputClosed { stream_id: u32 },
    /// The peer answered a ping.
    PingAck { opaque_data: [u8; 8] },
    /// The peer will accept no new streams; ours above `last_stream_id`
    /// were not processed.
    GoAway { last_stream_id: u32 },
}

impl CompletionEvent {
    /// Stream the event concerns, if any.
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            CompletionEvent::MessageReceived { stream_id, .. }
            | CompletionEvent::StreamClosed { stream_id, .. }
            | CompletionEvent::WriteDone { stream_id }
            | CompletionEvent::InputClosed { stream_id }
            | CompletionEvent::IncomingStream { stream_id, .. }
            | CompletionEvent::HeadersReceived { stream_id, .. } => Some(*stream_id),
            CompletionEvent::ConnectionError { stream_id, .. } => *stream_id,
            CompletionEvent::PingAck { .. } | CompletionEvent::GoAway { .. } => None,
        }
    }

    /// Final status if this event ends a stream.
    pub fn final_status(&self) -> Option<&Status> {
        match self {
            CompletionEvent::StreamClosed { status, .. }
            | CompletionEvent::ConnectionError {
                stream_id: Some(_),
                status,
            } => Some(status),
            _ => None,
        }
    }
}
