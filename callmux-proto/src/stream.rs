//! Per-call stream state machine.
//!
//! ```text
//!          send/recv Headers
//!   Idle ---------------------> Open
//!                                |  \
//!             local end (EndStream|   \ remote end (EndStream
//!             or Trailers sent)   |    \ or Trailers received)
//!                                v     v
//!               HalfClosedLocal     HalfClosedRemote
//!                        \            /
//!                 other side ends too
//!                          v        v
//!                           Closed  <---- Reset / cancel / deadline (any state)
//! ```

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

use crate::error::{Error, ErrorCode};
use crate::frame::{Frame, trailers_len};
use crate::message::MessageAssembler;
use crate::metadata::Metadata;
use crate::settings::MAX_FRAME_SIZE_LIMIT;
use crate::status::{Code, Status};

/// State of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Id reserved, nothing sent or received yet.
    Idle,
    /// Both directions active.
    Open,
    /// We sent our final frame; the peer may still send.
    HalfClosedLocal,
    /// The peer sent its final frame; we may still send.
    HalfClosedRemote,
    /// Terminal.
    Closed,
}

/// Application intent waiting for the writer.
#[derive(Debug)]
enum Outbound {
    Headers(Metadata),
    /// Unsent remainder of a message.
    Message(Bytes),
    EndStream,
    Trailers(Status, Metadata),
}

/// What the writer should do next for a stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Emit {
    /// Write this frame. `message_done` is set when it carries the last
    /// chunk of an application message.
    Frame { frame: Frame, message_done: bool },
    /// Data is queued but no flow-control budget is available.
    Blocked,
    /// Queued headers or trailers do not fit in one frame of the peer's
    /// size. The stream cannot make progress and should be cancelled.
    TooLarge(Error),
    /// Nothing queued.
    Idle,
}

/// Result of closing a stream abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled {
    /// Uncredited inbound bytes dropped, to be returned to the connection
    /// window.
    pub discarded: usize,
    /// The peer knows about this stream and should be told with a Reset.
    pub send_reset: bool,
}

/// State of one call within a connection.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    state: StreamState,
    deadline: Option<Instant>,

    assembler: MessageAssembler,
    max_message_size: usize,
    /// Complete messages with the part of each not yet returned to the
    /// receive windows.
    inbound: VecDeque<(Bytes, usize)>,
    inbound_uncredited: usize,
    pending_reads: usize,

    outbound: VecDeque<Outbound>,
    headers_queued: bool,
    finish_queued: bool,

    initial_metadata: Option<Metadata>,
    trailing_metadata: Metadata,
    /// Status carried by Trailers, sent or received.
    trailer_status: Option<Status>,
    /// Set at most once; never overwritten.
    final_status: Option<Status>,
    resolved: bool,
}

impl Stream {
    pub fn new(id: u32, deadline: Option<Instant>) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            deadline,
            assembler: MessageAssembler::new(),
            max_message_size: usize::MAX,
            inbound: VecDeque::new(),
            inbound_uncredited: 0,
            pending_reads: 0,
            outbound: VecDeque::new(),
            headers_queued: false,
            finish_queued: false,
            initial_metadata: None,
            trailing_metadata: Metadata::new(),
            trailer_status: None,
            final_status: None,
            resolved: false,
        }
    }

    /// Reject inbound messages larger than `limit` bytes.
    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_local_closed(&self) -> bool {
        matches!(self.state, StreamState::HalfClosedLocal | StreamState::Closed)
    }

    pub fn is_remote_closed(&self) -> bool {
        matches!(self.state, StreamState::HalfClosedRemote | StreamState::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    pub fn final_status(&self) -> Option<&Status> {
        self.final_status.as_ref()
    }

    pub fn initial_metadata(&self) -> Option<&Metadata> {
        self.initial_metadata.as_ref()
    }

    /// Trailing metadata received from the peer, leaving an empty map.
    pub fn take_trailing_metadata(&mut self) -> Metadata {
        std::mem::take(&mut self.trailing_metadata)
    }

    /// Received bytes held in unread messages and not yet credited back.
    pub fn uncredited_bytes(&self) -> usize {
        self.inbound_uncredited
    }

    pub fn buffered_messages(&self) -> usize {
        self.inbound.len()
    }

    // -- Application side --

    fn check_sendable(&self) -> Result<(), Error> {
        if self.is_local_closed() || self.finish_queued || self.final_status.is_some() {
            return Err(Error::StreamClosed(self.id));
        }
        Ok(())
    }

    fn check_frame_fits(&self, length: usize) -> Result<(), Error> {
        if length > MAX_FRAME_SIZE_LIMIT as usize {
            return Err(Error::MetadataTooLarge {
                stream_id: self.id,
                length,
                max: MAX_FRAME_SIZE_LIMIT,
            });
        }
        Ok(())
    }

    fn ensure_headers(&mut self) {
        if !self.headers_queued {
            self.outbound.push_back(Outbound::Headers(Metadata::new()));
            self.headers_queued = true;
        }
    }

    /// Queue initial metadata. Must come before any message.
    pub fn send_headers(&mut self, metadata: Metadata) -> Result<(), Error> {
        self.check_sendable()?;
        if self.headers_queued {
            return Err(Error::InvalidState {
                stream_id: self.id,
                reason: "headers already sent",
            });
        }
        self.check_frame_fits(metadata.encoded_len())?;
        self.outbound.push_back(Outbound::Headers(metadata));
        self.headers_queued = true;
        Ok(())
    }

    /// Queue a message for transmission. Empty initial metadata is sent
    /// first if the application did not send headers explicitly.
    pub fn enqueue_outbound_message(&mut self, payload: Bytes) -> Result<(), Error> {
        self.check_sendable()?;
        self.ensure_headers();
        self.outbound.push_back(Outbound::Message(payload));
        Ok(())
    }

    /// Half-close the local side after any queued messages.
    pub fn finish_sending(&mut self) -> Result<(), Error> {
        self.check_sendable()?;
        self.ensure_headers();
        self.outbound.push_back(Outbound::EndStream);
        self.finish_queued = true;
        Ok(())
    }

    /// Queue trailers carrying the call's status; half-closes the local side.
    pub fn finish(&mut self, status: Status, trailers: Metadata) -> Result<(), Error> {
        self.check_sendable()?;
        self.check_frame_fits(trailers_len(&status, &trailers))?;
        self.outbound.push_back(Outbound::Trailers(status, trailers));
        self.finish_queued = true;
        Ok(())
    }

    /// Register interest in one inbound message.
    pub fn request_read(&mut self) -> Result<(), Error> {
        if self.final_status.is_some() || (self.is_remote_closed() && self.inbound.is_empty()) {
            return Err(Error::StreamClosed(self.id));
        }
        self.pending_reads += 1;
        Ok(())
    }

    /// Pop a buffered message if a read is outstanding, along with the
    /// number of its bytes that should now be credited to the peer.
    pub fn take_deliverable(&mut self) -> Option<(Bytes, usize)> {
        if self.pending_reads == 0 {
            return None;
        }
        let (msg, uncredited) = self.inbound.pop_front()?;
        self.pending_reads -= 1;
        self.inbound_uncredited -= uncredited;
        Some((msg, uncredited))
    }

    // -- Writer side --

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty() && self.state != StreamState::Closed
    }

    /// Produce the next frame to write, taking at most `max_frame` payload
    /// bytes and asking `budget` for flow-control credit.
    pub fn poll_outbound(&mut self, max_frame: u32, budget: impl FnOnce(u32) -> u32) -> Emit {
        if self.state == StreamState::Closed {
            self.outbound.clear();
            return Emit::Idle;
        }
        let Some(front) = self.outbound.front_mut() else {
            return Emit::Idle;
        };
        let id = self.id;
        let metadata_len = match front {
            Outbound::Headers(metadata) => Some(metadata.encoded_len()),
            Outbound::Trailers(status, metadata) => Some(trailers_len(status, metadata)),
            _ => None,
        };
        if let Some(length) = metadata_len
            && length > max_frame as usize
        {
            return Emit::TooLarge(Error::MetadataTooLarge {
                stream_id: id,
                length,
                max: max_frame,
            });
        }
        match front {
            Outbound::Headers(_) => {
                let Some(Outbound::Headers(metadata)) = self.outbound.pop_front() else {
                    return Emit::Idle;
                };
                if self.state == StreamState::Idle {
                    self.state = StreamState::Open;
                }
                Emit::Frame {
                    frame: Frame::Headers {
                        stream_id: id,
                        metadata,
                        end_stream: false,
                    },
                    message_done: false,
                }
            }
            Outbound::Message(rest) => {
                if rest.is_empty() {
                    self.outbound.pop_front();
                    return Emit::Frame {
                        frame: Frame::Data {
                            stream_id: id,
                            payload: Bytes::new(),
                            end_message: true,
                            end_stream: false,
                        },
                        message_done: true,
                    };
                }
                let want = rest.len().min(max_frame as usize) as u32;
                let granted = budget(want);
                if granted == 0 {
                    return Emit::Blocked;
                }
                let chunk = rest.split_to(granted.min(want) as usize);
                let done = rest.is_empty();
                if done {
                    self.outbound.pop_front();
                }
                Emit::Frame {
                    frame: Frame::Data {
                        stream_id: id,
                        payload: chunk,
                        end_message: done,
                        end_stream: false,
                    },
                    message_done: done,
                }
            }
            Outbound::EndStream => {
                self.outbound.pop_front();
                self.close_local();
                Emit::Frame {
                    frame: Frame::Data {
                        stream_id: id,
                        payload: Bytes::new(),
                        end_message: false,
                        end_stream: true,
                    },
                    message_done: false,
                }
            }
            Outbound::Trailers(..) => {
                let Some(Outbound::Trailers(status, metadata)) = self.outbound.pop_front() else {
                    return Emit::Idle;
                };
                self.trailer_status = Some(status.clone());
                self.close_local();
                Emit::Frame {
                    frame: Frame::Trailers {
                        stream_id: id,
                        status,
                        metadata,
                    },
                    message_done: false,
                }
            }
        }
    }

    // -- Inbound side --

    /// Peer sent initial metadata.
    pub fn on_headers(&mut self, metadata: Metadata, end_stream: bool) -> Result<(), Error> {
        if self.is_remote_closed() {
            return Err(Error::StreamClosed(self.id));
        }
        if self.initial_metadata.is_some() {
            return Err(Error::InvalidState {
                stream_id: self.id,
                reason: "duplicate headers",
            });
        }
        if self.state == StreamState::Idle {
            self.state = StreamState::Open;
        }
        self.initial_metadata = Some(metadata);
        if end_stream {
            self.close_remote();
        }
        Ok(())
    }

    /// Peer sent a chunk of message payload. The caller has already charged
    /// it against the receive windows.
    ///
    /// Chunks of a message still being assembled count as delivered right
    /// away, or a message larger than the window could never complete.
    /// Returns the number of bytes to credit now; the completing chunk is
    /// credited when the message is read.
    pub fn on_inbound_data(
        &mut self,
        payload: Bytes,
        end_message: bool,
        end_stream: bool,
    ) -> Result<usize, Error> {
        if self.is_remote_closed() {
            return Err(Error::StreamClosed(self.id));
        }
        let len = payload.len();
        if self.assembler.pending_len() + len > self.max_message_size {
            return Err(Error::MessageTooLarge {
                stream_id: self.id,
                limit: self.max_message_size,
            });
        }
        let mut credit = 0;
        match self.assembler.push(payload, end_message) {
            Some(msg) => {
                self.inbound_uncredited += len;
                self.inbound.push_back((msg, len));
            }
            None => credit = len,
        }
        if end_stream {
            if !self.assembler.is_empty() {
                return Err(Error::InvalidState {
                    stream_id: self.id,
                    reason: "stream ended inside a message",
                });
            }
            self.close_remote();
        }
        Ok(credit)
    }

    /// Peer sent trailers. Returns `true` when our own side was still open
    /// and has been closed; the peer should then be sent `Reset(NoError)`.
    pub fn on_trailers(&mut self, status: Status, metadata: Metadata) -> Result<bool, Error> {
        if self.is_remote_closed() {
            return Err(Error::StreamClosed(self.id));
        }
        if !self.assembler.is_empty() {
            return Err(Error::InvalidState {
                stream_id: self.id,
                reason: "trailers inside a message",
            });
        }
        self.trailing_metadata = metadata;
        self.trailer_status.get_or_insert(status);
        let forced = !self.is_local_closed();
        if forced {
            self.outbound.clear();
            self.state = StreamState::Closed;
        } else {
            self.close_remote();
        }
        Ok(forced)
    }

    /// Peer reset the stream.
    pub fn on_reset(&mut self, code: ErrorCode) -> Option<Cancelled> {
        let status = match (code, &self.trailer_status) {
            (ErrorCode::NoError, Some(sent)) => sent.clone(),
            _ => Status::new(Code::from_reset(code), format!("stream reset by peer ({code:?})")),
        };
        self.request_cancel(status)
    }

    // -- Termination --

    /// Close immediately with `status`, discarding buffered data in both
    /// directions. Returns `None` if a final status was already set.
    pub fn request_cancel(&mut self, status: Status) -> Option<Cancelled> {
        if self.final_status.is_some() {
            return None;
        }
        let send_reset = matches!(
            self.state,
            StreamState::Open | StreamState::HalfClosedLocal | StreamState::HalfClosedRemote
        );
        self.state = StreamState::Closed;
        self.final_status = Some(status);
        self.outbound.clear();
        self.pending_reads = 0;
        self.assembler.clear();
        let discarded = self.inbound_uncredited;
        self.inbound.clear();
        self.inbound_uncredited = 0;
        Some(Cancelled {
            discarded,
            send_reset,
        })
    }

    pub fn set_deadline_exceeded(&mut self) -> Option<Cancelled> {
        self.request_cancel(Status::deadline_exceeded())
    }

    /// Hand out the final status once the stream is finished: immediately
    /// for abnormal closes, and after the last buffered message has been
    /// read for graceful ones. Returns `Some` exactly once.
    pub fn take_resolution(&mut self) -> Option<Status> {
        if self.resolved {
            return None;
        }
        if self.final_status.is_none() {
            if self.state != StreamState::Closed || !self.inbound.is_empty() {
                return None;
            }
            let status = self.trailer_status.clone().unwrap_or_else(|| {
                Status::new(Code::Unknown, "stream closed without status")
            });
            self.final_status = Some(status);
        }
        self.resolved = true;
        self.final_status.clone()
    }

    fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::HalfClosedRemote | StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedLocal,
        };
    }

    fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::HalfClosedLocal | StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedRemote,
        };
    }
}
