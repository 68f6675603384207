//! Connection multiplexer.
//!
//! A [`Connection`] owns one transport and runs two threads over it: the
//! reader decodes frames and applies them to the stream table, the writer
//! drains control frames and round-robins stream data under flow control.
//! Both, plus application threads and the deadline timer, share one
//! connection lock that is never held across transport I/O.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use callmux_proto::{
    Admission, Cancelled, Code, Emit, ErrorCode, FlowController, Frame, FrameCodec, Grants,
    Lookup, Metadata, Role, Settings, Status, Stream, StreamState, StreamTable,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::{Config, Keepalive, PingPolicy};
use crate::dispatcher::{CompletionDispatcher, Next};
use crate::error::{Error, protocol_status};
use crate::event::CompletionEvent;
use crate::metrics;
use crate::timer::{DeadlineTimer, TimerKey};
use crate::transport::Transport;

type ProtoError = callmux_proto::Error;

const READ_CHUNK: usize = 16 * 1024;

/// Pause before retrying a transport call that returned `WouldBlock`.
const RETRY_PAUSE: Duration = Duration::from_millis(1);

/// State guarded by the connection lock.
struct State {
    table: StreamTable,
    flow: FlowController,
    /// Frames that bypass stream scheduling, written first.
    control: VecDeque<Frame>,
    /// `None` until the peer's SETTINGS arrive; no stream frames go out
    /// before then.
    peer_settings: Option<Settings>,
    /// Streams last seen blocked on flow control.
    stalled: HashSet<u32>,
    /// Streams whose message completes in the batch being written; each
    /// is owed a `WriteDone`.
    in_flight: Vec<u32>,
    going_away: bool,
    closed: bool,
    next_ping: u64,
    /// Payload of the unacknowledged keepalive ping.
    keepalive_ping: Option<[u8; 8]>,
    last_ping_received: Option<Instant>,
    ping_strikes: u32,
}

impl State {
    fn next_ping_data(&mut self) -> [u8; 8] {
        let opaque_data = self.next_ping.to_be_bytes();
        self.next_ping += 1;
        opaque_data
    }
}

struct Shared {
    role: Role,
    local: Settings,
    keepalive: Option<Keepalive>,
    ping_policy: Option<PingPolicy>,
    transport: Box<dyn Transport>,
    dispatcher: Arc<CompletionDispatcher>,
    timer: DeadlineTimer,
    state: Mutex<State>,
    /// Signalled whenever the writer may have something to do.
    writable: Condvar,
    closed: AtomicBool,
    transport_closed: AtomicBool,
}

/// Bytes gathered by the writer for one transport write.
#[derive(Default)]
struct Batch {
    bytes: BytesMut,
    frames: u64,
}

impl Batch {
    fn push(&mut self, frame: &Frame) {
        frame.encode(&mut self.bytes);
        self.frames += 1;
    }
}

/// A multiplexed connection hosting many concurrent streams.
///
/// Dropping the connection shuts it down and joins its threads.
pub struct Connection {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Connection {
    /// Start a client connection. Streams it opens have odd ids.
    pub fn client<T: Transport>(transport: T, config: Config) -> Result<Self, Error> {
        Self::new(Role::Client, transport, config)
    }

    /// Start a server connection. Streams it opens have even ids.
    pub fn server<T: Transport>(transport: T, config: Config) -> Result<Self, Error> {
        Self::new(Role::Server, transport, config)
    }

    pub fn new<T: Transport>(role: Role, transport: T, config: Config) -> Result<Self, Error> {
        config.validate()?;
        let local = config.settings();

        let mut control = VecDeque::new();
        control.push_back(Frame::Settings {
            ack: false,
            settings: local,
        });

        let mut table = StreamTable::new(
            role,
            local.max_concurrent_streams,
            Settings::provisional().max_concurrent_streams,
        );
        table.set_max_message_size(config.max_message_size as usize);

        let shared = Arc::new(Shared {
            role,
            local,
            keepalive: config.keepalive,
            ping_policy: config.ping_policy,
            transport: Box::new(transport),
            dispatcher: Arc::new(CompletionDispatcher::new()),
            timer: DeadlineTimer::new(),
            state: Mutex::new(State {
                table,
                flow: FlowController::new(&local),
                control,
                peer_settings: None,
                stalled: HashSet::new(),
                in_flight: Vec::new(),
                going_away: false,
                closed: false,
                next_ping: 0,
                keepalive_ping: None,
                last_ping_received: None,
                ping_strikes: 0,
            }),
            writable: Condvar::new(),
            closed: AtomicBool::new(false),
            transport_closed: AtomicBool::new(false),
        });
        metrics::CONNECTIONS_OPENED.increment();
        debug!(?role, ?local, "connection starting");

        let mut conn = Connection {
            shared,
            reader: None,
            writer: None,
        };

        let weak = Arc::downgrade(&conn.shared);
        conn.shared.timer.start(move |key| {
            if let Some(shared) = weak.upgrade() {
                shared.on_timer(key);
            }
        })?;
        if let Some(keepalive) = config.keepalive {
            conn.shared
                .timer
                .arm(TimerKey::KeepalivePing, Instant::now() + keepalive.interval);
        }
        conn.writer = Some(spawn("callmux-writer", &conn.shared, writer_loop)?);
        conn.reader = Some(spawn("callmux-reader", &conn.shared, reader_loop)?);
        Ok(conn)
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Queue through which this connection reports completions.
    pub fn dispatcher(&self) -> &Arc<CompletionDispatcher> {
        &self.shared.dispatcher
    }

    /// Wait up to `timeout` for the next completion.
    pub fn next_event(&self, timeout: Duration) -> Next {
        self.shared.dispatcher.next(timeout)
    }

    /// Open a stream with the next local id. Nothing is sent until the
    /// application sends headers or a message.
    pub fn open_stream(&self) -> Result<StreamHandle, Error> {
        self.shared.open(None)
    }

    /// Open a stream that is cancelled with `DeadlineExceeded` if it has not
    /// finished within `timeout`.
    pub fn open_stream_with_deadline(&self, timeout: Duration) -> Result<StreamHandle, Error> {
        self.shared.open(Some(Instant::now() + timeout))
    }

    /// Handle for a live stream, typically one announced by
    /// [`CompletionEvent::IncomingStream`].
    pub fn stream(&self, stream_id: u32) -> Option<StreamHandle> {
        let st = self.shared.state.lock();
        st.table.get(stream_id).map(|_| StreamHandle {
            id: stream_id,
            shared: self.shared.clone(),
        })
    }

    pub fn active_streams(&self) -> usize {
        self.shared.state.lock().table.len()
    }

    /// Send a PING. The matching [`CompletionEvent::PingAck`] carries the
    /// returned payload.
    pub fn ping(&self) -> Result<[u8; 8], Error> {
        let mut st = self.shared.state.lock();
        if st.closed {
            return Err(Error::ConnectionClosed);
        }
        let opaque_data = st.next_ping_data();
        st.control.push_back(Frame::Ping {
            ack: false,
            opaque_data,
        });
        drop(st);
        self.shared.writable.notify_one();
        Ok(opaque_data)
    }

    /// Stop accepting new streams in either direction and tell the peer.
    /// Streams already open run to completion.
    pub fn go_away(&self) {
        let mut st = self.shared.state.lock();
        if st.closed || st.going_away {
            return;
        }
        st.going_away = true;
        let last_stream_id = st.table.last_remote_id();
        debug!(last_stream_id, "sending GOAWAY");
        st.control.push_back(Frame::GoAway {
            last_stream_id,
            error_code: ErrorCode::NoError,
            debug_data: Bytes::new(),
        });
        drop(st);
        self.shared.writable.notify_one();
    }

    /// Close every active stream, posting one `StreamClosed` each, then
    /// shut down the dispatcher and close the transport. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown();
        // The writer flushes the final GOAWAY and closes the transport,
        // which unblocks the reader.
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        self.shared.close_transport();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.shared.timer.stop();
    }
}

fn spawn(
    name: &str,
    shared: &Arc<Shared>,
    body: fn(Arc<Shared>),
) -> Result<JoinHandle<()>, Error> {
    let shared = shared.clone();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(shared))
        .map_err(Error::Io)
}

/// Application-side handle to one stream. Cheap to clone; operations on a
/// stream that has finished return `StreamClosed`.
#[derive(Clone)]
pub struct StreamHandle {
    id: u32,
    shared: Arc<Shared>,
}

impl StreamHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send initial metadata. Optional: the first message sends empty
    /// metadata if none was sent.
    pub fn send_headers(&self, metadata: Metadata) -> Result<(), Error> {
        self.shared
            .with_stream(self.id, |stream| stream.send_headers(metadata))
    }

    /// Queue a message. [`CompletionEvent::WriteDone`] follows once all of it
    /// has been written.
    pub fn send_message(&self, payload: impl Into<Bytes>) -> Result<(), Error> {
        let payload = payload.into();
        self.shared
            .with_stream(self.id, |stream| stream.enqueue_outbound_message(payload))
    }

    /// Half-close our side once queued messages are written.
    pub fn finish_sending(&self) -> Result<(), Error> {
        self.shared
            .with_stream(self.id, |stream| stream.finish_sending())
    }

    /// Send trailers carrying the call status, half-closing our side.
    pub fn finish(&self, status: Status, trailers: Metadata) -> Result<(), Error> {
        self.shared
            .with_stream(self.id, |stream| stream.finish(status, trailers))
    }

    /// Ask for the next inbound message, delivered as
    /// [`CompletionEvent::MessageReceived`].
    pub fn read_message(&self) -> Result<(), Error> {
        self.shared
            .with_stream(self.id, |stream| stream.request_read())
    }

    /// Cancel the call. The peer is sent a Reset and the stream resolves with
    /// `Cancelled`, unless it already has a final status.
    pub fn cancel(&self, reason: impl Into<String>) {
        let status = Status::cancelled(reason);
        let mut st = self.shared.state.lock();
        self.shared
            .terminate(&mut st, self.id, Some(ErrorCode::Cancel), status);
        drop(st);
        self.shared.writable.notify_one();
    }

    /// Initial metadata received from the peer.
    pub fn headers(&self) -> Option<Metadata> {
        let st = self.shared.state.lock();
        st.table.get(self.id)?.initial_metadata().cloned()
    }

    /// Current state, or `None` once the stream has been resolved.
    pub fn state(&self) -> Option<StreamState> {
        let st = self.shared.state.lock();
        st.table.get(self.id).map(Stream::state)
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle").field("id", &self.id).finish()
    }
}

fn queue_grants(control: &mut VecDeque<Frame>, stream_id: u32, grants: Grants) {
    if let Some(increment) = grants.connection {
        control.push_back(Frame::WindowUpdate {
            stream_id: 0,
            increment,
        });
    }
    if let Some(increment) = grants.stream {
        control.push_back(Frame::WindowUpdate {
            stream_id,
            increment,
        });
    }
}

fn release(st: &mut State, n: usize) {
    let n = u32::try_from(n).unwrap_or(u32::MAX);
    if let Some(increment) = st.flow.release_connection(n) {
        st.control.push_back(Frame::WindowUpdate {
            stream_id: 0,
            increment,
        });
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close_transport(&self) {
        if !self.transport_closed.swap(true, Ordering::AcqRel) {
            self.transport.close();
        }
    }

    fn open(self: &Arc<Self>, deadline: Option<Instant>) -> Result<StreamHandle, Error> {
        let mut st = self.state.lock();
        if st.closed || st.going_away {
            return Err(Error::ConnectionClosed);
        }
        let id = st.table.create_local_stream(deadline)?;
        st.flow.register_stream(id);
        if let Some(deadline) = deadline {
            self.timer.arm(TimerKey::Stream(id), deadline);
        }
        drop(st);

        metrics::STREAMS_OPENED.increment();
        metrics::STREAMS_ACTIVE.increment();
        debug!(stream_id = id, ?deadline, "stream opened");
        Ok(StreamHandle {
            id,
            shared: self.clone(),
        })
    }

    fn with_stream<T>(
        &self,
        id: u32,
        f: impl FnOnce(&mut Stream) -> Result<T, ProtoError>,
    ) -> Result<T, Error> {
        let mut st = self.state.lock();
        let stream = st
            .table
            .get_mut(id)
            .ok_or(ProtoError::StreamClosed(id))?;
        let out = f(stream)?;
        self.settle(&mut st, id);
        drop(st);
        self.writable.notify_one();
        Ok(out)
    }

    /// Deliver messages that meet read intents, and resolve the stream if it
    /// has finished.
    fn settle(&self, st: &mut State, id: u32) {
        let State {
            table,
            flow,
            control,
            stalled,
            in_flight,
            ..
        } = st;
        let Some(stream) = table.get_mut(id) else {
            return;
        };
        while let Some((payload, credit)) = stream.take_deliverable() {
            let credit = u32::try_from(credit).unwrap_or(u32::MAX);
            queue_grants(control, id, flow.on_bytes_delivered(id, credit));
            self.dispatcher.post(CompletionEvent::MessageReceived {
                stream_id: id,
                payload,
            });
        }
        let Some(status) = stream.take_resolution() else {
            return;
        };
        let trailers = stream.take_trailing_metadata();
        let had_deadline = stream.deadline().is_some();
        table.remove(id);
        flow.remove_stream(id);
        stalled.remove(&id);
        if had_deadline {
            self.timer.disarm(TimerKey::Stream(id));
        }
        if let Some(pos) = in_flight.iter().position(|&s| s == id) {
            // Handed to the transport already.
            in_flight.swap_remove(pos);
            self.dispatcher
                .post(CompletionEvent::WriteDone { stream_id: id });
        }
        metrics::STREAMS_CLOSED.increment();
        metrics::STREAMS_ACTIVE.decrement();
        debug!(stream_id = id, code = %status.code, "stream closed");
        self.dispatcher.post(CompletionEvent::StreamClosed {
            stream_id: id,
            status,
            trailers,
        });
    }

    /// Close a stream abnormally with `status`. `reset` is the code sent to
    /// the peer, if the peer knows the stream. No-op if the stream is gone
    /// or already had a final status.
    fn terminate(&self, st: &mut State, id: u32, reset: Option<ErrorCode>, status: Status) {
        let cancelled = st
            .table
            .get_mut(id)
            .and_then(|stream| stream.request_cancel(status));
        if let Some(cancelled) = cancelled {
            self.after_cancel(st, id, reset, cancelled);
        }
    }

    /// Tell the peer about a cancelled stream, return its unread bytes to
    /// the connection window and resolve it.
    fn after_cancel(&self, st: &mut State, id: u32, reset: Option<ErrorCode>, cancelled: Cancelled) {
        if cancelled.send_reset
            && let Some(error_code) = reset
        {
            st.control.push_back(Frame::Reset {
                stream_id: id,
                error_code,
            });
        }
        release(st, cancelled.discarded);
        self.settle(st, id);
    }

    /// Report a graceful remote half-close, unless it also finished the
    /// stream (then `StreamClosed` says it all).
    fn input_closed(&self, st: &State, id: u32) {
        if st.table.get(id).is_some() {
            self.dispatcher
                .post(CompletionEvent::InputClosed { stream_id: id });
        }
    }

    fn stream_error(&self, st: &mut State, id: u32, err: ProtoError) {
        debug!(stream_id = id, error = %err, "stream error");
        self.terminate(st, id, Some(err.code()), protocol_status(&err));
    }

    fn on_timer(&self, key: TimerKey) {
        match key {
            TimerKey::Stream(id) => self.expire(id),
            TimerKey::KeepalivePing => self.send_keepalive(),
            TimerKey::KeepaliveWatchdog => self.keepalive_expired(),
        }
    }

    fn expire(&self, id: u32) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let cancelled = st
            .table
            .get_mut(id)
            .and_then(Stream::set_deadline_exceeded);
        if let Some(cancelled) = cancelled {
            self.after_cancel(st, id, Some(ErrorCode::Cancel), cancelled);
            metrics::DEADLINES_EXPIRED.increment();
            debug!(stream_id = id, "deadline exceeded");
        }
        drop(guard);
        self.writable.notify_one();
    }

    /// Ping the peer if there are calls to keep alive (or that is
    /// permitted without calls) and start the watchdog; otherwise look
    /// again after another interval.
    fn send_keepalive(&self) {
        let Some(keepalive) = self.keepalive else {
            return;
        };
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        if !keepalive.permit_without_calls && st.table.is_empty() {
            self.timer
                .arm(TimerKey::KeepalivePing, Instant::now() + keepalive.interval);
            return;
        }
        let opaque_data = st.next_ping_data();
        st.keepalive_ping = Some(opaque_data);
        st.control.push_back(Frame::Ping {
            ack: false,
            opaque_data,
        });
        self.timer
            .arm(TimerKey::KeepaliveWatchdog, Instant::now() + keepalive.timeout);
        drop(st);
        metrics::KEEPALIVE_PINGS.increment();
        trace!("keepalive ping queued");
        self.writable.notify_one();
    }

    fn keepalive_expired(&self) {
        let outstanding = self.state.lock().keepalive_ping.is_some();
        if outstanding {
            self.fail(Error::KeepaliveTimeout);
        }
    }

    /// Remove every stream, posting one final-status event per stream.
    fn close_all(&self, st: &mut State, status: &Status, as_error: bool) {
        st.closed = true;
        self.closed.store(true, Ordering::Release);
        for id in st.table.ids() {
            let Some(mut stream) = st.table.remove(id) else {
                continue;
            };
            st.flow.remove_stream(id);
            if stream.deadline().is_some() {
                self.timer.disarm(TimerKey::Stream(id));
            }
            metrics::STREAMS_CLOSED.increment();
            metrics::STREAMS_ACTIVE.decrement();
            stream.request_cancel(status.clone());
            let Some(status) = stream.take_resolution() else {
                continue;
            };
            let event = if as_error {
                CompletionEvent::ConnectionError {
                    stream_id: Some(id),
                    status,
                }
            } else {
                CompletionEvent::StreamClosed {
                    stream_id: id,
                    status,
                    trailers: stream.take_trailing_metadata(),
                }
            };
            self.dispatcher.post(event);
        }
        st.stalled.clear();
        st.in_flight.clear();
        st.keepalive_ping = None;
        self.timer.disarm(TimerKey::KeepalivePing);
        self.timer.disarm(TimerKey::KeepaliveWatchdog);
    }

    fn shutdown(&self) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        debug!(streams = st.table.len(), "shutting down connection");
        let status = Status::new(Code::Cancelled, "connection shut down");
        self.close_all(&mut st, &status, false);
        let last_stream_id = st.table.last_remote_id();
        st.control.push_back(Frame::GoAway {
            last_stream_id,
            error_code: ErrorCode::NoError,
            debug_data: Bytes::new(),
        });
        drop(st);
        self.writable.notify_all();
        self.dispatcher.shutdown();
        metrics::CONNECTIONS_CLOSED.increment();
    }

    /// Tear the connection down after a fatal error.
    fn fail(&self, err: Error) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        match &err {
            Error::Protocol(e) => {
                metrics::PROTOCOL_ERRORS.increment();
                warn!(error = %e, "fatal protocol error, closing connection");
            }
            Error::ConnectionClosed => debug!("peer closed the transport"),
            Error::KeepaliveTimeout => warn!("keepalive ping unanswered, closing connection"),
            _ => warn!(error = %err, "transport failed, closing connection"),
        }
        let status = err.status();
        self.close_all(&mut st, &status, true);
        self.dispatcher.post(CompletionEvent::ConnectionError {
            stream_id: None,
            status,
        });
        if matches!(err, Error::Protocol(_)) {
            let last_stream_id = st.table.last_remote_id();
            st.control.push_back(Frame::GoAway {
                last_stream_id,
                error_code: err.go_away_code(),
                debug_data: Bytes::from(err.to_string()),
            });
        }
        drop(st);
        self.writable.notify_all();
        self.dispatcher.shutdown();
        metrics::CONNECTIONS_CLOSED.increment();
    }

    // ── Writer ───────────────────────────────────────────────────

    /// Wait until there is something to write. Returns `None` once the
    /// connection is closed and everything queued has been handed out.
    fn next_batch(&self) -> Option<Batch> {
        let mut st = self.state.lock();
        loop {
            let mut batch = Batch::default();
            while let Some(frame) = st.control.pop_front() {
                batch.push(&frame);
            }
            if !st.closed
                && let Some(peer) = st.peer_settings
            {
                self.write_round(&mut st, peer.max_frame_size, &mut batch);
                // Resets and grants queued by streams settled this round.
                while let Some(frame) = st.control.pop_front() {
                    batch.push(&frame);
                }
            }
            if batch.frames > 0 {
                return Some(batch);
            }
            if st.closed {
                return None;
            }
            self.writable.wait(&mut st);
        }
    }

    /// One frame from each stream with queued work, in id order.
    fn write_round(&self, st: &mut State, max_frame: u32, batch: &mut Batch) {
        for id in st.table.ids() {
            let State {
                table,
                flow,
                stalled,
                in_flight,
                ping_strikes,
                ..
            } = &mut *st;
            let Some(stream) = table.get_mut(id) else {
                continue;
            };
            if !stream.has_outbound() {
                continue;
            }
            match stream.poll_outbound(max_frame, |want| flow.reserve_send_budget(id, want)) {
                Emit::Frame {
                    frame,
                    message_done,
                } => {
                    stalled.remove(&id);
                    *ping_strikes = 0;
                    batch.push(&frame);
                    if message_done {
                        in_flight.push(id);
                    }
                    self.settle(st, id);
                }
                Emit::TooLarge(err) => {
                    warn!(stream_id = id, error = %err, "metadata does not fit in a frame, cancelling stream");
                    self.terminate(st, id, Some(err.code()), protocol_status(&err));
                }
                Emit::Blocked => {
                    if stalled.insert(id) {
                        metrics::FLOW_CONTROL_STALLS.increment();
                        trace!(stream_id = id, "stream blocked on flow control");
                    }
                }
                Emit::Idle => {}
            }
        }
    }

    /// Report messages completed by the batch just written. Runs under the
    /// lock so a stream's `WriteDone` cannot overtake its resolution.
    fn write_done(&self) {
        let mut st = self.state.lock();
        for stream_id in st.in_flight.drain(..) {
            self.dispatcher
                .post(CompletionEvent::WriteDone { stream_id });
        }
    }

    // ── Reader ───────────────────────────────────────────────────

    /// Apply one inbound frame. Errors returned are fatal to the connection;
    /// stream-scoped errors are handled here.
    fn handle_frame(&self, frame: Frame) -> Result<(), ProtoError> {
        let mut st = self.state.lock();
        if st.closed {
            return Ok(());
        }
        let st = &mut *st;
        let result = match frame {
            Frame::Settings { ack: true, .. } => {
                trace!("settings acknowledged");
                Ok(())
            }
            Frame::Settings {
                ack: false,
                settings,
            } => self.on_settings(st, settings),
            Frame::Ping {
                ack: false,
                opaque_data,
            } => self.on_ping(st, opaque_data),
            Frame::Ping {
                ack: true,
                opaque_data,
            } => {
                self.on_ping_ack(st, opaque_data);
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                self.on_go_away(st, last_stream_id, error_code, &debug_data);
                Ok(())
            }
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            } => st.flow.on_window_update(0, increment),
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.on_window_update(st, stream_id, increment),
            Frame::Headers {
                stream_id,
                metadata,
                end_stream,
            } => self.on_headers(st, stream_id, metadata, end_stream),
            Frame::Data {
                stream_id,
                payload,
                end_message,
                end_stream,
            } => self.on_data(st, stream_id, payload, end_message, end_stream),
            Frame::Trailers {
                stream_id,
                status,
                metadata,
            } => self.on_trailers(st, stream_id, status, metadata),
            Frame::Reset {
                stream_id,
                error_code,
            } => self.on_reset(st, stream_id, error_code),
        };
        self.writable.notify_one();
        result
    }

    fn on_settings(&self, st: &mut State, settings: Settings) -> Result<(), ProtoError> {
        let overflow = |_| ProtoError::ProtocolViolation("SETTINGS overflow a send window".into());
        if st.peer_settings.is_none() {
            st.flow.init_connection_send_window(&settings).map_err(overflow)?;
        }
        st.flow.apply_remote_settings(&settings).map_err(overflow)?;
        st.table.set_max_local_streams(settings.max_concurrent_streams);
        st.peer_settings = Some(settings);
        st.control.push_back(Frame::Settings {
            ack: true,
            settings: Settings::provisional(),
        });
        debug!(?settings, "peer settings applied");
        Ok(())
    }

    /// Answer a ping, counting a strike against the peer if it arrived too
    /// soon after the previous one.
    fn on_ping(&self, st: &mut State, opaque_data: [u8; 8]) -> Result<(), ProtoError> {
        if let Some(policy) = self.ping_policy {
            let now = Instant::now();
            if let Some(last) = st.last_ping_received
                && now.duration_since(last) < policy.min_interval
            {
                st.ping_strikes += 1;
                debug!(strikes = st.ping_strikes, "ping strike");
                if st.ping_strikes > policy.max_strikes {
                    return Err(ProtoError::TooManyPings);
                }
            }
            st.last_ping_received = Some(now);
        }
        st.control.push_back(Frame::Ping {
            ack: true,
            opaque_data,
        });
        Ok(())
    }

    fn on_ping_ack(&self, st: &mut State, opaque_data: [u8; 8]) {
        if st.keepalive_ping != Some(opaque_data) {
            self.dispatcher
                .post(CompletionEvent::PingAck { opaque_data });
            return;
        }
        st.keepalive_ping = None;
        if let Some(keepalive) = self.keepalive {
            self.timer.disarm(TimerKey::KeepaliveWatchdog);
            self.timer
                .arm(TimerKey::KeepalivePing, Instant::now() + keepalive.interval);
        }
        trace!("keepalive acknowledged");
    }

    fn on_go_away(&self, st: &mut State, last_stream_id: u32, error_code: ErrorCode, debug_data: &[u8]) {
        debug!(
            last_stream_id,
            ?error_code,
            reason = %String::from_utf8_lossy(debug_data),
            "peer sent GOAWAY"
        );
        st.going_away = true;
        let unprocessed = Status::new(Code::Unavailable, "stream not processed before GOAWAY");
        for id in st.table.ids() {
            if self.role_is_local(id) && id > last_stream_id {
                // The peer never saw these, so no Reset.
                self.terminate(st, id, None, unprocessed.clone());
            }
        }
        self.dispatcher
            .post(CompletionEvent::GoAway { last_stream_id });
    }

    fn role_is_local(&self, stream_id: u32) -> bool {
        self.role.is_local(stream_id)
    }

    fn dropped(stream_id: u32, kind: &'static str) {
        metrics::FRAMES_DROPPED_RETIRED.increment();
        trace!(stream_id, kind, "ignoring frame for retired stream");
    }

    fn never_opened(stream_id: u32, kind: &str) -> ProtoError {
        ProtoError::ProtocolViolation(format!("{kind} on stream {stream_id} which was never opened"))
    }

    fn on_window_update(&self, st: &mut State, id: u32, increment: u32) -> Result<(), ProtoError> {
        match st.table.lookup(id) {
            Lookup::Active(_) => {
                if let Err(e) = st.flow.on_window_update(id, increment) {
                    self.stream_error(st, id, e);
                }
                Ok(())
            }
            Lookup::Retired => {
                Self::dropped(id, "WINDOW_UPDATE");
                Ok(())
            }
            Lookup::Unknown => Err(Self::never_opened(id, "WINDOW_UPDATE")),
        }
    }

    fn on_headers(
        &self,
        st: &mut State,
        id: u32,
        metadata: Metadata,
        end_stream: bool,
    ) -> Result<(), ProtoError> {
        let local = self.role_is_local(id);
        match st.table.lookup(id) {
            Lookup::Active(stream) => {
                match stream.on_headers(metadata.clone(), end_stream) {
                    Ok(()) => {
                        if end_stream {
                            st.flow.close_stream_recv(id);
                        }
                        self.dispatcher.post(CompletionEvent::HeadersReceived {
                            stream_id: id,
                            metadata,
                        });
                        self.settle(st, id);
                        if end_stream {
                            self.input_closed(st, id);
                        }
                    }
                    Err(e) => self.stream_error(st, id, e),
                }
                Ok(())
            }
            Lookup::Retired if local => {
                Self::dropped(id, "HEADERS");
                Ok(())
            }
            Lookup::Retired | Lookup::Unknown if local => Err(Self::never_opened(id, "HEADERS")),
            Lookup::Retired | Lookup::Unknown => self.admit(st, id, metadata, end_stream),
        }
    }

    /// The peer opened stream `id`.
    fn admit(
        &self,
        st: &mut State,
        id: u32,
        metadata: Metadata,
        end_stream: bool,
    ) -> Result<(), ProtoError> {
        let admission = st.table.admit_remote_stream(id)?;
        if admission == Admission::Admitted && st.going_away {
            st.table.remove(id);
        } else if admission == Admission::Admitted {
            st.flow.register_stream(id);
            if let Some(stream) = st.table.get_mut(id)
                && let Err(e) = stream.on_headers(metadata.clone(), end_stream)
            {
                self.stream_error(st, id, e);
                return Ok(());
            }
            if end_stream {
                st.flow.close_stream_recv(id);
            }
            metrics::STREAMS_OPENED.increment();
            metrics::STREAMS_ACTIVE.increment();
            debug!(stream_id = id, "peer opened stream");
            self.dispatcher.post(CompletionEvent::IncomingStream {
                stream_id: id,
                metadata,
            });
            if end_stream {
                self.input_closed(st, id);
            }
            return Ok(());
        }
        metrics::STREAMS_REFUSED.increment();
        st.control.push_back(Frame::Reset {
            stream_id: id,
            error_code: ErrorCode::RefusedStream,
        });
        Ok(())
    }

    fn on_data(
        &self,
        st: &mut State,
        id: u32,
        payload: Bytes,
        end_message: bool,
        end_stream: bool,
    ) -> Result<(), ProtoError> {
        let len = payload.len();
        let charged = u32::try_from(len).unwrap_or(u32::MAX);
        match st.table.lookup(id) {
            Lookup::Active(stream) => {
                match st.flow.on_data_received(id, charged) {
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        release(st, len);
                        self.stream_error(st, id, e);
                        return Ok(());
                    }
                    Ok(()) => {}
                }
                match stream.on_inbound_data(payload, end_message, end_stream) {
                    Ok(credit) => {
                        if credit > 0 {
                            let credit = u32::try_from(credit).unwrap_or(u32::MAX);
                            let grants = st.flow.on_bytes_delivered(id, credit);
                            queue_grants(&mut st.control, id, grants);
                        }
                        if end_stream {
                            st.flow.close_stream_recv(id);
                        }
                        self.settle(st, id);
                        if end_stream {
                            self.input_closed(st, id);
                        }
                    }
                    Err(e) => {
                        release(st, len);
                        self.stream_error(st, id, e);
                    }
                }
                Ok(())
            }
            Lookup::Retired => {
                // Still counts against the connection window.
                st.flow.on_data_received(id, charged)?;
                release(st, len);
                Self::dropped(id, "DATA");
                Ok(())
            }
            Lookup::Unknown => Err(Self::never_opened(id, "DATA")),
        }
    }

    fn on_trailers(
        &self,
        st: &mut State,
        id: u32,
        status: Status,
        metadata: Metadata,
    ) -> Result<(), ProtoError> {
        match st.table.lookup(id) {
            Lookup::Active(stream) => {
                match stream.on_trailers(status, metadata) {
                    Ok(forced) => {
                        if forced {
                            st.control.push_back(Frame::Reset {
                                stream_id: id,
                                error_code: ErrorCode::NoError,
                            });
                        }
                        st.flow.close_stream_recv(id);
                        self.settle(st, id);
                    }
                    Err(e) => self.stream_error(st, id, e),
                }
                Ok(())
            }
            Lookup::Retired => {
                Self::dropped(id, "TRAILERS");
                Ok(())
            }
            Lookup::Unknown => Err(Self::never_opened(id, "TRAILERS")),
        }
    }

    fn on_reset(&self, st: &mut State, id: u32, error_code: ErrorCode) -> Result<(), ProtoError> {
        match st.table.lookup(id) {
            Lookup::Active(stream) => {
                debug!(stream_id = id, ?error_code, "peer reset stream");
                if let Some(cancelled) = stream.on_reset(error_code) {
                    release(st, cancelled.discarded);
                }
                self.settle(st, id);
                Ok(())
            }
            Lookup::Retired => {
                Self::dropped(id, "RESET");
                Ok(())
            }
            Lookup::Unknown => Err(Self::never_opened(id, "RESET")),
        }
    }
}

fn writer_loop(shared: Arc<Shared>) {
    while let Some(batch) = shared.next_batch() {
        if let Err(e) = write_all(shared.transport.as_ref(), &batch.bytes) {
            shared.fail(Error::Io(e));
            break;
        }
        metrics::FRAMES_SENT.add(batch.frames);
        metrics::BYTES_SENT.add(batch.bytes.len() as u64);
        shared.write_done();
    }
    shared.close_transport();
    trace!("writer exiting");
}

fn write_all(transport: &dyn Transport, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match transport.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(RETRY_PAUSE),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn reader_loop(shared: Arc<Shared>) {
    let codec = FrameCodec::new(shared.local.max_frame_size);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => {
                    metrics::FRAMES_RECEIVED.increment();
                    if let Err(e) = shared.handle_frame(frame) {
                        shared.fail(e.into());
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    shared.fail(e.into());
                    return;
                }
            }
        }
        if shared.is_closed() {
            break;
        }
        match shared.transport.read(&mut chunk) {
            Ok(0) => {
                shared.fail(Error::ConnectionClosed);
                break;
            }
            Ok(n) => {
                metrics::BYTES_RECEIVED.add(n as u64);
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(RETRY_PAUSE),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                shared.fail(Error::Io(e));
                break;
            }
        }
    }
    trace!("reader exiting");
}
