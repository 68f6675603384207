//! Wire-level tests: a `Connection` against a hand-driven peer that writes
//! raw frames and inspects what the engine sends back.

use std::thread;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use callmux::{
    Code, CompletionEvent, Config, Connection, Error, Keepalive, MemTransport, Metadata, Next,
    PingPolicy, Role, Status, Transport, pipe,
};
use callmux_proto::frame::{FRAME_DATA, FRAME_SETTINGS, encode_frame_header};
use callmux_proto::settings::MAX_FRAME_SIZE_LIMIT;
use callmux_proto::{ErrorCode, Frame, FrameCodec, Settings};
use crossbeam_channel::Receiver;

// -- Raw peer --

/// Engine logs go to the test output; set `RUST_LOG=callmux=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct RawPeer {
    transport: MemTransport,
    frames: Receiver<Frame>,
}

impl RawPeer {
    /// Start an engine with `role` and return it with a raw peer attached.
    fn start(role: Role, config: Config) -> (Connection, RawPeer) {
        init_tracing();
        let (ours, theirs) = pipe();
        let engine = Connection::new(role, ours, config).unwrap();

        let (tx, frames) = crossbeam_channel::unbounded();
        let reader = theirs.clone();
        thread::spawn(move || {
            let codec = FrameCodec::new(MAX_FRAME_SIZE_LIMIT);
            let mut buf = BytesMut::new();
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
                while let Ok(Some(frame)) = codec.decode(&mut buf) {
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
            }
        });

        (
            engine,
            RawPeer {
                transport: theirs,
                frames,
            },
        )
    }

    fn send(&self, frame: Frame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        self.send_raw(&buf);
    }

    fn send_raw(&self, bytes: &[u8]) {
        self.transport.write_all(bytes).unwrap();
    }

    fn recv(&self) -> Frame {
        self.frames
            .recv_timeout(Duration::from_secs(5))
            .expect("no frame from engine")
    }

    /// Skip frames until one matches; returns the frames skipped too.
    fn recv_matching(&self, pred: impl Fn(&Frame) -> bool) -> (Frame, Vec<Frame>) {
        let mut skipped = Vec::new();
        loop {
            let frame = self.recv();
            if pred(&frame) {
                return (frame, skipped);
            }
            skipped.push(frame);
        }
    }

    /// Exchange SETTINGS so the engine starts sending stream frames.
    fn handshake(&self) -> Settings {
        self.send(Frame::Settings {
            ack: false,
            settings: Settings::provisional(),
        });
        match self.recv_matching(|f| matches!(f, Frame::Settings { ack: false, .. })) {
            (Frame::Settings { settings, .. }, _) => settings,
            _ => unreachable!(),
        }
    }

    /// Round-trip a PING, returning everything the engine sent before the ack.
    fn sync(&self) -> Vec<Frame> {
        let opaque_data = *b"syncsync";
        self.send(Frame::Ping {
            ack: false,
            opaque_data,
        });
        let (_, before) = self.recv_matching(|f| {
            matches!(f, Frame::Ping { ack: true, opaque_data: d } if *d == opaque_data)
        });
        before
    }
}

fn config() -> Config {
    Config {
        initial_stream_window: 65535,
        initial_connection_window: 1 << 20,
        max_frame_size: 16384,
        max_concurrent_streams: 100,
        max_message_size: 4 << 20,
        keepalive: None,
        ping_policy: None,
    }
}

fn headers(stream_id: u32, end_stream: bool) -> Frame {
    Frame::Headers {
        stream_id,
        metadata: Metadata::new(),
        end_stream,
    }
}

fn data(stream_id: u32, payload: &'static [u8]) -> Frame {
    Frame::Data {
        stream_id,
        payload: Bytes::from_static(payload),
        end_message: true,
        end_stream: false,
    }
}

fn next(conn: &Connection) -> CompletionEvent {
    match conn.next_event(Duration::from_secs(5)) {
        Next::Event(event) => event,
        other => panic!("expected event, got {other:?}"),
    }
}

/// Every event up to the dispatcher shutting down.
fn drain(conn: &Connection) -> Vec<CompletionEvent> {
    let mut events = Vec::new();
    loop {
        match conn.next_event(Duration::from_secs(5)) {
            Next::Event(event) => events.push(event),
            Next::Shutdown => return events,
            Next::Timeout => panic!("dispatcher never shut down; got {events:?}"),
        }
    }
}

fn assert_quiet(conn: &Connection) {
    assert_eq!(conn.next_event(Duration::from_millis(50)), Next::Timeout);
}

/// Peer opens `ids` and the engine announces each of them.
fn open_remote(engine: &Connection, peer: &RawPeer, ids: &[u32]) {
    for &id in ids {
        peer.send(headers(id, false));
    }
    for &id in ids {
        match next(engine) {
            CompletionEvent::IncomingStream { stream_id, .. } => assert_eq!(stream_id, id),
            other => panic!("expected IncomingStream({id}), got {other:?}"),
        }
    }
}

fn expect_go_away(peer: &RawPeer, code: ErrorCode) {
    let (frame, _) = peer.recv_matching(|f| matches!(f, Frame::GoAway { .. }));
    let Frame::GoAway { error_code, .. } = frame else {
        unreachable!()
    };
    assert_eq!(error_code, code);
}

// -- Fatal errors --

#[test]
fn oversized_frame_fails_every_stream() {
    let (engine, peer) = RawPeer::start(Role::Server, config());
    peer.handshake();
    open_remote(&engine, &peer, &[1, 3, 5]);

    // Header alone announcing one byte over the limit.
    let mut raw = BytesMut::new();
    encode_frame_header(&mut raw, 16385, FRAME_DATA, 0, 1);
    peer.send_raw(&raw);

    let events = drain(&engine);
    let ids: Vec<Option<u32>> = events
        .iter()
        .map(|e| match e {
            CompletionEvent::ConnectionError { stream_id, status } => {
                assert_eq!(status.code, Code::Internal);
                *stream_id
            }
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(ids, vec![Some(1), Some(3), Some(5), None]);
    expect_go_away(&peer, ErrorCode::FrameSizeError);
    assert!(engine.is_closed());
    assert!(matches!(engine.open_stream(), Err(Error::ConnectionClosed)));
}

#[test]
fn reused_remote_id_is_fatal() {
    let (engine, peer) = RawPeer::start(Role::Server, config());
    peer.handshake();
    open_remote(&engine, &peer, &[3]);

    peer.send(headers(1, false));
    let events = drain(&engine);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].stream_id(), Some(3));
    assert!(matches!(
        events[1],
        CompletionEvent::ConnectionError {
            stream_id: None,
            ..
        }
    ));
    expect_go_away(&peer, ErrorCode::ProtocolError);
}

#[test]
fn data_on_unopened_stream_is_fatal() {
    let (engine, peer) = RawPeer::start(Role::Server, config());
    peer.handshake();
    peer.send(data(5, b"surprise"));

    let events = drain(&engine);
    assert!(matches!(
        events.as_slice(),
        [CompletionEvent::ConnectionError {
            stream_id: None,
            ..
        }]
    ));
    expect_go_away(&peer, ErrorCode::ProtocolError);
}

#[test]
fn invalid_settings_are_fatal() {
    let (engine, peer) = RawPeer::start(Role::Server, config());

    // MAX_FRAME_SIZE = 0.
    let mut raw = BytesMut::new();
    encode_frame_header(&mut raw, 6, FRAME_SETTINGS, 0, 0);
    raw.put_u16(0x3);
    raw.put_u32(0);
    peer.send_raw(&raw);

    let events = drain(&engine);
    assert_eq!(events.len(), 1);
    expect_go_away(&peer, ErrorCode::ProtocolError);
}

#[test]
fn connection_window_overflow_is_fatal() {
    let small = Config {
        initial_connection_window: 100,
        ..config()
    };
    let (engine, peer) = RawPeer::start(Role::Server, small);
    peer.handshake();
    open_remote(&engine, &peer, &[1]);

    peer.send(data(1, &[0u8; 101]));
    let events = drain(&engine);
    assert_eq!(
        events.iter().map(|e| e.stream_id()).collect::<Vec<_>>(),
        vec![Some(1), None]
    );
    for event in &events {
        let CompletionEvent::ConnectionError { status, .. } = event else {
            panic!("unexpected {event:?}");
        };
        assert_eq!(status.code, Code::ResourceExhausted);
    }
    expect_go_away(&peer, ErrorCode::FlowControlError);
}

// -- Stream-scoped errors --

#[test]
fn stream_window_overflow_resets_only_that_stream() {
    let small = Config {
        initial_stream_window: 10,
        ..config()
    };
    let (engine, peer) = RawPeer::start(Role::Server, small);
    peer.handshake();
    open_remote(&engine, &peer, &[1, 3]);

    peer.send(data(1, b"eleven byte"));
    let CompletionEvent::StreamClosed { stream_id, status, .. } = next(&engine) else {
        panic!("expected StreamClosed");
    };
    assert_eq!(stream_id, 1);
    assert_eq!(status.code, Code::ResourceExhausted);

    let (frame, _) = peer.recv_matching(|f| matches!(f, Frame::Reset { .. }));
    assert_eq!(
        frame,
        Frame::Reset {
            stream_id: 1,
            error_code: ErrorCode::FlowControlError,
        }
    );

    // Stream 3 is untouched.
    peer.send(data(3, b"fits"));
    engine.stream(3).unwrap().read_message().unwrap();
    assert_eq!(
        next(&engine),
        CompletionEvent::MessageReceived {
            stream_id: 3,
            payload: Bytes::from_static(b"fits"),
        }
    );
    assert!(!engine.is_closed());
}

#[test]
fn oversized_message_resets_only_that_stream() {
    let limited = Config {
        max_message_size: 100,
        ..config()
    };
    let (engine, peer) = RawPeer::start(Role::Server, limited);
    peer.handshake();
    open_remote(&engine, &peer, &[1, 3]);

    // Three 50-byte pieces of one message that never ends.
    for _ in 0..3 {
        peer.send(Frame::Data {
            stream_id: 1,
            payload: Bytes::from_static(&[0u8; 50]),
            end_message: false,
            end_stream: false,
        });
    }
    let CompletionEvent::StreamClosed { stream_id, status, .. } = next(&engine) else {
        panic!("expected StreamClosed");
    };
    assert_eq!(stream_id, 1);
    assert_eq!(status.code, Code::ResourceExhausted);

    let (frame, _) = peer.recv_matching(|f| matches!(f, Frame::Reset { .. }));
    assert_eq!(
        frame,
        Frame::Reset {
            stream_id: 1,
            error_code: ErrorCode::EnhanceYourCalm,
        }
    );

    // A message at the limit still goes through on stream 3.
    peer.send(Frame::Data {
        stream_id: 3,
        payload: Bytes::from_static(&[1u8; 100]),
        end_message: true,
        end_stream: false,
    });
    engine.stream(3).unwrap().read_message().unwrap();
    let CompletionEvent::MessageReceived { stream_id, payload } = next(&engine) else {
        panic!("expected MessageReceived");
    };
    assert_eq!((stream_id, payload.len()), (3, 100));
    assert!(!engine.is_closed());
}

#[test]
fn refused_stream_over_limit() {
    let one = Config {
        max_concurrent_streams: 1,
        ..config()
    };
    let (engine, peer) = RawPeer::start(Role::Server, one);
    peer.handshake();
    open_remote(&engine, &peer, &[1]);

    peer.send(headers(3, false));
    let (frame, _) = peer.recv_matching(|f| matches!(f, Frame::Reset { .. }));
    assert_eq!(
        frame,
        Frame::Reset {
            stream_id: 3,
            error_code: ErrorCode::RefusedStream,
        }
    );

    // Data the peer had in flight for the refused stream is dropped.
    peer.send(data(3, b"late"));
    peer.sync();
    assert_quiet(&engine);
    assert_eq!(engine.active_streams(), 1);
    assert!(!engine.is_closed());
}

#[test]
fn frames_for_retired_stream_are_ignored() {
    let (engine, peer) = RawPeer::start(Role::Server, config());
    peer.handshake();
    open_remote(&engine, &peer, &[1]);

    engine.stream(1).unwrap().cancel("not interested");
    assert_eq!(
        next(&engine),
        CompletionEvent::StreamClosed {
            stream_id: 1,
            status: Status::cancelled("not interested"),
            trailers: Metadata::new(),
        }
    );
    let (frame, _) = peer.recv_matching(|f| matches!(f, Frame::Reset { .. }));
    assert_eq!(
        frame,
        Frame::Reset {
            stream_id: 1,
            error_code: ErrorCode::Cancel,
        }
    );

    peer.send(data(1, b"in flight"));
    peer.send(Frame::WindowUpdate {
        stream_id: 1,
        increment: 100,
    });
    peer.send(Frame::Trailers {
        stream_id: 1,
        status: Status::ok(),
        metadata: Metadata::new(),
    });
    peer.send(Frame::Reset {
        stream_id: 1,
        error_code: ErrorCode::Cancel,
    });
    peer.sync();
    assert_quiet(&engine);
    assert!(!engine.is_closed());
}

// -- Connection-level frames --

#[test]
fn ping_is_echoed() {
    let (_engine, peer) = RawPeer::start(Role::Server, config());
    let opaque_data = [1, 2, 3, 4, 5, 6, 7, 8];
    peer.send(Frame::Ping {
        ack: false,
        opaque_data,
    });
    let (frame, _) = peer.recv_matching(|f| matches!(f, Frame::Ping { .. }));
    assert_eq!(
        frame,
        Frame::Ping {
            ack: true,
            opaque_data,
        }
    );
}

#[test]
fn rapid_pings_exhaust_strikes() {
    let strict = Config {
        ping_policy: Some(PingPolicy {
            min_interval: Duration::from_secs(1),
            max_strikes: 2,
        }),
        ..config()
    };
    let (engine, peer) = RawPeer::start(Role::Server, strict);
    peer.handshake();

    for i in 0..4u8 {
        peer.send(Frame::Ping {
            ack: false,
            opaque_data: [i; 8],
        });
    }
    let (frame, skipped) = peer.recv_matching(|f| matches!(f, Frame::GoAway { .. }));
    let Frame::GoAway {
        error_code,
        debug_data,
        ..
    } = frame
    else {
        unreachable!()
    };
    assert_eq!(error_code, ErrorCode::EnhanceYourCalm);
    assert_eq!(debug_data, "too_many_pings");
    // The first and the two tolerated pings were answered.
    let acks = skipped
        .iter()
        .filter(|f| matches!(f, Frame::Ping { ack: true, .. }))
        .count();
    assert_eq!(acks, 3);

    let events = drain(&engine);
    assert!(matches!(
        events.as_slice(),
        [CompletionEvent::ConnectionError { stream_id: None, status }]
            if status.code == Code::ResourceExhausted
    ));
}

#[test]
fn pings_at_allowed_rate_are_answered() {
    let relaxed = Config {
        ping_policy: Some(PingPolicy {
            min_interval: Duration::from_millis(20),
            max_strikes: 0,
        }),
        ..config()
    };
    let (engine, peer) = RawPeer::start(Role::Server, relaxed);
    peer.handshake();
    for i in 0..3u8 {
        peer.send(Frame::Ping {
            ack: false,
            opaque_data: [i; 8],
        });
        peer.recv_matching(|f| matches!(f, Frame::Ping { ack: true, .. }));
        thread::sleep(Duration::from_millis(40));
    }
    assert!(!engine.is_closed());
}

#[test]
fn unanswered_keepalive_closes_connection() {
    let eager = Config {
        keepalive: Some(Keepalive {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(50),
            permit_without_calls: true,
        }),
        ..config()
    };
    let (engine, peer) = RawPeer::start(Role::Client, eager);
    peer.handshake();

    // Never acknowledged.
    peer.recv_matching(|f| matches!(f, Frame::Ping { ack: false, .. }));
    let events = drain(&engine);
    let [CompletionEvent::ConnectionError {
        stream_id: None,
        status,
    }] = events.as_slice()
    else {
        panic!("unexpected {events:?}");
    };
    assert_eq!(status.code, Code::Unavailable);
    assert_eq!(status.message, "keepalive watchdog timeout");
    assert!(engine.is_closed());
}

#[test]
fn acknowledged_keepalive_keeps_connection_open() {
    let eager = Config {
        keepalive: Some(Keepalive {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(500),
            permit_without_calls: true,
        }),
        ..config()
    };
    let (engine, peer) = RawPeer::start(Role::Client, eager);
    peer.handshake();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let (frame, _) = peer.recv_matching(|f| matches!(f, Frame::Ping { ack: false, .. }));
        let Frame::Ping { opaque_data, .. } = frame else {
            unreachable!()
        };
        peer.send(Frame::Ping {
            ack: true,
            opaque_data,
        });
        seen.push(opaque_data);
    }
    assert_ne!(seen[0], seen[1]);
    thread::sleep(Duration::from_millis(100));
    assert!(!engine.is_closed());
    // Keepalive acks are not reported to the application.
    assert_quiet(&engine);
}

#[test]
fn keepalive_waits_for_calls_unless_permitted() {
    let idle = Config {
        keepalive: Some(Keepalive {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(200),
            permit_without_calls: false,
        }),
        ..config()
    };
    let (engine, peer) = RawPeer::start(Role::Client, idle);
    peer.handshake();
    thread::sleep(Duration::from_millis(80));
    assert!(!peer.sync().iter().any(|f| matches!(f, Frame::Ping { ack: false, .. })));

    let call = engine.open_stream().unwrap();
    call.send_headers(Metadata::new()).unwrap();
    peer.recv_matching(|f| matches!(f, Frame::Ping { ack: false, .. }));
}

#[test]
fn settings_are_acknowledged() {
    let (_engine, peer) = RawPeer::start(Role::Server, config());
    let advertised = peer.handshake();
    assert_eq!(advertised.max_frame_size, 16384);
    assert_eq!(advertised.initial_connection_window, 1 << 20);
    peer.recv_matching(|f| matches!(f, Frame::Settings { ack: true, .. }));
}

#[test]
fn nothing_sent_on_streams_before_peer_settings() {
    let (engine, peer) = RawPeer::start(Role::Client, config());
    let call = engine.open_stream().unwrap();
    call.send_message(&b"queued"[..]).unwrap();

    // Only the engine's own SETTINGS go out.
    let first = peer.recv();
    assert!(matches!(first, Frame::Settings { ack: false, .. }));
    assert!(
        peer.frames
            .recv_timeout(Duration::from_millis(50))
            .is_err()
    );

    peer.send(Frame::Settings {
        ack: false,
        settings: Settings::provisional(),
    });
    let (frame, _) = peer.recv_matching(|f| matches!(f, Frame::Headers { .. }));
    assert_eq!(frame.stream_id(), 1);
    let (frame, _) = peer.recv_matching(|f| matches!(f, Frame::Data { .. }));
    assert_eq!(frame, data(1, b"queued"));
}

#[test]
fn peer_go_away_fails_unprocessed_streams() {
    let (engine, peer) = RawPeer::start(Role::Client, config());
    peer.handshake();
    let calls: Vec<_> = (0..3)
        .map(|_| {
            let call = engine.open_stream().unwrap();
            call.send_headers(Metadata::new()).unwrap();
            call
        })
        .collect();
    for id in [1, 3, 5] {
        let (frame, _) = peer.recv_matching(|f| matches!(f, Frame::Headers { .. }));
        assert_eq!(frame.stream_id(), id);
    }

    peer.send(Frame::GoAway {
        last_stream_id: 1,
        error_code: ErrorCode::NoError,
        debug_data: Bytes::from_static(b"draining"),
    });

    let mut unavailable = Vec::new();
    loop {
        match next(&engine) {
            CompletionEvent::StreamClosed { stream_id, status, .. } => {
                assert_eq!(status.code, Code::Unavailable);
                unavailable.push(stream_id);
            }
            CompletionEvent::GoAway { last_stream_id } => {
                assert_eq!(last_stream_id, 1);
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(unavailable, vec![3, 5]);

    // The peer never saw 3 and 5, so they are not reset.
    let before_ack = peer.sync();
    assert!(!before_ack.iter().any(|f| matches!(f, Frame::Reset { .. })));

    assert!(matches!(engine.open_stream(), Err(Error::ConnectionClosed)));
    assert_eq!(calls[0].state(), Some(callmux::StreamState::Open));
}

// -- Stream termination --

#[test]
fn early_trailers_force_close() {
    let (engine, peer) = RawPeer::start(Role::Client, config());
    peer.handshake();
    let call = engine.open_stream().unwrap();
    call.send_headers(Metadata::new()).unwrap();
    peer.recv_matching(|f| matches!(f, Frame::Headers { .. }));

    let mut trailers = Metadata::new();
    trailers.insert("x-denied-by", "policy");
    peer.send(Frame::Trailers {
        stream_id: 1,
        status: Status::new(Code::PermissionDenied, "nope"),
        metadata: trailers.clone(),
    });

    assert_eq!(
        next(&engine),
        CompletionEvent::StreamClosed {
            stream_id: 1,
            status: Status::new(Code::PermissionDenied, "nope"),
            trailers,
        }
    );
    let (frame, _) = peer.recv_matching(|f| matches!(f, Frame::Reset { .. }));
    assert_eq!(
        frame,
        Frame::Reset {
            stream_id: 1,
            error_code: ErrorCode::NoError,
        }
    );
    assert!(call.send_message(&b"too late"[..]).is_err());
}

#[test]
fn reset_after_finish_keeps_sent_status() {
    let (engine, peer) = RawPeer::start(Role::Server, config());
    peer.handshake();
    open_remote(&engine, &peer, &[1]);

    engine
        .stream(1)
        .unwrap()
        .finish(Status::new(Code::NotFound, "missing"), Metadata::new())
        .unwrap();
    let (frame, _) = peer.recv_matching(|f| matches!(f, Frame::Trailers { .. }));
    assert_eq!(frame.stream_id(), 1);

    peer.send(Frame::Reset {
        stream_id: 1,
        error_code: ErrorCode::NoError,
    });
    assert_eq!(
        next(&engine),
        CompletionEvent::StreamClosed {
            stream_id: 1,
            status: Status::new(Code::NotFound, "missing"),
            trailers: Metadata::new(),
        }
    );
}

#[test]
fn peer_reset_cancels_stream() {
    let (engine, peer) = RawPeer::start(Role::Server, config());
    peer.handshake();
    open_remote(&engine, &peer, &[1]);

    peer.send(Frame::Reset {
        stream_id: 1,
        error_code: ErrorCode::Cancel,
    });
    let CompletionEvent::StreamClosed { stream_id, status, .. } = next(&engine) else {
        panic!("expected StreamClosed");
    };
    assert_eq!(stream_id, 1);
    assert_eq!(status.code, Code::Cancelled);
    assert!(engine.stream(1).is_none());

    // The engine does not answer a Reset with a Reset.
    let before_ack = peer.sync();
    assert!(!before_ack.iter().any(|f| matches!(f, Frame::Reset { .. })));
}
