//! callmux engine metrics.
//!
//! Process-wide counters for connections, streams, frames, bytes and
//! errors. Registered with metriken and exported by whatever exposition the
//! host application sets up.

use metriken::{Counter, Gauge, metric};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "callmux/connections/opened",
    description = "Total connections started"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "callmux/connections/closed",
    description = "Total connections torn down"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

// ── Streams ──────────────────────────────────────────────────────

#[metric(
    name = "callmux/streams/opened",
    description = "Total streams opened by either side"
)]
pub static STREAMS_OPENED: Counter = Counter::new();

#[metric(
    name = "callmux/streams/closed",
    description = "Total streams resolved with a final status"
)]
pub static STREAMS_CLOSED: Counter = Counter::new();

#[metric(
    name = "callmux/streams/refused",
    description = "Peer streams refused over the concurrency limit"
)]
pub static STREAMS_REFUSED: Counter = Counter::new();

#[metric(
    name = "callmux/streams/active",
    description = "Streams currently open"
)]
pub static STREAMS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "callmux/streams/deadline_exceeded",
    description = "Streams closed by their deadline"
)]
pub static DEADLINES_EXPIRED: Counter = Counter::new();

// ── Frames and bytes ─────────────────────────────────────────────

#[metric(name = "callmux/frames/sent", description = "Total frames written")]
pub static FRAMES_SENT: Counter = Counter::new();

#[metric(name = "callmux/frames/received", description = "Total frames decoded")]
pub static FRAMES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "callmux/frames/retired_dropped",
    description = "Frames ignored because their stream was already retired"
)]
pub static FRAMES_DROPPED_RETIRED: Counter = Counter::new();

#[metric(name = "callmux/bytes/sent", description = "Total bytes written")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(name = "callmux/bytes/received", description = "Total bytes read")]
pub static BYTES_RECEIVED: Counter = Counter::new();

// ── Flow control and errors ──────────────────────────────────────

#[metric(
    name = "callmux/flow_control/stalls",
    description = "Times a stream blocked with data queued and no send window"
)]
pub static FLOW_CONTROL_STALLS: Counter = Counter::new();

#[metric(
    name = "callmux/errors/protocol",
    description = "Connections failed by a fatal protocol error"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(
    name = "callmux/keepalive/pings",
    description = "Keepalive pings sent"
)]
pub static KEEPALIVE_PINGS: Counter = Counter::new();
