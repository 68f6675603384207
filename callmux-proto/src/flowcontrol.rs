//! Flow-control window accounting, per stream and per connection.

use std::collections::HashMap;

use crate::error::Error;
use crate::settings::{MAX_WINDOW_SIZE, Settings};

/// Tracks a send or receive flow control window.
#[derive(Debug, Clone)]
pub struct Window {
    stream_id: u32,
    window: i64,
}

impl Window {
    pub fn new(stream_id: u32, initial: i64) -> Self {
        Self {
            stream_id,
            window: initial,
        }
    }

    /// Current window size (may be negative after a SETTINGS change).
    pub fn window(&self) -> i64 {
        self.window
    }

    /// Consume `amount` bytes from the window.
    /// Returns error if the window would go below zero.
    pub fn consume(&mut self, amount: u32) -> Result<(), Error> {
        let new = self.window - i64::from(amount);
        if new < 0 {
            return Err(Error::FlowControlViolation {
                stream_id: self.stream_id,
            });
        }
        self.window = new;
        Ok(())
    }

    /// Add `increment` to the window (from WINDOW_UPDATE).
    /// Returns error if the window would exceed 2^31 - 1.
    pub fn increase(&mut self, increment: u32) -> Result<(), Error> {
        self.adjust(i64::from(increment))
    }

    /// Shift the window by `delta`, which can be negative.
    pub fn adjust(&mut self, delta: i64) -> Result<(), Error> {
        let new = self.window + delta;
        if new > i64::from(MAX_WINDOW_SIZE) {
            return Err(Error::FlowControlViolation {
                stream_id: self.stream_id,
            });
        }
        self.window = new;
        Ok(())
    }

    /// Bytes that may be taken right now.
    fn available(&self) -> u32 {
        self.window.clamp(0, i64::from(MAX_WINDOW_SIZE)) as u32
    }
}

/// Window increments that should be sent to the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Grants {
    pub connection: Option<u32>,
    pub stream: Option<u32>,
}

impl Grants {
    pub fn is_empty(&self) -> bool {
        self.connection.is_none() && self.stream.is_none()
    }
}

#[derive(Debug)]
struct StreamWindows {
    send: Window,
    recv: Window,
    /// Delivered bytes not yet handed back to the peer.
    pending_grant: u32,
    /// Peer finished sending; no more stream-level grants are useful.
    recv_closed: bool,
}

/// Admission control for payload bytes at stream and connection granularity.
///
/// Receive-side credit is returned to the peer lazily: delivered bytes
/// accumulate until they reach half of the initial window, and only then is
/// a WINDOW_UPDATE produced. Credit is never granted beyond the initial
/// window, so the peer can have at most the configured amount outstanding.
#[derive(Debug)]
pub struct FlowController {
    conn_send: Window,
    conn_recv: Window,
    conn_pending_grant: u32,
    streams: HashMap<u32, StreamWindows>,
    local: Settings,
    remote_stream_window: u32,
}

impl FlowController {
    /// Receive windows come from our own settings; send windows start at the
    /// provisional values until the peer's settings are applied.
    pub fn new(local: &Settings) -> Self {
        let provisional = Settings::provisional();
        Self {
            conn_send: Window::new(0, i64::from(provisional.initial_connection_window)),
            conn_recv: Window::new(0, i64::from(local.initial_connection_window)),
            conn_pending_grant: 0,
            streams: HashMap::new(),
            local: *local,
            remote_stream_window: provisional.initial_stream_window,
        }
    }

    /// Re-base send windows on the peer's advertised initial sizes.
    pub fn apply_remote_settings(&mut self, remote: &Settings) -> Result<(), Error> {
        let delta =
            i64::from(remote.initial_stream_window) - i64::from(self.remote_stream_window);
        if delta != 0 {
            for stream in self.streams.values_mut() {
                stream.send.adjust(delta)?;
            }
        }
        self.remote_stream_window = remote.initial_stream_window;
        // The connection window is only re-based by the first SETTINGS; later
        // growth arrives as WINDOW_UPDATE on stream 0.
        Ok(())
    }

    /// Set the connection send window from the peer's first SETTINGS.
    pub fn init_connection_send_window(&mut self, remote: &Settings) -> Result<(), Error> {
        let delta = i64::from(remote.initial_connection_window)
            - i64::from(Settings::provisional().initial_connection_window);
        self.conn_send.adjust(delta)
    }

    pub fn register_stream(&mut self, stream_id: u32) {
        self.streams.insert(
            stream_id,
            StreamWindows {
                send: Window::new(stream_id, i64::from(self.remote_stream_window)),
                recv: Window::new(stream_id, i64::from(self.local.initial_stream_window)),
                pending_grant: 0,
                recv_closed: false,
            },
        );
    }

    pub fn remove_stream(&mut self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }

    pub fn connection_send_window(&self) -> i64 {
        self.conn_send.window()
    }

    pub fn connection_recv_window(&self) -> i64 {
        self.conn_recv.window()
    }

    pub fn stream_send_window(&self, stream_id: u32) -> Option<i64> {
        self.streams.get(&stream_id).map(|s| s.send.window())
    }

    pub fn stream_recv_window(&self, stream_id: u32) -> Option<i64> {
        self.streams.get(&stream_id).map(|s| s.recv.window())
    }

    /// Grant up to `requested` bytes for sending on `stream_id`, deducting
    /// them from both the stream and connection windows.
    ///
    /// Returns 0 when no budget is available; the caller should retry after
    /// a WINDOW_UPDATE arrives.
    pub fn reserve_send_budget(&mut self, stream_id: u32, requested: u32) -> u32 {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return 0;
        };
        let granted = requested
            .min(stream.send.available())
            .min(self.conn_send.available());
        if granted == 0 {
            tracing::trace!(
                stream_id,
                stream_window = stream.send.window(),
                connection_window = self.conn_send.window(),
                "send blocked on flow control"
            );
        }
        if granted > 0 {
            // Both windows hold at least `granted`, so neither consume fails.
            let _ = stream.send.consume(granted);
            let _ = self.conn_send.consume(granted);
        }
        granted
    }

    /// Apply a WINDOW_UPDATE. Stream 0 addresses the connection window.
    /// Updates for streams no longer tracked are ignored.
    pub fn on_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), Error> {
        if stream_id == 0 {
            self.conn_send.increase(increment)
        } else if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.send.increase(increment)
        } else {
            Ok(())
        }
    }

    /// Charge `n` received payload bytes against the receive windows.
    ///
    /// A connection-window overrun is fatal (`stream_id == 0` in the error);
    /// a stream-window overrun is scoped to that stream, and its bytes should
    /// be handed back with [`release_connection`](Self::release_connection).
    /// Bytes for streams no longer tracked are charged to the connection only.
    pub fn on_data_received(&mut self, stream_id: u32, n: u32) -> Result<(), Error> {
        if n == 0 {
            return Ok(());
        }
        self.conn_recv.consume(n)?;
        match self.streams.get_mut(&stream_id) {
            Some(stream) => stream.recv.consume(n),
            None => Ok(()),
        }
    }

    /// The application consumed `n` bytes of `stream_id`'s inbound buffer.
    pub fn on_bytes_delivered(&mut self, stream_id: u32, n: u32) -> Grants {
        let mut grants = Grants {
            connection: self.release_connection(n),
            stream: None,
        };
        let threshold = half(self.local.initial_stream_window);
        if let Some(stream) = self.streams.get_mut(&stream_id)
            && !stream.recv_closed
        {
            stream.pending_grant = stream.pending_grant.saturating_add(n);
            if stream.pending_grant >= threshold {
                let increment = stream.pending_grant;
                stream.pending_grant = 0;
                if stream.recv.increase(increment).is_ok() {
                    grants.stream = Some(increment);
                }
            }
        }
        grants
    }

    /// Return `n` bytes to the connection receive window (data discarded or
    /// delivered). Produces a connection-level grant once enough accumulates.
    pub fn release_connection(&mut self, n: u32) -> Option<u32> {
        if n == 0 {
            return None;
        }
        self.conn_pending_grant = self.conn_pending_grant.saturating_add(n);
        if self.conn_pending_grant < half(self.local.initial_connection_window) {
            return None;
        }
        let increment = self.conn_pending_grant;
        self.conn_pending_grant = 0;
        self.conn_recv.increase(increment).ok().map(|_| increment)
    }

    /// The peer finished sending on `stream_id`.
    pub fn close_stream_recv(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.recv_closed = true;
        }
    }
}

fn half(window: u32) -> u32 {
    (window / 2).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(stream: u32, conn: u32) -> Settings {
        Settings {
            initial_stream_window: stream,
            initial_connection_window: conn,
            max_frame_size: 16384,
            max_concurrent_streams: 100,
        }
    }

    fn controller(local: Settings, remote: Settings) -> FlowController {
        let mut fc = FlowController::new(&local);
        fc.init_connection_send_window(&remote).unwrap();
        fc.apply_remote_settings(&remote).unwrap();
        fc
    }

    #[test]
    fn basic_consume_and_increase() {
        let mut w = Window::new(1, 65535);
        w.consume(1000).unwrap();
        assert_eq!(w.window(), 64535);
        w.increase(500).unwrap();
        assert_eq!(w.window(), 65035);
    }

    #[test]
    fn consume_underflow() {
        let mut w = Window::new(3, 100);
        assert_eq!(
            w.consume(101),
            Err(Error::FlowControlViolation { stream_id: 3 })
        );
        assert_eq!(w.window(), 100);
    }

    #[test]
    fn increase_overflow() {
        let mut w = Window::new(0, 0x7fff_ffff);
        assert_eq!(
            w.increase(1),
            Err(Error::FlowControlViolation { stream_id: 0 })
        );
    }

    #[test]
    fn stall_and_resume() {
        let mut fc = controller(settings(65535, 65535), settings(10, 1 << 20));
        fc.register_stream(1);

        assert_eq!(fc.reserve_send_budget(1, 20), 10);
        assert_eq!(fc.reserve_send_budget(1, 10), 0);
        fc.on_window_update(1, 10).unwrap();
        assert_eq!(fc.reserve_send_budget(1, 10), 10);
    }

    #[test]
    fn connection_window_caps_all_streams() {
        let mut fc = controller(settings(65535, 65535), settings(100, 30));
        fc.register_stream(1);
        fc.register_stream(3);

        assert_eq!(fc.reserve_send_budget(1, 20), 20);
        assert_eq!(fc.reserve_send_budget(3, 20), 10);
        assert_eq!(fc.reserve_send_budget(3, 20), 0);
        fc.on_window_update(0, 5).unwrap();
        assert_eq!(fc.reserve_send_budget(3, 20), 5);
    }

    #[test]
    fn unknown_stream_gets_no_budget() {
        let mut fc = controller(settings(100, 100), settings(100, 100));
        assert_eq!(fc.reserve_send_budget(7, 10), 0);
        assert!(fc.on_window_update(7, 10).is_ok());
    }

    #[test]
    fn settings_change_adjusts_open_streams() {
        let mut fc = FlowController::new(&settings(100, 100));
        fc.register_stream(1);
        assert_eq!(fc.stream_send_window(1), Some(65535));
        fc.apply_remote_settings(&settings(10, 100)).unwrap();
        assert_eq!(fc.stream_send_window(1), Some(10));
        fc.register_stream(3);
        assert_eq!(fc.stream_send_window(3), Some(10));
    }

    #[test]
    fn window_update_overflow_is_scoped() {
        let mut fc = controller(settings(100, 100), settings(100, 100));
        fc.register_stream(1);
        assert_eq!(
            fc.on_window_update(1, 0x7fff_ffff),
            Err(Error::FlowControlViolation { stream_id: 1 })
        );
        assert_eq!(
            fc.on_window_update(0, 0x7fff_ffff),
            Err(Error::FlowControlViolation { stream_id: 0 })
        );
    }

    #[test]
    fn receive_overrun_scoped_to_stream() {
        let mut fc = controller(settings(10, 1000), settings(100, 100));
        fc.register_stream(2);
        fc.on_data_received(2, 10).unwrap();
        let err = fc.on_data_received(2, 1).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn receive_overrun_of_connection_is_fatal() {
        let mut fc = controller(settings(100, 10), settings(100, 100));
        fc.register_stream(2);
        let err = fc.on_data_received(2, 11).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn grants_batched_until_half_window() {
        let mut fc = controller(settings(100, 1000), settings(100, 100));
        fc.register_stream(1);
        fc.on_data_received(1, 80).unwrap();

        let g = fc.on_bytes_delivered(1, 30);
        assert!(g.is_empty());
        let g = fc.on_bytes_delivered(1, 30);
        assert_eq!(g.stream, Some(60));
        assert_eq!(g.connection, None);
        assert_eq!(fc.stream_recv_window(1), Some(80));
    }

    #[test]
    fn no_stream_grant_after_remote_close() {
        let mut fc = controller(settings(10, 1000), settings(100, 100));
        fc.register_stream(1);
        fc.on_data_received(1, 10).unwrap();
        fc.close_stream_recv(1);
        assert_eq!(fc.on_bytes_delivered(1, 10).stream, None);
    }

    #[test]
    fn discarded_bytes_return_to_connection() {
        let mut fc = controller(settings(100, 20), settings(100, 100));
        fc.on_data_received(9, 12).unwrap();
        assert_eq!(fc.connection_recv_window(), 8);
        assert_eq!(fc.release_connection(12), Some(12));
        assert_eq!(fc.connection_recv_window(), 20);
    }

    #[test]
    fn sends_never_exceed_increments() {
        // Deterministic pseudo-random interleaving of reserves and updates.
        let mut fc = controller(settings(100, 100), settings(64, 1 << 20));
        fc.register_stream(1);
        let mut granted_total: u64 = 0;
        let mut credit_total: u64 = 64;
        let mut seed: u32 = 0x2545_f491;
        for _ in 0..10_000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 {
                let inc = seed % 50 + 1;
                if fc.on_window_update(1, inc).is_ok() {
                    credit_total += u64::from(inc);
                }
            } else {
                granted_total += u64::from(fc.reserve_send_budget(1, seed % 80));
            }
            assert!(granted_total <= credit_total);
        }
    }
}
