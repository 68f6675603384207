//! Application-facing completion queue.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::RwLock;

use crate::event::CompletionEvent;

/// Result of waiting on a [`CompletionDispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Event(CompletionEvent),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The dispatcher was shut down and every queued event has been taken.
    Shutdown,
}

/// FIFO of [`CompletionEvent`]s with competing consumers: any number of
/// threads may wait in [`next`](Self::next), and each event goes to exactly
/// one of them.
///
/// After [`shutdown`](Self::shutdown), consumers drain what is queued and
/// then see [`Next::Shutdown`] forever; posts are dropped.
#[derive(Debug)]
pub struct CompletionDispatcher {
    // Dropping the only sender disconnects the channel once it is drained.
    tx: RwLock<Option<Sender<CompletionEvent>>>,
    rx: Receiver<CompletionEvent>,
}

impl CompletionDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx: RwLock::new(Some(tx)),
            rx,
        }
    }

    /// Enqueue an event. Never blocks.
    pub fn post(&self, event: CompletionEvent) {
        match &*self.tx.read() {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => tracing::trace!(?event, "dropping event posted after shutdown"),
        }
    }

    /// Wait up to `timeout` for the next event.
    pub fn next(&self, timeout: Duration) -> Next {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Next::Event(event),
            Err(RecvTimeoutError::Timeout) => Next::Timeout,
            Err(RecvTimeoutError::Disconnected) => Next::Shutdown,
        }
    }

    /// Take the next event without waiting.
    pub fn try_next(&self) -> Next {
        match self.rx.try_recv() {
            Ok(event) => Next::Event(event),
            Err(TryRecvError::Empty) => Next::Timeout,
            Err(TryRecvError::Disconnected) => Next::Shutdown,
        }
    }

    pub fn shutdown(&self) {
        self.tx.write().take();
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx.read().is_none()
    }

    /// Events queued and not yet taken.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for CompletionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn write_done(stream_id: u32) -> CompletionEvent {
        CompletionEvent::WriteDone { stream_id }
    }

    #[test]
    fn fifo_order() {
        let d = CompletionDispatcher::new();
        d.post(write_done(1));
        d.post(write_done(3));
        assert_eq!(d.next(Duration::ZERO), Next::Event(write_done(1)));
        assert_eq!(d.next(Duration::ZERO), Next::Event(write_done(3)));
        assert_eq!(d.try_next(), Next::Timeout);
    }

    #[test]
    fn next_times_out() {
        let d = CompletionDispatcher::new();
        assert_eq!(d.next(Duration::from_millis(10)), Next::Timeout);
    }

    #[test]
    fn shutdown_drains_then_reports_shutdown() {
        let d = CompletionDispatcher::new();
        d.post(write_done(1));
        d.shutdown();
        d.post(write_done(3));
        assert!(d.is_shutdown());
        assert_eq!(d.next(Duration::from_millis(10)), Next::Event(write_done(1)));
        assert_eq!(d.next(Duration::from_millis(10)), Next::Shutdown);
        assert_eq!(d.next(Duration::from_millis(10)), Next::Shutdown);
    }

    #[test]
    fn shutdown_wakes_waiting_consumer() {
        let d = Arc::new(CompletionDispatcher::new());
        let waiter = {
            let d = d.clone();
            thread::spawn(move || d.next(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        d.shutdown();
        assert_eq!(waiter.join().unwrap(), Next::Shutdown);
    }

    #[test]
    fn competing_consumers_each_event_once() {
        let d = Arc::new(CompletionDispatcher::new());
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let d = d.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Next::Event(CompletionEvent::WriteDone { stream_id }) =
                        d.next(Duration::from_secs(5))
                    {
                        seen.push(stream_id);
                    }
                    seen
                })
            })
            .collect();
        for id in 0..1000 {
            d.post(write_done(id));
        }
        d.shutdown();
        let mut all: Vec<u32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());
    }
}
