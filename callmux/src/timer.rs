//! Connection timer: stream deadlines and keepalive pings.
//!
//! One thread per connection keeps the armed deadlines ordered and calls
//! back when the earliest passes. Commands arrive over a channel so arming
//! and disarming never block the caller, including while the connection
//! lock is held.

use std::collections::{BTreeSet, HashMap};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

/// What a deadline belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum TimerKey {
    Stream(u32),
    /// Time to send the next keepalive ping.
    KeepalivePing,
    /// An outstanding keepalive ping has gone unanswered too long.
    KeepaliveWatchdog,
}

#[derive(Debug)]
enum Command {
    Arm(TimerKey, Instant),
    Disarm(TimerKey),
    Stop,
}

#[derive(Debug)]
pub(crate) struct DeadlineTimer {
    tx: Sender<Command>,
    rx: Receiver<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeadlineTimer {
    pub(crate) fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            handle: Mutex::new(None),
        }
    }

    /// Start the timer thread. `on_expire` runs on that thread with the key of
    /// each deadline that passed and was not disarmed.
    pub(crate) fn start(
        &self,
        on_expire: impl Fn(TimerKey) + Send + 'static,
    ) -> std::io::Result<()> {
        let rx = self.rx.clone();
        let handle = thread::Builder::new()
            .name("callmux-timer".to_string())
            .spawn(move || run(rx, on_expire))?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Arm `key`, replacing any deadline it already had.
    pub(crate) fn arm(&self, key: TimerKey, deadline: Instant) {
        let _ = self.tx.send(Command::Arm(key, deadline));
    }

    pub(crate) fn disarm(&self, key: TimerKey) {
        let _ = self.tx.send(Command::Disarm(key));
    }

    /// Stop the thread and wait for it. Must not be called from `on_expire`.
    pub(crate) fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

fn run(rx: Receiver<Command>, on_expire: impl Fn(TimerKey)) {
    let mut queue: BTreeSet<(Instant, TimerKey)> = BTreeSet::new();
    let mut armed: HashMap<TimerKey, Instant> = HashMap::new();

    loop {
        let command = match queue.first() {
            Some(&(at, _)) => match rx.recv_deadline(at) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match rx.recv() {
                Ok(command) => Some(command),
                Err(_) => return,
            },
        };

        match command {
            Some(Command::Arm(key, at)) => {
                if let Some(old) = armed.insert(key, at) {
                    queue.remove(&(old, key));
                }
                queue.insert((at, key));
            }
            Some(Command::Disarm(key)) => {
                if let Some(at) = armed.remove(&key) {
                    queue.remove(&(at, key));
                }
            }
            Some(Command::Stop) => return,
            None => {}
        }

        let now = Instant::now();
        while let Some(&(at, key)) = queue.first()
            && at <= now
        {
            queue.pop_first();
            armed.remove(&key);
            tracing::trace!(?key, "deadline passed");
            on_expire(key);
        }
    }
}
