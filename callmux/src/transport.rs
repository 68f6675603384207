//! Duplex byte-stream boundary.
//!
//! The engine reads from the transport on its reader thread and writes on
//! its writer thread, concurrently, through a shared reference.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// A duplex byte stream.
///
/// `read` returns `Ok(0)` once the peer has closed. Either method may return
/// [`io::ErrorKind::WouldBlock`]; the engine retries after a short pause.
/// `close` must unblock a concurrent `read`.
pub trait Transport: Send + Sync + 'static {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn close(&self);
}

impl Transport for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn close(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

impl<T: Transport> Transport for Arc<T> {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn close(&self) {
        (**self).close()
    }
}

// ── In-process pipe ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct Buffer {
    data: VecDeque<u8>,
    closed: bool,
}

/// One direction of a pipe.
#[derive(Debug, Default)]
struct Half {
    buf: Mutex<Buffer>,
    readable: Condvar,
}

impl Half {
    fn close(&self) {
        self.buf.lock().closed = true;
        self.readable.notify_all();
    }
}

/// One end of an in-process duplex pipe created by [`pipe`].
#[derive(Debug, Clone)]
pub struct MemTransport {
    rx: Arc<Half>,
    tx: Arc<Half>,
}

/// Create a connected pair of in-process transports. Bytes written to one
/// end are read from the other.
pub fn pipe() -> (MemTransport, MemTransport) {
    let a_to_b = Arc::new(Half::default());
    let b_to_a = Arc::new(Half::default());
    (
        MemTransport {
            rx: b_to_a.clone(),
            tx: a_to_b.clone(),
        },
        MemTransport {
            rx: a_to_b,
            tx: b_to_a,
        },
    )
}

impl MemTransport {
    /// Write all of `buf`. Test peers use this to inject raw bytes.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let n = Transport::write(self, buf)?;
        debug_assert_eq!(n, buf.len());
        Ok(())
    }
}

impl Transport for MemTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.rx.buf.lock();
        while inner.data.is_empty() && !inner.closed {
            self.rx.readable.wait(&mut inner);
        }
        let n = buf.len().min(inner.data.len());
        for (dst, src) in buf.iter_mut().zip(inner.data.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.tx.buf.lock();
        if inner.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        inner.data.extend(buf);
        drop(inner);
        self.tx.readable.notify_all();
        Ok(buf.len())
    }

    /// Close both directions: our reads return end-of-stream immediately,
    /// the peer reads what is buffered and then end-of-stream.
    fn close(&self) {
        self.rx.close();
        self.tx.close();
    }
}
