//! callmux: a multiplexed RPC call engine over one duplex byte stream.
//!
//! Many concurrent calls ("streams") share a single transport. Each stream
//! carries initial metadata, any number of length-delimited messages in each
//! direction, and ends with exactly one final [`Status`]. Results reach the
//! application as [`CompletionEvent`]s through a [`CompletionDispatcher`].
//!
//! # Architecture
//!
//! ```text
//!   application threads                     CompletionDispatcher::next()
//!        |  StreamHandle::send_message / read_message / cancel     ^
//!   +----v-----------------------------------------------------+  |
//!   | Connection    StreamTable + FlowController (one lock)    |--+
//!   +----+------------------------------------------------+----+
//!        | writer thread                   reader thread  ^
//!        v  control frames, round-robin Data    FrameCodec |
//!   +---------------------- Transport -------------------------+
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use callmux::{CompletionEvent, Config, Connection, Metadata, Next, pipe};
//!
//! let config = Config {
//!     initial_stream_window: 65535,
//!     initial_connection_window: 1 << 20,
//!     max_frame_size: 16384,
//!     max_concurrent_streams: 100,
//!     max_message_size: 4 << 20,
//!     keepalive: None,
//!     ping_policy: None,
//! };
//! let (a, _b) = pipe();
//! let client = Connection::client(a, config)?;
//!
//! let call = client.open_stream()?;
//! let mut headers = Metadata::new();
//! headers.insert(":method", "POST");
//! call.send_headers(headers)?;
//! call.send_message(&b"hello"[..])?;
//! call.finish_sending()?;
//! call.read_message()?;
//!
//! while let Next::Event(event) = client.next_event(Duration::from_secs(1)) {
//!     if let CompletionEvent::StreamClosed { status, .. } = event {
//!         println!("call finished: {status}");
//!         break;
//!     }
//! }
//! # Ok::<(), callmux::Error>(())
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod metrics;
pub(crate) mod timer;
pub mod transport;

pub use callmux_proto::{Code, Metadata, Role, Status, StreamState};
pub use config::{Config, Keepalive, PingPolicy};
pub use connection::{Connection, StreamHandle};
pub use dispatcher::{CompletionDispatcher, Next};
pub use error::Error;
pub use event::CompletionEvent;
pub use transport::{MemTransport, Transport, pipe};
