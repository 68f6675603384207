//! Sans-IO core of the callmux call engine.
//!
//! This crate holds everything about the multiplexing protocol that does not
//! touch a socket or a thread: the frame codec, flow-control accounting,
//! per-call stream state, and the stream table. The `callmux` crate drives
//! these from its reader and writer threads.
//!
//! # Architecture
//!
//! ```text
//!   application threads
//!        |  enqueue / cancel / read intents
//!   +----v-----------+
//!   | StreamTable    |  id allocation, admission, lookup
//!   |   Stream       |  state machine, outbound queue, inbound messages
//!   | FlowController |  send budget, receive windows, WINDOW_UPDATE grants
//!   +----+-----------+
//!        |  Frame
//!   +----v-----------+
//!   | FrameCodec     |  9-byte header + typed payload
//!   +----------------+
//!        |
//!   duplex byte stream
//! ```
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use callmux_proto::{Frame, FrameCodec};
//!
//! let codec = FrameCodec::new(16384);
//! let mut buf = BytesMut::new();
//! codec.encode(&Frame::WindowUpdate { stream_id: 1, increment: 10 }, &mut buf);
//!
//! let frame = codec.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(frame, Frame::WindowUpdate { stream_id: 1, increment: 10 });
//! assert!(buf.is_empty());
//! ```

pub mod error;
pub mod flowcontrol;
pub mod frame;
mod message;
pub mod metadata;
pub mod settings;
pub mod status;
pub mod stream;
pub mod table;

pub use error::{Error, ErrorCode, ErrorKind};
pub use flowcontrol::{FlowController, Grants};
pub use frame::{Frame, FrameCodec};
pub use metadata::Metadata;
pub use settings::Settings;
pub use status::{Code, Status};
pub use stream::{Cancelled, Emit, Stream, StreamState};
pub use table::{Admission, Lookup, Role, StreamTable};
