//! Connection SETTINGS parameters exchanged at start-up.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;

// Settings identifiers.
const SETTINGS_INITIAL_STREAM_WINDOW: u16 = 0x1;
const SETTINGS_INITIAL_CONNECTION_WINDOW: u16 = 0x2;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x3;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x4;

/// Largest representable flow-control window.
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// Largest frame payload the 24-bit length field can describe.
pub const MAX_FRAME_SIZE_LIMIT: u32 = 0x00ff_ffff;

/// Parameters one side advertises to its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Receive window granted to each new stream.
    pub initial_stream_window: u32,
    /// Receive window granted to the connection as a whole.
    pub initial_connection_window: u32,
    /// Largest frame payload this side accepts.
    pub max_frame_size: u32,
    /// Most peer-initiated streams this side keeps open at once.
    pub max_concurrent_streams: u32,
}

impl Settings {
    /// Settings a connection assumes for its peer until the peer's own
    /// SETTINGS frame arrives.
    pub const fn provisional() -> Self {
        Self {
            initial_stream_window: 65535,
            initial_connection_window: 65535,
            max_frame_size: 16384,
            max_concurrent_streams: 100,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        encode_setting(buf, SETTINGS_INITIAL_STREAM_WINDOW, self.initial_stream_window);
        encode_setting(
            buf,
            SETTINGS_INITIAL_CONNECTION_WINDOW,
            self.initial_connection_window,
        );
        encode_setting(buf, SETTINGS_MAX_FRAME_SIZE, self.max_frame_size);
        encode_setting(
            buf,
            SETTINGS_MAX_CONCURRENT_STREAMS,
            self.max_concurrent_streams,
        );
    }

    /// Decode a payload of 6-byte `(id, value)` pairs. Identifiers that are
    /// not sent keep their provisional value; unknown identifiers are ignored.
    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        if !buf.len().is_multiple_of(6) {
            return Err(Error::Malformed("SETTINGS payload not a multiple of 6".into()));
        }
        let mut settings = Settings::provisional();
        while buf.has_remaining() {
            let id = buf.get_u16();
            let value = buf.get_u32();
            match id {
                SETTINGS_INITIAL_STREAM_WINDOW => {
                    check_window(value)?;
                    settings.initial_stream_window = value;
                }
                SETTINGS_INITIAL_CONNECTION_WINDOW => {
                    check_window(value)?;
                    settings.initial_connection_window = value;
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(1..=MAX_FRAME_SIZE_LIMIT).contains(&value) {
                        return Err(Error::ProtocolViolation(
                            "MAX_FRAME_SIZE out of range".into(),
                        ));
                    }
                    settings.max_frame_size = value;
                }
                SETTINGS_MAX_CONCURRENT_STREAMS => {
                    settings.max_concurrent_streams = value;
                }
                _ => {}
            }
        }
        Ok(settings)
    }
}

fn check_window(value: u32) -> Result<(), Error> {
    if value == 0 || value > MAX_WINDOW_SIZE {
        return Err(Error::ProtocolViolation(format!(
            "initial window {value} out of range"
        )));
    }
    Ok(())
}

fn encode_setting(buf: &mut BytesMut, id: u16, value: u32) {
    buf.put_u16(id);
    buf.put_u32(value);
}
