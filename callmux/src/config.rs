use std::time::Duration;

use callmux_proto::Settings;
use callmux_proto::settings::{MAX_FRAME_SIZE_LIMIT, MAX_WINDOW_SIZE};

use crate::error::Error;

/// Per-connection configuration. Every field must be set by the caller;
/// there are no implicit defaults.
///
/// The window, frame and stream limits are advertised to the peer in the
/// initial SETTINGS frame and govern what this side is willing to receive.
/// The rest are enforced locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Receive window granted to each stream.
    pub initial_stream_window: u32,
    /// Receive window granted to the connection as a whole.
    pub initial_connection_window: u32,
    /// Largest inbound frame payload accepted. Larger frames are fatal.
    pub max_frame_size: u32,
    /// Most peer-initiated streams open at once. Further streams are refused.
    pub max_concurrent_streams: u32,
    /// Largest inbound message reassembled. A stream whose message grows
    /// past it is reset with `ResourceExhausted`.
    pub max_message_size: u32,
    /// Periodic liveness pings; `None` disables them.
    pub keepalive: Option<Keepalive>,
    /// Limits on pings the peer may send; `None` accepts any rate.
    pub ping_policy: Option<PingPolicy>,
}

/// Keepalive pings sent by this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Wait between the last acknowledged keepalive and the next one.
    pub interval: Duration,
    /// How long a keepalive may go unacknowledged before the connection is
    /// failed with `Unavailable`.
    pub timeout: Duration,
    /// Ping even when no streams are open.
    pub permit_without_calls: bool,
}

/// Policing of pings received from the peer.
///
/// A ping arriving sooner than `min_interval` after the previous one is a
/// strike. Sending headers or data clears the strikes. One strike more than
/// `max_strikes` fails the connection with GOAWAY(`EnhanceYourCalm`,
/// "too_many_pings").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPolicy {
    pub min_interval: Duration,
    pub max_strikes: u32,
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        check_window("initial_stream_window", self.initial_stream_window)?;
        check_window("initial_connection_window", self.initial_connection_window)?;
        if self.max_frame_size == 0 || self.max_frame_size > MAX_FRAME_SIZE_LIMIT {
            return Err(Error::InvalidConfig(format!(
                "max_frame_size must be in 1..={MAX_FRAME_SIZE_LIMIT}"
            )));
        }
        if self.max_concurrent_streams == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_streams must be > 0".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(Error::InvalidConfig("max_message_size must be > 0".into()));
        }
        if let Some(keepalive) = &self.keepalive
            && (keepalive.interval.is_zero() || keepalive.timeout.is_zero())
        {
            return Err(Error::InvalidConfig(
                "keepalive interval and timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// The SETTINGS this configuration advertises.
    pub fn settings(&self) -> Settings {
        Settings {
            initial_stream_window: self.initial_stream_window,
            initial_connection_window: self.initial_connection_window,
            max_frame_size: self.max_frame_size,
            max_concurrent_streams: self.max_concurrent_streams,
        }
    }
}

fn check_window(name: &str, value: u32) -> Result<(), Error> {
    if value == 0 || value > MAX_WINDOW_SIZE {
        return Err(Error::InvalidConfig(format!(
            "{name} must be > 0 and <= {MAX_WINDOW_SIZE}"
        )));
    }
    Ok(())
}
