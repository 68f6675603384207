//! Stream registry: id allocation, admission of peer streams, and lookup.

use std::collections::HashMap;
use std::time::Instant;

use crate::error::Error;
use crate::settings::MAX_WINDOW_SIZE;
use crate::stream::Stream;

/// Which end of the connection we are. Clients allocate odd stream ids,
/// servers even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_local_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `stream_id` has the parity this side allocates.
    pub fn is_local(self, stream_id: u32) -> bool {
        match self {
            Role::Client => stream_id % 2 == 1,
            Role::Server => stream_id != 0 && stream_id.is_multiple_of(2),
        }
    }
}

/// Outcome of admitting a peer-initiated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Over the concurrency limit; the peer should be sent `Reset(RefusedStream)`.
    Refused,
}

/// Outcome of looking up a stream id carried by an inbound frame.
#[derive(Debug)]
pub enum Lookup<'a> {
    Active(&'a mut Stream),
    /// The id was used before and the stream is gone. Late frames are expected.
    Retired,
    /// The id was never opened.
    Unknown,
}

#[derive(Debug)]
pub struct StreamTable {
    role: Role,
    streams: HashMap<u32, Stream>,
    next_local_id: u32,
    last_remote_id: u32,
    local_active: u32,
    remote_active: u32,
    /// Limit on streams we open, advertised by the peer.
    max_local_streams: u32,
    /// Limit on streams the peer opens, advertised by us.
    max_remote_streams: u32,
    /// Largest inbound message any stream will reassemble.
    max_message_size: usize,
}

impl StreamTable {
    pub fn new(role: Role, max_remote_streams: u32, max_local_streams: u32) -> Self {
        Self {
            role,
            streams: HashMap::new(),
            next_local_id: role.first_local_id(),
            last_remote_id: 0,
            local_active: 0,
            remote_active: 0,
            max_local_streams,
            max_remote_streams,
            max_message_size: usize::MAX,
        }
    }

    /// Cap inbound messages on streams created from now on.
    pub fn set_max_message_size(&mut self, limit: usize) {
        self.max_message_size = limit;
    }

    fn new_stream(&self, id: u32, deadline: Option<Instant>) -> Stream {
        Stream::new(id, deadline).with_max_message_size(self.max_message_size)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn set_max_local_streams(&mut self, limit: u32) {
        self.max_local_streams = limit;
    }

    /// Allocate the next local id and register a stream for it.
    pub fn create_local_stream(&mut self, deadline: Option<Instant>) -> Result<u32, Error> {
        if self.local_active >= self.max_local_streams {
            return Err(Error::TooManyStreams {
                limit: self.max_local_streams,
            });
        }
        let id = self.next_local_id;
        if id > MAX_WINDOW_SIZE {
            return Err(Error::StreamIdsExhausted);
        }
        self.next_local_id = id + 2;
        let stream = self.new_stream(id, deadline);
        self.streams.insert(id, stream);
        self.local_active += 1;
        Ok(id)
    }

    /// Register a stream opened by the peer. Ids must have the peer's parity
    /// and strictly increase.
    pub fn admit_remote_stream(&mut self, stream_id: u32) -> Result<Admission, Error> {
        if stream_id == 0 || self.role.is_local(stream_id) {
            return Err(Error::ProtocolViolation(format!(
                "peer opened stream {stream_id} with wrong parity"
            )));
        }
        if stream_id <= self.last_remote_id {
            return Err(Error::ProtocolViolation(format!(
                "peer reused stream id {stream_id} (last {})",
                self.last_remote_id
            )));
        }
        self.last_remote_id = stream_id;
        if self.remote_active >= self.max_remote_streams {
            tracing::debug!(
                stream_id,
                limit = self.max_remote_streams,
                "refusing peer stream over concurrency limit"
            );
            return Ok(Admission::Refused);
        }
        let stream = self.new_stream(stream_id, None);
        self.streams.insert(stream_id, stream);
        self.remote_active += 1;
        Ok(Admission::Admitted)
    }

    pub fn lookup(&mut self, stream_id: u32) -> Lookup<'_> {
        if self.is_retired(stream_id) {
            return Lookup::Retired;
        }
        match self.streams.get_mut(&stream_id) {
            Some(stream) => Lookup::Active(stream),
            None => Lookup::Unknown,
        }
    }

    /// The id was allocated at some point and is no longer in the table.
    pub fn is_retired(&self, stream_id: u32) -> bool {
        if stream_id == 0 || self.streams.contains_key(&stream_id) {
            return false;
        }
        if self.role.is_local(stream_id) {
            stream_id < self.next_local_id
        } else {
            stream_id <= self.last_remote_id
        }
    }

    pub fn get(&self, stream_id: u32) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&stream_id)
    }

    pub fn remove(&mut self, stream_id: u32) -> Option<Stream> {
        let stream = self.streams.remove(&stream_id)?;
        if self.role.is_local(stream_id) {
            self.local_active -= 1;
        } else {
            self.remote_active -= 1;
        }
        Some(stream)
    }

    /// Active ids in ascending order.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn last_remote_id(&self) -> u32 {
        self.last_remote_id
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
