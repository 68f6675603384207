use bytes::{Bytes, BytesMut};

/// Per-stream buffer for reassembling messages from DATA frame chunks.
///
/// A message may arrive split across any number of DATA frames; the chunk
/// carrying END_MESSAGE completes it.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    partial: BytesMut,
    /// First chunk of a message, kept without copying in case it is the
    /// only one.
    head: Option<Bytes>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Returns the complete message when `end_message` is set.
    pub fn push(&mut self, chunk: Bytes, end_message: bool) -> Option<Bytes> {
        match (self.head.take(), end_message) {
            (None, true) if self.partial.is_empty() => return Some(chunk),
            (None, false) if self.partial.is_empty() => {
                self.head = Some(chunk);
                return None;
            }
            (Some(head), _) => {
                self.partial.extend_from_slice(&head);
                self.partial.extend_from_slice(&chunk);
            }
            (None, _) => self.partial.extend_from_slice(&chunk),
        }
        if end_message {
            Some(self.partial.split().freeze())
        } else {
            None
        }
    }

    /// Bytes held for a message that is not complete yet.
    pub fn pending_len(&self) -> usize {
        self.partial.len() + self.head.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.pending_len() == 0
    }

    /// Drop any partial message, returning how many bytes were held.
    pub fn clear(&mut self) -> usize {
        let n = self.pending_len();
        self.partial.clear();
        self.head = None;
        n
    }
}
