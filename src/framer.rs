//! Message Protocol — turns an incoming byte stream into a sequence of
//! fully parsed messages, preserving partial state across chunk boundaries.

use bytes::BytesMut;

use crate::error::Result;
use crate::message::{parse_complete, peek_header, HeaderKind, Message};

/// A stateful framer for one direction of one connection.
///
/// Bytes accumulate in a single buffer. Every call to `data_received`
/// drains every message that is now fully available; whatever remains is
/// either the leading bytes of the next message or nothing at all — which
/// is exactly what `parsing_message()` reports.
#[derive(Default)]
pub struct MessageFramer {
    buf: BytesMut,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Appends `chunk` and returns every message that is now fully parsed,
    /// in arrival order.
    pub fn data_received(&mut self, chunk: &[u8]) -> Result<Vec<Message>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            let total_length = match peek_header(&self.buf) {
                None => break,
                Some(HeaderKind::Ordinary { total_length, .. }) => total_length,
                Some(HeaderKind::Typeless { total_length, .. }) => total_length,
            };
            if self.buf.len() < total_length {
                break;
            }
            let raw = self.buf.split_to(total_length).freeze();
            out.push(parse_complete(raw)?);
        }
        Ok(out)
    }

    /// True iff a message is partially buffered (header not yet complete,
    /// or body not yet fully arrived).
    pub fn parsing_message(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Discards whatever partial message is currently buffered. Used when
    /// the owning connection disconnects mid-parse.
    pub fn discard_message(&mut self) {
        self.buf.clear();
    }
}
