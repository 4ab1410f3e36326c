//! Record reassembly for CRLF-delimited streams.
//!
//! Transports hand over bytes in whatever chunks the OS produced. A record
//! may span several chunks and a chunk may hold several records, and the two
//! bytes of the terminator may themselves arrive in different chunks:
//!
//! ```text
//! chunk 1: {"messageType":"pi
//! chunk 2: ng","messageId":"1"}\r
//! chunk 3: \n{"messageType":...
//! ```
//!
//! [`FrameReassembler`] buffers at the byte level and hands out only complete
//! records, without their terminator.

use crate::RECORD_TERMINATOR;
use crate::error::{ProtocolError, ProtocolResult};

/// Turns arbitrarily chunked bytes into complete records.
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
    /// Length of the buffer prefix that ends on a terminator.
    complete: usize,
    max_record_size: usize,
}

impl FrameReassembler {
    /// Creates a reassembler that fails once a partial record exceeds
    /// `max_record_size` bytes.
    pub fn new(max_record_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            complete: 0,
            max_record_size,
        }
    }

    /// Appends `chunk` and returns the records it completed.
    ///
    /// Records are produced lazily. Records not pulled before the returned
    /// iterator is dropped stay buffered and come out of the next `feed`.
    /// Whitespace-only records are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::RecordTooLarge`] if the bytes after the last
    /// terminator exceed the cap. The partial tail is discarded, since the
    /// stream can no longer be trusted to resynchronize. Records completed
    /// before it stay buffered; pull them with [`FrameReassembler::records`].
    pub fn feed(&mut self, chunk: &[u8]) -> ProtocolResult<Records<'_>> {
        // A terminator may straddle the old tail and the new chunk.
        let search_from = self
            .buffer
            .len()
            .saturating_sub(RECORD_TERMINATOR.len() - 1)
            .max(self.complete);
        self.buffer.extend_from_slice(chunk);

        if let Some(idx) = rfind_terminator(&self.buffer[search_from..]) {
            self.complete = search_from + idx + RECORD_TERMINATOR.len();
        }

        let pending = self.buffer.len() - self.complete;
        if pending > self.max_record_size {
            self.buffer.truncate(self.complete);
            return Err(ProtocolError::RecordTooLarge {
                size: pending,
                max: self.max_record_size,
            });
        }

        Ok(self.records())
    }

    /// Complete records still buffered, without feeding new bytes.
    pub fn records(&mut self) -> Records<'_> {
        Records {
            frames: self,
            pos: 0,
        }
    }

    /// Number of buffered bytes that do not yet form a complete record.
    pub fn pending_len(&self) -> usize {
        self.buffer.len() - self.complete
    }
}

/// Complete records handed out by [`FrameReassembler::feed`] or
/// [`FrameReassembler::records`].
#[derive(Debug)]
pub struct Records<'a> {
    frames: &'a mut FrameReassembler,
    pos: usize,
}

impl Iterator for Records<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let end = self.frames.complete;
        while self.pos < end {
            let start = self.pos;
            let len = find_terminator(&self.frames.buffer[start..end])?;
            self.pos = start + len + RECORD_TERMINATOR.len();

            let record = &self.frames.buffer[start..start + len];
            if record.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(record.to_vec());
        }
        None
    }
}

impl Drop for Records<'_> {
    fn drop(&mut self) {
        self.frames.buffer.drain(..self.pos);
        self.frames.complete -= self.pos;
    }
}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(RECORD_TERMINATOR.len())
        .position(|window| window == RECORD_TERMINATOR)
}

fn rfind_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(RECORD_TERMINATOR.len())
        .rposition(|window| window == RECORD_TERMINATOR)
}
