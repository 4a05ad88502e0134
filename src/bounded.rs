//! Size-capped tee for body bytes.
//!
//! [`BoundedCapture`] sits in front of a destination writer: every byte is
//! forwarded, and only the first `limit` bytes of the logical stream are kept
//! for logging. How the stream is fragmented into writes does not matter.

use bytes::{Bytes, BytesMut};
use std::io::{self, Write};

/// Forwards all writes to the wrapped writer and keeps a copy of at most
/// `limit` bytes of them.
///
/// A `None` limit keeps everything. Going over the limit is not an error, the
/// extra bytes are simply not buffered.
///
/// # Examples
///
/// ```rust
/// use logged_http::BoundedCapture;
/// use std::io::Write;
///
/// let mut capture = BoundedCapture::new(Vec::new(), Some(4));
/// capture.write_all(b"Hello, World!").unwrap();
///
/// assert_eq!(capture.captured(), b"Hell");
/// assert_eq!(capture.get_ref().as_slice(), b"Hello, World!");
/// ```
#[derive(Debug)]
pub struct BoundedCapture<W> {
    inner: W,
    buffer: BytesMut,
    limit: Option<usize>,
}

impl<W> BoundedCapture<W> {
    /// Wrap `inner`, buffering at most `limit` bytes (`None` for no limit).
    pub fn new(inner: W, limit: Option<usize>) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            limit,
        }
    }

    /// The configured cap, if any.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Bytes captured so far.
    pub fn captured(&self) -> &[u8] {
        &self.buffer
    }

    /// Whether the buffer reached its cap.
    pub fn is_full(&self) -> bool {
        matches!(self.limit, Some(limit) if self.buffer.len() >= limit)
    }

    /// Appends the part of `chunk` that still fits under the limit.
    ///
    /// Used directly when the bytes are forwarded by something other than
    /// the wrapped writer, such as a body stream.
    pub fn capture(&mut self, chunk: &[u8]) {
        let take = match self.limit {
            None => chunk.len(),
            Some(limit) => limit.saturating_sub(self.buffer.len()).min(chunk.len()),
        };
        if take > 0 {
            self.buffer.extend_from_slice(&chunk[..take]);
        }
    }

    /// Takes the captured bytes out, leaving an empty buffer behind.
    pub fn take_captured(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Splits into the wrapped writer and the captured bytes.
    pub fn into_parts(self) -> (W, Bytes) {
        (self.inner, self.buffer.freeze())
    }
}

impl BoundedCapture<io::Sink> {
    /// A capture with no destination, for bytes forwarded elsewhere.
    pub fn detached(limit: Option<usize>) -> Self {
        Self::new(io::sink(), limit)
    }
}

impl<W: Write> Write for BoundedCapture<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        // Only what the destination accepted belongs to the logical stream
        self.capture(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
