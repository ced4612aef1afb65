// src/buffer.rs
use std::fmt;
use thiserror::Error;

/// Returned when an append does not fit. The buffer is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer full: {needed} bytes needed, {available} available")]
pub struct BufferFull {
    pub needed: usize,
    pub available: usize,
}

/// Fixed-capacity byte buffer allocated once per connection slot.
///
/// The filled region is `[0, len)`. Reads land in [`FixedBuf::spare_mut`] and
/// are published with [`FixedBuf::commit`]; the parser may rewrite bytes of
/// the filled region in place through [`FixedBuf::filled_mut`].
pub struct FixedBuf {
    data: Box<[u8]>,
    len: usize,
}

impl FixedBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn remaining_capacity(&self) -> usize {
        self.data.len() - self.len
    }

    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn filled_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Unfilled tail, for `recv` to write into.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Publish `n` bytes previously written into [`FixedBuf::spare_mut`].
    pub fn commit(&mut self, n: usize) {
        self.len = (self.len + n).min(self.data.len());
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        let available = self.remaining_capacity();
        if bytes.len() > available {
            return Err(BufferFull {
                needed: bytes.len(),
                available,
            });
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Bounded formatted append. On overflow nothing is kept.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<(), BufferFull> {
        let start = self.len;
        let available = self.remaining_capacity();
        let mut writer = SpareWriter {
            buf: &mut self.data[start..],
            written: 0,
            overflow: 0,
        };
        if fmt::Write::write_fmt(&mut writer, args).is_err() {
            return Err(BufferFull {
                needed: writer.written + writer.overflow,
                available,
            });
        }
        self.len = start + writer.written;
        Ok(())
    }

    /// Drop the first `n` filled bytes, shifting the rest to the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl fmt::Debug for FixedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedBuf")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

struct SpareWriter<'a> {
    buf: &'a mut [u8],
    written: usize,
    overflow: usize,
}

impl fmt::Write for SpareWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.written + s.len();
        if end > self.buf.len() {
            self.overflow += s.len();
            return Err(fmt::Error);
        }
        self.buf[self.written..end].copy_from_slice(s.as_bytes());
        self.written = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_respects_capacity() {
        let mut buf = FixedBuf::with_capacity(8);
        buf.append(b"hello").unwrap();
        assert_eq!(buf.remaining_capacity(), 3);

        let err = buf.append(b"world").unwrap_err();
        assert_eq!(err, BufferFull { needed: 5, available: 3 });
        assert_eq!(buf.filled(), b"hello");
    }

    #[test]
    fn append_fmt_rolls_back_on_overflow() {
        let mut buf = FixedBuf::with_capacity(24);
        buf.append_fmt(format_args!("Content-Length: {}\r\n", 42)).unwrap();
        assert_eq!(buf.filled(), b"Content-Length: 42\r\n");

        let before = buf.len();
        assert!(buf.append_fmt(format_args!("{}{}", "abc", "defgh")).is_err());
        assert_eq!(buf.len(), before);
        assert_eq!(buf.filled(), b"Content-Length: 42\r\n");
    }

    #[test]
    fn commit_publishes_spare_bytes() {
        let mut buf = FixedBuf::with_capacity(4);
        buf.spare_mut()[..2].copy_from_slice(b"ab");
        buf.commit(2);
        assert_eq!(buf.filled(), b"ab");
        buf.commit(10);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.remaining_capacity(), 0);
    }

    #[test]
    fn consume_shifts_remaining_bytes() {
        let mut buf = FixedBuf::with_capacity(16);
        buf.append(b"GET / HTTP/1.1").unwrap();
        buf.consume(4);
        assert_eq!(buf.filled(), b"/ HTTP/1.1");
        buf.consume(100);
        assert!(buf.is_empty());
    }
}
