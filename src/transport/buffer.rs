//! Fixed-capacity packet buffer with an (offset, length) content window.
//!
//! Transforms move the window instead of copying: headers are prepended
//! into the headroom, tags appended into the tailroom, and stripping a
//! header just advances the offset. A zero-length window is the pipeline's
//! "drop" signal.
//!
//! ```text
//! 0        offset           offset+len          capacity
//! |headroom|     content     |     tailroom     |
//! ```

use crate::core::BufferError;

/// A packet buffer sized once from the frame budget.
#[derive(Clone)]
pub struct PacketBuffer {
    data: Vec<u8>,
    offset: usize,
    len: usize,
}

impl PacketBuffer {
    /// Allocate a buffer of `capacity` bytes with an empty window at `headroom`.
    pub fn new(capacity: usize, headroom: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            offset: headroom.min(capacity),
            len: 0,
        }
    }

    /// Total allocation size.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes available in front of the content.
    pub fn headroom(&self) -> usize {
        self.offset
    }

    /// Bytes available behind the content.
    pub fn tailroom(&self) -> usize {
        self.data.len() - self.offset - self.len
    }

    /// Content length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the window is empty (dropped or not yet filled).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The content.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    /// The content, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.offset..self.offset + self.len]
    }

    /// Empty the window and move it to `headroom`.
    pub fn reset(&mut self, headroom: usize) {
        self.offset = headroom.min(self.data.len());
        self.len = 0;
    }

    /// Mark the content as dropped.
    pub fn discard(&mut self) {
        self.len = 0;
    }

    /// Everything from the window start to the end of the allocation.
    ///
    /// Used as the target of a read; follow with [`commit`](Self::commit).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.offset..]
    }

    /// Set the content length after writing into [`spare_mut`](Self::spare_mut).
    pub fn commit(&mut self, len: usize) -> Result<(), BufferError> {
        let available = self.data.len() - self.offset;
        if len > available {
            return Err(BufferError::Tailroom {
                needed: len,
                available,
            });
        }
        self.len = len;
        Ok(())
    }

    /// Replace the content with `bytes`, keeping the current offset.
    pub fn replace(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let available = self.data.len() - self.offset;
        if bytes.len() > available {
            return Err(BufferError::Tailroom {
                needed: bytes.len(),
                available,
            });
        }
        self.data[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        Ok(())
    }

    /// Grow the window forward by `n` bytes and return the new prefix.
    pub fn prepend(&mut self, n: usize) -> Result<&mut [u8], BufferError> {
        if n > self.offset {
            return Err(BufferError::Headroom {
                needed: n,
                available: self.offset,
            });
        }
        self.offset -= n;
        self.len += n;
        Ok(&mut self.data[self.offset..self.offset + n])
    }

    /// Prepend a copy of `bytes`.
    pub fn prepend_slice(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.prepend(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Grow the window backward by `n` bytes and return the new suffix.
    pub fn append(&mut self, n: usize) -> Result<&mut [u8], BufferError> {
        let available = self.tailroom();
        if n > available {
            return Err(BufferError::Tailroom {
                needed: n,
                available,
            });
        }
        let start = self.offset + self.len;
        self.len += n;
        Ok(&mut self.data[start..start + n])
    }

    /// Append a copy of `bytes`.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.append(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Strip `n` bytes from the front of the content.
    pub fn advance(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.len {
            return Err(BufferError::Underflow {
                needed: n,
                available: self.len,
            });
        }
        self.offset += n;
        self.len -= n;
        Ok(())
    }

    /// Shorten the content to `len` bytes. No-op if already shorter.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("capacity", &self.data.len())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = PacketBuffer::new(128, 16);
        assert!(buf.is_empty());
        assert_eq!(buf.headroom(), 16);
        assert_eq!(buf.tailroom(), 112);
    }

    #[test]
    fn test_prepend_append_advance() {
        let mut buf = PacketBuffer::new(64, 8);
        buf.extend_from_slice(b"payload").unwrap();
        buf.prepend_slice(&[1, 2, 3, 4]).unwrap();
        buf.extend_from_slice(&[9, 9]).unwrap();

        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, b'p', b'a', b'y', b'l', b'o', b'a', b'd', 9, 9]);
        assert_eq!(buf.headroom(), 4);

        buf.advance(4).unwrap();
        buf.truncate(7);
        assert_eq!(buf.as_slice(), b"payload");
    }

    #[test]
    fn test_window_never_leaves_allocation() {
        let mut buf = PacketBuffer::new(16, 4);
        assert!(matches!(
            buf.prepend(5),
            Err(BufferError::Headroom { needed: 5, available: 4 })
        ));
        assert!(buf.append(13).is_err());
        assert!(buf.advance(1).is_err());
        assert!(buf.replace(&[0u8; 13]).is_err());

        // Failed operations leave the window unchanged
        assert_eq!(buf.headroom(), 4);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_spare_and_commit() {
        let mut buf = PacketBuffer::new(32, 0);
        buf.spare_mut()[..3].copy_from_slice(b"abc");
        buf.commit(3).unwrap();
        assert_eq!(buf.as_slice(), b"abc");
        assert!(buf.commit(33).is_err());
    }

    #[test]
    fn test_discard_is_drop_signal() {
        let mut buf = PacketBuffer::new(32, 4);
        buf.extend_from_slice(b"data").unwrap();
        buf.discard();
        assert!(buf.is_empty());
        assert_eq!(buf.as_slice(), b"");

        buf.reset(8);
        assert_eq!(buf.headroom(), 8);
    }
}
