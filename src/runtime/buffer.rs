//! User-space staging block for the buffer relay strategy.
//!
//! The block is allocated once per engine and never reallocated, so raw
//! pointers handed to in-flight sends stay valid until the engine drops it.

/// Fixed-size byte block with a fill mark.
pub struct Block {
    data: Box<[u8]>,
    /// Bytes of `data` holding the current chunk.
    filled: usize,
}

impl Block {
    /// Allocate a zeroed block of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            filled: 0,
        }
    }

    /// Size of the block.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whole block for reading into. Resets the fill mark.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        self.filled = 0;
        &mut self.data
    }

    /// Record that `n` bytes were read into the block.
    ///
    /// # Panics
    /// Panics if `n` exceeds the block size.
    pub fn set_filled(&mut self, n: usize) {
        assert!(n <= self.data.len(), "fill mark beyond block");
        self.filled = n;
    }

    /// Pointer to the last `remaining` bytes of the current chunk.
    ///
    /// Sends always finish the chunk, so the offset of a resubmission follows
    /// from how many bytes are still owed.
    ///
    /// # Panics
    /// Panics if `remaining` exceeds the chunk.
    pub fn tail_ptr(&self, remaining: usize) -> *const u8 {
        assert!(remaining <= self.filled, "remainder beyond chunk");
        self.data[self.filled - remaining..].as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_pointer_tracks_remainder() {
        let mut block = Block::new(16);
        assert_eq!(block.capacity(), 16);

        block.spare_mut()[..10].copy_from_slice(b"0123456789");
        block.set_filled(10);
        assert_eq!(&block.data[..block.filled], b"0123456789");

        let base = block.data.as_ptr();
        assert_eq!(block.tail_ptr(10), base);
        assert_eq!(block.tail_ptr(3), unsafe { base.add(7) });
        // An empty remainder points one past the chunk.
        assert_eq!(block.tail_ptr(0), unsafe { base.add(10) });
    }

    #[test]
    fn test_refill_resets_mark() {
        let mut block = Block::new(8);
        block.set_filled(8);
        let _ = block.spare_mut();
        assert_eq!(block.filled, 0);
    }

    #[test]
    #[should_panic(expected = "fill mark beyond block")]
    fn test_overfill_panics() {
        let mut block = Block::new(4);
        block.set_filled(5);
    }
}
