//! A FIFO byte queue organized as variable-size blocks.

use std::collections::VecDeque;
use std::fmt;

/// The block size used when single bytes are appended.
const DEFAULT_BLOCK_SIZE: usize = 512;

/// One stored block; `off` marks how much of it was already consumed.
#[derive(Debug)]
struct Block {
    data: Vec<u8>,
    off: usize,
}

impl Block {
    fn len(&self) -> usize {
        self.data.len() - self.off
    }

    fn bytes(&self) -> &[u8] {
        &self.data[self.off..]
    }
}

/// A byte FIFO buffering data on its way to a consumer.
///
/// Writers append blocks of whatever size a segment happened to carry;
/// readers drain however many bytes they ask for. Whole blocks are
/// consumed first, then the next block is drained partially. The buffer
/// exists precisely because those two sizes are unrelated.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    blocks: VecDeque<Block>,
}

impl StreamBuffer {
    /// Create an empty buffer.
    pub fn new() -> StreamBuffer {
        StreamBuffer::default()
    }

    /// Append a copy of `bytes` as one block.
    pub fn write(&mut self, bytes: &[u8]) {
        self.blocks.push_back(Block {
            data: bytes.to_vec(),
            off: 0,
        });
    }

    /// Append a single byte.
    ///
    /// The byte lands in the tail block while it has room, so repeated
    /// single-byte writes do not degenerate into one block per byte.
    pub fn push(&mut self, byte: u8) {
        if let Some(block) = self.blocks.back_mut() {
            if block.data.len() < DEFAULT_BLOCK_SIZE {
                block.data.push(byte);
                return;
            }
        }
        let mut data = Vec::with_capacity(DEFAULT_BLOCK_SIZE);
        data.push(byte);
        self.blocks.push_back(Block { data, off: 0 });
    }

    /// The number of buffered bytes.
    pub fn available(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }

    /// Whether no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|block| block.len() == 0)
    }

    /// Remove and return the first byte, if any.
    pub fn pop(&mut self) -> Option<u8> {
        loop {
            let block = self.blocks.front_mut()?;
            if block.len() == 0 {
                self.blocks.pop_front();
                continue;
            }
            let byte = block.data[block.off];
            block.off += 1;
            if block.len() == 0 {
                self.blocks.pop_front();
            }
            return Some(byte);
        }
    }

    /// Fill `buf` from the front of the queue.
    ///
    /// Returns how many bytes were written, the minimum of `buf.len()` and
    /// [`available`](#method.available).
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut count = 0;
        while count < buf.len() {
            let Some(block) = self.blocks.front_mut() else {
                break;
            };
            let want = buf.len() - count;
            let have = block.len();
            if want >= have {
                buf[count..count + have].copy_from_slice(block.bytes());
                count += have;
                self.blocks.pop_front();
            } else {
                buf[count..count + want].copy_from_slice(&block.bytes()[..want]);
                block.off += want;
                count += want;
            }
        }
        count
    }

    /// Remove and return everything buffered.
    pub fn read_all(&mut self) -> Vec<u8> {
        let mut data = vec![0; self.available()];
        let count = self.read(&mut data);
        debug_assert_eq!(count, data.len());
        data
    }
}

impl fmt::Display for StreamBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, block) in self.blocks.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", block.len())?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut buffer = StreamBuffer::new();
        buffer.write(&[1, 2, 3]);
        buffer.write(&[4, 5]);
        assert_eq!(buffer.available(), 5);
        assert_eq!(buffer.read_all(), vec![1, 2, 3, 4, 5]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_read_straddles_blocks() {
        let mut buffer = StreamBuffer::new();
        buffer.write(&[1, 2, 3]);
        buffer.write(&[4, 5, 6]);
        let mut out = [0; 4];
        assert_eq!(buffer.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(buffer.available(), 2);
        assert_eq!(buffer.read_all(), vec![5, 6]);
    }

    #[test]
    fn short_read_from_drained_buffer() {
        let mut buffer = StreamBuffer::new();
        buffer.write(&[9]);
        let mut out = [0; 8];
        assert_eq!(buffer.read(&mut out), 1);
        assert_eq!(buffer.read(&mut out), 0);
    }

    #[test]
    fn single_bytes_share_a_block() {
        let mut buffer = StreamBuffer::new();
        for i in 0..4u8 {
            buffer.push(i);
        }
        assert_eq!(buffer.blocks.len(), 1);
        assert_eq!(buffer.pop(), Some(0));
        assert_eq!(buffer.read_all(), vec![1, 2, 3]);
        assert_eq!(buffer.pop(), None);
    }

    #[test]
    fn block_rollover_after_default_size() {
        let mut buffer = StreamBuffer::new();
        for _ in 0..DEFAULT_BLOCK_SIZE + 1 {
            buffer.push(7);
        }
        assert_eq!(buffer.blocks.len(), 2);
        assert_eq!(buffer.available(), DEFAULT_BLOCK_SIZE + 1);
    }
}
