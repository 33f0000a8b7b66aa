//! Sequence-space reassembly.
//!
//! Incoming payload is positioned somewhere in the 32-bit sequence space;
//! it may duplicate, overlap, or leave holes. [`ChunkBuffer`] retains such
//! data and exposes only the gap-free prefix starting at its head cursor,
//! which is the exact mechanism by which out-of-order segments become
//! in-order application bytes.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::wire::tcp::SeqNumber;

/// An immutable, positioned run of bytes.
///
/// A chunk covers `[begin, end)` of the sequence space. Splitting a chunk
/// shares the underlying allocation instead of copying.
#[derive(Clone)]
pub struct Chunk {
    pos: SeqNumber,
    buf: Arc<[u8]>,
    off: usize,
    len: usize,
}

impl Chunk {
    /// Create a chunk holding a copy of `bytes` at position `pos`.
    pub fn new(pos: SeqNumber, bytes: &[u8]) -> Chunk {
        Chunk {
            pos,
            buf: bytes.into(),
            off: 0,
            len: bytes.len(),
        }
    }

    /// The position of the first byte.
    pub fn begin(&self) -> SeqNumber {
        self.pos
    }

    /// The position one past the last byte.
    pub fn end(&self) -> SeqNumber {
        self.pos + self.len
    }

    /// The number of bytes covered.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the chunk covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bytes covered by this chunk.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.off..self.off + self.len]
    }

    /// The portion of this chunk from `begin` to its end.
    ///
    /// # Panics
    ///
    /// Panics when `begin` lies outside `[self.begin(), self.end()]`.
    pub fn subchunk(&self, begin: SeqNumber) -> Chunk {
        self.subchunk_within(begin, self.end())
    }

    /// The portion of this chunk between the two positions.
    ///
    /// # Panics
    ///
    /// Panics when the range lies outside `[self.begin(), self.end()]` —
    /// like slice indexing, asking for bytes a chunk does not cover is a
    /// caller bug.
    pub fn subchunk_within(&self, begin: SeqNumber, end: SeqNumber) -> Chunk {
        assert!(
            begin >= self.pos && begin <= self.end(),
            "begin of sub-chunk out of range ({} not in [{}, {}])",
            begin,
            self.pos,
            self.end()
        );
        assert!(
            end >= self.pos && end <= self.end(),
            "end of sub-chunk out of range ({} not in [{}, {}])",
            end,
            self.pos,
            self.end()
        );
        Chunk {
            pos: begin,
            buf: self.buf.clone(),
            off: self.off + (begin - self.pos),
            len: end - begin,
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk[{},{})", self.begin(), self.end())
    }
}

/// A buffer of non-overlapping chunks ordered by position.
///
/// Chunks may be written in any order. The buffer keeps everything at or
/// after its head cursor, resolves overlap so that stored chunks never
/// cover a position twice, and releases bytes only once the run from the
/// head cursor is contiguous.
#[derive(Debug)]
pub struct ChunkBuffer {
    chunks: VecDeque<Chunk>,
    begin: SeqNumber,
}

impl ChunkBuffer {
    /// Create a buffer whose head cursor starts at `begin`.
    pub fn new(begin: SeqNumber) -> ChunkBuffer {
        ChunkBuffer {
            chunks: VecDeque::new(),
            begin,
        }
    }

    /// The position of the next byte to be read, i.e. the head cursor.
    pub fn begin(&self) -> SeqNumber {
        self.begin
    }

    /// The position one past the last stored byte, or the head cursor
    /// when nothing is stored.
    pub fn end(&self) -> SeqNumber {
        match self.chunks.back() {
            Some(chunk) => chunk.end(),
            None => self.begin,
        }
    }

    /// Store a chunk, resolving overlap against already-stored data.
    ///
    /// Bytes before the head cursor are discarded; where the chunk covers
    /// positions some stored chunk already holds, only the non-overlapping
    /// left portion is inserted and the remainder is considered against
    /// the following chunks in turn. Data that arrived first wins. Each
    /// write performs at most one split per stored chunk.
    pub fn write(&mut self, chunk: Chunk) {
        let mut c = chunk;
        if c.is_empty() || c.end() <= self.begin {
            return;
        }
        if c.begin() < self.begin {
            c = c.subchunk(self.begin);
        }
        if self.chunks.is_empty() {
            self.chunks.push_back(c);
            return;
        }
        let mut i = 0;
        while i < self.chunks.len() {
            let (ci_begin, ci_end) = {
                let ci = &self.chunks[i];
                (ci.begin(), ci.end())
            };
            if c.begin() < ci_begin {
                if c.end() <= ci_begin {
                    self.chunks.insert(i, c);
                    return;
                }
                let left = c.subchunk_within(c.begin(), ci_begin);
                self.chunks.insert(i, left);
                if c.end() > ci_end {
                    // Skip past the inserted part and the chunk it abuts.
                    c = c.subchunk(ci_end);
                    i += 2;
                    continue;
                }
                return;
            } else if c.begin() < ci_end && c.end() > ci_end {
                c = c.subchunk(ci_end);
                i += 1;
                continue;
            } else if c.end() <= ci_end {
                // Fully covered by data that was here first.
                return;
            }
            i += 1;
        }
        self.chunks.push_back(c);
    }

    /// The number of bytes available in order from the head cursor.
    pub fn available(&self) -> usize {
        let mut len = 0;
        let mut cursor = self.begin;
        for chunk in &self.chunks {
            debug_assert!(cursor <= chunk.begin(), "chunk overlap in buffer");
            if cursor == chunk.begin() {
                len += chunk.len();
                cursor = chunk.end();
            } else {
                break;
            }
        }
        len
    }

    /// Remove and return all bytes available in order from the head
    /// cursor, advancing it past them.
    pub fn read(&mut self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.available());
        let mut cursor = self.begin;
        while let Some(chunk) = self.chunks.front() {
            debug_assert!(cursor <= chunk.begin(), "chunk overlap in buffer");
            if cursor != chunk.begin() {
                break;
            }
            data.extend_from_slice(chunk.bytes());
            cursor = chunk.end();
            self.chunks.pop_front();
        }
        self.begin = cursor;
        data
    }
}

impl fmt::Display for ChunkBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chunk in &self.chunks {
            write!(f, "[{},{})", chunk.begin(), chunk.end())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn filled(pos: i32, len: usize, value: u8) -> Chunk {
        Chunk::new(SeqNumber(pos), &vec![value; len])
    }

    fn ascending(pos: i32, range: core::ops::Range<u8>) -> Chunk {
        let bytes: Vec<u8> = range.collect();
        Chunk::new(SeqNumber(pos), &bytes)
    }

    #[test]
    fn in_order_run() {
        let mut buffer = ChunkBuffer::new(SeqNumber(0));
        buffer.write(ascending(0, 0..4));
        buffer.write(ascending(4, 4..8));
        assert_eq!(buffer.available(), 8);
        assert_eq!(buffer.read(), (0..8).collect::<Vec<u8>>());
        assert_eq!(buffer.begin(), SeqNumber(8));
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn gap_withholds_data() {
        let mut buffer = ChunkBuffer::new(SeqNumber(0));
        buffer.write(ascending(10, 10..20));
        assert_eq!(buffer.available(), 0);
        assert_eq!(buffer.read(), Vec::<u8>::new());
        buffer.write(ascending(0, 0..10));
        assert_eq!(buffer.available(), 20);
        assert_eq!(buffer.read(), (0..20).collect::<Vec<u8>>());
    }

    #[test]
    fn write_is_idempotent() {
        let mut buffer = ChunkBuffer::new(SeqNumber(0));
        buffer.write(ascending(0, 0..10));
        buffer.write(ascending(0, 0..10));
        assert_eq!(buffer.available(), 10);
        assert_eq!(buffer.read(), (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn order_independence() {
        let pieces = [(0i32, 0u8..3u8), (3, 3..7), (7, 10..13)];
        let expect: Vec<u8> = (0..3).chain(3..7).chain(10..13).collect();
        // Every permutation of three non-overlapping pieces covering the
        // same range reads back identically.
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let mut buffer = ChunkBuffer::new(SeqNumber(0));
            for &i in &order {
                let (pos, ref range) = pieces[i];
                buffer.write(ascending(pos, range.clone()));
            }
            assert_eq!(buffer.read(), expect, "order {:?}", order);
        }
    }

    #[test]
    fn overlap_keeps_first_writer() {
        let mut buffer = ChunkBuffer::new(SeqNumber(0));
        buffer.write(filled(0, 10, b'a'));
        buffer.write(filled(5, 10, b'b'));
        assert_eq!(buffer.available(), 15);
        let mut expect = vec![b'a'; 10];
        expect.extend_from_slice(&[b'b'; 5]);
        assert_eq!(buffer.read(), expect);
    }

    #[test]
    fn straddling_write_splits_around_stored_chunk() {
        let mut buffer = ChunkBuffer::new(SeqNumber(5));
        buffer.write(filled(10, 10, b'a'));
        buffer.write(filled(0, 25, b'b'));
        // Head truncation to 5, split around [10, 20), tail to 25.
        assert_eq!(buffer.available(), 20);
        let mut expect = vec![b'b'; 5];
        expect.extend_from_slice(&[b'a'; 10]);
        expect.extend_from_slice(&[b'b'; 5]);
        assert_eq!(buffer.read(), expect);
        assert_eq!(buffer.begin(), SeqNumber(25));
    }

    #[test]
    fn consumed_region_is_discarded() {
        let mut buffer = ChunkBuffer::new(SeqNumber(10));
        buffer.write(filled(0, 10, b'x'));
        assert_eq!(buffer.available(), 0);
        assert_eq!(buffer.end(), SeqNumber(10));
    }

    #[test]
    fn head_truncation() {
        let mut buffer = ChunkBuffer::new(SeqNumber(10));
        buffer.write(ascending(5, 0..10));
        assert_eq!(buffer.available(), 5);
        assert_eq!(buffer.read(), (5..10).collect::<Vec<u8>>());
    }

    #[test]
    fn out_of_order_segments() {
        let mut buffer = ChunkBuffer::new(SeqNumber(900));
        buffer.write(filled(1000, 100, b'2'));
        assert_eq!(buffer.available(), 0);
        buffer.write(filled(900, 100, b'1'));
        assert_eq!(buffer.available(), 200);
        let data = buffer.read();
        assert_eq!(&data[..100], &[b'1'; 100][..]);
        assert_eq!(&data[100..], &[b'2'; 100][..]);
    }

    #[test]
    fn end_tracks_last_chunk() {
        let mut buffer = ChunkBuffer::new(SeqNumber(0));
        assert_eq!(buffer.end(), SeqNumber(0));
        buffer.write(filled(20, 5, b'x'));
        assert_eq!(buffer.end(), SeqNumber(25));
    }

    #[test]
    fn subchunk_shares_bytes() {
        let chunk = ascending(0, 0..10);
        let tail = chunk.subchunk(SeqNumber(6));
        assert_eq!(tail.begin(), SeqNumber(6));
        assert_eq!(tail.bytes(), &[6, 7, 8, 9]);
    }

    #[test]
    #[should_panic]
    fn subchunk_out_of_range() {
        let chunk = ascending(0, 0..10);
        let _ = chunk.subchunk(SeqNumber(11));
    }

    #[test]
    fn sequence_space_wrap() {
        // A buffer whose window straddles the signed wrap point.
        let begin = SeqNumber(i32::MAX - 4);
        let mut buffer = ChunkBuffer::new(begin);
        buffer.write(Chunk::new(begin + 5, &[5, 6, 7, 8, 9]));
        assert_eq!(buffer.available(), 0);
        buffer.write(Chunk::new(begin, &[0, 1, 2, 3, 4]));
        assert_eq!(buffer.available(), 10);
        assert_eq!(buffer.read(), (0..10).collect::<Vec<u8>>());
        assert_eq!(buffer.begin(), begin + 10);
    }
}
