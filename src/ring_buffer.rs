//! A fixed-capacity ring of variable-length blocks.
//!
//! Blocks are addressed by monotonically increasing u64 indices which are byte
//! offsets into an infinite logical stream; only the `[range_start,
//! range_end)` window is backed by storage. Each block is a 4-byte
//! little-endian length header followed by the body. When a new block doesn't
//! fit, whole blocks are evicted from the start (newest wins).
//!
//! [`BlocksRingBuffer`] is single-writer, enforced by `&mut self`.
//! [`CoreBuffer`] wraps one in a mutex for the process-wide buffer that marker
//! producers write to without holding the directory lock. The core buffer has
//! no storage attached while no session is active, and rejects all puts in
//! that state.

use std::sync::{Mutex, MutexGuard};

const BLOCK_HEADER_LEN: u64 = 4;

/// A snapshot of the buffer's index bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingState {
    /// Smallest live block index.
    pub range_start: u64,
    /// One past the end of the last live block.
    pub range_end: u64,
    /// Number of whole blocks dropped because of wrap-around since creation.
    pub cleared_block_count: u64,
}

#[derive(Debug, Default)]
pub(crate) struct BlocksRingBuffer {
    storage: Option<Box<[u8]>>,
    range_start: u64,
    range_end: u64,
    cleared_block_count: u64,
}

impl BlocksRingBuffer {
    /// A buffer with no storage attached; all puts are rejected until
    /// [`set_storage`](Self::set_storage) is called.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity_bytes: usize) -> Self {
        let mut buffer = Self::default();
        buffer.set_storage(capacity_bytes);
        buffer
    }

    /// Attach storage of the given byte capacity (rounded up to a power of
    /// two) and drop any previous contents. Indices stay monotonic across
    /// storage changes.
    pub fn set_storage(&mut self, capacity_bytes: usize) {
        let capacity = capacity_bytes.next_power_of_two();
        self.storage = Some(vec![0u8; capacity].into_boxed_slice());
        self.range_start = self.range_end;
    }

    /// Detach the storage; subsequent puts are rejected.
    pub fn take_storage(&mut self) {
        self.storage = None;
        self.range_start = self.range_end;
    }

    pub fn buffer_length(&self) -> Option<usize> {
        self.storage.as_ref().map(|s| s.len())
    }

    pub fn state(&self) -> RingState {
        RingState {
            range_start: self.range_start,
            range_end: self.range_end,
            cleared_block_count: self.cleared_block_count,
        }
    }

    /// Drop all live blocks, keeping indices monotonic.
    pub fn clear(&mut self) {
        self.range_start = self.range_end;
    }

    /// Append one block, evicting from the start until it fits. Returns the
    /// new block's index, or `None` if there is no storage or the block can
    /// never fit.
    pub fn put_block(&mut self, body: &[u8]) -> Option<u64> {
        let capacity = self.storage.as_ref()?.len() as u64;
        let total = BLOCK_HEADER_LEN + body.len() as u64;
        if total > capacity {
            return None;
        }
        while self.range_end - self.range_start + total > capacity {
            self.evict_front();
        }
        let index = self.range_end;
        let header = (body.len() as u32).to_le_bytes();
        self.write_bytes(index, &header);
        self.write_bytes(index + BLOCK_HEADER_LEN, body);
        self.range_end += total;
        Some(index)
    }

    /// Bulk-copy every live block from `other`, in order.
    pub fn append_contents(&mut self, other: &BlocksRingBuffer) {
        other.for_each_block(other.range_start, |_, body| {
            self.put_block(body);
            true
        });
    }

    /// Read the block starting at `index`, if it is still live.
    pub fn read_block_at(&self, index: u64) -> Option<Vec<u8>> {
        if index < self.range_start || index + BLOCK_HEADER_LEN > self.range_end {
            return None;
        }
        let len = self.block_body_len(index);
        if index + BLOCK_HEADER_LEN + len > self.range_end {
            return None;
        }
        let mut body = vec![0u8; len as usize];
        self.read_bytes(index + BLOCK_HEADER_LEN, &mut body);
        Some(body)
    }

    /// Invoke `f` with `(index, body)` for each live block at or after
    /// `from`, until it returns false. `from` must be a block boundary (or
    /// below `range_start`, in which case iteration starts at the beginning).
    pub fn for_each_block(&self, from: u64, mut f: impl FnMut(u64, &[u8]) -> bool) {
        if self.storage.is_none() {
            return;
        }
        let mut index = from.max(self.range_start);
        let mut scratch = Vec::new();
        while index + BLOCK_HEADER_LEN <= self.range_end {
            let len = self.block_body_len(index);
            let body_start = index + BLOCK_HEADER_LEN;
            if body_start + len > self.range_end {
                break;
            }
            scratch.resize(len as usize, 0);
            self.read_bytes(body_start, &mut scratch);
            if !f(index, &scratch) {
                return;
            }
            index = body_start + len;
        }
    }

    /// Advance `range_start` to the given block boundary, counting evictions.
    pub fn discard_blocks_before(&mut self, index: u64) {
        while self.range_start < index && self.range_start < self.range_end {
            self.evict_front();
        }
    }

    fn evict_front(&mut self) {
        debug_assert!(self.range_start < self.range_end);
        let len = self.block_body_len(self.range_start);
        self.range_start += BLOCK_HEADER_LEN + len;
        self.cleared_block_count += 1;
    }

    fn block_body_len(&self, index: u64) -> u64 {
        let mut header = [0u8; BLOCK_HEADER_LEN as usize];
        self.read_bytes(index, &mut header);
        u32::from_le_bytes(header) as u64
    }

    fn write_bytes(&mut self, at: u64, src: &[u8]) {
        let storage = self.storage.as_mut().expect("write without storage");
        let mask = storage.len() as u64 - 1;
        for (i, byte) in src.iter().enumerate() {
            storage[((at + i as u64) & mask) as usize] = *byte;
        }
    }

    fn read_bytes(&self, at: u64, dst: &mut [u8]) {
        let storage = self.storage.as_ref().expect("read without storage");
        let mask = storage.len() as u64 - 1;
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = storage[((at + i as u64) & mask) as usize];
        }
    }
}

/// The internally-synchronized flavor, shared between the directory-locked
/// writers (sampler, pause/resume bookkeeping) and the lock-free marker path.
#[derive(Debug, Default)]
pub(crate) struct CoreBuffer {
    inner: Mutex<BlocksRingBuffer>,
}

impl CoreBuffer {
    pub const fn new() -> Self {
        CoreBuffer {
            inner: Mutex::new(BlocksRingBuffer {
                storage: None,
                range_start: 0,
                range_end: 0,
                cleared_block_count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BlocksRingBuffer> {
        // A panic while holding this lock never leaves the ring in a state
        // that later operations can't handle, so recover from poisoning.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put_block(&self, body: &[u8]) -> Option<u64> {
        self.lock().put_block(body)
    }

    /// Run a compound operation (read-modify or snapshot read) under a single
    /// lock acquisition. Writers are quiesced for the duration.
    pub fn with<R>(&self, f: impl FnOnce(&mut BlocksRingBuffer) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn state(&self) -> RingState {
        self.lock().state()
    }

    pub fn buffer_length(&self) -> Option<usize> {
        self.lock().buffer_length()
    }

    pub fn append_contents(&self, other: &BlocksRingBuffer) {
        self.lock().append_contents(other);
    }

    pub fn set_storage(&self, capacity_bytes: usize) {
        self.lock().set_storage(capacity_bytes);
    }

    pub fn take_storage(&self) {
        self.lock().take_storage();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(buffer: &BlocksRingBuffer) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        buffer.for_each_block(0, |index, body| {
            out.push((index, body.to_vec()));
            true
        });
        out
    }

    #[test]
    fn put_and_read_back() {
        let mut buffer = BlocksRingBuffer::with_capacity(64);
        let a = buffer.put_block(b"aaa").unwrap();
        let b = buffer.put_block(b"bb").unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 7);
        assert_eq!(buffer.read_block_at(a).unwrap(), b"aaa");
        assert_eq!(buffer.read_block_at(b).unwrap(), b"bb");
        assert_eq!(
            collect(&buffer),
            vec![(0, b"aaa".to_vec()), (7, b"bb".to_vec())]
        );
    }

    #[test]
    fn wrap_evicts_oldest_whole_blocks() {
        let mut buffer = BlocksRingBuffer::with_capacity(32);
        for i in 0u8..8 {
            buffer.put_block(&[i; 4]);
        }
        let state = buffer.state();
        // 8 bytes per block, 32-byte capacity: only the last 4 blocks live.
        assert_eq!(state.range_end - state.range_start, 32);
        assert_eq!(state.cleared_block_count, 4);
        let blocks = collect(&buffer);
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].1, vec![4; 4]);
        assert_eq!(blocks[3].1, vec![7; 4]);
    }

    #[test]
    fn evicted_block_is_unreadable() {
        let mut buffer = BlocksRingBuffer::with_capacity(32);
        let first = buffer.put_block(&[1; 4]).unwrap();
        for i in 2u8..9 {
            buffer.put_block(&[i; 4]);
        }
        assert_eq!(buffer.read_block_at(first), None);
    }

    #[test]
    fn too_big_is_rejected() {
        let mut buffer = BlocksRingBuffer::with_capacity(32);
        buffer.put_block(&[9; 2]).unwrap();
        assert_eq!(buffer.put_block(&[0; 64]), None);
        // The rejected put didn't disturb existing contents.
        assert_eq!(collect(&buffer).len(), 1);
    }

    #[test]
    fn no_storage_rejects_puts() {
        let mut buffer = BlocksRingBuffer::new();
        assert_eq!(buffer.put_block(b"x"), None);
        buffer.set_storage(64);
        assert!(buffer.put_block(b"x").is_some());
        buffer.take_storage();
        assert_eq!(buffer.put_block(b"x"), None);
    }

    #[test]
    fn clear_keeps_indices_monotonic() {
        let mut buffer = BlocksRingBuffer::with_capacity(64);
        buffer.put_block(b"abc");
        let before = buffer.state();
        buffer.clear();
        let after = buffer.state();
        assert_eq!(after.range_start, after.range_end);
        assert!(after.range_start >= before.range_end);
        let next = buffer.put_block(b"d").unwrap();
        assert!(next >= before.range_end);
    }

    #[test]
    fn append_contents_copies_live_blocks() {
        let mut staging = BlocksRingBuffer::with_capacity(64);
        staging.put_block(b"one");
        staging.put_block(b"two");

        let mut global = BlocksRingBuffer::with_capacity(128);
        global.put_block(b"zero");
        global.append_contents(&staging);

        let bodies: Vec<Vec<u8>> = collect(&global).into_iter().map(|(_, b)| b).collect();
        assert_eq!(bodies, vec![b"zero".to_vec(), b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn discard_blocks_before_counts_cleared() {
        let mut buffer = BlocksRingBuffer::with_capacity(128);
        buffer.put_block(&[1]);
        let second = buffer.put_block(&[2]).unwrap();
        buffer.put_block(&[3]);
        buffer.discard_blocks_before(second);
        let state = buffer.state();
        assert_eq!(state.range_start, second);
        assert_eq!(state.cleared_block_count, 1);
        assert_eq!(collect(&buffer).len(), 2);
    }

    #[test]
    fn core_buffer_locks_per_operation() {
        let core = CoreBuffer::new();
        assert_eq!(core.put_block(b"x"), None);
        core.set_storage(64);
        let index = core.put_block(b"x").unwrap();
        core.with(|ring| {
            assert_eq!(ring.read_block_at(index).unwrap(), b"x");
        });
        core.take_storage();
        assert_eq!(core.put_block(b"x"), None);
    }
}
