//! The typed entry layer over the blocks ring buffer.
//!
//! Every piece of profiling data is one block: a 1-byte kind tag followed by
//! a fixed or length-prefixed body. The encoding is stable within a build and
//! never persisted across versions. Entries that are written from inside the
//! sampler's suspended window (label frames, native addresses, times) encode
//! into a stack scratch buffer so that path never allocates.
//!
//! A sample is the entry run `ThreadId, Time, frame*` where a frame is a
//! `Label` or `NativeLeafAddr` entry. A counter reading is `CounterId, Time,
//! CounterKey, Count[, Number]`. Markers and overhead records are single
//! self-contained blocks.

use crate::category::Category;
use crate::markers::{take, MarkerPayload};
use crate::ring_buffer::{BlocksRingBuffer, CoreBuffer, RingState};

pub(crate) const TAG_THREAD_ID: u8 = 0;
pub(crate) const TAG_TIME: u8 = 1;
pub(crate) const TAG_NATIVE_LEAF: u8 = 2;
pub(crate) const TAG_LABEL: u8 = 3;
pub(crate) const TAG_COUNTER_ID: u8 = 4;
pub(crate) const TAG_COUNTER_KEY: u8 = 5;
pub(crate) const TAG_COUNT: u8 = 6;
pub(crate) const TAG_NUMBER: u8 = 7;
pub(crate) const TAG_PAUSE: u8 = 8;
pub(crate) const TAG_RESUME: u8 = 9;
pub(crate) const TAG_COLLECTION_START: u8 = 10;
pub(crate) const TAG_COLLECTION_END: u8 = 11;
pub(crate) const TAG_MARKER: u8 = 12;
pub(crate) const TAG_OVERHEAD: u8 = 13;

const MAX_LABEL_LEN: usize = 256;
const MAX_DYNAMIC_LEN: usize = 64;
const ENTRY_SCRATCH_LEN: usize = 384;

/// An entry to be written. Strings are borrowed; the encoder copies them into
/// the block.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Entry<'a> {
    ThreadId(i32),
    Time(f64),
    NativeLeafAddr(u64),
    Label {
        label: &'a str,
        dynamic: &'a str,
        category: Category,
    },
    CounterId(u32),
    CounterKey(u64),
    Count(i64),
    Number(u64),
    Pause(f64),
    Resume(f64),
    CollectionStart(f64),
    CollectionEnd(f64),
    Overhead {
        sampling_start: f64,
        locking: f64,
        cleaning: f64,
        counters: f64,
        threads: f64,
    },
}

/// Fixed-size scratch for allocation-free entry encoding.
pub(crate) struct EntryBuf {
    bytes: [u8; ENTRY_SCRATCH_LEN],
    len: usize,
}

impl EntryBuf {
    pub fn new() -> EntryBuf {
        EntryBuf {
            bytes: [0; ENTRY_SCRATCH_LEN],
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        self.bytes[self.len] = byte;
        self.len += 1;
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.bytes[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Entry<'_> {
    pub(crate) fn encode<'b>(&self, buf: &'b mut EntryBuf) -> &'b [u8] {
        buf.len = 0;
        match *self {
            Entry::ThreadId(tid) => {
                buf.push(TAG_THREAD_ID);
                buf.extend(&tid.to_le_bytes());
            }
            Entry::Time(t) => {
                buf.push(TAG_TIME);
                buf.extend(&t.to_le_bytes());
            }
            Entry::NativeLeafAddr(addr) => {
                buf.push(TAG_NATIVE_LEAF);
                buf.extend(&addr.to_le_bytes());
            }
            Entry::Label {
                label,
                dynamic,
                category,
            } => {
                buf.push(TAG_LABEL);
                buf.push(category as u8);
                let label = &label.as_bytes()[..label.len().min(MAX_LABEL_LEN)];
                buf.extend(&(label.len() as u16).to_le_bytes());
                buf.extend(label);
                let dynamic = &dynamic.as_bytes()[..dynamic.len().min(MAX_DYNAMIC_LEN)];
                buf.extend(&(dynamic.len() as u16).to_le_bytes());
                buf.extend(dynamic);
            }
            Entry::CounterId(id) => {
                buf.push(TAG_COUNTER_ID);
                buf.extend(&id.to_le_bytes());
            }
            Entry::CounterKey(key) => {
                buf.push(TAG_COUNTER_KEY);
                buf.extend(&key.to_le_bytes());
            }
            Entry::Count(count) => {
                buf.push(TAG_COUNT);
                buf.extend(&count.to_le_bytes());
            }
            Entry::Number(number) => {
                buf.push(TAG_NUMBER);
                buf.extend(&number.to_le_bytes());
            }
            Entry::Pause(t) => {
                buf.push(TAG_PAUSE);
                buf.extend(&t.to_le_bytes());
            }
            Entry::Resume(t) => {
                buf.push(TAG_RESUME);
                buf.extend(&t.to_le_bytes());
            }
            Entry::CollectionStart(t) => {
                buf.push(TAG_COLLECTION_START);
                buf.extend(&t.to_le_bytes());
            }
            Entry::CollectionEnd(t) => {
                buf.push(TAG_COLLECTION_END);
                buf.extend(&t.to_le_bytes());
            }
            Entry::Overhead {
                sampling_start,
                locking,
                cleaning,
                counters,
                threads,
            } => {
                buf.push(TAG_OVERHEAD);
                for value in [sampling_start, locking, cleaning, counters, threads] {
                    buf.extend(&value.to_le_bytes());
                }
            }
        }
        buf.as_slice()
    }
}

/// One marker block, as stored in the buffer.
#[derive(Debug, Clone)]
pub(crate) struct MarkerRecord {
    pub tid: i32,
    pub name: String,
    pub category: Category,
    pub time: f64,
    pub payload: Option<MarkerPayload>,
}

pub(crate) fn encode_marker_block(
    tid: i32,
    name: &str,
    category: Category,
    time: f64,
    payload: Option<&MarkerPayload>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + name.len());
    out.push(TAG_MARKER);
    out.extend_from_slice(&tid.to_le_bytes());
    let name = &name.as_bytes()[..name.len().min(u16::MAX as usize)];
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(name);
    out.push(category as u8);
    out.extend_from_slice(&time.to_le_bytes());
    match payload {
        Some(payload) => {
            out.push(1);
            payload.encode_into(&mut out);
        }
        None => out.push(0),
    }
    out
}

#[derive(Debug, Clone)]
pub(crate) struct DecodedLabel {
    pub label: String,
    pub dynamic: String,
    pub category: Category,
}

#[derive(Debug, Clone)]
pub(crate) enum DecodedEntry {
    ThreadId(i32),
    Time(f64),
    NativeLeafAddr(u64),
    Label(DecodedLabel),
    CounterId(u32),
    CounterKey(u64),
    Count(i64),
    Number(u64),
    Pause(f64),
    Resume(f64),
    CollectionStart(f64),
    CollectionEnd(f64),
    Marker(MarkerRecord),
    Overhead([f64; 5]),
}

pub(crate) fn decode_entry(body: &[u8]) -> Option<DecodedEntry> {
    let mut at = 1;
    let tag = *body.first()?;
    let entry = match tag {
        TAG_THREAD_ID => DecodedEntry::ThreadId(read_i32(body, &mut at)?),
        TAG_TIME => DecodedEntry::Time(read_f64(body, &mut at)?),
        TAG_NATIVE_LEAF => DecodedEntry::NativeLeafAddr(read_u64(body, &mut at)?),
        TAG_LABEL => {
            let category = Category::from_u8(*take(body, &mut at, 1)?.first()?);
            let label = read_str16(body, &mut at)?;
            let dynamic = read_str16(body, &mut at)?;
            DecodedEntry::Label(DecodedLabel {
                label,
                dynamic,
                category,
            })
        }
        TAG_COUNTER_ID => {
            DecodedEntry::CounterId(u32::from_le_bytes(take(body, &mut at, 4)?.try_into().ok()?))
        }
        TAG_COUNTER_KEY => DecodedEntry::CounterKey(read_u64(body, &mut at)?),
        TAG_COUNT => {
            DecodedEntry::Count(i64::from_le_bytes(take(body, &mut at, 8)?.try_into().ok()?))
        }
        TAG_NUMBER => DecodedEntry::Number(read_u64(body, &mut at)?),
        TAG_PAUSE => DecodedEntry::Pause(read_f64(body, &mut at)?),
        TAG_RESUME => DecodedEntry::Resume(read_f64(body, &mut at)?),
        TAG_COLLECTION_START => DecodedEntry::CollectionStart(read_f64(body, &mut at)?),
        TAG_COLLECTION_END => DecodedEntry::CollectionEnd(read_f64(body, &mut at)?),
        TAG_MARKER => {
            let tid = read_i32(body, &mut at)?;
            let name = read_str16(body, &mut at)?;
            let category = Category::from_u8(*take(body, &mut at, 1)?.first()?);
            let time = read_f64(body, &mut at)?;
            let payload = match take(body, &mut at, 1)?[0] {
                0 => None,
                _ => Some(MarkerPayload::decode(body, &mut at)?),
            };
            DecodedEntry::Marker(MarkerRecord {
                tid,
                name,
                category,
                time,
                payload,
            })
        }
        TAG_OVERHEAD => {
            let mut values = [0.0; 5];
            for value in &mut values {
                *value = read_f64(body, &mut at)?;
            }
            DecodedEntry::Overhead(values)
        }
        _ => return None,
    };
    Some(entry)
}

fn read_i32(body: &[u8], at: &mut usize) -> Option<i32> {
    Some(i32::from_le_bytes(take(body, at, 4)?.try_into().ok()?))
}

fn read_u64(body: &[u8], at: &mut usize) -> Option<u64> {
    Some(u64::from_le_bytes(take(body, at, 8)?.try_into().ok()?))
}

fn read_f64(body: &[u8], at: &mut usize) -> Option<f64> {
    Some(f64::from_le_bytes(take(body, at, 8)?.try_into().ok()?))
}

fn read_str16(body: &[u8], at: &mut usize) -> Option<String> {
    let len = u16::from_le_bytes(take(body, at, 2)?.try_into().ok()?);
    Some(String::from_utf8_lossy(take(body, at, len as usize)?).into_owned())
}

pub(crate) enum BufferBacking {
    /// The process-wide, internally synchronized buffer.
    Core(&'static CoreBuffer),
    /// A caller-owned single-writer buffer (staging, synchronous samples).
    Owned(BlocksRingBuffer),
}

/// The typed facade. One exists per active session (over the core buffer),
/// one per sampler task (staging), and one per synchronous backtrace.
pub(crate) struct ProfileBuffer {
    backing: BufferBacking,
}

impl ProfileBuffer {
    pub fn over_core(core: &'static CoreBuffer) -> ProfileBuffer {
        ProfileBuffer {
            backing: BufferBacking::Core(core),
        }
    }

    pub fn owned_with_capacity(capacity_bytes: usize) -> ProfileBuffer {
        ProfileBuffer {
            backing: BufferBacking::Owned(BlocksRingBuffer::with_capacity(capacity_bytes)),
        }
    }

    fn with_ring<R>(&mut self, f: impl FnOnce(&mut BlocksRingBuffer) -> R) -> R {
        match &mut self.backing {
            BufferBacking::Core(core) => core.with(f),
            BufferBacking::Owned(ring) => f(ring),
        }
    }

    fn with_ring_read<R>(&self, f: impl FnOnce(&BlocksRingBuffer) -> R) -> R {
        match &self.backing {
            BufferBacking::Core(core) => core.with(|ring| f(ring)),
            BufferBacking::Owned(ring) => f(ring),
        }
    }

    pub fn add_entry(&mut self, entry: Entry<'_>) -> Option<u64> {
        let mut scratch = EntryBuf::new();
        let bytes = entry.encode(&mut scratch);
        self.with_ring(|ring| ring.put_block(bytes))
    }

    /// Write a `ThreadId` entry and return its position, which callers keep
    /// to correlate the entries that follow.
    pub fn add_thread_id_entry(&mut self, tid: i32) -> Option<u64> {
        self.add_entry(Entry::ThreadId(tid))
    }

    pub fn state(&self) -> RingState {
        self.with_ring_read(|ring| ring.state())
    }

    pub fn buffer_range_start(&self) -> u64 {
        self.state().range_start
    }

    pub fn buffer_range_end(&self) -> u64 {
        self.state().range_end
    }

    pub fn clear(&mut self) {
        self.with_ring(|ring| ring.clear());
    }

    /// Borrow the underlying single-writer ring. Panics on the core backing.
    pub fn owned_ring(&mut self) -> &mut BlocksRingBuffer {
        match &mut self.backing {
            BufferBacking::Owned(ring) => ring,
            BufferBacking::Core(_) => unreachable!("owned_ring on the core buffer"),
        }
    }

    /// Decode each live entry at or after `from`, until `f` returns false.
    pub fn for_each_entry(&self, from: u64, mut f: impl FnMut(u64, DecodedEntry) -> bool) {
        self.with_ring_read(|ring| {
            ring.for_each_block(from, |index, body| match decode_entry(body) {
                Some(entry) => f(index, entry),
                None => true,
            });
        })
    }

    /// If the sample that starts at `last_position` is still in range and
    /// belongs to `tid`, re-emit it with a fresh time. Returns the new
    /// sample's position.
    pub fn duplicate_last_sample(&mut self, tid: i32, last_position: Option<u64>) -> Option<u64> {
        let last = last_position?;
        let now_ms = crate::time::profiler_time();
        let mut scratch = EntryBuf::new();
        self.with_ring(|ring| {
            if last < ring.state().range_start {
                return None;
            }
            let mut frames: Vec<Vec<u8>> = Vec::new();
            let mut is_our_sample = false;
            let mut first = true;
            ring.for_each_block(last, |_, body| {
                if first {
                    first = false;
                    is_our_sample =
                        matches!(decode_entry(body), Some(DecodedEntry::ThreadId(t)) if t == tid);
                    return is_our_sample;
                }
                match body.first() {
                    Some(&TAG_LABEL) | Some(&TAG_NATIVE_LEAF) => {
                        frames.push(body.to_vec());
                        true
                    }
                    Some(&TAG_TIME) => true,
                    _ => false,
                }
            });
            if !is_our_sample {
                return None;
            }
            let new_position = ring.put_block(Entry::ThreadId(tid).encode(&mut scratch))?;
            ring.put_block(Entry::Time(now_ms).encode(&mut scratch));
            for frame in frames {
                ring.put_block(&frame);
            }
            Some(new_position)
        })
    }

    /// Logical trim for a configured maximum window duration: evict all
    /// leading blocks whose data is older than `ms`.
    pub fn discard_samples_before_time(&mut self, ms: f64) {
        self.with_ring(|ring| {
            let mut cut = None;
            let mut saw_older = false;
            let mut group_start = None;
            ring.for_each_block(0, |index, body| {
                let Some(entry) = decode_entry(body) else {
                    return true;
                };
                let time_of = |entry: &DecodedEntry| match entry {
                    DecodedEntry::Time(t)
                    | DecodedEntry::Pause(t)
                    | DecodedEntry::Resume(t)
                    | DecodedEntry::CollectionStart(t)
                    | DecodedEntry::CollectionEnd(t) => Some(*t),
                    DecodedEntry::Marker(m) => Some(m.time),
                    _ => None,
                };
                match &entry {
                    DecodedEntry::ThreadId(_) | DecodedEntry::CounterId(_) => {
                        group_start = Some(index);
                        true
                    }
                    _ => match time_of(&entry) {
                        Some(t) if t >= ms => {
                            // A Time entry belongs to the sample or counter
                            // group it follows; cut before the whole group.
                            let is_time = matches!(&entry, DecodedEntry::Time(_));
                            cut = Some(if is_time {
                                group_start.unwrap_or(index)
                            } else {
                                index
                            });
                            false
                        }
                        Some(_) => {
                            saw_older = true;
                            group_start = None;
                            true
                        }
                        None => true,
                    },
                }
            });
            match cut {
                Some(cut) => ring.discard_blocks_before(cut),
                None if saw_older => ring.clear(),
                None => {}
            }
        })
    }

    /// Record one sampler-iteration timing breakdown.
    pub fn collect_overhead_stats(
        &mut self,
        sampling_start: f64,
        locking: f64,
        cleaning: f64,
        counters: f64,
        threads: f64,
    ) {
        self.add_entry(Entry::Overhead {
            sampling_start,
            locking,
            cleaning,
            counters,
            threads,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(buffer: &ProfileBuffer) -> Vec<DecodedEntry> {
        let mut out = Vec::new();
        buffer.for_each_entry(0, |_, entry| {
            out.push(entry);
            true
        });
        out
    }

    #[test]
    fn entry_round_trip() {
        let mut buffer = ProfileBuffer::owned_with_capacity(4096);
        buffer.add_entry(Entry::ThreadId(42)).unwrap();
        buffer.add_entry(Entry::Time(12.5)).unwrap();
        buffer
            .add_entry(Entry::Label {
                label: "compute",
                dynamic: "chunk 3",
                category: Category::Runtime,
            })
            .unwrap();
        buffer.add_entry(Entry::NativeLeafAddr(0xdead_beef)).unwrap();
        buffer.add_entry(Entry::CounterId(7)).unwrap();
        buffer.add_entry(Entry::Count(-3)).unwrap();

        let decoded = entries(&buffer);
        assert!(matches!(decoded[0], DecodedEntry::ThreadId(42)));
        assert!(matches!(decoded[1], DecodedEntry::Time(t) if t == 12.5));
        match &decoded[2] {
            DecodedEntry::Label(label) => {
                assert_eq!(label.label, "compute");
                assert_eq!(label.dynamic, "chunk 3");
                assert_eq!(label.category, Category::Runtime);
            }
            other => panic!("unexpected entry {other:?}"),
        }
        assert!(matches!(decoded[3], DecodedEntry::NativeLeafAddr(0xdead_beef)));
        assert!(matches!(decoded[4], DecodedEntry::CounterId(7)));
        assert!(matches!(decoded[5], DecodedEntry::Count(-3)));
    }

    #[test]
    fn marker_block_round_trip() {
        let mut buffer = ProfileBuffer::owned_with_capacity(4096);
        let payload = MarkerPayload::text("details");
        let block = encode_marker_block(9, "net request", Category::Io, 77.0, Some(&payload));
        buffer.with_ring(|ring| ring.put_block(&block)).unwrap();

        match &entries(&buffer)[0] {
            DecodedEntry::Marker(marker) => {
                assert_eq!(marker.tid, 9);
                assert_eq!(marker.name, "net request");
                assert_eq!(marker.category, Category::Io);
                assert_eq!(marker.time, 77.0);
                assert_eq!(marker.payload.as_ref().unwrap(), &payload);
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn duplicate_last_sample_copies_frames_with_new_time() {
        let mut buffer = ProfileBuffer::owned_with_capacity(4096);
        let position = buffer.add_thread_id_entry(5).unwrap();
        buffer.add_entry(Entry::Time(0.0)).unwrap();
        buffer
            .add_entry(Entry::Label {
                label: "idle",
                dynamic: "",
                category: Category::Idle,
            })
            .unwrap();

        let new_position = buffer.duplicate_last_sample(5, Some(position)).unwrap();
        assert!(new_position > position);

        let decoded = entries(&buffer);
        assert_eq!(decoded.len(), 6);
        assert!(matches!(decoded[3], DecodedEntry::ThreadId(5)));
        match (&decoded[1], &decoded[4]) {
            (DecodedEntry::Time(old), DecodedEntry::Time(new)) => assert!(new >= old),
            other => panic!("unexpected entries {other:?}"),
        }
        assert!(matches!(&decoded[5], DecodedEntry::Label(l) if l.label == "idle"));
    }

    #[test]
    fn duplicate_last_sample_rejects_wrong_thread_and_stale_position() {
        let mut buffer = ProfileBuffer::owned_with_capacity(4096);
        let position = buffer.add_thread_id_entry(5).unwrap();
        buffer.add_entry(Entry::Time(1.0)).unwrap();
        assert!(buffer.duplicate_last_sample(6, Some(position)).is_none());
        assert!(buffer.duplicate_last_sample(5, None).is_none());

        // Push the original sample out of the buffer, then try again.
        let mut small = ProfileBuffer::owned_with_capacity(64);
        let position = small.add_thread_id_entry(5).unwrap();
        for _ in 0..20 {
            small.add_entry(Entry::Time(2.0)).unwrap();
        }
        assert!(small.duplicate_last_sample(5, Some(position)).is_none());
    }

    #[test]
    fn discard_samples_before_time_trims_leading_groups() {
        let mut buffer = ProfileBuffer::owned_with_capacity(4096);
        buffer.add_thread_id_entry(1).unwrap();
        buffer.add_entry(Entry::Time(1.0)).unwrap();
        let keep_from = buffer.add_thread_id_entry(1).unwrap();
        buffer.add_entry(Entry::Time(10.0)).unwrap();

        buffer.discard_samples_before_time(5.0);
        assert_eq!(buffer.buffer_range_start(), keep_from);
        let decoded = entries(&buffer);
        assert_eq!(decoded.len(), 2);
        assert!(matches!(decoded[1], DecodedEntry::Time(t) if t == 10.0));
    }

    #[test]
    fn discard_samples_clears_when_everything_is_older() {
        let mut buffer = ProfileBuffer::owned_with_capacity(4096);
        buffer.add_thread_id_entry(1).unwrap();
        buffer.add_entry(Entry::Time(1.0)).unwrap();
        buffer.discard_samples_before_time(100.0);
        assert!(entries(&buffer).is_empty());
    }
}
