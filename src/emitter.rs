//! The profile document emitter.
//!
//! Walks the profile buffer, the registry and the session under the
//! directory lock, and produces the version-19 structured document. The
//! writing side is serde: every section is a private wrapper struct with a
//! hand-written `Serialize` impl, and pre-serialized peer profiles are
//! spliced in as `RawValue`s.
//!
//! Emission is two-phase. The gather phase decodes the buffer's entry stream
//! once, reassembling samples (`ThreadId, Time, frame*`), counter readings
//! (`CounterId, Time, CounterKey, Count[, Number]`), markers, pause events
//! and overhead records. Marker blocks interleave freely with sample entry
//! runs (they come from other threads through the shared ring) and therefore
//! don't terminate a pending sample. The assembly phase then interns frames
//! and stacks per thread and builds fully-owned section values that
//! serialize without touching profiler state.

use std::io;

use rustc_hash::FxHashMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::value::RawValue;
use serde_json::json;

use crate::category::{Category, CATEGORIES};
use crate::features::Features;
use crate::markers::MarkerDetails;
use crate::pages::PageRegistration;
use crate::profile_buffer::{DecodedEntry, Entry, MarkerRecord};
use crate::registry::Registry;
use crate::session::ActiveSession;
use crate::time::{profiler_time, wall_clock_start_ms};

/// One shared library mapping, as provided by the embedder's enumerator.
#[derive(Debug, Clone, Default)]
pub struct LibraryInfo {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub name: String,
    pub path: String,
    pub debug_name: String,
    pub debug_path: String,
    pub breakpad_id: String,
    pub arch: String,
}

impl Serialize for LibraryInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("start", &self.start)?;
        map.serialize_entry("end", &self.end)?;
        map.serialize_entry("offset", &self.offset)?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("path", &self.path)?;
        map.serialize_entry("debugName", &self.debug_name)?;
        map.serialize_entry("debugPath", &self.debug_path)?;
        map.serialize_entry("breakpadId", &self.breakpad_id)?;
        map.serialize_entry("arch", &self.arch)?;
        map.end()
    }
}

pub(crate) struct EmitOptions {
    pub since_time: f64,
    pub is_shutting_down: bool,
    pub only_threads: bool,
    /// Splice the session's exit profiles into "processes" (and drain them).
    pub include_exit_profiles: bool,
}

// ---------------------------------------------------------------------------
// Gather phase

#[derive(Debug)]
enum FrameData {
    Label { location: String, category: Category },
    Native(u64),
}

#[derive(Debug)]
struct GatheredSample {
    time: f64,
    frames: Vec<FrameData>,
}

#[derive(Default)]
struct GatheredThread {
    samples: Vec<GatheredSample>,
    markers: Vec<MarkerRecord>,
}

#[derive(Debug, Clone, Copy)]
struct CounterRow {
    time: f64,
    count: i64,
    number: u64,
}

#[derive(Default)]
struct Gathered {
    threads: FxHashMap<i32, GatheredThread>,
    counter_rows: FxHashMap<u32, Vec<CounterRow>>,
    /// (time, true for pause / false for resume)
    pause_events: Vec<(f64, bool)>,
    /// (time, true for collection start / false for end)
    collection_events: Vec<(f64, bool)>,
    overheads: Vec<[f64; 5]>,
}

enum PendingGroup {
    None,
    Sample {
        tid: i32,
        time: Option<f64>,
        frames: Vec<FrameData>,
    },
    Counter {
        id: u32,
        time: Option<f64>,
        count: Option<i64>,
        number: u64,
    },
}

fn gather(session: &ActiveSession, since_time: f64) -> Gathered {
    let mut gathered = Gathered::default();
    let mut pending = PendingGroup::None;

    fn flush(gathered: &mut Gathered, pending: &mut PendingGroup, since_time: f64) {
        match std::mem::replace(pending, PendingGroup::None) {
            PendingGroup::None => {}
            PendingGroup::Sample { tid, time, frames } => {
                if let Some(time) = time {
                    if time >= since_time {
                        gathered
                            .threads
                            .entry(tid)
                            .or_default()
                            .samples
                            .push(GatheredSample { time, frames });
                    }
                }
            }
            PendingGroup::Counter {
                id,
                time,
                count,
                number,
            } => {
                if let (Some(time), Some(count)) = (time, count) {
                    if time >= since_time {
                        gathered
                            .counter_rows
                            .entry(id)
                            .or_default()
                            .push(CounterRow {
                                time,
                                count,
                                number,
                            });
                    }
                }
            }
        }
    }

    session.buffer.for_each_entry(0, |_, entry| {
        match entry {
            DecodedEntry::ThreadId(tid) => {
                flush(&mut gathered, &mut pending, since_time);
                pending = PendingGroup::Sample {
                    tid,
                    time: None,
                    frames: Vec::new(),
                };
            }
            DecodedEntry::CounterId(id) => {
                flush(&mut gathered, &mut pending, since_time);
                pending = PendingGroup::Counter {
                    id,
                    time: None,
                    count: None,
                    number: 0,
                };
            }
            DecodedEntry::Time(t) => match &mut pending {
                PendingGroup::Sample { time, .. } | PendingGroup::Counter { time, .. }
                    if time.is_none() =>
                {
                    *time = Some(t)
                }
                _ => {}
            },
            DecodedEntry::Label(label) => {
                if let PendingGroup::Sample { frames, .. } = &mut pending {
                    let location = if label.dynamic.is_empty() {
                        label.label
                    } else {
                        format!("{} {}", label.label, label.dynamic)
                    };
                    frames.push(FrameData::Label {
                        location,
                        category: label.category,
                    });
                }
            }
            DecodedEntry::NativeLeafAddr(address) => {
                if let PendingGroup::Sample { frames, .. } = &mut pending {
                    frames.push(FrameData::Native(address));
                }
            }
            DecodedEntry::CounterKey(_key) => {}
            DecodedEntry::Count(c) => {
                if let PendingGroup::Counter { count, .. } = &mut pending {
                    *count = Some(c);
                }
            }
            DecodedEntry::Number(n) => {
                if let PendingGroup::Counter { number, .. } = &mut pending {
                    *number = n;
                }
            }
            DecodedEntry::Pause(t) => {
                flush(&mut gathered, &mut pending, since_time);
                gathered.pause_events.push((t, true));
            }
            DecodedEntry::Resume(t) => {
                flush(&mut gathered, &mut pending, since_time);
                gathered.pause_events.push((t, false));
            }
            DecodedEntry::CollectionStart(t) => {
                flush(&mut gathered, &mut pending, since_time);
                gathered.collection_events.push((t, true));
            }
            DecodedEntry::CollectionEnd(t) => {
                flush(&mut gathered, &mut pending, since_time);
                gathered.collection_events.push((t, false));
            }
            DecodedEntry::Marker(marker) => {
                // Markers come through the shared ring from arbitrary
                // threads; they don't close the current entry run.
                if marker.time >= since_time {
                    gathered
                        .threads
                        .entry(marker.tid)
                        .or_default()
                        .markers
                        .push(marker);
                }
            }
            DecodedEntry::Overhead(values) => {
                flush(&mut gathered, &mut pending, since_time);
                gathered.overheads.push(values);
            }
        }
        true
    });
    flush(&mut gathered, &mut pending, since_time);
    gathered
}

// ---------------------------------------------------------------------------
// Assembly phase: per-thread interned tables

#[derive(Default)]
struct StringTable {
    strings: Vec<String>,
    index: FxHashMap<String, u32>,
}

impl StringTable {
    fn index_for(&mut self, s: &str) -> u32 {
        match self.index.get(s) {
            Some(index) => *index,
            None => {
                let index = self.strings.len() as u32;
                self.strings.push(s.to_string());
                self.index.insert(s.to_string(), index);
                index
            }
        }
    }
}

#[derive(Default)]
struct FrameTable {
    /// (location string index, category index)
    rows: Vec<(u32, u8)>,
    index: FxHashMap<(u32, u8), u32>,
}

impl FrameTable {
    fn index_for(&mut self, location: u32, category: u8) -> u32 {
        *self.index.entry((location, category)).or_insert_with(|| {
            let index = self.rows.len() as u32;
            self.rows.push((location, category));
            index
        })
    }
}

#[derive(Default)]
struct StackTable {
    /// (prefix stack index or None, frame index)
    rows: Vec<(Option<u32>, u32)>,
    index: FxHashMap<(Option<u32>, u32), u32>,
}

impl StackTable {
    fn index_for(&mut self, prefix: Option<u32>, frame: u32) -> u32 {
        *self.index.entry((prefix, frame)).or_insert_with(|| {
            let index = self.rows.len() as u32;
            self.rows.push((prefix, frame));
            index
        })
    }
}

struct EmittedThread {
    name: String,
    tid: i32,
    pid: u32,
    process_name: String,
    register_time: f64,
    unregister_time: Option<f64>,
    /// (stack index or None, time)
    sample_rows: Vec<(Option<u32>, f64)>,
    /// (name string index, time, category index, payload json)
    marker_rows: Vec<(u32, f64, u8, Option<serde_json::Value>)>,
    stack_table: StackTable,
    frame_table: FrameTable,
    string_table: StringTable,
}

fn marker_payload_json(marker: &MarkerRecord) -> Option<serde_json::Value> {
    let payload = marker.payload.as_ref()?;
    let mut data = serde_json::Map::new();
    match &payload.details {
        MarkerDetails::None => {}
        MarkerDetails::Text(text) => {
            data.insert("type".into(), "Text".into());
            data.insert("name".into(), text.as_str().into());
        }
        MarkerDetails::Tracing { category, kind } => {
            data.insert("type".into(), "tracing".into());
            data.insert("category".into(), category.as_str().into());
            if let Some(interval) = kind.interval() {
                data.insert("interval".into(), interval.into());
            }
        }
    }
    if let Some(start) = payload.start_time {
        data.insert("startTime".into(), start.into());
    }
    if let Some(end) = payload.end_time {
        data.insert("endTime".into(), end.into());
    }
    if let Some(id) = payload.inner_window_id {
        data.insert("innerWindowID".into(), id.into());
    }
    if let Some(cause) = &payload.cause {
        data.insert("stack".into(), cause.as_slice().into());
    }
    Some(serde_json::Value::Object(data))
}

fn assemble_thread(
    name: &str,
    tid: i32,
    process_name: &str,
    register_time: f64,
    unregister_time: Option<f64>,
    data: GatheredThread,
) -> EmittedThread {
    let mut string_table = StringTable::default();
    let mut frame_table = FrameTable::default();
    let mut stack_table = StackTable::default();

    let mut sample_rows = Vec::with_capacity(data.samples.len());
    for sample in data.samples {
        let mut prefix = None;
        for frame in &sample.frames {
            let (location, category) = match frame {
                FrameData::Label { location, category } => (location.clone(), *category as u8),
                FrameData::Native(address) => {
                    (format!("{address:#x}"), Category::Other as u8)
                }
            };
            let location_index = string_table.index_for(&location);
            let frame_index = frame_table.index_for(location_index, category);
            prefix = Some(stack_table.index_for(prefix, frame_index));
        }
        sample_rows.push((prefix, sample.time));
    }

    let mut marker_rows = Vec::with_capacity(data.markers.len());
    for marker in &data.markers {
        let name_index = string_table.index_for(&marker.name);
        marker_rows.push((
            name_index,
            marker.time,
            marker.category as u8,
            marker_payload_json(marker),
        ));
    }

    EmittedThread {
        name: name.to_string(),
        tid,
        pid: std::process::id(),
        process_name: process_name.to_string(),
        register_time,
        unregister_time,
        sample_rows,
        marker_rows,
        stack_table,
        frame_table,
        string_table,
    }
}

impl Serialize for EmittedThread {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("processType", "default")?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("processName", &self.process_name)?;
        map.serialize_entry("registerTime", &self.register_time)?;
        map.serialize_entry("unregisterTime", &self.unregister_time)?;
        map.serialize_entry("tid", &self.tid)?;
        map.serialize_entry("pid", &self.pid)?;
        map.serialize_entry("samples", &SerializableSamples(&self.sample_rows))?;
        map.serialize_entry("markers", &SerializableMarkers(&self.marker_rows))?;
        map.serialize_entry("stackTable", &SerializableStackTable(&self.stack_table))?;
        map.serialize_entry("frameTable", &SerializableFrameTable(&self.frame_table))?;
        map.serialize_entry("stringTable", &self.string_table.strings)?;
        map.end()
    }
}

struct SerializableSamples<'a>(&'a [(Option<u32>, f64)]);

impl Serialize for SerializableSamples<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("schema", &json!({ "stack": 0, "time": 1 }))?;
        map.serialize_entry("data", &SerializableRows(self.0))?;
        map.end()
    }
}

struct SerializableRows<'a>(&'a [(Option<u32>, f64)]);

impl Serialize for SerializableRows<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for (stack, time) in self.0 {
            seq.serialize_element(&(stack, time))?;
        }
        seq.end()
    }
}

struct SerializableMarkers<'a>(&'a [(u32, f64, u8, Option<serde_json::Value>)]);

impl Serialize for SerializableMarkers<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(
            "schema",
            &json!({ "name": 0, "time": 1, "category": 2, "data": 3 }),
        )?;
        struct Rows<'a>(&'a [(u32, f64, u8, Option<serde_json::Value>)]);
        impl Serialize for Rows<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
                for (name, time, category, data) in self.0 {
                    seq.serialize_element(&(name, time, category, data))?;
                }
                seq.end()
            }
        }
        map.serialize_entry("data", &Rows(self.0))?;
        map.end()
    }
}

struct SerializableStackTable<'a>(&'a StackTable);

impl Serialize for SerializableStackTable<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("schema", &json!({ "prefix": 0, "frame": 1 }))?;
        struct Rows<'a>(&'a [(Option<u32>, u32)]);
        impl Serialize for Rows<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
                for (prefix, frame) in self.0 {
                    seq.serialize_element(&(prefix, frame))?;
                }
                seq.end()
            }
        }
        map.serialize_entry("data", &Rows(&self.0.rows))?;
        map.end()
    }
}

struct SerializableFrameTable<'a>(&'a FrameTable);

impl Serialize for SerializableFrameTable<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("schema", &json!({ "location": 0, "category": 1 }))?;
        struct Rows<'a>(&'a [(u32, u8)]);
        impl Serialize for Rows<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
                for (location, category) in self.0 {
                    seq.serialize_element(&(location, category))?;
                }
                seq.end()
            }
        }
        map.serialize_entry("data", &Rows(&self.0.rows))?;
        map.end()
    }
}

// ---------------------------------------------------------------------------
// Remaining sections

struct EmittedCounter {
    name: String,
    category: String,
    description: String,
    rows: Vec<CounterRow>,
}

impl Serialize for EmittedCounter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("category", &self.category)?;
        map.serialize_entry("description", &self.description)?;
        struct Samples<'a>(&'a [CounterRow]);
        impl Serialize for Samples<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("schema", &json!({ "time": 0, "count": 1, "number": 2 }))?;
                struct Rows<'a>(&'a [CounterRow]);
                impl Serialize for Rows<'_> {
                    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
                        for row in self.0 {
                            seq.serialize_element(&(row.time, row.count, row.number))?;
                        }
                        seq.end()
                    }
                }
                map.serialize_entry("data", &Rows(self.0))?;
                map.end()
            }
        }
        struct Group<'a>(&'a [CounterRow]);
        impl Serialize for Group<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("id", &0)?;
                map.serialize_entry("samples", &Samples(self.0))?;
                map.end()
            }
        }
        map.serialize_entry("sample_groups", &[Group(&self.rows)])?;
        map.end()
    }
}

struct EmittedOverhead {
    rows: Vec<[f64; 5]>,
}

impl Serialize for EmittedOverhead {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        struct Samples<'a>(&'a [[f64; 5]]);
        impl Serialize for Samples<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry(
                    "schema",
                    &json!({
                        "time": 0,
                        "locking": 1,
                        "expiredMarkerCleaning": 2,
                        "counters": 3,
                        "threads": 4,
                    }),
                )?;
                map.serialize_entry("data", &self.0)?;
                map.end()
            }
        }
        map.serialize_entry("samples", &Samples(&self.rows))?;

        // Per-iteration overhead is the sum of the four phase durations.
        let count = self.rows.len();
        let overheads: Vec<f64> = self.rows.iter().map(|r| r[1] + r[2] + r[3] + r[4]).collect();
        let max = overheads.iter().copied().fold(0.0, f64::max);
        let min = overheads.iter().copied().fold(f64::INFINITY, f64::min);
        let mean = if count > 0 {
            overheads.iter().sum::<f64>() / count as f64
        } else {
            0.0
        };
        map.serialize_entry(
            "statistics",
            &json!({
                "samplingCount": count,
                "maxOverheadMs": if count > 0 { max } else { 0.0 },
                "minOverheadMs": if count > 0 { min } else { 0.0 },
                "meanOverheadMs": mean,
            }),
        )?;
        map.end()
    }
}

#[derive(Debug, Clone, Copy)]
struct PausedRange {
    start: Option<f64>,
    end: Option<f64>,
    reason: &'static str,
}

impl Serialize for PausedRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("startTime", &self.start)?;
        map.serialize_entry("endTime", &self.end)?;
        map.serialize_entry("reason", self.reason)?;
        map.end()
    }
}

fn paused_ranges(events: &[(f64, bool)], reason: &'static str) -> Vec<PausedRange> {
    let mut ranges = Vec::new();
    let mut open: Option<f64> = None;
    for (time, is_start) in events {
        if *is_start {
            open = Some(*time);
        } else {
            ranges.push(PausedRange {
                start: open.take(),
                end: Some(*time),
                reason,
            });
        }
    }
    if let Some(start) = open {
        ranges.push(PausedRange {
            start: Some(start),
            end: None,
            reason,
        });
    }
    ranges
}

struct Meta {
    interval: f64,
    stackwalk: bool,
    shutdown_time: Option<f64>,
}

impl Serialize for Meta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("version", &19)?;
        // Reconstruct the wall-clock process start from the monotonic
        // reference: now_wall - (now_mono - start_mono).
        map.serialize_entry("startTime", &wall_clock_start_ms())?;
        map.serialize_entry("shutdownTime", &self.shutdown_time)?;
        map.serialize_entry("categories", CATEGORIES)?;
        map.serialize_entry("interval", &self.interval)?;
        map.serialize_entry("stackwalk", &(self.stackwalk as u8))?;
        map.serialize_entry("debug", &(cfg!(debug_assertions) as u8))?;
        map.serialize_entry("gcpoison", &0)?;
        map.serialize_entry("asyncstack", &0)?;
        map.serialize_entry("processType", &0)?;
        map.end()
    }
}

/// The fully-assembled document; owns everything it serializes.
struct ProfileDocument {
    libs: Vec<LibraryInfo>,
    meta: Meta,
    pages: Vec<PageRegistration>,
    overhead: EmittedOverhead,
    counters: Vec<EmittedCounter>,
    threads: Vec<EmittedThread>,
    paused_ranges: Vec<PausedRange>,
    processes: Vec<Box<RawValue>>,
}

impl Serialize for ProfileDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("libs", &self.libs)?;
        map.serialize_entry("meta", &self.meta)?;
        map.serialize_entry("pages", &self.pages)?;
        map.serialize_entry("profilerOverhead", &self.overhead)?;
        map.serialize_entry("counters", &self.counters)?;
        map.serialize_entry("threads", &self.threads)?;
        map.serialize_entry("pausedRanges", &self.paused_ranges)?;
        map.serialize_entry("processes", &self.processes)?;
        map.end()
    }
}

fn build_document(
    registry: &mut Registry,
    session: &mut ActiveSession,
    options: &EmitOptions,
) -> ProfileDocument {
    // If a maximum window duration is configured, discard older data first.
    let collection_start = profiler_time();
    if let Some(duration_s) = session.duration {
        session
            .buffer
            .discard_samples_before_time(collection_start - duration_s * 1000.0);
    }

    let mut gathered = gather(session, options.since_time);

    let libs = registry
        .library_enumerator
        .map(|enumerate| {
            let mut libs = enumerate();
            libs.sort_by_key(|lib| lib.start);
            libs
        })
        .unwrap_or_default();

    session.discard_expired_dead_pages();
    let mut pages: Vec<PageRegistration> = registry.registered_pages.clone();
    pages.extend(session.dead_pages.iter().cloned());

    let counters = registry
        .counters
        .iter()
        .map(|counter| EmittedCounter {
            name: counter.source.name().to_string(),
            category: counter.source.category().to_string(),
            description: counter.source.description().to_string(),
            rows: gathered.counter_rows.remove(&counter.id).unwrap_or_default(),
        })
        .collect();

    // One thread object per profiled thread, live and dead, ordered by
    // registration time.
    session.discard_expired_dead_threads();
    let mut thread_infos: Vec<(String, i32, f64, Option<f64>)> = session
        .live_threads
        .iter()
        .map(|t| {
            (
                t.record.info.name.clone(),
                t.record.info.tid,
                t.record.info.register_time,
                None,
            )
        })
        .collect();
    thread_infos.extend(session.dead_threads.iter().map(|record| {
        (
            record.info.name.clone(),
            record.info.tid,
            record.info.register_time,
            record.unregister_time,
        )
    }));
    thread_infos.sort_by(|a, b| a.2.total_cmp(&b.2));

    let threads = thread_infos
        .into_iter()
        .map(|(name, tid, register_time, unregister_time)| {
            let data = gathered.threads.remove(&tid).unwrap_or_default();
            assemble_thread(
                &name,
                tid,
                &registry.process_name,
                register_time,
                unregister_time,
                data,
            )
        })
        .collect();

    let mut ranges = paused_ranges(&gathered.pause_events, "profiler-paused");
    ranges.extend(paused_ranges(&gathered.collection_events, "collecting"));

    let processes = if options.include_exit_profiles {
        session
            .move_exit_profiles()
            .into_iter()
            .filter(|json| !json.is_empty())
            .filter_map(|json| RawValue::from_string(json).ok())
            .collect()
    } else {
        Vec::new()
    };

    ProfileDocument {
        libs,
        meta: Meta {
            interval: session.interval_ms,
            stackwalk: session.features.contains(Features::STACK_WALK),
            shutdown_time: options.is_shutting_down.then(profiler_time),
        },
        pages,
        overhead: EmittedOverhead {
            rows: gathered.overheads,
        },
        counters,
        threads,
        paused_ranges: ranges,
        processes,
    }
}

/// Serialize the profile to `writer`. Called with the directory lock held;
/// stamps the buffer with collection bracket entries afterwards so the next
/// collection can see this one's duration.
pub(crate) fn write_profile<W: io::Write>(
    registry: &mut Registry,
    session: &mut ActiveSession,
    options: &EmitOptions,
    writer: W,
) -> io::Result<()> {
    let collection_start = profiler_time();
    let document = build_document(registry, session, options);
    let result = if options.only_threads {
        serde_json::to_writer(writer, &document.threads)
    } else {
        serde_json::to_writer(writer, &document)
    };
    let collection_end = profiler_time();
    session
        .buffer
        .add_entry(Entry::CollectionStart(collection_start));
    session.buffer.add_entry(Entry::CollectionEnd(collection_end));
    result.map_err(io::Error::from)
}

pub(crate) fn profile_to_string(
    registry: &mut Registry,
    session: &mut ActiveSession,
    options: &EmitOptions,
) -> String {
    let mut out = Vec::new();
    if write_profile(registry, session, options, &mut out).is_err() {
        return String::new();
    }
    String::from_utf8(out).unwrap_or_default()
}
