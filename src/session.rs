//! The active-only state: everything that exists exactly while the profiler
//! is running. Created by `start`, destroyed by `stop`; all mutation goes
//! through the directory lock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::features::Features;
use crate::profile_buffer::ProfileBuffer;
use crate::registry::{Registry, ThreadInfo, ThreadRegistration, CORE_BUFFER};
use crate::pages::PageRegistration;
use crate::sampler::{task, Sampler};

/// The session's sampler. Only ever locked while the directory lock is held,
/// which serializes the sampler task's iterations against `stop`'s disable.
pub(crate) type SharedSampler = Arc<Mutex<Option<Sampler>>>;

/// Entries are 8 bytes each in the underlying byte buffer.
pub(crate) const BYTES_PER_ENTRY: u32 = 8;

pub(crate) const DEFAULT_CAPACITY_ENTRIES: u32 = 1 << 20;
pub(crate) const DEFAULT_STARTUP_CAPACITY_ENTRIES: u32 = 1 << 22;
pub(crate) const DEFAULT_INTERVAL_MS: f64 = 1.0;
const MIN_CAPACITY_ENTRIES: u32 = 8192;

// Generations must survive session teardown so a sampler task can detect a
// stop/start pair that happened while it was off the lock.
static NEXT_GENERATION: AtomicU32 = AtomicU32::new(0);

/// Per-thread sampling state. Lives in the session's live list while the
/// thread is registered; moves to the dead list on unregistration and stays
/// there until its last data has aged out of the buffer.
#[derive(Debug, Clone)]
pub(crate) struct SampledThreadRecord {
    pub info: ThreadInfo,
    pub last_sample_position: Option<u64>,
    /// Buffer position at unregistration; `None` while the thread is live.
    pub unregister_position: Option<u64>,
    /// Milliseconds since process start at unregistration.
    pub unregister_time: Option<f64>,
}

pub(crate) struct LiveSampledThread {
    /// Back-reference into the registry; the registry owns the registration.
    pub registration: Arc<ThreadRegistration>,
    pub record: SampledThreadRecord,
}

pub(crate) struct ExitProfile {
    pub json: String,
    pub position_at_gather_time: u64,
}

pub(crate) struct ActiveSession {
    pub generation: u32,
    pub capacity: u32,
    pub duration: Option<f64>,
    pub interval_ms: f64,
    pub features: Features,
    pub filters: Vec<String>,
    pub buffer: ProfileBuffer,
    pub live_threads: Vec<LiveSampledThread>,
    pub dead_threads: Vec<SampledThreadRecord>,
    pub dead_pages: Vec<PageRegistration>,
    pub exit_profiles: Vec<ExitProfile>,
    pub is_paused: bool,
    sampler: SharedSampler,
    sampler_join: Option<JoinHandle<()>>,
}

/// Clamp unreasonable start parameters to defaults. Below 8192 entries
/// (65536 bytes) even a single complex stack may not fit.
pub(crate) fn clamp_capacity(capacity: u32) -> u32 {
    if capacity >= MIN_CAPACITY_ENTRIES {
        capacity.next_power_of_two()
    } else {
        DEFAULT_CAPACITY_ENTRIES
    }
}

pub(crate) fn clamp_interval(interval_ms: f64) -> f64 {
    if interval_ms > 0.0 {
        interval_ms
    } else {
        DEFAULT_INTERVAL_MS
    }
}

pub(crate) fn clamp_duration(duration: Option<f64>) -> Option<f64> {
    duration.filter(|d| *d > 0.0)
}

/// Intersect with what the platform offers, and force `THREADS` on when any
/// filter is given: a thread filter without it would select nothing.
pub(crate) fn adjust_features(features: Features, filter_count: usize) -> Features {
    let mut features = features & Features::available_features();
    if filter_count > 0 {
        features |= Features::THREADS;
    }
    features
}

/// Case-insensitive substring filter match; `"*"` matches everything and
/// `"pid:<n>"` matches iff `n` is the current process id.
pub(crate) fn thread_filter_matches(filters: &[String], thread_name: &str) -> bool {
    if filters.is_empty() {
        return true;
    }
    let name = thread_name.to_lowercase();
    for filter in filters {
        if filter == "*" {
            return true;
        }
        let filter = filter.to_lowercase();
        if name.contains(&filter) {
            return true;
        }
        if let Some(pid) = filter.strip_prefix("pid:") {
            if pid == std::process::id().to_string() {
                return true;
            }
        }
    }
    false
}

impl ActiveSession {
    /// Create the session: attaches storage to the core buffer and spawns
    /// the sampler task. The caller holds the directory lock, so the new
    /// task's first lock acquisition blocks until `start` completes.
    pub fn new(
        capacity: u32,
        interval_ms: f64,
        features: Features,
        filters: Vec<String>,
        duration: Option<f64>,
    ) -> ActiveSession {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let capacity = clamp_capacity(capacity);
        let interval_ms = clamp_interval(interval_ms);
        let duration = clamp_duration(duration);
        let features = adjust_features(features, filters.len());

        CORE_BUFFER.set_storage(capacity as usize * BYTES_PER_ENTRY as usize);

        // The Sampler is created here, with the directory lock held, so its
        // signal-handler installation nests correctly with the previous
        // session's disable. The task only borrows it.
        let sampler: SharedSampler = Arc::new(Mutex::new(match Sampler::new() {
            Ok(sampler) => Some(sampler),
            Err(error) => {
                log::warn!("thread suspension unavailable: {error}");
                None
            }
        }));
        let sampler_join = task::spawn(generation, interval_ms, sampler.clone());

        ActiveSession {
            generation,
            capacity,
            duration,
            interval_ms,
            features,
            filters,
            buffer: ProfileBuffer::over_core(&CORE_BUFFER),
            live_threads: Vec::new(),
            dead_threads: Vec::new(),
            dead_pages: Vec::new(),
            exit_profiles: Vec::new(),
            is_paused: false,
            sampler,
            sampler_join: Some(sampler_join),
        }
    }

    pub fn params_equal(
        &self,
        capacity: u32,
        interval_ms: f64,
        features: Features,
        filters: &[String],
        duration: Option<f64>,
    ) -> bool {
        self.capacity == clamp_capacity(capacity)
            && self.interval_ms == clamp_interval(interval_ms)
            && self.features == adjust_features(features, filters.len())
            && self.filters == filters
            && self.duration == clamp_duration(duration)
    }

    pub fn should_profile_thread(&self, info: &ThreadInfo) -> bool {
        (info.is_main || self.features.contains(Features::THREADS))
            && thread_filter_matches(&self.filters, &info.name)
    }

    pub fn add_live_thread(&mut self, registration: Arc<ThreadRegistration>) {
        registration.racy.set_is_being_profiled(true);
        let record = SampledThreadRecord {
            info: registration.info.clone(),
            last_sample_position: None,
            unregister_position: None,
            unregister_time: None,
        };
        self.live_threads.push(LiveSampledThread {
            registration,
            record,
        });
    }

    /// Move the thread's record to the dead list, stamped with the current
    /// buffer end so emit code knows its valid range.
    pub fn unregister_thread(&mut self, tid: i32) {
        self.discard_expired_dead_threads();
        let end = self.buffer.buffer_range_end();
        if let Some(index) = self
            .live_threads
            .iter()
            .position(|t| t.record.info.tid == tid)
        {
            let live = self.live_threads.remove(index);
            let mut record = live.record;
            record.unregister_position = Some(end);
            record.unregister_time = Some(crate::time::profiler_time());
            self.dead_threads.push(record);
        }
    }

    pub fn unregister_page(&mut self, registry: &mut Registry, inner_window_id: u64) {
        self.discard_expired_dead_pages();
        let end = self.buffer.buffer_range_end();
        let mut removed: Vec<PageRegistration> = Vec::new();
        registry.registered_pages.retain_mut(|page| {
            if page.inner_window_id == inner_window_id {
                page.notify_unregistered(end);
                removed.push(page.clone());
                false
            } else {
                true
            }
        });
        self.dead_pages.extend(removed);
    }

    pub fn discard_expired_dead_threads(&mut self) {
        let range_start = self.buffer.buffer_range_start();
        self.dead_threads.retain(|record| {
            let position = record
                .unregister_position
                .expect("dead record without unregister position");
            position >= range_start
        });
    }

    pub fn discard_expired_dead_pages(&mut self) {
        let range_start = self.buffer.buffer_range_start();
        self.dead_pages.retain(|page| {
            let position = page
                .unregister_position
                .expect("dead page without unregister position");
            position >= range_start
        });
    }

    pub fn clear_expired_exit_profiles(&mut self) {
        let range_start = self.buffer.buffer_range_start();
        self.exit_profiles
            .retain(|p| p.position_at_gather_time >= range_start);
    }

    pub fn add_exit_profile(&mut self, json: String) {
        self.clear_expired_exit_profiles();
        self.exit_profiles.push(ExitProfile {
            json,
            position_at_gather_time: self.buffer.buffer_range_end(),
        });
    }

    pub fn move_exit_profiles(&mut self) -> Vec<String> {
        self.clear_expired_exit_profiles();
        std::mem::take(&mut self.exit_profiles)
            .into_iter()
            .map(|p| p.json)
            .collect()
    }

    /// Tear down: disable the sampler (restoring the signal handler while
    /// still serialized by the directory lock), detach the core buffer's
    /// storage (rejecting all further writes), and hand the sampler task's
    /// join handle to the caller, who must join it only after dropping the
    /// directory lock.
    pub fn destroy(self) -> Option<JoinHandle<()>> {
        let mut sampler = self
            .sampler
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(sampler) = sampler.as_mut() {
            sampler.disable();
        }
        sampler.take();
        drop(sampler);
        CORE_BUFFER.take_storage();
        self.sampler_join
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_match_case_insensitive_substring() {
        let filters = vec!["worker".to_string()];
        assert!(thread_filter_matches(&filters, "Worker#1"));
        assert!(thread_filter_matches(&filters, "IMAGE WORKER"));
        assert!(!thread_filter_matches(&filters, "io"));
    }

    #[test]
    fn empty_filters_match_everything() {
        assert!(thread_filter_matches(&[], "anything"));
    }

    #[test]
    fn star_filter_matches_everything() {
        let filters = vec!["nomatch".to_string(), "*".to_string()];
        assert!(thread_filter_matches(&filters, "zzz"));
    }

    #[test]
    fn pid_filter_matches_own_process_only() {
        let own = vec![format!("pid:{}", std::process::id())];
        assert!(thread_filter_matches(&own, "zzz"));
        let other = vec![format!("pid:{}", u32::MAX)];
        assert!(!thread_filter_matches(&other, "zzz"));
    }

    #[test]
    fn filters_force_threads_feature() {
        let adjusted = adjust_features(Features::LEAF, 1);
        assert!(adjusted.contains(Features::THREADS));
        let unadjusted = adjust_features(Features::LEAF, 0);
        assert!(!unadjusted.contains(Features::THREADS));
    }

    #[test]
    fn clamping() {
        assert_eq!(clamp_capacity(0), DEFAULT_CAPACITY_ENTRIES);
        assert_eq!(clamp_capacity(8191), DEFAULT_CAPACITY_ENTRIES);
        assert_eq!(clamp_capacity(8192), 8192);
        assert_eq!(clamp_capacity(10_000), 16_384);
        assert_eq!(clamp_interval(0.0), DEFAULT_INTERVAL_MS);
        assert_eq!(clamp_interval(5.5), 5.5);
        assert_eq!(clamp_duration(Some(0.0)), None);
        assert_eq!(clamp_duration(Some(2.0)), Some(2.0));
        assert_eq!(clamp_duration(None), None);
    }
}
