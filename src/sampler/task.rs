//! The long-lived periodic sampling task.
//!
//! One OS thread runs while a session is active. Each iteration takes the
//! directory lock, samples counters and every live sampled thread, then
//! sleeps with drift correction so the long-run cadence tracks the interval
//! despite per-iteration jitter.
//!
//! Termination is cooperative: the loop exits when the session is gone or
//! when the session's generation no longer matches the one this task was
//! created for, which detects a stop/start pair that happened while the task
//! was off the lock. The stopper joins this thread only after releasing the
//! directory lock, otherwise the final iteration could never complete.
//!
//! Because the global buffer is internally synchronized and its mutex cannot
//! be taken inside a suspended window, sample data is first written to a
//! single-writer staging buffer owned by this task and bulk-copied into the
//! global ring after the target resumes.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::features::Features;
use crate::profile_buffer::{Entry, ProfileBuffer};
use crate::registry::{current_thread_id, lock_profiler, ProfilerState, CORE_BUFFER};
use crate::session::SharedSampler;
use crate::time::ms_since_start;

use super::{default_stack_walker, do_shared_sample, NativeStack, ProfileBufferCollector};

const STAGING_BUFFER_BYTES: usize = 64 * 1024;

pub(crate) fn spawn(generation: u32, interval_ms: f64, sampler: SharedSampler) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("SamplerThread".into())
        .spawn(move || run(generation, interval_ms, sampler))
        .expect("couldn't spawn the sampler thread")
}

/// Keeps the sampling cadence on schedule: each sleep is shortened by how
/// much the previous sleep overshot its request.
pub(crate) struct DriftCorrector {
    interval: Duration,
    last_overshoot: Duration,
}

impl DriftCorrector {
    pub fn new(interval: Duration) -> DriftCorrector {
        DriftCorrector {
            interval,
            last_overshoot: Duration::ZERO,
        }
    }

    pub fn sleep_duration(&self, sample_start: Instant, now: Instant) -> Duration {
        (sample_start + self.interval)
            .saturating_duration_since(now)
            .saturating_sub(self.last_overshoot)
    }

    pub fn note_overshoot(&mut self, before_sleep: Instant, planned: Duration, now: Instant) {
        self.last_overshoot = now
            .saturating_duration_since(before_sleep)
            .saturating_sub(planned);
    }
}

fn to_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn run(generation: u32, interval_ms: f64, shared_sampler: SharedSampler) {
    // Features don't change during this task's lifetime, so decide up front
    // whether stack sampling happens at all.
    let no_stack_sampling = {
        let state = lock_profiler();
        let Some(session) = state.session.as_ref() else {
            return;
        };
        if session.generation != generation {
            return;
        }
        session.features.contains(Features::NO_STACK_SAMPLING)
    };

    let mut walker = default_stack_walker();
    let mut staging = ProfileBuffer::owned_with_capacity(STAGING_BUFFER_BYTES);
    let mut previous_state = staging.state();
    let mut native = Box::new(NativeStack::new());

    let mut drift = DriftCorrector::new(Duration::from_secs_f64(interval_ms / 1000.0));
    let mut sample_start = Instant::now();

    loop {
        {
            let mut state = lock_profiler();
            let lock_acquired = Instant::now();
            let ProfilerState { registry, session } = &mut *state;
            let (Some(registry), Some(session)) = (registry.as_mut(), session.as_mut()) else {
                break;
            };
            if session.generation != generation {
                break;
            }

            session.clear_expired_exit_profiles();
            session.discard_expired_dead_threads();
            let expired_cleaned = Instant::now();

            if !session.is_paused {
                let sampling_start_ms = ms_since_start(sample_start);

                for counter in &registry.counters {
                    let sample = counter.source.sample();
                    session.buffer.add_entry(Entry::CounterId(counter.id));
                    session.buffer.add_entry(Entry::Time(sampling_start_ms));
                    // Keyed counters would use the key to subdivide; simple
                    // counters all use key 0.
                    session.buffer.add_entry(Entry::CounterKey(0));
                    session.buffer.add_entry(Entry::Count(sample.count));
                    if sample.number != 0 {
                        session.buffer.add_entry(Entry::Number(sample.number));
                    }
                }
                let counters_sampled = Instant::now();

                // The sampler is only borrowed while the directory lock is
                // held; `stop` disables and drops it under the same lock.
                let mut sampler_guard = shared_sampler
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if let (false, Some(sampler)) = (no_stack_sampling, sampler_guard.as_mut()) {
                    let features = session.features;
                    for i in 0..session.live_threads.len() {
                        let registration = session.live_threads[i].registration.clone();
                        let tid = registration.info.tid;
                        if tid == current_thread_id() {
                            continue;
                        }

                        // A thread asleep since its last sample can't have
                        // changed its stack; copying the previous sample is
                        // much cheaper than suspending it again.
                        if registration.racy.can_duplicate_last_sample_due_to_sleep() {
                            let last = session.live_threads[i].record.last_sample_position;
                            if let Some(position) =
                                session.buffer.duplicate_last_sample(tid, last)
                            {
                                session.live_threads[i].record.last_sample_position =
                                    Some(position);
                                continue;
                            }
                        }

                        let now = Instant::now();
                        // The ThreadId goes straight into the main buffer so
                        // its position is known; the Time entry follows
                        // unconditionally, as the parser expects.
                        let Some(sample_position) = session.buffer.add_thread_id_entry(tid)
                        else {
                            continue;
                        };
                        session.live_threads[i].record.last_sample_position =
                            Some(sample_position);
                        session.buffer.add_entry(Entry::Time(ms_since_start(now)));

                        let result =
                            sampler.suspend_and_sample(&registration, &mut |regs, _now| {
                                let mut collector = ProfileBufferCollector {
                                    buffer: &mut staging,
                                    sample_position,
                                };
                                do_shared_sample(
                                    features,
                                    &registration,
                                    regs,
                                    &mut native,
                                    &mut walker,
                                    &mut collector,
                                );
                            });
                        if let Err(error) = result {
                            log::debug!("couldn't sample thread {tid}: {error}");
                        }

                        // If the captured data is complete, copy it into the
                        // global buffer; a sample that overflowed the staging
                        // area or that can't fit the global ring is dropped.
                        let staging_state = staging.state();
                        let grown = staging_state.range_end - previous_state.range_end;
                        if staging_state.cleared_block_count != previous_state.cleared_block_count
                        {
                            log::warn!(
                                "stack sample too big for local storage, needed {grown} bytes"
                            );
                        } else if grown as usize
                            >= CORE_BUFFER.buffer_length().unwrap_or(usize::MAX)
                        {
                            log::warn!(
                                "stack sample too big for profiler storage, needed {grown} bytes"
                            );
                        } else {
                            CORE_BUFFER.append_contents(staging.owned_ring());
                        }
                        staging.clear();
                        previous_state = staging.state();
                    }
                }
                let threads_sampled = Instant::now();

                session.buffer.collect_overhead_stats(
                    sampling_start_ms,
                    to_ms(lock_acquired - sample_start),
                    to_ms(expired_cleaned - lock_acquired),
                    to_ms(counters_sampled - expired_cleaned),
                    to_ms(threads_sampled - counters_sampled),
                );
            }
        }
        // The directory lock is not held past this point.

        let before_sleep = Instant::now();
        let planned = drift.sleep_duration(sample_start, before_sleep);
        std::thread::sleep(planned);
        let after_sleep = Instant::now();
        drift.note_overshoot(before_sleep, planned, after_sleep);
        sample_start = after_sleep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_correction_bounds_cumulative_error() {
        let base = Instant::now();
        let interval = Duration::from_millis(10);
        let mut drift = DriftCorrector::new(interval);
        let mut now = base;
        let mut sample_start = base;

        // Simulated per-iteration sampling work and sleep overshoot, both
        // well under the interval.
        let jitters_ms = [0u64, 3, 1, 4, 1, 5, 2, 0, 3, 2];
        for (k, jitter) in jitters_ms.iter().cycle().take(100).enumerate() {
            now += Duration::from_millis(jitter / 2); // sampling work
            let before_sleep = now;
            let planned = drift.sleep_duration(sample_start, now);
            now = before_sleep + planned + Duration::from_millis(*jitter); // oversleep
            drift.note_overshoot(before_sleep, planned, now);
            sample_start = now;

            let ideal = base + interval * (k as u32 + 1);
            let error = if sample_start > ideal {
                sample_start - ideal
            } else {
                ideal - sample_start
            };
            assert!(
                error <= interval,
                "iteration {k}: cadence error {error:?} exceeds one interval"
            );
        }
    }

    #[test]
    fn overshoot_shortens_the_next_sleep() {
        let base = Instant::now();
        let interval = Duration::from_millis(10);
        let mut drift = DriftCorrector::new(interval);

        let planned = drift.sleep_duration(base, base);
        assert_eq!(planned, interval);
        // The sleep took 4ms longer than requested.
        drift.note_overshoot(base, planned, base + planned + Duration::from_millis(4));

        let next_start = base + planned + Duration::from_millis(4);
        let next = drift.sleep_duration(next_start, next_start);
        assert_eq!(next, interval - Duration::from_millis(4));
    }
}
