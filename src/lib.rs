//! An in-process sampling execution profiler.
//!
//! A dedicated sampler thread periodically suspends selected worker threads,
//! captures their native call stacks, and merges those stacks with the
//! lightweight label frames worker code pushes voluntarily. Samples,
//! per-process counters and application-injected markers land in a
//! fixed-capacity ring buffer, which [`get_profile`] serializes as a
//! structured JSON document (Gecko raw format, version 19).
//!
//! There are three kinds of samples:
//!
//! - A *periodic* sample is the most complex kind. It is taken in response
//!   to a timer while the profiler is active, from off-thread, by suspending
//!   the target and writing its stack plus counters and markers into the
//!   main profile buffer.
//! - A *synchronous* sample is simpler: [`get_backtrace`] samples the
//!   calling thread on-thread into a private buffer and returns a handle
//!   that can subsequently be attached to a marker.
//! - A *backtrace* sample is the simplest: [`suspend_and_sample_thread`]
//!   hands the merged stack to a caller-provided collector and writes
//!   nothing to any profile buffer.
//!
//! # Typical use
//!
//! ```no_run
//! use stackpulse as profiler;
//!
//! profiler::init(0);
//! profiler::start(
//!     1 << 20,
//!     1.0,
//!     profiler::Features::default_features(),
//!     &[],
//!     None,
//! );
//!
//! let _scope = profiler::enter_label("startup", "", profiler::Category::Other);
//! profiler::add_marker("first frame", profiler::Category::Other, None);
//!
//! let json = profiler::get_profile(0.0, false);
//! profiler::stop();
//! profiler::shutdown();
//! # drop(json);
//! ```

mod backtrace;
mod category;
mod counters;
mod emitter;
mod error;
mod features;
mod label_stack;
mod markers;
mod pages;
mod profile_buffer;
mod racy_flags;
mod registry;
mod ring_buffer;
mod sampler;
mod session;
mod startup;
mod time;

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

pub use crate::backtrace::Backtrace;
pub use crate::category::Category;
pub use crate::counters::{CounterSample, CounterSource};
pub use crate::emitter::LibraryInfo;
pub use crate::error::SamplingError;
pub use crate::features::Features;
pub use crate::markers::{MarkerDetails, MarkerPayload, TracingKind};
pub use crate::ring_buffer::RingState;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use crate::sampler::FramePointerWalker;
pub use crate::sampler::{NativeStack, Registers, StackCollector, StackWalker, MAX_NATIVE_FRAMES};
pub use crate::time::profiler_time;

use crate::emitter::EmitOptions;
use crate::label_stack::{FrameKind, InlineString, LabelFrame};
use crate::pages::PageRegistration;
use crate::profile_buffer::{encode_marker_block, Entry};
use crate::registry::{
    current_thread_id, lock_profiler, set_tls_registration, tls_registration, ProfilerState,
    RacyRegistration, Registry, ThreadInfo, ThreadRegistration, CORE_BUFFER,
};
use crate::sampler::{default_stack_walker, do_shared_sample, Sampler};
use crate::session::ActiveSession;

/// Create the profiler's always-present state and register the calling
/// thread as the main thread. Honors the `BASE_PROFILER_*` startup
/// environment variables; `BASE_PROFILER_HELP` prints usage and exits.
///
/// `stack_top` is the highest address of the calling thread's stack, used to
/// bound native stack walks; pass 0 if unknown.
pub fn init(stack_top: u64) {
    startup::init_logging();
    log::info!("profiler init");

    if startup::help_requested() {
        startup::print_usage_then_exit(0);
    }

    {
        let mut state = lock_profiler();
        if state.registry.is_some() {
            debug_assert!(false, "init called twice");
            return;
        }
        state.registry = Some(Registry::new());
        locked_register_thread(&mut state, startup::MAIN_THREAD_NAME, stack_top);
    }

    if let Some(params) = startup::read_startup_params() {
        let filters: Vec<&str> = params.filters.iter().map(String::as_str).collect();
        start(
            params.capacity,
            params.interval_ms,
            params.features,
            &filters,
            params.duration,
        );
    }
}

/// Stop the session if one is active (saving a profile first when
/// `BASE_PROFILER_SHUTDOWN` names a file), then destroy the always-present
/// state. Must be called on the thread that called [`init`].
pub fn shutdown() {
    log::info!("profiler shutdown");

    let sampler_join = {
        let mut state = lock_profiler();
        if state.registry.is_none() {
            return;
        }
        debug_assert!(
            state.registry.as_ref().is_some_and(|r| r.is_main_thread()),
            "shutdown off the main thread"
        );

        let join = if state.session.is_some() {
            if let Some(path) = startup::shutdown_save_path() {
                locked_save_profile(&mut state, Path::new(&path), true);
            }
            locked_stop(&mut state)
        } else {
            None
        };

        state.registry = None;
        set_tls_registration(None);
        join
    };

    join_sampler(sampler_join);
}

/// Start a session. If one is already active it is stopped first. Out-of
/// range arguments are clamped: capacity below 8192 entries or interval ≤ 0
/// fall back to the defaults, duration ≤ 0 means unbounded.
pub fn start(
    capacity: u32,
    interval_ms: f64,
    features: Features,
    filters: &[&str],
    duration: Option<f64>,
) {
    log::info!("profiler start");

    let previous = {
        let mut state = lock_profiler();
        if state.registry.is_none() {
            state.registry = Some(Registry::new());
            locked_register_thread(&mut state, startup::MAIN_THREAD_NAME, 0);
        }
        let previous = if state.session.is_some() {
            locked_stop(&mut state)
        } else {
            None
        };
        locked_start(&mut state, capacity, interval_ms, features, filters, duration);
        previous
    };

    join_sampler(previous);
}

/// Start a session unless one with identical parameters is already running.
pub fn ensure_started(
    capacity: u32,
    interval_ms: f64,
    features: Features,
    filters: &[&str],
    duration: Option<f64>,
) {
    log::info!("profiler ensure_started");

    let previous = {
        let mut state = lock_profiler();
        if state.registry.is_none() {
            state.registry = Some(Registry::new());
            locked_register_thread(&mut state, startup::MAIN_THREAD_NAME, 0);
        }
        let filters_owned: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
        match state.session.as_ref() {
            Some(session)
                if session.params_equal(
                    capacity,
                    interval_ms,
                    features,
                    &filters_owned,
                    duration,
                ) =>
            {
                None
            }
            Some(_) => {
                let previous = locked_stop(&mut state);
                locked_start(&mut state, capacity, interval_ms, features, filters, duration);
                previous
            }
            None => {
                locked_start(&mut state, capacity, interval_ms, features, filters, duration);
                None
            }
        }
    };

    join_sampler(previous);
}

/// Stop the active session and join the sampler task.
pub fn stop() {
    log::info!("profiler stop");

    let sampler_join = {
        let mut state = lock_profiler();
        if state.session.is_none() {
            return;
        }
        locked_stop(&mut state)
    };

    // Joining with the directory lock released: the task's final iteration
    // needs the lock to observe that the session is gone.
    join_sampler(sampler_join);
}

pub fn is_active() -> bool {
    racy_flags::is_active()
}

/// The stable numeric id the profiler uses for the calling thread.
pub fn profiler_current_thread_id() -> i32 {
    current_thread_id()
}

/// Lock-free feature test, for hot paths.
pub fn feature_active(feature: Features) -> bool {
    racy_flags::is_active_with_feature(feature)
}

pub fn get_available_features() -> Features {
    Features::available_features()
}

pub fn is_paused() -> bool {
    lock_profiler()
        .session
        .as_ref()
        .map(|s| s.is_paused)
        .unwrap_or(false)
}

/// Pause periodic sampling (markers are paused too); the session stays
/// alive.
pub fn pause() {
    log::info!("profiler pause");
    let mut state = lock_profiler();
    let Some(session) = state.session.as_mut() else {
        return;
    };
    racy_flags::set_paused();
    session.is_paused = true;
    session.buffer.add_entry(Entry::Pause(profiler_time()));
}

pub fn resume() {
    log::info!("profiler resume");
    let mut state = lock_profiler();
    let Some(session) = state.session.as_mut() else {
        return;
    };
    session.buffer.add_entry(Entry::Resume(profiler_time()));
    session.is_paused = false;
    racy_flags::set_unpaused();
}

/// Register the calling thread. If a session is active and the thread
/// passes the session's filters it is enrolled for sampling immediately.
pub fn register_thread(name: &str, stack_top: u64) {
    log::debug!("register_thread({name})");
    let mut state = lock_profiler();
    if state.registry.is_none() {
        debug_assert!(false, "register_thread before init");
        return;
    }
    locked_register_thread(&mut state, name, stack_top);
}

/// Unregister the calling thread. Its sampled record, if any, moves to the
/// dead list and survives until its data has aged out of the buffer.
pub fn unregister_thread() {
    // Runs fine after shutdown; threads may outlive the profiler.
    let mut state = lock_profiler();
    if state.registry.is_none() {
        return;
    }
    let tid = current_thread_id();
    if let Some(session) = state.session.as_mut() {
        session.unregister_thread(tid);
    }
    if let Some(registration) = tls_registration() {
        registration.racy.set_is_being_profiled(false);
    }
    set_tls_registration(None);
    if let Some(registry) = state.registry.as_mut() {
        registry.remove_registered_thread(tid);
    }
}

fn locked_register_thread(state: &mut ProfilerState, name: &str, stack_top: u64) {
    let Some(registry) = state.registry.as_mut() else {
        return;
    };
    let tid = current_thread_id();
    if registry.find_thread(tid).is_some() {
        debug_assert!(false, "thread registered twice");
        return;
    }
    let registration = Arc::new(ThreadRegistration {
        info: ThreadInfo {
            name: name.to_string(),
            tid,
            is_main: registry.is_main_thread(),
            register_time: profiler_time(),
        },
        stack_top,
        racy: RacyRegistration::new(tid),
    });
    set_tls_registration(Some(registration.clone()));
    if let Some(session) = state.session.as_mut() {
        if session.should_profile_thread(&registration.info) {
            session.add_live_thread(registration.clone());
        }
    }
    state
        .registry
        .as_mut()
        .expect("registry checked above")
        .append_registered_thread(registration);
}

fn locked_start(
    state: &mut ProfilerState,
    capacity: u32,
    interval_ms: f64,
    features: Features,
    filters: &[&str],
    duration: Option<f64>,
) {
    debug_assert!(state.session.is_none(), "start with a session active");
    let filters: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
    log::info!(
        "starting: capacity {capacity} entries, interval {interval_ms} ms, \
         features {features:?}, filters {filters:?}"
    );

    let mut session = ActiveSession::new(capacity, interval_ms, features, filters, duration);

    // Enroll every already-registered thread that the session wants.
    if let Some(registry) = state.registry.as_ref() {
        for registration in &registry.registered_threads {
            if session.should_profile_thread(&registration.info) {
                session.add_live_thread(registration.clone());
                registration.racy.reinitialize_on_resume();
            }
        }
    }

    let active_features = session.features;
    state.session = Some(session);

    // At the very end, flip the racy flags: this is the last observable step
    // of starting.
    racy_flags::set_active(active_features);
}

fn locked_stop(state: &mut ProfilerState) -> Option<JoinHandle<()>> {
    // At the very start, flip the racy flags: marker producers stop being
    // admitted before anything is torn down.
    racy_flags::set_inactive();

    let session = state.session.take()?;
    for thread in &session.live_threads {
        thread.registration.racy.set_is_being_profiled(false);
    }
    session.destroy()
}

fn join_sampler(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        let _ = handle.join();
    }
}

// ---------------------------------------------------------------------------
// Pages

/// Register a page. A page whose identity matches an existing registration
/// replaces it if the existing URL is "about:blank", and is ignored
/// otherwise.
pub fn register_page(
    browsing_context_id: u64,
    inner_window_id: u64,
    url: &str,
    embedder_inner_window_id: u64,
) {
    log::debug!("register_page({browsing_context_id}, {inner_window_id}, {url})");
    let mut state = lock_profiler();
    let ProfilerState { registry, session } = &mut *state;
    let Some(registry) = registry.as_mut() else {
        debug_assert!(false, "register_page before init");
        return;
    };
    registry.append_registered_page(PageRegistration::new(
        browsing_context_id,
        inner_window_id,
        url.to_string(),
        embedder_inner_window_id,
    ));
    if let Some(session) = session.as_mut() {
        session.discard_expired_dead_pages();
    }
}

/// Unregister a page by its inner window id. While a session is active the
/// page is kept on the dead list so late markers can still resolve it.
pub fn unregister_page(inner_window_id: u64) {
    let mut state = lock_profiler();
    let ProfilerState { registry, session } = &mut *state;
    let Some(registry) = registry.as_mut() else {
        return;
    };
    match session.as_mut() {
        Some(session) => session.unregister_page(registry, inner_window_id),
        None => registry.remove_registered_page(inner_window_id),
    }
}

pub fn clear_all_pages() {
    let mut state = lock_profiler();
    let ProfilerState { registry, session } = &mut *state;
    let Some(registry) = registry.as_mut() else {
        return;
    };
    registry.clear_registered_pages();
    if let Some(session) = session.as_mut() {
        session.dead_pages.clear();
    }
}

// ---------------------------------------------------------------------------
// Counters

/// Register a counter; the sampler reads it once per iteration while a
/// session is active. The profiler does not own the source.
pub fn add_sampled_counter(source: Arc<dyn CounterSource>) {
    log::debug!("add_sampled_counter({})", source.name());
    let mut state = lock_profiler();
    if let Some(registry) = state.registry.as_mut() {
        registry.append_counter(source);
    }
}

pub fn remove_sampled_counter(source: &Arc<dyn CounterSource>) {
    log::debug!("remove_sampled_counter({})", source.name());
    // May be called after shutdown; nothing to do then.
    let mut state = lock_profiler();
    if let Some(registry) = state.registry.as_mut() {
        registry.remove_counter(source);
    }
}

// ---------------------------------------------------------------------------
// Sleep hints

/// Tell the profiler the calling thread is about to block. While it stays
/// asleep, subsequent periodic samples duplicate the previous one instead of
/// suspending it.
pub fn thread_sleep() {
    if let Some(registration) = tls_registration() {
        registration.racy.set_sleeping();
    }
}

pub fn thread_wake() {
    if let Some(registration) = tls_registration() {
        registration.racy.set_awake();
    }
}

pub fn thread_is_sleeping() -> bool {
    tls_registration()
        .map(|r| r.racy.is_sleeping())
        .unwrap_or(false)
}

pub fn is_thread_being_profiled() -> bool {
    tls_registration()
        .map(|r| r.racy.is_being_profiled())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Label frames

/// RAII scope for a label frame on the calling thread's label stack.
/// Created by [`enter_label`]; pops the frame on drop.
pub struct LabelGuard {
    pushed: bool,
    // Popping must happen on the pushing thread.
    _not_send: std::marker::PhantomData<*const ()>,
}

/// Push a label frame for the current scope. Cheap enough for hot paths: a
/// TLS read and a few stores when the thread is registered, a TLS read when
/// it isn't.
pub fn enter_label(label: &'static str, dynamic: &str, category: Category) -> LabelGuard {
    let probe = 0u32;
    let stack_address = &probe as *const u32 as u64;
    let pushed = registry::with_tls_label_stack(|stack| match stack {
        Some(stack) => {
            stack.push(LabelFrame {
                label,
                dynamic: InlineString::new(dynamic),
                category,
                kind: FrameKind::Label,
                stack_address,
            });
            true
        }
        None => false,
    });
    LabelGuard {
        pushed,
        _not_send: std::marker::PhantomData,
    }
}

impl Drop for LabelGuard {
    fn drop(&mut self) {
        if self.pushed {
            registry::with_tls_label_stack(|stack| {
                if let Some(stack) = stack {
                    stack.pop();
                }
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Markers

fn can_accept_markers() -> bool {
    racy_flags::is_active_and_unpaused_without_privacy()
}

fn write_marker(tid: i32, name: &str, category: Category, payload: Option<MarkerPayload>) {
    // A marker's time is its payload's start time when given, else now.
    let time = payload
        .as_ref()
        .and_then(|p| p.start_time)
        .unwrap_or_else(profiler_time);
    let block = encode_marker_block(tid, name, category, time, payload.as_ref());
    // Straight into the core buffer: no directory lock on this path. This
    // can race with stop; a marker that lands after teardown is rejected by
    // the storage-less buffer, and one that lands just before is simply
    // never emitted.
    CORE_BUFFER.put_block(&block);
}

/// Record a marker for the calling thread.
pub fn add_marker(name: &str, category: Category, payload: Option<MarkerPayload>) {
    // Racy flags first; precision is not required, missing or keeping one
    // marker around a concurrent stop is acceptable.
    if !can_accept_markers() {
        return;
    }
    let Some(registration) = tls_registration() else {
        return;
    };
    if !registration.racy.is_being_profiled() {
        return;
    }
    write_marker(registration.racy.tid, name, category, payload);
}

/// Record a marker attributed to another thread.
pub fn add_marker_for_thread(
    tid: i32,
    name: &str,
    category: Category,
    payload: Option<MarkerPayload>,
) {
    if !can_accept_markers() {
        return;
    }
    #[cfg(debug_assertions)]
    {
        let state = lock_profiler();
        if state.session.is_some() {
            let known = state
                .registry
                .as_ref()
                .map(|r| r.find_thread(tid).is_some())
                .unwrap_or(false);
            debug_assert!(known, "add_marker_for_thread with unknown tid {tid}");
        }
    }
    write_marker(tid, name, category, payload);
}

/// Record an event or interval-edge marker.
pub fn tracing_marker(
    tracing_category: &str,
    name: &str,
    category: Category,
    kind: TracingKind,
) {
    add_marker(
        name,
        category,
        Some(MarkerPayload::tracing(tracing_category, kind)),
    );
}

/// Record a marker carrying a line of text.
pub fn text_marker(name: &str, text: impl Into<String>, category: Category) {
    add_marker(name, category, Some(MarkerPayload::text(text)));
}

// ---------------------------------------------------------------------------
// Synchronous and backtrace samples

/// Sample the calling thread synchronously. Returns `None` when no session
/// is active, the session has the privacy feature, or the thread is not
/// registered.
pub fn get_backtrace() -> Option<Backtrace> {
    let state = lock_profiler();
    let session = state.session.as_ref()?;
    if session.features.contains(Features::PRIVACY) {
        return None;
    }
    let registration = tls_registration()?;
    Some(Backtrace::capture(&registration, session.features))
}

/// One-shot backtrace of another thread through a caller-provided collector.
/// Works with or without an active session. The collector's methods run
/// while the target is suspended: they must not allocate or take locks.
pub fn suspend_and_sample_thread(
    tid: i32,
    features: Features,
    collector: &mut dyn StackCollector,
    sample_native: bool,
) {
    let state = lock_profiler();
    let Some(registry) = state.registry.as_ref() else {
        return;
    };
    let Some(registration) = registry.find_thread(tid) else {
        return;
    };
    if registration.info.is_main {
        collector.set_is_main_thread();
    }
    if registration.info.tid == current_thread_id() {
        debug_assert!(false, "suspend_and_sample_thread on the current thread");
        return;
    }

    let mut sampler = match Sampler::new() {
        Ok(sampler) => sampler,
        Err(error) => {
            log::warn!("suspend_and_sample_thread: {error}");
            return;
        }
    };
    let mut native = Box::new(NativeStack::new());
    let mut walker = if sample_native {
        default_stack_walker()
    } else {
        None
    };
    let result = sampler.suspend_and_sample(registration, &mut |regs, _now| {
        do_shared_sample(
            features,
            registration,
            regs,
            &mut native,
            &mut walker,
            collector,
        );
    });
    if let Err(error) = result {
        log::debug!("suspend_and_sample_thread({tid}): {error}");
    }
    // Restore the signal handler before the lock is released.
    sampler.disable();
}

// ---------------------------------------------------------------------------
// Output

/// Serialize the current buffer as a profile document. `since_time` drops
/// samples and markers older than that many milliseconds since process
/// start. Returns `None` when no session is active.
pub fn get_profile(since_time: f64, is_shutting_down: bool) -> Option<String> {
    log::info!("get_profile");
    let mut state = lock_profiler();
    let ProfilerState { registry, session } = &mut *state;
    let (Some(registry), Some(session)) = (registry.as_mut(), session.as_mut()) else {
        return None;
    };
    let options = EmitOptions {
        since_time,
        is_shutting_down,
        only_threads: false,
        include_exit_profiles: false,
    };
    Some(emitter::profile_to_string(registry, session, &options))
}

/// Like [`get_profile`], but the output is only the threads array.
pub fn get_profile_threads(since_time: f64, is_shutting_down: bool) -> Option<String> {
    let mut state = lock_profiler();
    let ProfilerState { registry, session } = &mut *state;
    let (Some(registry), Some(session)) = (registry.as_mut(), session.as_mut()) else {
        return None;
    };
    let options = EmitOptions {
        since_time,
        is_shutting_down,
        only_threads: true,
        include_exit_profiles: false,
    };
    Some(emitter::profile_to_string(registry, session, &options))
}

/// Write the profile (including any gathered exit profiles) to `path`.
/// File-system failures are silently ignored.
pub fn save_profile_to_file(path: &Path) {
    log::info!("save_profile_to_file({})", path.display());
    let mut state = lock_profiler();
    if state.session.is_none() {
        return;
    }
    locked_save_profile(&mut state, path, false);
}

fn locked_save_profile(state: &mut ProfilerState, path: &Path, is_shutting_down: bool) {
    let ProfilerState { registry, session } = &mut *state;
    let (Some(registry), Some(session)) = (registry.as_mut(), session.as_mut()) else {
        return;
    };
    let Ok(file) = File::create(path) else {
        return;
    };
    let options = EmitOptions {
        since_time: 0.0,
        is_shutting_down,
        only_threads: false,
        include_exit_profiles: true,
    };
    let _ = emitter::write_profile(registry, session, &options, BufWriter::new(file));
}

// ---------------------------------------------------------------------------
// Exit profiles and process metadata

/// Ingest a pre-serialized profile from a peer process. It is emitted under
/// `processes` by [`save_profile_to_file`] until it ages out of the buffer.
pub fn add_exit_profile(json: &str) {
    let mut state = lock_profiler();
    if let Some(session) = state.session.as_mut() {
        session.add_exit_profile(json.to_string());
    }
}

/// Drain the gathered exit profiles.
pub fn move_exit_profiles() -> Vec<String> {
    let mut state = lock_profiler();
    match state.session.as_mut() {
        Some(session) => session.move_exit_profiles(),
        None => Vec::new(),
    }
}

pub fn set_process_name(name: &str) {
    log::info!("set_process_name(\"{name}\")");
    let mut state = lock_profiler();
    if let Some(registry) = state.registry.as_mut() {
        registry.process_name = name.to_string();
    }
}

/// Provide the shared-library enumerator backing the document's `libs`
/// section. Without one the section is empty.
pub fn set_library_enumerator(enumerate: fn() -> Vec<LibraryInfo>) {
    let mut state = lock_profiler();
    if let Some(registry) = state.registry.as_mut() {
        registry.library_enumerator = Some(enumerate);
    }
}

// ---------------------------------------------------------------------------
// Introspection

#[derive(Debug, Clone, Copy)]
pub struct BufferInfo {
    pub range_start: u64,
    pub range_end: u64,
    pub entry_capacity: u32,
}

pub fn get_buffer_info() -> Option<BufferInfo> {
    let state = lock_profiler();
    let session = state.session.as_ref()?;
    let ring = session.buffer.state();
    Some(BufferInfo {
        range_start: ring.range_start,
        range_end: ring.range_end,
        entry_capacity: session.capacity,
    })
}

#[derive(Debug, Clone)]
pub struct StartParams {
    pub capacity: u32,
    pub duration: Option<f64>,
    pub interval_ms: f64,
    pub features: Features,
    pub filters: Vec<String>,
}

pub fn get_start_params() -> Option<StartParams> {
    let state = lock_profiler();
    let session = state.session.as_ref()?;
    Some(StartParams {
        capacity: session.capacity,
        duration: session.duration,
        interval_ms: session.interval_ms,
        features: session.features,
        filters: session.filters.clone(),
    })
}
