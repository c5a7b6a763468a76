//! The always-present directory: thread, page and counter registrations,
//! process metadata, and the global lock that guards all of it.
//!
//! Everything mutable in here (and in [`crate::session`]) is guarded by one
//! non-recursive mutex, taken via [`lock_profiler`]. The exceptions:
//!
//! - [`CORE_BUFFER`] is internally synchronized, because marker producers
//!   write to it without the directory lock.
//! - Each thread's [`RacyRegistration`] is reachable through thread-local
//!   storage and uses relaxed atomics for its flags; the owning thread writes
//!   its TLS pointers at registration and clears them at unregistration, and
//!   the sampler only dereferences registrations while holding the directory
//!   lock, which serializes against registration changes.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::counters::{CounterSource, RegisteredCounter};
use crate::emitter::LibraryInfo;
use crate::label_stack::LabelStack;
use crate::pages::PageRegistration;
use crate::ring_buffer::CoreBuffer;
use crate::session::ActiveSession;

/// The process-wide ring buffer all profiling data lands in. Storage is
/// attached while a session is active; without storage all writes are
/// rejected, which is what makes racing marker producers harmless after stop.
pub(crate) static CORE_BUFFER: CoreBuffer = CoreBuffer::new();

pub(crate) struct ProfilerState {
    pub registry: Option<Registry>,
    pub session: Option<ActiveSession>,
}

static PROFILER: Mutex<ProfilerState> = Mutex::new(ProfilerState {
    registry: None,
    session: None,
});

/// Take the directory lock. A poisoned lock is recovered: the state is
/// repaired lazily by the individual operations, never left inaccessible.
pub(crate) fn lock_profiler() -> MutexGuard<'static, ProfilerState> {
    PROFILER.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
pub(crate) struct ThreadInfo {
    pub name: String,
    pub tid: i32,
    pub is_main: bool,
    /// Milliseconds since process start when the thread registered.
    pub register_time: f64,
}

const SLEEP_AWAKE: u32 = 0;
const SLEEP_NOT_OBSERVED: u32 = 1;
const SLEEP_OBSERVED: u32 = 2;

/// The lock-free part of a thread registration: read by the owning thread
/// and, under the directory lock, by the sampler.
pub(crate) struct RacyRegistration {
    pub tid: i32,
    pub label_stack: LabelStack,
    is_being_profiled: AtomicU32,
    sleep: AtomicU32,
}

impl RacyRegistration {
    pub(crate) fn new(tid: i32) -> RacyRegistration {
        RacyRegistration {
            tid,
            label_stack: LabelStack::new(),
            is_being_profiled: AtomicU32::new(0),
            sleep: AtomicU32::new(SLEEP_AWAKE),
        }
    }

    pub fn set_is_being_profiled(&self, profiled: bool) {
        self.is_being_profiled
            .store(profiled as u32, Ordering::Relaxed);
    }

    pub fn is_being_profiled(&self) -> bool {
        self.is_being_profiled.load(Ordering::Relaxed) != 0
    }

    pub fn set_sleeping(&self) {
        self.sleep.store(SLEEP_NOT_OBSERVED, Ordering::Relaxed);
    }

    pub fn set_awake(&self) {
        self.sleep.store(SLEEP_AWAKE, Ordering::Relaxed);
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleep.load(Ordering::Relaxed) != SLEEP_AWAKE
    }

    /// True if the thread has been asleep for a whole sample period already,
    /// so its previous sample can be duplicated instead of re-walked. The
    /// first call in a sleep episode records the observation and returns
    /// false.
    pub fn can_duplicate_last_sample_due_to_sleep(&self) -> bool {
        match self.sleep.load(Ordering::Relaxed) {
            SLEEP_AWAKE => false,
            SLEEP_NOT_OBSERVED => {
                self.sleep.store(SLEEP_OBSERVED, Ordering::Relaxed);
                false
            }
            _ => true,
        }
    }

    /// Forget a previous sleep observation, so a freshly started session
    /// takes a real first sample.
    pub fn reinitialize_on_resume(&self) {
        let _ = self.sleep.compare_exchange(
            SLEEP_OBSERVED,
            SLEEP_NOT_OBSERVED,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }
}

pub(crate) struct ThreadRegistration {
    pub info: ThreadInfo,
    /// Highest address of this thread's stack, for stack walkers.
    pub stack_top: u64,
    pub racy: RacyRegistration,
}

pub(crate) struct Registry {
    main_thread_tid: i32,
    pub registered_threads: Vec<Arc<ThreadRegistration>>,
    pub registered_pages: Vec<PageRegistration>,
    pub counters: Vec<RegisteredCounter>,
    next_counter_id: u32,
    pub process_name: String,
    pub library_enumerator: Option<fn() -> Vec<LibraryInfo>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            main_thread_tid: current_thread_id(),
            registered_threads: Vec::new(),
            registered_pages: Vec::new(),
            counters: Vec::new(),
            next_counter_id: 0,
            process_name: String::new(),
            library_enumerator: None,
        }
    }

    pub fn is_main_thread(&self) -> bool {
        current_thread_id() == self.main_thread_tid
    }

    pub fn find_thread(&self, tid: i32) -> Option<&Arc<ThreadRegistration>> {
        self.registered_threads.iter().find(|t| t.info.tid == tid)
    }

    pub fn append_registered_thread(&mut self, registration: Arc<ThreadRegistration>) {
        debug_assert!(self.find_thread(registration.info.tid).is_none());
        self.registered_threads.push(registration);
    }

    pub fn remove_registered_thread(&mut self, tid: i32) {
        self.registered_threads.retain(|t| t.info.tid != tid);
    }

    /// Add a page registration. If a page with the same identity exists and
    /// its URL is the "about:blank" sentinel, the new registration replaces
    /// it; otherwise a duplicate is ignored.
    pub fn append_registered_page(&mut self, page: PageRegistration) {
        if let Some(existing) = self
            .registered_pages
            .iter_mut()
            .find(|p| p.same_identity(&page))
        {
            if existing.url == "about:blank" {
                *existing = page;
            }
            return;
        }
        self.registered_pages.push(page);
    }

    pub fn remove_registered_page(&mut self, inner_window_id: u64) {
        self.registered_pages
            .retain(|p| p.inner_window_id != inner_window_id);
    }

    pub fn clear_registered_pages(&mut self) {
        self.registered_pages.clear();
    }

    /// Counters are not owned by the registry; they may live in statics on
    /// the application side.
    pub fn append_counter(&mut self, source: Arc<dyn CounterSource>) -> u32 {
        let id = self.next_counter_id;
        self.next_counter_id += 1;
        self.counters.push(RegisteredCounter { id, source });
        id
    }

    pub fn remove_counter(&mut self, source: &Arc<dyn CounterSource>) {
        self.counters
            .retain(|c| !Arc::ptr_eq(&c.source, source));
    }
}

thread_local! {
    static TLS_REGISTRATION: RefCell<Option<Arc<ThreadRegistration>>> =
        const { RefCell::new(None) };
    // Second, direct pointer to the label stack for the push/pop hot path.
    // Kept valid by the Arc above; both are set and cleared together.
    static TLS_LABEL_STACK: Cell<*const LabelStack> = const { Cell::new(std::ptr::null()) };
}

pub(crate) fn set_tls_registration(registration: Option<Arc<ThreadRegistration>>) {
    TLS_LABEL_STACK.with(|cell| {
        cell.set(match &registration {
            Some(r) => &r.racy.label_stack,
            None => std::ptr::null(),
        })
    });
    TLS_REGISTRATION.with(|slot| *slot.borrow_mut() = registration);
}

pub(crate) fn tls_registration() -> Option<Arc<ThreadRegistration>> {
    TLS_REGISTRATION.with(|slot| slot.borrow().clone())
}

pub(crate) fn with_tls_label_stack<R>(f: impl FnOnce(Option<&LabelStack>) -> R) -> R {
    TLS_LABEL_STACK.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            f(None)
        } else {
            f(Some(unsafe { &*ptr }))
        }
    })
}

/// A stable numeric id for the calling thread. On Linux this is the kernel
/// tid; elsewhere ids are handed out from a process-local counter.
pub(crate) fn current_thread_id() -> i32 {
    thread_local! {
        static CACHED_TID: Cell<i32> = const { Cell::new(0) };
    }
    CACHED_TID.with(|cached| {
        let tid = cached.get();
        if tid != 0 {
            return tid;
        }
        let tid = platform_thread_id();
        cached.set(tid);
        tid
    })
}

#[cfg(target_os = "linux")]
fn platform_thread_id() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(not(target_os = "linux"))]
fn platform_thread_id() -> i32 {
    use std::sync::atomic::AtomicI32;
    static NEXT: AtomicI32 = AtomicI32::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::PageRegistration;

    #[test]
    fn current_thread_id_is_stable_and_distinct() {
        let here = current_thread_id();
        assert_eq!(here, current_thread_id());
        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, other);
    }

    #[test]
    fn about_blank_registration_is_replaced() {
        let mut registry = Registry::new();
        registry.append_registered_page(PageRegistration::new(1, 100, "about:blank".into(), 0));
        registry.append_registered_page(PageRegistration::new(
            1,
            100,
            "https://example.com/".into(),
            0,
        ));
        assert_eq!(registry.registered_pages.len(), 1);
        assert_eq!(registry.registered_pages[0].url, "https://example.com/");
    }

    #[test]
    fn duplicate_page_registration_is_ignored() {
        let mut registry = Registry::new();
        registry.append_registered_page(PageRegistration::new(1, 100, "https://a/".into(), 0));
        registry.append_registered_page(PageRegistration::new(1, 100, "https://b/".into(), 0));
        assert_eq!(registry.registered_pages.len(), 1);
        assert_eq!(registry.registered_pages[0].url, "https://a/");
    }

    #[test]
    fn sleep_duplication_protocol() {
        let racy = RacyRegistration::new(1);
        assert!(!racy.can_duplicate_last_sample_due_to_sleep());
        racy.set_sleeping();
        assert!(racy.is_sleeping());
        // First sample in the episode is taken for real.
        assert!(!racy.can_duplicate_last_sample_due_to_sleep());
        assert!(racy.can_duplicate_last_sample_due_to_sleep());
        racy.reinitialize_on_resume();
        assert!(!racy.can_duplicate_last_sample_due_to_sleep());
        racy.set_awake();
        assert!(!racy.is_sleeping());
        assert!(!racy.can_duplicate_last_sample_due_to_sleep());
    }
}
