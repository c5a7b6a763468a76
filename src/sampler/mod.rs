//! The suspend-and-sample primitive and its collaborators.
//!
//! There are three kinds of samples:
//!
//! - A *periodic* sample is taken by the sampler task in response to its
//!   timer. The target thread is suspended from off-thread, its registers are
//!   captured, and the merged stack is written into the staging profile
//!   buffer (see [`task`]).
//! - A *synchronous* sample is taken on-thread by `get_backtrace()`: the
//!   calling thread captures its own state into a private buffer and gets a
//!   handle back.
//! - A *backtrace* sample is taken by `suspend_and_sample_thread()`: the
//!   target is suspended and a caller-provided [`StackCollector`] receives
//!   the frames directly; nothing is written to any profile buffer.
//!
//! The closure that runs while a target is suspended executes inside the
//! profiler's critical section: it must not allocate, must not take the
//! directory lock, and must not touch any internally-synchronized buffer,
//! because the suspended thread may hold any of those. Everything it needs
//! writes into single-writer storage owned by the sampling thread.

pub(crate) mod merge;
pub(crate) mod task;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as platform;

#[cfg(not(target_os = "linux"))]
mod fallback;
#[cfg(not(target_os = "linux"))]
use fallback as platform;

use std::time::Instant;

use crate::category::Category;
use crate::error::SamplingError;
use crate::features::Features;
use crate::profile_buffer::{Entry, ProfileBuffer};
use crate::registry::{current_thread_id, ThreadRegistration};

/// Too many frames risks the unwinder spinning on a corrupted stack.
pub const MAX_NATIVE_FRAMES: usize = 1024;

/// The register set captured from a suspended (or the current) thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
    pub lr: u64,
}

impl Registers {
    /// Approximate the calling thread's own state for a synchronous sample.
    /// Only the stack pointer is populated; a zero pc suppresses leaf
    /// entries.
    pub(crate) fn sync_populate() -> Registers {
        let probe = 0u64;
        Registers {
            sp: &probe as *const u64 as u64,
            ..Registers::default()
        }
    }
}

/// A fixed-capacity native stack, youngest frame first.
pub struct NativeStack {
    pcs: [u64; MAX_NATIVE_FRAMES],
    sps: [u64; MAX_NATIVE_FRAMES],
    count: usize,
}

impl NativeStack {
    pub fn new() -> NativeStack {
        NativeStack {
            pcs: [0; MAX_NATIVE_FRAMES],
            sps: [0; MAX_NATIVE_FRAMES],
            count: 0,
        }
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }

    pub fn push(&mut self, pc: u64, sp: u64) -> bool {
        if self.count == MAX_NATIVE_FRAMES {
            return false;
        }
        self.pcs[self.count] = pc;
        self.sps[self.count] = sp;
        self.count += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn pc(&self, i: usize) -> u64 {
        self.pcs[i]
    }

    pub fn sp(&self, i: usize) -> u64 {
        self.sps[i]
    }
}

impl Default for NativeStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Native stack unwinding capability. Given the captured registers and the
/// registration's stack top, fills the output buffer youngest-first. Runs
/// inside the critical section, so implementations must not allocate or
/// lock.
pub trait StackWalker: Send {
    fn walk_stack(&mut self, regs: &Registers, stack_top: u64, native: &mut NativeStack);
}

pub(crate) fn native_unwind_supported() -> bool {
    cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
}

/// Frame-pointer chain walker. Works on builds that preserve frame pointers;
/// the resulting stacks are incomplete where a frame omits them, which is the
/// usual trade-off of this strategy.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub struct FramePointerWalker;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
impl StackWalker for FramePointerWalker {
    fn walk_stack(&mut self, regs: &Registers, stack_top: u64, native: &mut NativeStack) {
        native.clear();
        if regs.pc != 0 {
            native.push(regs.pc, regs.sp);
        }
        if stack_top == 0 {
            // Without a stack bound the frame reads can't be validated.
            return;
        }
        let mut fp = regs.fp;
        let mut previous = regs.sp;
        while fp != 0
            && fp % 8 == 0
            && fp >= previous
            && fp.saturating_add(16) <= stack_top
            && native.len() < MAX_NATIVE_FRAMES
        {
            // [fp] is the caller's frame pointer, [fp + 8] the return address.
            let next_fp = unsafe { (fp as *const u64).read_volatile() };
            let return_address = unsafe { ((fp + 8) as *const u64).read_volatile() };
            if return_address == 0 {
                break;
            }
            native.push(return_address, fp);
            if next_fp <= fp {
                break;
            }
            previous = fp;
            fp = next_fp;
        }
    }
}

pub(crate) fn default_stack_walker() -> Option<Box<dyn StackWalker>> {
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    {
        Some(Box::new(FramePointerWalker))
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        None
    }
}

/// Receives the frames of one merged stack, oldest first.
pub trait StackCollector {
    fn set_is_main_thread(&mut self) {}
    /// Position of the sample's `ThreadId` entry, when the collector writes
    /// into a profile buffer.
    fn sample_position(&self) -> Option<u64> {
        None
    }
    fn collect_native_leaf_addr(&mut self, address: u64);
    fn collect_label_frame(&mut self, label: &str, dynamic: &str, category: Category);
}

/// Collector that appends frame entries to a (single-writer) profile buffer.
pub(crate) struct ProfileBufferCollector<'a> {
    pub buffer: &'a mut ProfileBuffer,
    pub sample_position: u64,
}

impl StackCollector for ProfileBufferCollector<'_> {
    fn sample_position(&self) -> Option<u64> {
        Some(self.sample_position)
    }

    fn collect_native_leaf_addr(&mut self, address: u64) {
        self.buffer.add_entry(Entry::NativeLeafAddr(address));
    }

    fn collect_label_frame(&mut self, label: &str, dynamic: &str, category: Category) {
        self.buffer.add_entry(Entry::Label {
            label,
            dynamic,
            category,
        });
    }
}

/// The stack-capture path shared by all three sample kinds. Runs inside the
/// critical section when the target is suspended.
pub(crate) fn do_shared_sample(
    features: Features,
    registration: &ThreadRegistration,
    regs: &Registers,
    native: &mut NativeStack,
    walker: &mut Option<Box<dyn StackWalker>>,
    collector: &mut dyn StackCollector,
) {
    native.clear();
    let walked = if features.contains(Features::STACK_WALK) {
        match walker.as_mut() {
            Some(walker) => {
                walker.walk_stack(regs, registration.stack_top, native);
                true
            }
            None => false,
        }
    } else {
        false
    };

    let labels = registration.racy.label_stack.read();
    merge::merge_stacks(&labels, native, collector);

    if !walked && features.contains(Features::LEAF) && regs.pc != 0 {
        // We couldn't walk the whole native stack, but we can record the top
        // frame.
        collector.collect_native_leaf_addr(regs.pc);
    }
}

/// The per-invocation suspend primitive. A single instance is bound to a
/// single sampling thread; it must never be pointed at the thread it runs
/// on. `disable` must be called before drop so the platform backend can
/// restore its signal handler.
pub(crate) struct Sampler {
    backend: platform::SuspendBackend,
    disabled: bool,
}

impl Sampler {
    pub fn new() -> Result<Sampler, SamplingError> {
        Ok(Sampler {
            backend: platform::SuspendBackend::install()?,
            disabled: false,
        })
    }

    pub fn suspend_and_sample(
        &mut self,
        registration: &ThreadRegistration,
        process_regs: &mut dyn FnMut(&Registers, Instant),
    ) -> Result<(), SamplingError> {
        debug_assert_ne!(
            registration.info.tid,
            current_thread_id(),
            "a sampler must not suspend its own thread"
        );
        if registration.info.tid == current_thread_id() {
            return Err(SamplingError::Ignorable("self-sample refused", 0));
        }
        self.backend
            .suspend_and_sample(registration.info.tid, process_regs)
    }

    pub fn disable(&mut self) {
        if !self.disabled {
            self.backend.restore();
            self.disabled = true;
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        debug_assert!(self.disabled, "Sampler dropped without disable()");
        self.disable();
    }
}
