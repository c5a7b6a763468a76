//! Synchronous on-thread samples.
//!
//! `get_backtrace()` captures the calling thread's own stack into a private
//! buffer and returns it as a handle. The handle can be attached to a marker
//! payload as the marker's cause, or inspected directly.

use crate::features::Features;
use crate::markers::MarkerPayload;
use crate::profile_buffer::{DecodedEntry, Entry, ProfileBuffer};
use crate::registry::ThreadRegistration;
use crate::sampler::{
    default_stack_walker, do_shared_sample, NativeStack, ProfileBufferCollector, Registers,
};
use crate::time::profiler_time;

const BACKTRACE_BUFFER_BYTES: usize = 64 * 1024;

/// A captured synchronous sample.
pub struct Backtrace {
    tid: i32,
    buffer: ProfileBuffer,
}

impl Backtrace {
    /// Capture the current thread. Must be called on the registered thread
    /// itself; registers come from a synchronous populate, not a suspension.
    pub(crate) fn capture(registration: &ThreadRegistration, features: Features) -> Backtrace {
        let mut buffer = ProfileBuffer::owned_with_capacity(BACKTRACE_BUFFER_BYTES);
        let tid = registration.info.tid;
        let position = buffer.add_thread_id_entry(tid).unwrap_or(0);
        buffer.add_entry(Entry::Time(profiler_time()));

        let regs = Registers::sync_populate();
        let mut native = Box::new(NativeStack::new());
        let mut walker = default_stack_walker();
        let mut collector = ProfileBufferCollector {
            buffer: &mut buffer,
            sample_position: position,
        };
        do_shared_sample(
            features,
            registration,
            &regs,
            &mut native,
            &mut walker,
            &mut collector,
        );

        Backtrace { tid, buffer }
    }

    pub fn thread_id(&self) -> i32 {
        self.tid
    }

    /// Frame locations, oldest first.
    pub fn frame_locations(&self) -> Vec<String> {
        let mut frames = Vec::new();
        self.buffer.for_each_entry(0, |_, entry| {
            match entry {
                DecodedEntry::Label(label) => {
                    frames.push(if label.dynamic.is_empty() {
                        label.label
                    } else {
                        format!("{} {}", label.label, label.dynamic)
                    });
                }
                DecodedEntry::NativeLeafAddr(address) => frames.push(format!("{address:#x}")),
                _ => {}
            }
            true
        });
        frames
    }
}

impl std::fmt::Debug for Backtrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backtrace")
            .field("tid", &self.tid)
            .field("frames", &self.frame_locations())
            .finish()
    }
}

impl MarkerPayload {
    /// Attach a backtrace as this marker's cause.
    pub fn with_cause(mut self, backtrace: &Backtrace) -> Self {
        self.cause = Some(backtrace.frame_locations());
        self
    }
}
