//! Suspension fallback for platforms without a backend.
//!
//! The closure still runs so the label stack gets sampled, but the target is
//! not actually stopped and no registers are captured; with an empty pc the
//! shared sample path skips native frames and leaf entries entirely.

use std::time::Instant;

use crate::error::SamplingError;

use super::Registers;

pub(crate) struct SuspendBackend;

impl SuspendBackend {
    pub fn install() -> Result<SuspendBackend, SamplingError> {
        Ok(SuspendBackend)
    }

    pub fn suspend_and_sample(
        &mut self,
        _tid: i32,
        process_regs: &mut dyn FnMut(&Registers, Instant),
    ) -> Result<(), SamplingError> {
        process_regs(&Registers::default(), Instant::now());
        Ok(())
    }

    pub fn restore(&mut self) {}
}
