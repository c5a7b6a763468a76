//! Per-process sampled counters.
//!
//! A counter source is owned by the embedding application and registered with
//! the profiler; every sampler iteration reads each registered source and
//! records a `(count, number)` pair into the profile buffer. `count` is the
//! counter's value delta since the previous sample (for example bytes
//! allocated minus bytes freed), `number` an optional operation count.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterSample {
    pub count: i64,
    pub number: u64,
}

pub trait CounterSource: Send + Sync {
    fn name(&self) -> &str;
    fn category(&self) -> &str;
    fn description(&self) -> &str;
    fn sample(&self) -> CounterSample;
}

/// A registered counter: the registry does not own the source, it only keeps
/// a handle and a process-unique id that buffer entries refer to.
#[derive(Clone)]
pub(crate) struct RegisteredCounter {
    pub id: u32,
    pub source: Arc<dyn CounterSource>,
}

impl std::fmt::Debug for RegisteredCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredCounter")
            .field("id", &self.id)
            .field("name", &self.source.name())
            .finish()
    }
}
