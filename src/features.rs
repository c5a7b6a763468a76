//! The profiling feature set.
//!
//! Features select optional behaviors of an active session. They are chosen
//! at `start` time and are immutable for the session's lifetime; the sampler
//! and the marker hot path read them through [`crate::racy_flags`] without
//! taking the directory lock.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        /// Walk the native stack of sampled threads.
        const STACK_WALK = 1 << 0;
        /// Record the leaf program counter when native stack walking is off.
        const LEAF = 1 << 1;
        /// Sample all registered threads, not just the main thread.
        const THREADS = 1 << 2;
        /// Record main-thread I/O markers.
        const MAIN_THREAD_IO = 1 << 3;
        /// Exclude potentially sensitive data: disables markers.
        const PRIVACY = 1 << 4;
        /// Disable stack sampling entirely; counters and markers still flow.
        const NO_STACK_SAMPLING = 1 << 5;
    }
}

const FEATURE_NAMES: &[(Features, &str, &str)] = &[
    (
        Features::STACK_WALK,
        "stackwalk",
        "Walk the C++ stack (not available on all platforms)",
    ),
    (
        Features::LEAF,
        "leaf",
        "Include the C++ leaf node if not stackwalking",
    ),
    (
        Features::THREADS,
        "threads",
        "Profile the registered secondary threads",
    ),
    (
        Features::MAIN_THREAD_IO,
        "mainthreadio",
        "Add markers for any I/O on the main thread",
    ),
    (
        Features::PRIVACY,
        "privacy",
        "Do not include user-identifiable information",
    ),
    (
        Features::NO_STACK_SAMPLING,
        "nostacksampling",
        "Disable all stack sampling: sample only markers and counters",
    ),
];

impl Features {
    /// Features enabled when the caller doesn't ask for anything specific.
    pub fn default_features() -> Features {
        Features::LEAF | Features::STACK_WALK | Features::THREADS
    }

    /// Extra defaults applied on top when profiling from process startup.
    pub fn startup_extra_default_features() -> Features {
        Features::MAIN_THREAD_IO
    }

    /// All features that can actually work on this platform/build.
    pub fn available_features() -> Features {
        let mut features = Features::all();
        if !crate::sampler::native_unwind_supported() {
            features.remove(Features::STACK_WALK);
        }
        features
    }

    pub fn name(self) -> Option<&'static str> {
        FEATURE_NAMES
            .iter()
            .find(|(f, _, _)| *f == self)
            .map(|(_, name, _)| *name)
    }

    /// Parse a single feature name. `"default"` expands to the default set
    /// (plus the startup extras when `is_startup` is set).
    pub fn parse_name(name: &str, is_startup: bool) -> Option<Features> {
        if name == "default" {
            let mut features = Features::default_features();
            if is_startup {
                features |= Features::startup_extra_default_features();
            }
            return Some(features & Features::available_features());
        }
        FEATURE_NAMES
            .iter()
            .find(|(_, n, _)| *n == name)
            .map(|(f, _, _)| *f)
    }

    pub fn parse_names<'a>(
        names: impl Iterator<Item = &'a str>,
        is_startup: bool,
    ) -> Result<Features, String> {
        let mut features = Features::empty();
        for name in names {
            match Features::parse_name(name, is_startup) {
                Some(f) => features |= f,
                None => return Err(name.to_string()),
            }
        }
        Ok(features)
    }

    pub fn descriptions() -> impl Iterator<Item = (Features, &'static str, &'static str)> {
        FEATURE_NAMES.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_names() {
        assert_eq!(
            Features::parse_name("stackwalk", false),
            Some(Features::STACK_WALK)
        );
        assert_eq!(
            Features::parse_name("threads", false),
            Some(Features::THREADS)
        );
        assert_eq!(Features::parse_name("bogus", false), None);
    }

    #[test]
    fn parse_default_expands() {
        let f = Features::parse_name("default", false).unwrap();
        assert!(f.contains(Features::LEAF & Features::available_features()));
        assert!(f.contains(Features::THREADS));

        let startup = Features::parse_name("default", true).unwrap();
        assert!(startup.contains(Features::MAIN_THREAD_IO));
    }

    #[test]
    fn parse_csv_list() {
        let f = Features::parse_names("leaf,threads".split(','), false).unwrap();
        assert_eq!(f, Features::LEAF | Features::THREADS);
        assert!(Features::parse_names("leaf,nope".split(','), false).is_err());
    }
}
