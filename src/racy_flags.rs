//! A single atomic word mirroring the session state for lock-free hot paths.
//!
//! Layout: bit 0 = active, bit 1 = paused, the session's feature bits shifted
//! left by two. All accesses are relaxed; this word is a hint only, and code
//! that needs a precise answer re-checks under the directory lock. The one
//! ordering rule that matters is enforced by the callers: `set_active` is the
//! last observable step of `start`, and `set_inactive` is the first
//! observable step of `stop`.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::features::Features;

const ACTIVE: u32 = 1 << 0;
const PAUSED: u32 = 1 << 1;
const FEATURE_SHIFT: u32 = 2;

static ACTIVE_AND_FEATURES: AtomicU32 = AtomicU32::new(0);

pub(crate) fn set_active(features: Features) {
    ACTIVE_AND_FEATURES.store(ACTIVE | (features.bits() << FEATURE_SHIFT), Ordering::Relaxed);
}

pub(crate) fn set_inactive() {
    ACTIVE_AND_FEATURES.store(0, Ordering::Relaxed);
}

pub(crate) fn set_paused() {
    ACTIVE_AND_FEATURES.fetch_or(PAUSED, Ordering::Relaxed);
}

pub(crate) fn set_unpaused() {
    ACTIVE_AND_FEATURES.fetch_and(!PAUSED, Ordering::Relaxed);
}

pub(crate) fn is_active() -> bool {
    ACTIVE_AND_FEATURES.load(Ordering::Relaxed) & ACTIVE != 0
}

pub(crate) fn is_active_with_feature(feature: Features) -> bool {
    let word = ACTIVE_AND_FEATURES.load(Ordering::Relaxed);
    word & ACTIVE != 0 && (word >> FEATURE_SHIFT) & feature.bits() != 0
}

pub(crate) fn is_active_and_unpaused_without_privacy() -> bool {
    let word = ACTIVE_AND_FEATURES.load(Ordering::Relaxed);
    word & (ACTIVE | PAUSED) == ACTIVE
        && (word >> FEATURE_SHIFT) & Features::PRIVACY.bits() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_and_feature_bits() {
        set_inactive();
        assert!(!is_active());

        set_active(Features::THREADS | Features::LEAF);
        assert!(is_active());
        assert!(is_active_with_feature(Features::THREADS));
        assert!(!is_active_with_feature(Features::PRIVACY));
        assert!(is_active_and_unpaused_without_privacy());

        set_paused();
        assert!(is_active());
        assert!(!is_active_and_unpaused_without_privacy());
        set_unpaused();
        assert!(is_active_and_unpaused_without_privacy());

        set_active(Features::PRIVACY);
        assert!(!is_active_and_unpaused_without_privacy());

        set_inactive();
        assert!(!is_active_with_feature(Features::THREADS));
    }
}
