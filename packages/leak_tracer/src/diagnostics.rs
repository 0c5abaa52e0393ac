use std::{fmt, mem};
use std::sync::atomic::{self, AtomicU64};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::guard;
use crate::record::AllocationKind;

/// Something suspicious noticed while retiring a release.
///
/// Anomalies never interrupt the program: the block is released regardless.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Anomaly {
    /// A release of a block that has no record: a double release, or the release of a
    /// block allocated while allocation capture was off.
    UntrackedRelease {
        /// The released block.
        address: usize,

        /// The release form used.
        kind: AllocationKind,
    },

    /// A block released with a different form than it was allocated with, such as
    /// `operator delete` on the result of `operator new[]`.
    KindMismatch {
        /// The released block.
        address: usize,

        /// The size the block was tracked with.
        size: usize,

        /// The allocation form.
        allocated: AllocationKind,

        /// The release form.
        released: AllocationKind,
    },
}

impl Anomaly {
    /// The block the anomaly concerns.
    #[must_use]
    pub fn address(&self) -> usize {
        match self {
            Self::UntrackedRelease { address, .. } | Self::KindMismatch { address, .. } => {
                *address
            }
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UntrackedRelease { address, kind } => write!(
                f,
                "{kind} release of untracked or already released block {address:#x}"
            ),
            Self::KindMismatch {
                address,
                size,
                allocated,
                released,
            } => write!(
                f,
                "block {address:#x} of {size} bytes allocated as {allocated} but released as {released}"
            ),
        }
    }
}

/// Called for every anomaly, with the reentrancy guard raised.
pub type AnomalyHook = fn(&Anomaly);

/// How many anomalies and skipped registrations a tracer has seen.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct AnomalyCounts {
    /// Releases of blocks without a record.
    pub untracked_releases: u64,

    /// Releases with the wrong form.
    pub kind_mismatches: u64,

    /// Allocations that were not recorded because no registry node was available.
    pub skipped_registrations: u64,
}

/// Collects anomalies for one tracer.
#[derive(Debug, Default)]
pub struct Diagnostics {
    untracked_releases: AtomicU64,
    kind_mismatches: AtomicU64,
    skipped_registrations: AtomicU64,
    hook: Mutex<Option<AnomalyHook>>,
}

impl Diagnostics {
    /// Creates an empty collector without a hook.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            untracked_releases: AtomicU64::new(0),
            kind_mismatches: AtomicU64::new(0),
            skipped_registrations: AtomicU64::new(0),
            hook: Mutex::new(None),
        }
    }

    /// Records an anomaly, logs it and passes it to the hook.
    ///
    /// Must not be called while holding the registry lock: the hook may do anything,
    /// including allocating.
    pub fn report(&self, anomaly: &Anomaly) {
        let counter = match anomaly {
            Anomaly::UntrackedRelease { .. } => &self.untracked_releases,
            Anomaly::KindMismatch { .. } => &self.kind_mismatches,
        };

        counter.fetch_add(1, atomic::Ordering::Relaxed);

        let _suppressed = guard::suppress();

        match anomaly {
            Anomaly::UntrackedRelease { .. } => debug!(%anomaly, "allocation anomaly"),
            Anomaly::KindMismatch { .. } => warn!(%anomaly, "allocation anomaly"),
        }

        let hook = *self.hook.lock();

        if let Some(hook) = hook {
            hook(anomaly);
        }
    }

    /// Records that an allocation could not be tracked.
    pub fn skipped_registration(&self, address: usize, size: usize) {
        self.skipped_registrations
            .fetch_add(1, atomic::Ordering::Relaxed);

        let _suppressed = guard::suppress();
        trace!(address, size, "allocation not tracked, no registry node available");
    }

    /// Replaces the hook, returning the previous one.
    pub fn set_hook(&self, hook: Option<AnomalyHook>) -> Option<AnomalyHook> {
        mem::replace(&mut *self.hook.lock(), hook)
    }

    /// The current counts.
    #[must_use]
    pub fn counts(&self) -> AnomalyCounts {
        AnomalyCounts {
            untracked_releases: self.untracked_releases.load(atomic::Ordering::Relaxed),
            kind_mismatches: self.kind_mismatches.load(atomic::Ordering::Relaxed),
            skipped_registrations: self.skipped_registrations.load(atomic::Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serial_test::serial;

    use super::*;

    #[test]
    fn display() {
        let untracked = Anomaly::UntrackedRelease {
            address: 0x1230,
            kind: AllocationKind::Scalar,
        };

        assert_eq!(
            untracked.to_string(),
            "scalar release of untracked or already released block 0x1230"
        );

        let mismatch = Anomaly::KindMismatch {
            address: 0xff0,
            size: 256,
            allocated: AllocationKind::Array,
            released: AllocationKind::Scalar,
        };

        assert_eq!(
            mismatch.to_string(),
            "block 0xff0 of 256 bytes allocated as array but released as scalar"
        );
        assert_eq!(mismatch.address(), 0xff0);
    }

    #[test]
    fn counts_by_category() {
        let diagnostics = Diagnostics::new();

        diagnostics.report(&Anomaly::UntrackedRelease {
            address: 0x10,
            kind: AllocationKind::Array,
        });
        diagnostics.report(&Anomaly::UntrackedRelease {
            address: 0x20,
            kind: AllocationKind::Scalar,
        });
        diagnostics.report(&Anomaly::KindMismatch {
            address: 0x30,
            size: 1,
            allocated: AllocationKind::Scalar,
            released: AllocationKind::Array,
        });
        diagnostics.skipped_registration(0x40, 8);

        let counts = diagnostics.counts();
        assert_eq!(counts.untracked_releases, 2);
        assert_eq!(counts.kind_mismatches, 1);
        assert_eq!(counts.skipped_registrations, 1);
    }

    static HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);
    static HOOK_SAW_GUARD: AtomicUsize = AtomicUsize::new(0);

    fn counting_hook(anomaly: &Anomaly) {
        assert_eq!(anomaly.address(), 0x50);

        HOOK_CALLS.fetch_add(1, atomic::Ordering::Relaxed);

        if guard::is_suppressed() {
            HOOK_SAW_GUARD.fetch_add(1, atomic::Ordering::Relaxed);
        }
    }

    #[test]
    #[serial(anomaly_hook)]
    fn hook_runs_with_guard_raised() {
        let diagnostics = Diagnostics::new();
        assert!(diagnostics.set_hook(Some(counting_hook)).is_none());

        let before = HOOK_CALLS.load(atomic::Ordering::Relaxed);

        diagnostics.report(&Anomaly::UntrackedRelease {
            address: 0x50,
            kind: AllocationKind::Scalar,
        });

        assert_eq!(HOOK_CALLS.load(atomic::Ordering::Relaxed), before + 1);
        assert_eq!(HOOK_SAW_GUARD.load(atomic::Ordering::Relaxed), before + 1);
        assert!(!guard::is_suppressed());

        assert!(diagnostics.set_hook(None).is_some());

        diagnostics.report(&Anomaly::UntrackedRelease {
            address: 0x50,
            kind: AllocationKind::Scalar,
        });

        assert_eq!(HOOK_CALLS.load(atomic::Ordering::Relaxed), before + 1);
    }
}
