//! Which allocation events are being captured right now.
//!
//! Allocation capture and release capture are switched separately. Allocation capture
//! is either on for every thread or on for the individual threads that opted in.
//! Release capture stays on after allocation capture stops, so blocks that are already
//! tracked are still retired correctly when the program frees them.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{self, AtomicBool, AtomicUsize};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::guard;

static NEXT_MONITOR_ID: AtomicUsize = AtomicUsize::new(1);

type ThreadList = Mutex<Vec<Arc<ThreadOptions>>>;

/// Observable summary of a [`Monitor`]'s switches.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum MonitoringState {
    /// Nothing is captured.
    Idle,

    /// Allocations are no longer captured but releases of tracked blocks still are.
    ReleasesOnly,

    /// Allocations on every thread are captured.
    AllThreads,

    /// Allocations on the threads that opted in are captured.
    PerThread,
}

#[derive(Debug, Default)]
struct ThreadOptions {
    monitor_allocations: AtomicBool,
}

/// Ties one thread's options to one monitor's thread list.
///
/// Lives in the thread's own storage, so the runtime drops it when the thread ends,
/// which takes the options off the monitor's list.
struct Enrollment {
    monitor_id: usize,
    options: Arc<ThreadOptions>,
    list: Weak<ThreadList>,
}

impl Drop for Enrollment {
    fn drop(&mut self) {
        let _suppressed = guard::suppress();

        if let Some(list) = self.list.upgrade() {
            list.lock()
                .retain(|options| !Arc::ptr_eq(options, &self.options));
        }
    }
}

thread_local! {
    // Only touched once the thread has enrolled somewhere. Reading it before that would
    // register its destructor, which can allocate on the interception path.
    static ENROLLMENTS: RefCell<Vec<Enrollment>> = const { RefCell::new(Vec::new()) };

    static ENROLLED: Cell<bool> = const { Cell::new(false) };
}

/// The monitoring switches of one tracer.
#[derive(Debug)]
pub struct Monitor {
    id: usize,
    all_threads: AtomicBool,
    releases: AtomicBool,
    threads: Arc<ThreadList>,
}

impl Monitor {
    /// Creates a monitor with every switch off.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_MONITOR_ID.fetch_add(1, atomic::Ordering::Relaxed),
            all_threads: AtomicBool::new(false),
            releases: AtomicBool::new(false),
            threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Whether an allocation made by the calling thread right now must be recorded.
    ///
    /// Never allocates.
    #[inline]
    #[must_use]
    pub fn is_allocation_monitored(&self) -> bool {
        self.is_all_threads() || self.is_this_thread_opted_in()
    }

    /// Whether a release made right now must retire its record.
    #[inline]
    #[must_use]
    pub fn is_release_monitored(&self) -> bool {
        self.releases.load(atomic::Ordering::Acquire)
    }

    /// Whether allocations on every thread are captured.
    #[inline]
    #[must_use]
    pub fn is_all_threads(&self) -> bool {
        self.all_threads.load(atomic::Ordering::Acquire)
    }

    /// Whether the calling thread opted in to allocation capture.
    ///
    /// Never allocates, and reports `false` while the thread's storage is being torn down.
    #[must_use]
    pub fn is_this_thread_opted_in(&self) -> bool {
        if !ENROLLED.get() {
            return false;
        }

        ENROLLMENTS
            .try_with(|enrollments| {
                let Ok(enrollments) = enrollments.try_borrow() else {
                    return false;
                };

                enrollments
                    .iter()
                    .find(|enrollment| enrollment.monitor_id == self.id)
                    .is_some_and(|enrollment| {
                        enrollment
                            .options
                            .monitor_allocations
                            .load(atomic::Ordering::Relaxed)
                    })
            })
            .unwrap_or(false)
    }

    /// Turns release capture on or off.
    pub fn set_releases(&self, enabled: bool) {
        self.releases.store(enabled, atomic::Ordering::Release);
    }

    /// Turns all-thread allocation capture on or off.
    pub fn set_all_threads(&self, enabled: bool) {
        self.all_threads.store(enabled, atomic::Ordering::Release);
    }

    /// Opts every known thread out of per-thread allocation capture.
    pub fn reset_thread_opt_ins(&self) {
        let _suppressed = guard::suppress();

        for options in self.threads.lock().iter() {
            options
                .monitor_allocations
                .store(false, atomic::Ordering::Relaxed);
        }
    }

    /// Opts the calling thread in to or out of allocation capture.
    ///
    /// Opting in for the first time enrolls the thread with this monitor, which
    /// allocates and is therefore done with the reentrancy guard raised.
    pub fn set_this_thread(&self, enabled: bool) {
        let _suppressed = guard::suppress();

        let found = self.with_own_options(|options| {
            options
                .monitor_allocations
                .store(enabled, atomic::Ordering::Relaxed);
        });

        if found || !enabled {
            return;
        }

        let options = Arc::new(ThreadOptions {
            monitor_allocations: AtomicBool::new(true),
        });

        self.threads.lock().push(Arc::clone(&options));

        let enrollment = Enrollment {
            monitor_id: self.id,
            options,
            list: Arc::downgrade(&self.threads),
        };

        // If the thread is already tearing down its storage, the enrollment is dropped
        // right here, which takes it off the list again.
        _ = ENROLLMENTS.try_with(|enrollments| {
            let mut enrollments = enrollments.borrow_mut();

            // Enrollments with monitors that no longer exist are dead weight.
            enrollments.retain(|enrollment| enrollment.list.strong_count() > 0);
            enrollments.push(enrollment);

            ENROLLED.set(true);
        });
    }

    /// Number of threads currently enrolled with this monitor.
    #[must_use]
    pub fn enrolled_threads(&self) -> usize {
        let _suppressed = guard::suppress();

        self.threads.lock().len()
    }

    /// Summarizes the switches.
    #[must_use]
    pub fn state(&self) -> MonitoringState {
        if self.is_all_threads() {
            return MonitoringState::AllThreads;
        }

        let any_thread_opted_in = {
            let _suppressed = guard::suppress();

            self.threads.lock().iter().any(|options| {
                options.monitor_allocations.load(atomic::Ordering::Relaxed)
            })
        };

        if any_thread_opted_in {
            MonitoringState::PerThread
        } else if self.is_release_monitored() {
            MonitoringState::ReleasesOnly
        } else {
            MonitoringState::Idle
        }
    }

    fn with_own_options(&self, f: impl FnOnce(&ThreadOptions)) -> bool {
        if !ENROLLED.get() {
            return false;
        }

        ENROLLMENTS
            .try_with(|enrollments| {
                let enrollments = enrollments.borrow();

                match enrollments
                    .iter()
                    .find(|enrollment| enrollment.monitor_id == self.id)
                {
                    Some(enrollment) => {
                        f(&enrollment.options);
                        true
                    }
                    None => false,
                }
            })
            .unwrap_or(false)
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}
