//! Reentrancy guard for the interception layer.
//!
//! Anything the tracer does internally may itself call back into the intercepted
//! allocation primitives: resolving symbols, registering thread-local destructors,
//! walking the stack, taking a contended lock, emitting a log event. Each such path
//! raises the guard first, so when the nested call arrives at the interception layer
//! it sees [`is_suppressed()`] and falls straight through to the raw allocator
//! without touching the registry. An unguarded internal allocation would recurse
//! without bound.
//!
//! The guard has two parts:
//!
//! * a per-thread depth counter, raised with [`enter()`] / [`suppress()`];
//! * a process-wide disabler, raised with [`disable_process()`] while the tracer
//!   itself is being constructed.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{self, AtomicUsize};

thread_local! {
    // Const-initialized and without drop logic, so the runtime never registers a
    // destructor for it. That keeps it usable while other thread-locals are being
    // torn down, which is exactly when some of the nested calls arrive.
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

static PROCESS_DISABLER: AtomicUsize = AtomicUsize::new(0);

/// Raises the calling thread's guard depth by one, returning the previous depth.
#[inline]
pub fn enter() -> usize {
    DEPTH.with(|depth| {
        let previous = depth.get();
        depth.set(previous.wrapping_add(1));
        previous
    })
}

/// Lowers the calling thread's guard depth by one, returning the previous depth.
///
/// Calls must be balanced with [`enter()`]. An unbalanced call on a thread whose
/// depth is already zero leaves the depth at zero.
#[inline]
pub fn leave() -> usize {
    DEPTH.with(|depth| {
        let previous = depth.get();
        depth.set(previous.saturating_sub(1));
        previous
    })
}

/// The calling thread's current guard depth.
#[inline]
#[must_use]
pub fn depth() -> usize {
    DEPTH.with(Cell::get)
}

/// Whether allocation events arriving right now must be ignored.
///
/// True if the process-wide disabler is raised or the calling thread is inside
/// one of the tracer's own code paths.
#[inline]
#[must_use]
pub fn is_suppressed() -> bool {
    // Relaxed is sufficient: a stale read during the short construction window is
    // tolerated, because construction itself is serialized by a one-time primitive.
    PROCESS_DISABLER.load(atomic::Ordering::Relaxed) != 0 || depth() != 0
}

/// Raises the calling thread's guard until the returned value is dropped.
#[inline]
pub fn suppress() -> Suppressed {
    enter();

    Suppressed {
        _single_threaded: PhantomData,
    }
}

/// Raises the process-wide disabler until the returned value is dropped.
pub fn disable_process() -> ProcessDisabled {
    PROCESS_DISABLER.fetch_add(1, atomic::Ordering::Relaxed);

    ProcessDisabled { _private: () }
}

/// Keeps the calling thread's guard raised while alive.
///
/// Created by [`suppress()`]. Bound to the thread that created it because the
/// depth it restores on drop is thread-local.
#[derive(Debug)]
#[must_use = "the guard is lowered as soon as this value is dropped"]
pub struct Suppressed {
    _single_threaded: PhantomData<*const ()>,
}

impl Drop for Suppressed {
    #[inline]
    fn drop(&mut self) {
        leave();
    }
}

/// Keeps the process-wide disabler raised while alive.
///
/// Created by [`disable_process()`].
#[derive(Debug)]
#[must_use = "the disabler is lowered as soon as this value is dropped"]
pub struct ProcessDisabled {
    _private: (),
}

impl Drop for ProcessDisabled {
    fn drop(&mut self) {
        PROCESS_DISABLER.fetch_sub(1, atomic::Ordering::Relaxed);
    }
}
