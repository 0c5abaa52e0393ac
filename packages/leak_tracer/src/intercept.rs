//! The process-wide allocation boundary.
//!
//! These functions are what the exported allocation symbols of the preload library
//! call. Each of them first advances startup as far as the calling context allows
//! and then serves the call at whatever level is available:
//!
//! * during the symbol phase, from the bootstrap arena;
//! * with only the raw primitives resolved, straight from them, untracked;
//! * with the tracer ready, through the tracer.
//!
//! The control surface at the bottom is what the C API of the preload library calls.

use std::alloc::{GlobalAlloc, Layout};
use std::io::Write;
use std::path::Path;
use std::{cmp, ptr};

use crate::bootstrap::{self, Stage};
use crate::raw::{self, BootstrapArena, MIN_ALIGN, RawAllocator, Resolved};
use crate::{AllocationKind, Error, Result, Tracer};

static ARENA: BootstrapArena = BootstrapArena::new();

/// The process-wide tracer, starting it up if possible.
///
/// Returns `None` when called in a context that must not start the tracer, such as
/// from inside the tracer itself before startup has completed.
#[must_use]
pub fn tracer() -> Option<&'static Tracer<Resolved>> {
    match bootstrap::setup() {
        Stage::Ready(_, context) => Some(context.tracer()),
        _ => None,
    }
}

/// `operator new`.
#[must_use]
pub fn allocate_scalar(size: usize) -> *mut u8 {
    allocate(size, AllocationKind::Scalar)
}

/// `operator new[]`.
#[must_use]
pub fn allocate_array(size: usize) -> *mut u8 {
    allocate(size, AllocationKind::Array)
}

/// `operator delete`.
///
/// # Safety
///
/// `block` must be null or a live block obtained from this module.
pub unsafe fn release_scalar(block: *mut u8) {
    // SAFETY: Forwarding the caller's guarantee.
    unsafe { release(block, AllocationKind::Scalar) }
}

/// `operator delete[]`.
///
/// # Safety
///
/// `block` must be null or a live block obtained from this module.
pub unsafe fn release_array(block: *mut u8) {
    // SAFETY: Forwarding the caller's guarantee.
    unsafe { release(block, AllocationKind::Array) }
}

/// `malloc`.
#[must_use]
pub fn malloc(size: usize) -> *mut u8 {
    allocate(size, AllocationKind::Scalar)
}

/// `calloc`.
#[must_use]
pub fn calloc(count: usize, size: usize) -> *mut u8 {
    match bootstrap::setup() {
        // Arena memory is never handed out twice, so it is still zeroed.
        Stage::Bootstrapping => count
            .checked_mul(size)
            .map_or(ptr::null_mut(), |total| ARENA.allocate(total)),
        Stage::Resolved(raw) => raw.calloc(count, size),
        Stage::Ready(_, context) => context.tracer().calloc(count, size),
    }
}

/// `realloc`.
///
/// # Safety
///
/// `block` must be null or a live block obtained from this module.
pub unsafe fn realloc(block: *mut u8, size: usize) -> *mut u8 {
    if ARENA.contains(block) {
        // SAFETY: Forwarding the caller's guarantee, it is a live arena block.
        return unsafe { move_out_of_arena(block, size) };
    }

    match bootstrap::setup() {
        Stage::Bootstrapping => {
            if block.is_null() {
                ARENA.allocate(size)
            } else {
                raw::fatal(b"leaktracer: realloc of a foreign block during startup\n")
            }
        }
        // SAFETY: Forwarding the caller's guarantee.
        Stage::Resolved(raw) => unsafe { raw.realloc(block, size) },
        // SAFETY: Forwarding the caller's guarantee.
        Stage::Ready(_, context) => unsafe { context.tracer().realloc(block, size) },
    }
}

/// `free`.
///
/// # Safety
///
/// `block` must be null or a live block obtained from this module.
pub unsafe fn free(block: *mut u8) {
    // SAFETY: Forwarding the caller's guarantee.
    unsafe { release(block, AllocationKind::Scalar) }
}

fn allocate(size: usize, kind: AllocationKind) -> *mut u8 {
    match bootstrap::setup() {
        Stage::Bootstrapping => ARENA.allocate(size),
        Stage::Resolved(raw) => raw.malloc(size),
        Stage::Ready(_, context) => context.tracer().allocate(size, kind),
    }
}

unsafe fn release(block: *mut u8, kind: AllocationKind) {
    if block.is_null() || ARENA.contains(block) {
        return;
    }

    match bootstrap::setup() {
        // Nothing but arena blocks can exist before the symbols are resolved.
        Stage::Bootstrapping => {}
        // SAFETY: Forwarding the caller's guarantee.
        Stage::Resolved(raw) => unsafe { raw.free(block) },
        // SAFETY: Forwarding the caller's guarantee.
        Stage::Ready(_, context) => unsafe { context.tracer().release(block, kind) },
    }
}

/// Copies an arena block into a regular one. The arena block stays where it is.
unsafe fn move_out_of_arena(block: *mut u8, size: usize) -> *mut u8 {
    let moved = allocate(size, AllocationKind::Scalar);

    if !moved.is_null() {
        // SAFETY: The caller guarantees `block` is a live arena block.
        let old_size = unsafe { ARENA.block_size(block) };

        // SAFETY: Both blocks are at least this long and distinct.
        unsafe {
            ptr::copy_nonoverlapping(block, moved, cmp::min(old_size, size));
        }
    }

    moved
}

/// Starts monitoring allocations on every thread of the process.
pub fn start_monitoring_all_threads() {
    if let Some(tracer) = tracer() {
        tracer.start_monitoring_all_threads();
    }
}

/// Starts monitoring allocations on the calling thread.
pub fn start_monitoring_this_thread() {
    if let Some(tracer) = tracer() {
        tracer.start_monitoring_this_thread();
    }
}

/// Stops recording new allocations. Releases are still recorded.
pub fn stop_monitoring_allocations() {
    if let Some(tracer) = tracer() {
        tracer.stop_monitoring_allocations();
    }
}

/// Stops recording allocations and releases.
pub fn stop_all_monitoring() {
    if let Some(tracer) = tracer() {
        tracer.stop_all_monitoring();
    }
}

/// Writes a leak report to `sink`.
///
/// # Errors
///
/// Returns [`Error::NotReady`] if the process-wide tracer cannot be started from the
/// calling context, or an error if writing fails.
pub fn write_leaks(sink: &mut impl Write) -> Result<()> {
    tracer().ok_or(Error::NotReady)?.write_leaks(sink)
}

/// Writes a leak report to the file at `path`, replacing any existing file.
///
/// # Errors
///
/// Returns [`Error::NotReady`] if the process-wide tracer cannot be started from the
/// calling context, or an error if the file cannot be created or written.
pub fn write_leaks_to_file(path: impl AsRef<Path>) -> Result<()> {
    tracer().ok_or(Error::NotReady)?.write_leaks_to_file(path)
}

/// A global allocator for code that runs underneath the interception layer.
///
/// Allocations go straight to the raw primitives and are never recorded, which keeps
/// the tracer's own Rust allocations out of the symbols it interposes.
///
/// ```ignore
/// #[global_allocator]
/// static ALLOCATOR: leak_tracer::intercept::UntrackedAllocator =
///     leak_tracer::intercept::UntrackedAllocator;
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct UntrackedAllocator;

impl UntrackedAllocator {
    fn allocate(layout: Layout, zeroed: bool) -> *mut u8 {
        let Some(raw) = bootstrap::raw() else {
            // Only the resolving thread gets here. The arena only guarantees the
            // minimum alignment and is zeroed.
            return if layout.align() <= MIN_ALIGN {
                ARENA.allocate(layout.size())
            } else {
                ptr::null_mut()
            };
        };

        if layout.align() <= MIN_ALIGN {
            return if zeroed {
                raw.calloc(1, layout.size())
            } else {
                raw.malloc(layout.size())
            };
        }

        let mut block = ptr::null_mut();

        // SAFETY: The alignment is a power of two and a multiple of the pointer size
        // because it is larger than the minimum alignment.
        let result = unsafe { libc::posix_memalign(&raw mut block, layout.align(), layout.size()) };

        if result != 0 {
            return ptr::null_mut();
        }

        let block = block.cast::<u8>();

        if zeroed {
            // SAFETY: The block was just allocated with this size.
            unsafe {
                ptr::write_bytes(block, 0, layout.size());
            }
        }

        block
    }
}

// SAFETY: Blocks come from the raw primitives, which satisfy the minimum alignment,
// or from posix_memalign for larger alignments. Both are released with free.
unsafe impl GlobalAlloc for UntrackedAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        Self::allocate(layout, false)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        Self::allocate(layout, true)
    }

    unsafe fn dealloc(&self, block: *mut u8, _layout: Layout) {
        if ARENA.contains(block) {
            return;
        }

        if let Some(raw) = bootstrap::raw() {
            // SAFETY: The block came from the raw primitives or posix_memalign.
            unsafe {
                raw.free(block);
            }
        }
    }

    unsafe fn realloc(&self, block: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let raw = bootstrap::raw();

        match raw {
            Some(raw) if layout.align() <= MIN_ALIGN && !ARENA.contains(block) => {
                // SAFETY: The block came from the raw primitives.
                unsafe { raw.realloc(block, new_size) }
            }
            _ => {
                // SAFETY: The caller guarantees the new layout is valid.
                let new_layout =
                    unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
                let moved = Self::allocate(new_layout, false);

                if !moved.is_null() {
                    // SAFETY: Both blocks are at least this long and distinct.
                    unsafe {
                        ptr::copy_nonoverlapping(block, moved, cmp::min(layout.size(), new_size));
                    }

                    // SAFETY: Forwarding the caller's guarantee.
                    unsafe {
                        self.dealloc(block, layout);
                    }
                }

                moved
            }
        }
    }
}
