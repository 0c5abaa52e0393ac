//! Allocation tracking for Rust programs through the global allocator.

use std::alloc::{GlobalAlloc, Layout, System};
use std::fmt;

use crate::{AllocationKind, intercept};

/// A memory allocator that records allocations in the process-wide tracer.
///
/// This allocator wraps any [`GlobalAlloc`] implementation. The wrapped allocator does
/// the actual work; every block it hands out or takes back is reported to the tracer,
/// which records it if monitoring is active at the time. Rust has no separate array
/// form, so everything is recorded as [`AllocationKind::Scalar`].
///
/// Monitoring is controlled with the functions in [`intercept`] or with the
/// `LEAKTRACER_*` environment variables.
///
/// # Examples
///
/// ```rust
/// use leak_tracer::Allocator;
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
/// ```
pub struct Allocator<A: GlobalAlloc> {
    inner: A,
}

impl<A: GlobalAlloc> fmt::Debug for Allocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("inner", &"<allocator>")
            .finish()
    }
}

impl Allocator<System> {
    /// Creates a tracking allocator on top of the system allocator.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A: GlobalAlloc> Allocator<A> {
    /// Creates a tracking allocator on top of the provided allocator.
    #[must_use]
    #[inline]
    pub const fn new(allocator: A) -> Self {
        Self { inner: allocator }
    }
}

fn register_allocation(block: *mut u8, size: usize) {
    if let Some(tracer) = intercept::tracer() {
        // SAFETY: The block was just handed out by the inner allocator with this size
        // and stays live until its release is registered in `dealloc()`.
        unsafe {
            tracer.register_allocation(block, size, AllocationKind::Scalar);
        }
    }
}

// SAFETY: We delegate all allocation operations to the underlying allocator,
// which already implements GlobalAlloc safely, while adding tracking functionality.
unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let block = unsafe { self.inner.alloc(layout) };
        register_allocation(block, layout.size());
        block
    }

    #[inline]
    unsafe fn dealloc(&self, block: *mut u8, layout: Layout) {
        // The record goes before the block does.
        if let Some(tracer) = intercept::tracer() {
            tracer.register_release(block, AllocationKind::Scalar);
        }

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        unsafe { self.inner.dealloc(block, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let block = unsafe { self.inner.alloc_zeroed(layout) };
        register_allocation(block, layout.size());
        block
    }

    #[inline]
    unsafe fn realloc(&self, block: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let resized = unsafe { self.inner.realloc(block, layout, new_size) };

        if let Some(tracer) = intercept::tracer() {
            // SAFETY: `resized` is what the inner allocator returned for `block`.
            unsafe {
                tracer.register_resize(block, resized, new_size);
            }
        }

        resized
    }
}
