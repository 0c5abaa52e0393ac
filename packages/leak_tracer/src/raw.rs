//! The raw allocation primitives that sit beneath any interception.
//!
//! Everything the tracer allocates for its own bookkeeping comes from here, never
//! from the intercepted `malloc` family and never from the Rust global allocator.

use std::cell::UnsafeCell;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
use std::ffi::CStr;
use std::ffi::c_void;
use std::sync::atomic::{self, AtomicUsize};
use std::{fmt, ptr};

/// Alignment guaranteed for every block returned by a [`RawAllocator`].
pub const MIN_ALIGN: usize = if cfg!(target_pointer_width = "64") {
    16
} else {
    8
};

/// Access to the process's underlying allocation primitives.
///
/// # Safety
///
/// Implementations must return blocks aligned to at least [`MIN_ALIGN`] and valid for
/// the requested number of bytes, must accept in `realloc` and `free` any block they
/// returned earlier, and must never call back into the interception layer.
pub unsafe trait RawAllocator: Copy + Send + Sync + 'static {
    /// Allocates `size` uninitialized bytes. Returns null on failure.
    fn malloc(&self, size: usize) -> *mut u8;

    /// Allocates `count * size` zeroed bytes. Returns null on failure or overflow.
    fn calloc(&self, count: usize, size: usize) -> *mut u8;

    /// Resizes a block, returning the (possibly moved) block or null on failure.
    ///
    /// # Safety
    ///
    /// `block` must be null or a live block returned by this allocator.
    unsafe fn realloc(&self, block: *mut u8, size: usize) -> *mut u8;

    /// Releases a block.
    ///
    /// # Safety
    ///
    /// `block` must be null or a live block returned by this allocator.
    unsafe fn free(&self, block: *mut u8);
}

type MallocFn = unsafe extern "C" fn(libc::size_t) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, libc::size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);

/// The process's raw allocation primitives, resolved once during bootstrap.
///
/// On glibc the statically known `__libc_*` aliases are linked directly, so resolving
/// them performs no symbol lookup and no allocation. Elsewhere the next definitions
/// of `malloc`, `calloc`, `realloc` and `free` after our own are looked up
/// dynamically. That lookup may itself allocate; see [`BootstrapArena`].
#[derive(Clone, Copy, Debug)]
pub struct Resolved {
    malloc: MallocFn,
    calloc: CallocFn,
    realloc: ReallocFn,
    free: FreeFn,
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod glibc {
    use std::ffi::c_void;

    unsafe extern "C" {
        pub(super) fn __libc_malloc(size: libc::size_t) -> *mut c_void;
        pub(super) fn __libc_calloc(count: libc::size_t, size: libc::size_t) -> *mut c_void;
        pub(super) fn __libc_realloc(block: *mut c_void, size: libc::size_t) -> *mut c_void;
        pub(super) fn __libc_free(block: *mut c_void);
    }
}

impl Resolved {
    /// Resolves the raw primitives.
    ///
    /// Aborts the process if any of them cannot be found, as there is no way to
    /// continue intercepting allocations without them.
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[must_use]
    pub fn resolve() -> Self {
        Self {
            malloc: glibc::__libc_malloc,
            calloc: glibc::__libc_calloc,
            realloc: glibc::__libc_realloc,
            free: glibc::__libc_free,
        }
    }

    /// Resolves the raw primitives.
    ///
    /// Aborts the process if any of them cannot be found, as there is no way to
    /// continue intercepting allocations without them.
    #[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
    #[must_use]
    pub fn resolve() -> Self {
        use std::mem::transmute;

        let malloc = lookup_next(c"malloc");
        let calloc = lookup_next(c"calloc");
        let realloc = lookup_next(c"realloc");
        let free = lookup_next(c"free");

        // SAFETY: Each symbol is the next definition of the libc function with the same
        // name, so it has exactly the C signature we transmute it to.
        unsafe {
            Self {
                malloc: transmute::<*mut c_void, MallocFn>(malloc),
                calloc: transmute::<*mut c_void, CallocFn>(calloc),
                realloc: transmute::<*mut c_void, ReallocFn>(realloc),
                free: transmute::<*mut c_void, FreeFn>(free),
            }
        }
    }
}

#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
fn lookup_next(name: &CStr) -> *mut c_void {
    // SAFETY: `name` is a valid C string and RTLD_NEXT is a valid pseudo-handle.
    let symbol = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };

    if symbol.is_null() {
        fatal(b"leak_tracer: unable to resolve a raw allocation primitive\n");
    }

    symbol
}

// SAFETY: The resolved functions are the platform allocator itself, which satisfies
// MIN_ALIGN and never calls back into our interception layer.
unsafe impl RawAllocator for Resolved {
    #[inline]
    fn malloc(&self, size: usize) -> *mut u8 {
        // SAFETY: malloc may be called with any size.
        unsafe { (self.malloc)(size) }.cast()
    }

    #[inline]
    fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        // SAFETY: calloc may be called with any count and size, it checks for overflow.
        unsafe { (self.calloc)(count, size) }.cast()
    }

    #[inline]
    unsafe fn realloc(&self, block: *mut u8, size: usize) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantee that the block came from us.
        unsafe { (self.realloc)(block.cast(), size) }.cast()
    }

    #[inline]
    unsafe fn free(&self, block: *mut u8) {
        // SAFETY: Forwarding the caller's guarantee that the block came from us.
        unsafe { (self.free)(block.cast()) }
    }
}

/// Calls the platform `malloc` family through the normal symbol binding.
///
/// Only valid when this crate is not the one interposing those symbols, e.g. for a
/// Rust program that intercepts through [`Allocator`](crate::Allocator) or for
/// tracers constructed directly in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct Libc;

// SAFETY: The platform allocator satisfies MIN_ALIGN. Per the type's contract it is only
// used when these symbols are not interposed by us.
unsafe impl RawAllocator for Libc {
    #[inline]
    fn malloc(&self, size: usize) -> *mut u8 {
        // SAFETY: malloc may be called with any size.
        unsafe { libc::malloc(size) }.cast()
    }

    #[inline]
    fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        // SAFETY: calloc may be called with any count and size, it checks for overflow.
        unsafe { libc::calloc(count, size) }.cast()
    }

    #[inline]
    unsafe fn realloc(&self, block: *mut u8, size: usize) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantee that the block came from us.
        unsafe { libc::realloc(block.cast(), size) }.cast()
    }

    #[inline]
    unsafe fn free(&self, block: *mut u8) {
        // SAFETY: Forwarding the caller's guarantee that the block came from us.
        unsafe { libc::free(block.cast()) }
    }
}

const ARENA_SIZE: usize = 64 * 1024;
const ARENA_HEADER: usize = MIN_ALIGN;

#[repr(C, align(16))]
struct ArenaStorage(UnsafeCell<[u8; ARENA_SIZE]>);

/// A small static bump arena serving allocations that arrive while the raw
/// primitives are still being resolved.
///
/// On platforms where resolution goes through the dynamic loader, the loader may
/// call `malloc` or `calloc` on the very thread that is resolving them. Those calls
/// cannot be forwarded anywhere yet, so they are carved out of this arena instead.
///
/// Blocks start zeroed, are never reused and carry a header holding their size so a
/// later `realloc` can move them into real memory.
pub struct BootstrapArena {
    storage: ArenaStorage,
    used: AtomicUsize,
}

// SAFETY: Disjoint ranges of the storage are handed out through an atomic bump
// counter, so no two threads ever receive overlapping blocks.
unsafe impl Sync for BootstrapArena {}

impl BootstrapArena {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            storage: ArenaStorage(UnsafeCell::new([0; ARENA_SIZE])),
            used: AtomicUsize::new(0),
        }
    }

    /// Carves a zeroed block of `size` bytes out of the arena.
    ///
    /// Returns null once the arena is exhausted.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let Some(reserved) = size
            .checked_add(ARENA_HEADER)
            .and_then(|total| total.checked_next_multiple_of(MIN_ALIGN))
        else {
            return ptr::null_mut();
        };

        let mut offset = self.used.load(atomic::Ordering::Relaxed);

        loop {
            let Some(end) = offset.checked_add(reserved).filter(|end| *end <= ARENA_SIZE)
            else {
                return ptr::null_mut();
            };

            match self.used.compare_exchange_weak(
                offset,
                end,
                atomic::Ordering::Relaxed,
                atomic::Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => offset = actual,
            }
        }

        // SAFETY: offset..offset+reserved lies within the storage, as checked above,
        // and was reserved exclusively for us by the compare-exchange.
        let header = unsafe { self.storage.0.get().cast::<u8>().add(offset) };

        // SAFETY: The header is MIN_ALIGN aligned (storage is 16-aligned and offsets are
        // multiples of MIN_ALIGN) and lies inside our reserved range.
        unsafe {
            header.cast::<usize>().write(size);
        }

        // SAFETY: ARENA_HEADER bytes into our reserved range, still in bounds.
        unsafe { header.add(ARENA_HEADER) }
    }

    /// Whether `block` points into this arena.
    #[must_use]
    pub fn contains(&self, block: *const u8) -> bool {
        let start = self.storage.0.get().cast::<u8>().addr();
        let address = block.addr();

        address >= start && address < start.wrapping_add(ARENA_SIZE)
    }

    /// The size that was requested for an arena block.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by [`allocate()`](Self::allocate) on this arena.
    #[must_use]
    pub unsafe fn block_size(&self, block: *const u8) -> usize {
        // SAFETY: The caller guarantees the block came from us, so its header sits
        // right before it and is aligned for usize.
        unsafe { block.sub(ARENA_HEADER).cast::<usize>().read() }
    }

    /// Number of arena bytes consumed so far, headers and padding included.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(atomic::Ordering::Relaxed)
    }
}

impl Default for BootstrapArena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BootstrapArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapArena")
            .field("used", &self.used())
            .field("capacity", &ARENA_SIZE)
            .finish()
    }
}

/// Writes `message` to stderr without allocating and aborts the process.
#[cfg_attr(test, mutants::skip)] // Aborts the test process, cannot be observed.
pub(crate) fn fatal(message: &[u8]) -> ! {
    // SAFETY: The buffer is valid for its length. A failed write is irrelevant as we
    // are about to abort anyway.
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
    }

    // SAFETY: abort has no preconditions.
    unsafe { libc::abort() }
}
