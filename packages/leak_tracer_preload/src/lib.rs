//! `libleaktracer.so`: leak tracking for unmodified programs through `LD_PRELOAD`.
//!
//! ```text
//! LEAKTRACER_AUTO_REPORTFILENAME=leaks.out LD_PRELOAD=./libleaktracer.so ./my_program
//! ```
//!
//! The library replaces `malloc`, `calloc`, `realloc`, `free` and the C++ allocation
//! operators of the process, forwarding every call to the process-wide tracer in
//! `leak_tracer::intercept`. Programs that want finer control link against the C API
//! declared in `include/leaktracer.h`. Everything else is configured through the
//! `LEAKTRACER_*` environment variables.
//!
//! Failed `operator new` calls abort the process instead of throwing `std::bad_alloc`.

use std::alloc::{Layout, handle_alloc_error};
use std::ffi::{CStr, OsStr, c_char, c_void};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use leak_tracer::intercept::{self, UntrackedAllocator};
use leak_tracer::{Anomaly, Error, bootstrap};
use tracing::warn;
use tracing_subscriber::EnvFilter;

// Our own Rust code must not go through the symbols we export.
#[global_allocator]
static ALLOCATOR: UntrackedAllocator = UntrackedAllocator;

/// C `malloc`.
///
/// # Safety
///
/// Called by C code under the usual `malloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    intercept::malloc(size).cast()
}

/// C `calloc`.
///
/// # Safety
///
/// Called by C code under the usual `calloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    intercept::calloc(count, size).cast()
}

/// C `realloc`.
///
/// # Safety
///
/// `block` must be null or a live block from this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(block: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: Forwarding the caller's guarantee.
    unsafe { intercept::realloc(block.cast(), size).cast() }
}

/// C `free`.
///
/// # Safety
///
/// `block` must be null or a live block from this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(block: *mut c_void) {
    // SAFETY: Forwarding the caller's guarantee.
    unsafe { intercept::free(block.cast()) }
}

fn or_abort(block: *mut u8, size: usize) -> *mut c_void {
    if block.is_null() {
        handle_alloc_error(Layout::from_size_align(size, 1).unwrap_or(Layout::new::<u8>()));
    }

    block.cast()
}

/// `operator new(size_t)`.
///
/// # Safety
///
/// Called by C++ code under the usual `operator new` contract.
#[unsafe(export_name = "_Znwm")]
pub unsafe extern "C" fn operator_new(size: usize) -> *mut c_void {
    or_abort(intercept::allocate_scalar(size), size)
}

/// `operator new[](size_t)`.
///
/// # Safety
///
/// Called by C++ code under the usual `operator new[]` contract.
#[unsafe(export_name = "_Znam")]
pub unsafe extern "C" fn operator_new_array(size: usize) -> *mut c_void {
    or_abort(intercept::allocate_array(size), size)
}

/// `operator new(size_t, const std::nothrow_t&)`.
///
/// # Safety
///
/// Called by C++ code under the usual `operator new` contract.
#[unsafe(export_name = "_ZnwmRKSt9nothrow_t")]
pub unsafe extern "C" fn operator_new_nothrow(size: usize, _tag: *const c_void) -> *mut c_void {
    intercept::allocate_scalar(size).cast()
}

/// `operator new[](size_t, const std::nothrow_t&)`.
///
/// # Safety
///
/// Called by C++ code under the usual `operator new[]` contract.
#[unsafe(export_name = "_ZnamRKSt9nothrow_t")]
pub unsafe extern "C" fn operator_new_array_nothrow(
    size: usize,
    _tag: *const c_void,
) -> *mut c_void {
    intercept::allocate_array(size).cast()
}

/// `operator delete(void*)`.
///
/// # Safety
///
/// `block` must be null or a live block from `operator new`.
#[unsafe(export_name = "_ZdlPv")]
pub unsafe extern "C" fn operator_delete(block: *mut c_void) {
    // SAFETY: Forwarding the caller's guarantee.
    unsafe { intercept::release_scalar(block.cast()) }
}

/// `operator delete[](void*)`.
///
/// # Safety
///
/// `block` must be null or a live block from `operator new[]`.
#[unsafe(export_name = "_ZdaPv")]
pub unsafe extern "C" fn operator_delete_array(block: *mut c_void) {
    // SAFETY: Forwarding the caller's guarantee.
    unsafe { intercept::release_array(block.cast()) }
}

/// `operator delete(void*, size_t)`.
///
/// # Safety
///
/// `block` must be null or a live block from `operator new`.
#[unsafe(export_name = "_ZdlPvm")]
pub unsafe extern "C" fn operator_delete_sized(block: *mut c_void, _size: usize) {
    // SAFETY: Forwarding the caller's guarantee.
    unsafe { intercept::release_scalar(block.cast()) }
}

/// `operator delete[](void*, size_t)`.
///
/// # Safety
///
/// `block` must be null or a live block from `operator new[]`.
#[unsafe(export_name = "_ZdaPvm")]
pub unsafe extern "C" fn operator_delete_array_sized(block: *mut c_void, _size: usize) {
    // SAFETY: Forwarding the caller's guarantee.
    unsafe { intercept::release_array(block.cast()) }
}

/// Starts monitoring allocations on every thread.
#[unsafe(export_name = "leaktracer_startMonitoringAllThreads")]
pub extern "C" fn start_monitoring_all_threads() {
    intercept::start_monitoring_all_threads();
}

/// Starts monitoring allocations on the calling thread.
#[unsafe(export_name = "leaktracer_startMonitoringThisThread")]
pub extern "C" fn start_monitoring_this_thread() {
    intercept::start_monitoring_this_thread();
}

/// Stops monitoring allocations. Releases are still monitored.
#[unsafe(export_name = "leaktracer_stopMonitoringAllocations")]
pub extern "C" fn stop_monitoring_allocations() {
    intercept::stop_monitoring_allocations();
}

/// Stops monitoring allocations and releases.
#[unsafe(export_name = "leaktracer_stopAllMonitoring")]
pub extern "C" fn stop_all_monitoring() {
    intercept::stop_all_monitoring();
}

/// Writes a leak report to the named file. Failures are logged.
///
/// # Safety
///
/// `path` must be null or a valid NUL-terminated string.
#[unsafe(export_name = "leaktracer_writeLeaksToFile")]
pub unsafe extern "C" fn write_leaks_to_file(path: *const c_char) {
    if path.is_null() {
        return;
    }

    // SAFETY: The caller guarantees a valid NUL-terminated string.
    let path = unsafe { CStr::from_ptr(path) };
    let path = Path::new(OsStr::from_bytes(path.to_bytes()));

    // Other failures are logged by the tracer itself.
    if let Err(e @ Error::NotReady) = intercept::write_leaks_to_file(path) {
        warn!(path = %path.display(), error = %e, "leak report not written");
    }
}

#[used]
#[unsafe(link_section = ".init_array")]
static INIT: extern "C" fn() = init;

extern "C" fn init() {
    // Usually long done by the time the loader gets to us.
    let Some(tracer) = intercept::tracer() else {
        return;
    };

    let Some(context) = bootstrap::context() else {
        return;
    };

    let config = context.config();

    if let Some(filter) = &config.log_filter {
        _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_writer(io::stderr)
            .try_init();
    }

    if config.banner {
        _ = writeln!(
            io::stderr(),
            "leaktracer {} (shared library)",
            env!("CARGO_PKG_VERSION")
        );
    }

    tracer.set_anomaly_hook(Some(report_anomaly));
}

fn report_anomaly(anomaly: &Anomaly) {
    if !matches!(anomaly, Anomaly::KindMismatch { .. }) {
        return;
    }

    _ = writeln!(io::stderr(), "leaktracer: {anomaly}");

    let trap = bootstrap::context().is_some_and(|context| context.config().trap_on_anomaly);

    if trap {
        // SAFETY: Raising a signal has no memory safety implications. Without a
        // debugger attached the default action ends the process.
        unsafe {
            libc::raise(libc::SIGTRAP);
        }
    }
}
