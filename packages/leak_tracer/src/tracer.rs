use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::diagnostics::{Anomaly, AnomalyCounts, AnomalyHook, Diagnostics};
use crate::monitor::{Monitor, MonitoringState};
use crate::raw::RawAllocator;
use crate::record::{AllocationKind, AllocationRecord, CallStack, Timestamp};
use crate::registry::Registry;
use crate::report::{DataPreview, Leak, LeakSummary};
use crate::{Error, Result, guard};

// The registration function itself. Any further tracer frames are inlined into the
// interception entry points most of the time.
const INTERNAL_FRAMES: usize = 1;

/// The allocation tracking engine.
///
/// Owns the registry of live allocations, the monitoring switches and the anomaly
/// diagnostics. The `register_*` methods record events for blocks that were allocated
/// or released elsewhere. The allocation-shaped methods ([`allocate()`](Self::allocate),
/// [`calloc()`](Self::calloc), [`realloc()`](Self::realloc), [`release()`](Self::release))
/// call the raw allocator and record the outcome in one go, which is what the
/// interception layer uses.
///
/// Every method is safe to call from inside an allocator: events arriving while the
/// calling thread's reentrancy guard is raised are ignored, and all of the tracer's own
/// work that might allocate happens with the guard raised.
///
/// # Examples
///
/// ```
/// use leak_tracer::{AllocationKind, Libc, Tracer};
///
/// let tracer = Tracer::new(Libc);
/// tracer.start_monitoring_all_threads();
///
/// let block = tracer.allocate(64, AllocationKind::Scalar);
/// assert_eq!(tracer.leak_count(), 1);
///
/// // SAFETY: The block came from this tracer's raw allocator.
/// unsafe {
///     tracer.release(block, AllocationKind::Scalar);
/// }
/// assert_eq!(tracer.leak_count(), 0);
/// ```
#[derive(Debug)]
pub struct Tracer<R: RawAllocator> {
    raw: R,
    registry: Mutex<Registry<R>>,
    monitor: Monitor,
    diagnostics: Diagnostics,
}

impl<R: RawAllocator> Tracer<R> {
    /// Creates a tracer with every monitoring switch off.
    #[must_use]
    pub fn new(raw: R) -> Self {
        Self::from_registry(raw, Registry::new(raw))
    }

    /// Creates a tracer whose registry has `2^bits` buckets.
    #[must_use]
    pub fn with_bucket_bits(raw: R, bits: u32) -> Self {
        Self::from_registry(raw, Registry::with_bucket_bits(raw, bits))
    }

    fn from_registry(raw: R, registry: Registry<R>) -> Self {
        Self {
            raw,
            registry: Mutex::new(registry),
            monitor: Monitor::new(),
            diagnostics: Diagnostics::new(),
        }
    }

    /// The raw allocator this tracer forwards to.
    #[must_use]
    pub fn raw(&self) -> &R {
        &self.raw
    }

    /// The monitoring switches.
    #[must_use]
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// The anomaly diagnostics.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Anomaly and skip counts so far.
    #[must_use]
    pub fn anomaly_counts(&self) -> AnomalyCounts {
        self.diagnostics.counts()
    }

    /// Replaces the anomaly hook, returning the previous one.
    pub fn set_anomaly_hook(&self, hook: Option<AnomalyHook>) -> Option<AnomalyHook> {
        self.diagnostics.set_hook(hook)
    }

    /// Allocates `size` bytes from the raw allocator and records the block.
    ///
    /// Returns null if the raw allocator fails. Nothing is recorded in that case.
    pub fn allocate(&self, size: usize, kind: AllocationKind) -> *mut u8 {
        let block = {
            let _suppressed = guard::suppress();
            self.raw.malloc(size)
        };

        // SAFETY: The block is fresh from the raw allocator and `size` bytes long.
        unsafe {
            self.register_allocation(block, size, kind);
        }

        block
    }

    /// Allocates `count * size` zeroed bytes from the raw allocator and records the block.
    pub fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        let block = {
            let _suppressed = guard::suppress();
            self.raw.calloc(count, size)
        };

        // A non-null block means the product did not overflow.
        // SAFETY: The block is fresh from the raw allocator and that many bytes long.
        unsafe {
            self.register_allocation(block, count.wrapping_mul(size), AllocationKind::Scalar);
        }

        block
    }

    /// Resizes a block through the raw allocator and records the outcome.
    ///
    /// # Safety
    ///
    /// `block` must be null or a live block from this tracer's raw allocator.
    pub unsafe fn realloc(&self, block: *mut u8, size: usize) -> *mut u8 {
        let resized = {
            let _suppressed = guard::suppress();

            // SAFETY: Forwarding the caller's guarantee.
            unsafe { self.raw.realloc(block, size) }
        };

        // SAFETY: `resized` is what the raw allocator just returned for `block`.
        unsafe {
            self.register_resize(block, resized, size);
        }

        resized
    }

    /// Retires a block's record and returns the block to the raw allocator.
    ///
    /// The record goes first, so by the time the address can be handed out again its
    /// old record no longer exists.
    ///
    /// # Safety
    ///
    /// `block` must be null or a live block from this tracer's raw allocator.
    pub unsafe fn release(&self, block: *mut u8, kind: AllocationKind) {
        self.register_release(block, kind);

        let _suppressed = guard::suppress();

        // SAFETY: Forwarding the caller's guarantee.
        unsafe {
            self.raw.free(block);
        }
    }

    /// Records a new allocation, if allocations are being captured right now.
    ///
    /// Null blocks are ignored. If no registry node can be obtained the event is
    /// counted as a skipped registration and otherwise ignored.
    ///
    /// # Safety
    ///
    /// `block` must be null or a live block of at least `size` bytes that stays
    /// readable until its release is registered. Reports read from it.
    #[inline(never)]
    pub unsafe fn register_allocation(&self, block: *mut u8, size: usize, kind: AllocationKind) {
        if block.is_null() || guard::is_suppressed() || !self.monitor.is_allocation_monitored() {
            return;
        }

        let _suppressed = guard::suppress();

        let address = block.expose_provenance();
        let record = AllocationRecord::new(
            size,
            kind,
            Timestamp::monotonic_now(),
            CallStack::capture(INTERNAL_FRAMES),
        );

        let inserted = self.registry.lock().insert(address, record).is_some();

        if !inserted {
            self.diagnostics.skipped_registration(address, size);
        }
    }

    /// Refreshes the record of a block that was resized in place.
    ///
    /// Only done while allocations are being captured, and only for blocks that already
    /// have a record.
    ///
    /// # Safety
    ///
    /// As for [`register_allocation()`](Self::register_allocation).
    #[inline(never)]
    pub unsafe fn register_reallocation(&self, block: *mut u8, size: usize, kind: AllocationKind) {
        if block.is_null() || guard::is_suppressed() || !self.monitor.is_allocation_monitored() {
            return;
        }

        let _suppressed = guard::suppress();

        let call_stack = CallStack::capture(INTERNAL_FRAMES);
        let timestamp = Timestamp::monotonic_now();

        if let Some(record) = self.registry.lock().find_mut(block.addr()) {
            record.size = size;
            record.kind = kind;
            record.timestamp = timestamp;
            record.call_stack = call_stack;
        }
    }

    /// Records the outcome of a `realloc` that turned `old` into `new`.
    ///
    /// * Same address: the record is refreshed.
    /// * Moved: the old address is retired and the new one recorded.
    /// * Null result for a non-null block and zero size: the block was released.
    /// * Any other null result: the resize failed and `old` is unchanged.
    ///
    /// # Safety
    ///
    /// `new` must be what the allocator returned when asked to resize `old` to `size`
    /// bytes.
    pub unsafe fn register_resize(&self, old: *mut u8, new: *mut u8, size: usize) {
        if new.is_null() {
            if !old.is_null() && size == 0 {
                self.register_release(old, AllocationKind::Scalar);
            }

            return;
        }

        if new == old {
            // SAFETY: The caller guarantees `new` is the resized block of `size` bytes.
            unsafe {
                self.register_reallocation(new, size, AllocationKind::Scalar);
            }
        } else {
            self.register_release(old, AllocationKind::Scalar);

            // SAFETY: The caller guarantees `new` is the resized block of `size` bytes.
            unsafe {
                self.register_allocation(new, size, AllocationKind::Scalar);
            }
        }
    }

    /// Retires the record of a released block, if releases are being captured.
    ///
    /// A block without a record or released with the wrong form is reported as an
    /// [`Anomaly`]. The record is retired either way.
    pub fn register_release(&self, block: *mut u8, kind: AllocationKind) {
        if block.is_null() || guard::is_suppressed() || !self.monitor.is_release_monitored() {
            return;
        }

        let _suppressed = guard::suppress();

        let address = block.addr();
        let removed = self.registry.lock().remove(address);

        let anomaly = match removed {
            None => Some(Anomaly::UntrackedRelease { address, kind }),
            Some(record) if record.kind != kind => Some(Anomaly::KindMismatch {
                address,
                size: record.size,
                allocated: record.kind,
                released: kind,
            }),
            Some(_) => None,
        };

        if let Some(anomaly) = anomaly {
            self.diagnostics.report(&anomaly);
        }
    }

    /// Starts capturing allocations on every thread.
    ///
    /// If releases were not being captured, the registry is cleared first: records
    /// left from an earlier session may belong to blocks that were released unseen.
    /// Per-thread opt-ins are reset, as the all-thread switch overrides them.
    pub fn start_monitoring_all_threads(&self) {
        let _suppressed = guard::suppress();

        self.enable_releases();
        self.monitor.set_all_threads(true);
        self.monitor.reset_thread_opt_ins();

        debug!("monitoring allocations on all threads");
    }

    /// Starts capturing allocations on the calling thread.
    ///
    /// Does nothing while all threads are being monitored.
    pub fn start_monitoring_this_thread(&self) {
        let _suppressed = guard::suppress();

        if self.monitor.is_all_threads() {
            return;
        }

        self.enable_releases();
        self.monitor.set_this_thread(true);

        debug!("monitoring allocations on this thread");
    }

    /// Stops capturing allocations.
    ///
    /// Turns off the all-thread switch if it is on, otherwise opts the calling thread
    /// out. Releases of tracked blocks are still captured.
    pub fn stop_monitoring_allocations(&self) {
        let _suppressed = guard::suppress();

        if self.monitor.is_all_threads() {
            self.monitor.set_all_threads(false);
        } else {
            self.monitor.set_this_thread(false);
        }

        debug!("stopped monitoring allocations");
    }

    /// Stops capturing allocations as [`stop_monitoring_allocations()`] does, then stops
    /// capturing releases too.
    ///
    /// [`stop_monitoring_allocations()`]: Self::stop_monitoring_allocations
    pub fn stop_all_monitoring(&self) {
        self.stop_monitoring_allocations();

        let _suppressed = guard::suppress();

        // Flipped under the lock so a report in progress keeps reading live blocks.
        {
            let _registry = self.registry.lock();
            self.monitor.set_releases(false);
        }

        debug!("stopped all monitoring");
    }

    /// The current monitoring state.
    #[must_use]
    pub fn state(&self) -> MonitoringState {
        self.monitor.state()
    }

    /// Forgets every record.
    pub fn clear_allocations(&self) {
        let _suppressed = guard::suppress();

        self.registry.lock().clear();
    }

    /// Number of tracked blocks, i.e. the leaks a report written now would contain.
    #[must_use]
    pub fn leak_count(&self) -> usize {
        let _suppressed = guard::suppress();

        self.registry.lock().len()
    }

    /// Copies out every tracked block.
    ///
    /// Block contents are only read while releases are being captured. Otherwise a
    /// tracked block may already be gone and every [`Leak::data`] is empty.
    #[must_use]
    pub fn leaks(&self) -> Vec<Leak> {
        let _suppressed = guard::suppress();

        let registry = self.registry.lock();
        let readable = self.monitor.is_release_monitored();

        registry
            .iter()
            .map(|(address, record)| {
                // SAFETY: `readable` was checked while holding the registry lock.
                let data = unsafe { preview(address, record, readable) };

                Leak::new(address, *record, data)
            })
            .collect()
    }

    /// Writes a leak report for every tracked block.
    ///
    /// Registration is paused while the report is written: this thread's events are
    /// ignored and other threads wait for the registry. The `data` field is empty
    /// unless releases are being captured, as in [`leaks()`](Self::leaks).
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the sink fails.
    pub fn write_leaks(&self, sink: &mut impl Write) -> Result<()> {
        let _suppressed = guard::suppress();

        let summary = LeakSummary::now();
        let registry = self.registry.lock();
        let readable = self.monitor.is_release_monitored();

        writeln!(sink, "{summary}")?;

        for (address, record) in registry.iter() {
            // SAFETY: `readable` was checked while holding the registry lock.
            let data = unsafe { preview(address, record, readable) };

            summary.write_leak(sink, &Leak::new(address, *record, data))?;
        }

        sink.flush()?;

        Ok(())
    }

    /// Writes a leak report to a file, replacing any existing content.
    ///
    /// A failure is also logged, as this is typically called from contexts with
    /// nobody to return the error to.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn write_leaks_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let _suppressed = guard::suppress();

        let path = path.as_ref();

        let result = File::create(path)
            .map_err(|source| Error::ReportFile {
                path: path.to_path_buf(),
                source,
            })
            .and_then(|file| self.write_leaks(&mut BufWriter::new(file)));

        match &result {
            Ok(()) => debug!(path = %path.display(), "leak report written"),
            Err(e) => error!(path = %path.display(), error = %e, "leak report not written"),
        }

        result
    }

    fn enable_releases(&self) {
        if self.monitor.is_release_monitored() {
            return;
        }

        let mut registry = self.registry.lock();

        // Checked again under the lock, another thread may have won the race.
        if !self.monitor.is_release_monitored() {
            registry.clear();
            self.monitor.set_releases(true);
        }
    }
}

/// Reads the start of a tracked block, if it is known to be alive.
///
/// While releases are captured, a block's record is retired under the registry lock
/// before the block goes back to the allocator. Any other time a record may outlive its
/// block, and the block may no longer even be mapped.
///
/// # Safety
///
/// `readable` must be the release capture switch as seen while holding the registry
/// lock that is still held, and `record` must be the record of `address`.
unsafe fn preview(address: usize, record: &AllocationRecord, readable: bool) -> DataPreview {
    if !readable {
        return DataPreview::EMPTY;
    }

    // SAFETY: Releases are captured, so the block is alive and at least `record.size`
    // bytes long until its record is retired, which needs the lock the caller holds.
    unsafe { DataPreview::read(address, record.size) }
}
