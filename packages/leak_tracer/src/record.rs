//! Metadata kept for every live, tracked allocation.

use std::fmt;
use std::mem::MaybeUninit;

/// Number of return addresses captured per allocation.
pub const CALL_STACK_DEPTH: usize = 5;

/// Which allocation form created a block, and therefore which release form must
/// eventually retire it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum AllocationKind {
    /// A single object: `operator new`, the C primitives and Rust allocations.
    Scalar,

    /// An array: `operator new[]`.
    Array,
}

impl fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar => f.write_str("scalar"),
            Self::Array => f.write_str("array"),
        }
    }
}

/// A point in time read from one of the system clocks, with nanosecond resolution.
///
/// The clock is read with `clock_gettime`, which neither allocates nor takes locks
/// and is therefore safe to call from the interception path.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Timestamp {
    secs: u64,
    nanos: u32,
}

impl Timestamp {
    /// The clock epoch, also used when a clock cannot be read.
    pub const ZERO: Self = Self { secs: 0, nanos: 0 };

    /// Creates a timestamp from whole seconds and a sub-second nanosecond part.
    ///
    /// # Panics
    ///
    /// Panics if `nanos` is not less than one billion.
    #[must_use]
    pub const fn from_parts(secs: u64, nanos: u32) -> Self {
        assert!(nanos < 1_000_000_000, "sub-second part must be below one second");

        Self { secs, nanos }
    }

    /// Reads the monotonic clock.
    #[must_use]
    pub fn monotonic_now() -> Self {
        read_clock(libc::CLOCK_MONOTONIC)
    }

    /// Reads the wall clock.
    #[must_use]
    pub fn realtime_now() -> Self {
        read_clock(libc::CLOCK_REALTIME)
    }

    /// Whole seconds since the clock's epoch.
    #[must_use]
    pub const fn secs(&self) -> u64 {
        self.secs
    }

    /// The sub-second part, in nanoseconds.
    #[must_use]
    pub const fn subsec_nanos(&self) -> u32 {
        self.nanos
    }

    /// The timestamp as fractional seconds.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "report output only needs microsecond precision"
    )]
    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + f64::from(self.nanos) / 1_000_000_000.0
    }
}

fn read_clock(clock: libc::clockid_t) -> Timestamp {
    let mut time = MaybeUninit::<libc::timespec>::uninit();

    // SAFETY: The pointer is valid for writing one timespec.
    let result = unsafe { libc::clock_gettime(clock, time.as_mut_ptr()) };

    if result != 0 {
        return Timestamp::ZERO;
    }

    // SAFETY: clock_gettime succeeded, so it filled in the value.
    let time = unsafe { time.assume_init() };

    Timestamp {
        secs: u64::try_from(time.tv_sec).unwrap_or(0),
        nanos: u32::try_from(time.tv_nsec).unwrap_or(0),
    }
}

/// Return addresses of the code that requested an allocation, most recent caller first.
///
/// Holds up to [`CALL_STACK_DEPTH`] frames. A zero entry marks the end of the
/// captured frames; nothing after it is meaningful.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct CallStack {
    frames: [usize; CALL_STACK_DEPTH],
}

impl CallStack {
    /// A call stack with no frames.
    pub const EMPTY: Self = Self {
        frames: [0; CALL_STACK_DEPTH],
    };

    /// Creates a call stack from explicit return addresses.
    ///
    /// Capture stops at the first zero address and at [`CALL_STACK_DEPTH`] entries.
    #[must_use]
    pub fn from_frames(addresses: &[usize]) -> Self {
        let mut stack = Self::EMPTY;

        for (slot, address) in stack
            .frames
            .iter_mut()
            .zip(addresses.iter().copied().take_while(|address| *address != 0))
        {
            *slot = address;
        }

        stack
    }

    /// Captures the calling thread's stack.
    ///
    /// `skip` is the number of innermost frames to leave out, counted from the caller
    /// of this function. Frame skipping is best effort because inlining decisions move
    /// frames around.
    ///
    /// Walking the stack may allocate the first time it happens on a thread, so the
    /// caller must have the reentrancy guard raised.
    #[inline(never)]
    #[must_use]
    pub fn capture(skip: usize) -> Self {
        let mut stack = Self::EMPTY;
        let mut captured = 0_usize;

        // One extra frame for this function itself.
        let mut to_skip = skip.saturating_add(1);

        backtrace::trace(|frame| {
            if to_skip > 0 {
                to_skip = to_skip.wrapping_sub(1);
                return true;
            }

            let address = frame.ip().addr();

            let Some(slot) = stack.frames.get_mut(captured) else {
                return false;
            };

            if address == 0 {
                return false;
            }

            *slot = address;
            captured = captured.wrapping_add(1);

            captured < CALL_STACK_DEPTH
        });

        stack
    }

    /// The captured return addresses, up to the first absent frame.
    #[must_use]
    pub fn frames(&self) -> &[usize] {
        let len = self
            .frames
            .iter()
            .position(|address| *address == 0)
            .unwrap_or(CALL_STACK_DEPTH);

        self.frames.get(..len).unwrap_or_default()
    }

    /// Whether no frames were captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames().is_empty()
    }
}

impl fmt::Debug for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames().iter().map(|address| Hex(*address)))
            .finish()
    }
}

/// Renders the frames space-separated in hexadecimal, the way they appear in reports.
impl fmt::Display for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, address) in self.frames().iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }

            write!(f, "{:#x}", *address)?;
        }

        Ok(())
    }
}

struct Hex(usize);

impl fmt::Debug for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Everything known about one live, tracked allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct AllocationRecord {
    /// Requested size in bytes at allocation or at the latest in-place reallocation.
    pub size: usize,

    /// The form the block was allocated with.
    pub kind: AllocationKind,

    /// Monotonic clock reading taken at registration.
    pub timestamp: Timestamp,

    /// Where the allocation was requested from.
    pub call_stack: CallStack,
}

impl AllocationRecord {
    /// Creates a record.
    #[must_use]
    pub const fn new(
        size: usize,
        kind: AllocationKind,
        timestamp: Timestamp,
        call_stack: CallStack,
    ) -> Self {
        Self {
            size,
            kind,
            timestamp,
            call_stack,
        }
    }
}
