//! Leak report rendering.
//!
//! A report is line oriented: one summary line, then one line per leak.
//!
//! ```text
//! # LeakTracer report diff_utc_mono=1718000000.123456
//! leak, time=00012.345678, stack=0x55d0c4a1b2c3 0x55d0c4a1b400, size=256, data=hello....
//! ```
//!
//! `time` is the monotonic clock reading at registration. Adding `diff_utc_mono` turns
//! it into wall clock time. `data` shows up to the first 50 bytes of the block with
//! everything outside printable ASCII replaced by `.`.

use std::io::{self, Write};
use std::{fmt, ptr};

use crate::record::{AllocationRecord, Timestamp};

/// Maximum number of block bytes shown per leak.
pub const DATA_PREVIEW_LEN: usize = 50;

const PRECISION: usize = 6;
const NANOS_PER_SEC: i128 = 1_000_000_000;

/// The first bytes of a leaked block, copied while the block was known to be alive.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct DataPreview {
    bytes: [u8; DATA_PREVIEW_LEN],
    len: usize,
}

impl DataPreview {
    /// A preview of no bytes, for blocks whose contents cannot be read safely.
    pub const EMPTY: Self = Self {
        bytes: [0; DATA_PREVIEW_LEN],
        len: 0,
    };

    /// Copies up to [`DATA_PREVIEW_LEN`] bytes from the start of a block.
    ///
    /// # Safety
    ///
    /// `address` must point to a live block of at least `size` readable bytes.
    #[must_use]
    pub unsafe fn read(address: usize, size: usize) -> Self {
        let len = size.min(DATA_PREVIEW_LEN);
        let mut bytes = [0; DATA_PREVIEW_LEN];

        // SAFETY: The caller guarantees `size` readable bytes and we copy at most that
        // many into a local buffer that cannot overlap the block.
        unsafe {
            ptr::copy_nonoverlapping(
                ptr::with_exposed_provenance::<u8>(address),
                bytes.as_mut_ptr(),
                len,
            );
        }

        Self { bytes, len }
    }

    /// Creates a preview from bytes already in hand, keeping at most
    /// [`DATA_PREVIEW_LEN`] of them.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut bytes = [0; DATA_PREVIEW_LEN];
        let len = data.len().min(DATA_PREVIEW_LEN);

        if let (Some(target), Some(source)) = (bytes.get_mut(..len), data.get(..len)) {
            target.copy_from_slice(source);
        }

        Self { bytes, len }
    }

    /// The copied bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.get(..self.len).unwrap_or_default()
    }
}

/// Printable ASCII as is, anything else as `.`.
impl fmt::Display for DataPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use fmt::Write as _;

        for byte in self.as_bytes() {
            let shown = if (0x20..=0x7e).contains(byte) {
                char::from(*byte)
            } else {
                '.'
            };

            f.write_char(shown)?;
        }

        Ok(())
    }
}

impl fmt::Debug for DataPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DataPreview")
            .field(&self.to_string())
            .finish()
    }
}

/// One leaked block, as captured for a report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct Leak {
    /// Address of the block.
    pub address: usize,

    /// What was recorded when the block was allocated.
    pub record: AllocationRecord,

    /// The start of the block's contents at capture time.
    pub data: DataPreview,
}

impl Leak {
    /// Creates a leak entry.
    #[must_use]
    pub const fn new(address: usize, record: AllocationRecord, data: DataPreview) -> Self {
        Self {
            address,
            record,
            data,
        }
    }
}

/// The clock readings a report is rendered against.
///
/// Renders as the report's first line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeakSummary {
    realtime: Timestamp,
    monotonic: Timestamp,
}

impl LeakSummary {
    /// Reads both clocks.
    #[must_use]
    pub fn now() -> Self {
        Self::from_clocks(Timestamp::realtime_now(), Timestamp::monotonic_now())
    }

    /// Uses given clock readings.
    #[must_use]
    pub const fn from_clocks(realtime: Timestamp, monotonic: Timestamp) -> Self {
        Self {
            realtime,
            monotonic,
        }
    }

    /// Seconds to add to a monotonic reading to get wall clock time.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "report output only needs microsecond precision"
    )]
    pub fn diff_utc_mono(&self) -> f64 {
        let difference = total_nanos(self.realtime).wrapping_sub(total_nanos(self.monotonic));

        difference as f64 / 1_000_000_000.0
    }

    /// Width of the `time` field: enough integer digits for the current monotonic
    /// reading, the decimal point and the fraction.
    fn time_width(&self) -> usize {
        let mut digits = 0_usize;
        let mut secs = self.monotonic.secs();

        while secs > 0 {
            secs /= 10;
            digits = digits.wrapping_add(1);
        }

        digits.max(1).wrapping_add(1).wrapping_add(PRECISION)
    }

    /// Writes one leak line.
    ///
    /// # Errors
    ///
    /// Returns whatever error the sink returns.
    pub fn write_leak(&self, sink: &mut impl Write, leak: &Leak) -> io::Result<()> {
        writeln!(
            sink,
            "leak, time={time:0width$.precision$}, stack={stack}, size={size}, data={data}",
            time = leak.record.timestamp.as_secs_f64(),
            width = self.time_width(),
            precision = PRECISION,
            stack = leak.record.call_stack,
            size = leak.record.size,
            data = leak.data,
        )
    }
}

impl fmt::Display for LeakSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "# LeakTracer report diff_utc_mono={:.precision$}",
            self.diff_utc_mono(),
            precision = PRECISION
        )
    }
}

fn total_nanos(timestamp: Timestamp) -> i128 {
    i128::from(timestamp.secs())
        .wrapping_mul(NANOS_PER_SEC)
        .wrapping_add(i128::from(timestamp.subsec_nanos()))
}

/// Writes a complete report: the summary line, then every leak.
///
/// # Errors
///
/// Returns whatever error the sink returns.
pub fn write_report<'a>(
    sink: &mut impl Write,
    summary: &LeakSummary,
    leaks: impl IntoIterator<Item = &'a Leak>,
) -> io::Result<()> {
    writeln!(sink, "{summary}")?;

    for leak in leaks {
        summary.write_leak(sink, leak)?;
    }

    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::record::{AllocationKind, CallStack};

    fn leak(secs: u64, nanos: u32, size: usize, data: &[u8]) -> Leak {
        Leak::new(
            0x1000,
            AllocationRecord::new(
                size,
                AllocationKind::Array,
                Timestamp::from_parts(secs, nanos),
                CallStack::from_frames(&[0xabc, 0xdef]),
            ),
            DataPreview::from_bytes(data),
        )
    }

    fn render(summary: &LeakSummary, leaks: &[Leak]) -> String {
        let mut out = Vec::new();
        write_report(&mut out, summary, leaks).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn summary_line() {
        let summary = LeakSummary::from_clocks(
            Timestamp::from_parts(1_700_000_100, 750_000_000),
            Timestamp::from_parts(100, 250_000_000),
        );

        assert_eq!(
            summary.to_string(),
            "# LeakTracer report diff_utc_mono=1700000000.500000"
        );
    }

    #[test]
    fn summary_with_borrowed_second() {
        let summary = LeakSummary::from_clocks(
            Timestamp::from_parts(1000, 100_000_000),
            Timestamp::from_parts(10, 900_000_000),
        );

        assert_eq!(
            summary.to_string(),
            "# LeakTracer report diff_utc_mono=989.200000"
        );
    }

    #[test]
    fn leak_line_format() {
        let summary = LeakSummary::from_clocks(
            Timestamp::from_parts(2000, 0),
            Timestamp::from_parts(12_345, 0),
        );

        let report = render(&summary, &[leak(42, 5_000_000, 256, b"hello\0\x7fworld\n")]);
        let mut lines = report.lines();

        assert!(lines.next().unwrap().starts_with("# LeakTracer report diff_utc_mono="));
        assert_eq!(
            lines.next().unwrap(),
            "leak, time=00042.005000, stack=0xabc 0xdef, size=256, data=hello..world."
        );
        assert!(lines.next().is_none());
    }

    #[test]
    fn time_is_at_least_one_integer_digit_wide() {
        let summary = LeakSummary::from_clocks(Timestamp::from_parts(5, 0), Timestamp::ZERO);

        let report = render(&summary, &[leak(0, 1_000, 1, b"x")]);

        assert!(report.contains("leak, time=0.000001, "), "{report}");
    }

    #[test]
    fn preview_is_capped() {
        let data = [b'a'; 80];
        let preview = DataPreview::from_bytes(&data);

        assert_eq!(preview.as_bytes().len(), DATA_PREVIEW_LEN);
        assert_eq!(preview.to_string(), "a".repeat(DATA_PREVIEW_LEN));
    }

    #[test]
    fn preview_read_from_memory() {
        let block = *b"abc\x01def";

        // SAFETY: The block is live and 7 bytes long.
        let preview = unsafe { DataPreview::read(block.as_ptr().expose_provenance(), 5) };

        assert_eq!(preview.as_bytes(), b"abc\x01d");
        assert_eq!(preview.to_string(), "abc.d");
    }

    #[test]
    fn empty_report_is_only_the_summary() {
        let report = render(&LeakSummary::now(), &[]);

        assert_eq!(report.lines().count(), 1);
    }

    #[test]
    fn stack_stops_at_first_absent_frame() {
        let summary =
            LeakSummary::from_clocks(Timestamp::from_parts(5, 0), Timestamp::from_parts(5, 0));
        let mut entry = leak(1, 0, 3, b"abc");
        entry.record.call_stack = CallStack::from_frames(&[0x10, 0, 0x30]);

        let report = render(&summary, &[entry]);

        assert!(report.contains("stack=0x10, size=3"), "{report}");
    }
}
