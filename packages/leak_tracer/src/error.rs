use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when configuring the tracer or writing leak reports.
///
/// Nothing on the allocation interception path returns these. Problems detected
/// there are reported as [`Anomaly`](crate::Anomaly) values instead, because they
/// must never interrupt the host program.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A signal identifier in the environment could not be understood.
    #[error("invalid signal '{value}': {problem}")]
    InvalidSignal {
        /// The value as it appeared in the environment.
        value: String,

        /// A human-readable description of the problem.
        problem: String,
    },

    /// An on-exit report was requested but no file name was given for it.
    #[error("{variable} is set but no report file name was provided")]
    MissingReportPath {
        /// The variable that requested the report.
        variable: &'static str,
    },

    /// The report file could not be created.
    #[error("failed to write to \"{}\"", path.display())]
    ReportFile {
        /// The file we tried to create.
        path: PathBuf,

        /// The underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// The process-wide tracer was asked for a report before it finished starting up.
    #[error("the process-wide tracer is not initialized yet")]
    NotReady,

    /// Writing the report to an already opened sink failed.
    #[error("failed to write leak report")]
    Report(#[from] io::Error),
}

/// A specialized `Result` type for tracer operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn report_file_error_names_the_path() {
        let error = Error::ReportFile {
            path: PathBuf::from("/nonexistent/leaks.out"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };

        assert_eq!(
            error.to_string(),
            "failed to write to \"/nonexistent/leaks.out\""
        );
    }

    #[test]
    fn io_error_converts_into_report_error() {
        let error: Error = io::Error::from(io::ErrorKind::WriteZero).into();

        assert!(matches!(error, Error::Report(_)));
    }
}
