//! Process-wide configuration read from `LEAKTRACER_*` environment variables.

use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::{Error, Result};

/// Write a report when the process exits. Needs a file name.
pub const ONEXIT_REPORT: &str = "LEAKTRACER_ONEXIT_REPORT";

/// File name for the exit report.
pub const ONEXIT_REPORTFILENAME: &str = "LEAKTRACER_ONEXIT_REPORTFILENAME";

/// Monitor all threads from startup and write the exit report to this file.
pub const AUTO_REPORTFILENAME: &str = "LEAKTRACER_AUTO_REPORTFILENAME";

/// Do not print the startup banner.
pub const NOBANNER: &str = "LEAKTRACER_NOBANNER";

/// Signal that starts monitoring all threads.
pub const ONSIG_STARTALLTHREAD: &str = "LEAKTRACER_ONSIG_STARTALLTHREAD";

/// Signal that stops all monitoring.
pub const ONSIG_STOPALLTHREAD: &str = "LEAKTRACER_ONSIG_STOPALLTHREAD";

/// Signal that writes a report.
pub const ONSIG_REPORT: &str = "LEAKTRACER_ONSIG_REPORT";

/// File name for reports triggered by signal.
pub const ONSIG_REPORTFILENAME: &str = "LEAKTRACER_ONSIG_REPORTFILENAME";

/// Monitor all threads from startup.
pub const ONSTART_STARTALLTHREAD: &str = "LEAKTRACER_ONSTART_STARTALLTHREAD";

/// Raise `SIGTRAP` on allocation kind mismatches.
pub const TRAP_ON_ANOMALY: &str = "LEAKTRACER_TRAP_ON_ANOMALY";

/// Log filter directive for the preload library's diagnostic output.
pub const LOG: &str = "LEAKTRACER_LOG";

/// Where signal-triggered reports go unless configured otherwise.
pub const DEFAULT_SIGNAL_REPORT_FILE: &str = "leaks.out";

/// An OS signal number.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Signal(i32);

impl Signal {
    /// `SIGUSR1`.
    pub const USR1: Self = Self(libc::SIGUSR1);

    /// `SIGUSR2`.
    pub const USR2: Self = Self(libc::SIGUSR2);

    /// Wraps a raw signal number.
    ///
    /// # Errors
    ///
    /// Returns an error if the number is not positive.
    pub fn from_number(number: i32) -> Result<Self> {
        if number > 0 {
            Ok(Self(number))
        } else {
            Err(Error::InvalidSignal {
                value: number.to_string(),
                problem: "signal numbers are positive".to_string(),
            })
        }
    }

    /// The raw signal number.
    #[must_use]
    pub const fn number(self) -> i32 {
        self.0
    }

    /// Parses `USR1`, `USR2` (optionally with a `SIG` prefix) or a positive number.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is none of those.
    pub fn parse(value: &str) -> Result<Self> {
        let name = value.trim();
        let name = name.strip_prefix("SIG").unwrap_or(name);

        match name {
            "USR1" => Ok(Self::USR1),
            "USR2" => Ok(Self::USR2),
            number => {
                let number = number.parse::<i32>().map_err(|e| Error::InvalidSignal {
                    value: value.to_string(),
                    problem: e.to_string(),
                })?;

                Self::from_number(number).map_err(|_| Error::InvalidSignal {
                    value: value.to_string(),
                    problem: "signal numbers are positive".to_string(),
                })
            }
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::USR1 => f.write_str("SIGUSR1"),
            Self::USR2 => f.write_str("SIGUSR2"),
            Self(number) => write!(f, "signal {number}"),
        }
    }
}

/// What the tracer does on its own at startup, on signals and at exit.
///
/// The default does nothing beyond printing the banner.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct Config {
    /// Write a report to this file when the process exits.
    pub exit_report: Option<PathBuf>,

    /// Print a banner on stderr when the preload library starts.
    pub banner: bool,

    /// Monitor allocations on all threads from startup.
    pub start_all_threads: bool,

    /// Signal that starts monitoring all threads.
    pub start_signal: Option<Signal>,

    /// Signal that stops all monitoring.
    pub stop_signal: Option<Signal>,

    /// Signal that writes a report to [`signal_report_path`](Self::signal_report_path).
    pub report_signal: Option<Signal>,

    /// Where signal-triggered reports go.
    pub signal_report_path: PathBuf,

    /// Raise `SIGTRAP` on kind mismatches, for stopping in a debugger.
    pub trap_on_anomaly: bool,

    /// Log filter directive for the preload library, logging is off without it.
    pub log_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exit_report: None,
            banner: true,
            start_all_threads: false,
            start_signal: None,
            stop_signal: None,
            report_signal: None,
            signal_report_path: PathBuf::from(DEFAULT_SIGNAL_REPORT_FILE),
            trap_on_anomaly: false,
            log_filter: None,
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a signal cannot be parsed or an exit report is requested
    /// without a file name.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| {
            env::var_os(name).map(|value| value.to_string_lossy().into_owned())
        })
    }

    /// Reads the configuration through `lookup`, which returns the value of a variable
    /// or `None` if it is not set.
    ///
    /// A variable set to the empty string counts as set.
    ///
    /// # Errors
    ///
    /// Returns an error if a signal cannot be parsed or an exit report is requested
    /// without a file name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let is_set = |name: &str| lookup(name).is_some();
        let signal = |name: &str| lookup(name).map(|value| Signal::parse(&value)).transpose();

        let auto_report = lookup(AUTO_REPORTFILENAME);

        let exit_report = if is_set(ONEXIT_REPORT) || auto_report.is_some() {
            let path = lookup(ONEXIT_REPORTFILENAME)
                .or_else(|| auto_report.clone())
                .ok_or(Error::MissingReportPath {
                    variable: ONEXIT_REPORT,
                })?;

            Some(PathBuf::from(path))
        } else {
            None
        };

        Ok(Self {
            exit_report,
            banner: !is_set(NOBANNER),
            start_all_threads: is_set(ONSTART_STARTALLTHREAD) || auto_report.is_some(),
            start_signal: signal(ONSIG_STARTALLTHREAD)?,
            stop_signal: signal(ONSIG_STOPALLTHREAD)?,
            report_signal: signal(ONSIG_REPORT)?,
            signal_report_path: lookup(ONSIG_REPORTFILENAME)
                .map_or_else(|| PathBuf::from(DEFAULT_SIGNAL_REPORT_FILE), PathBuf::from),
            trap_on_anomaly: is_set(TRAP_ON_ANOMALY),
            log_filter: lookup(LOG),
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect();

        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(config(&[]).unwrap(), Config::default());
    }

    #[test]
    fn signal_names_and_numbers() {
        assert_eq!(Signal::parse("USR1").unwrap(), Signal::USR1);
        assert_eq!(Signal::parse("SIGUSR2").unwrap(), Signal::USR2);
        assert_eq!(Signal::parse(" 10 ").unwrap().number(), 10);
        assert_eq!(Signal::parse("SIG12").unwrap().number(), 12);
    }

    #[test]
    fn invalid_signals() {
        for value in ["", "HUP", "0", "-5", "USR3"] {
            let error = Signal::parse(value).unwrap_err();
            assert!(
                matches!(&error, Error::InvalidSignal { value: v, .. } if v == value),
                "{value}: {error}"
            );
        }
    }

    #[test]
    fn signal_display() {
        assert_eq!(Signal::USR1.to_string(), "SIGUSR1");
        assert_eq!(Signal::from_number(3).unwrap().to_string(), "signal 3");
    }

    #[test]
    fn signals_are_read() {
        let config = config(&[
            (ONSIG_STARTALLTHREAD, "USR1"),
            (ONSIG_STOPALLTHREAD, "SIGUSR2"),
            (ONSIG_REPORT, "28"),
            (ONSIG_REPORTFILENAME, "/tmp/sig.out"),
        ])
        .unwrap();

        assert_eq!(config.start_signal, Some(Signal::USR1));
        assert_eq!(config.stop_signal, Some(Signal::USR2));
        assert_eq!(config.report_signal.map(Signal::number), Some(28));
        assert_eq!(config.signal_report_path, PathBuf::from("/tmp/sig.out"));
    }

    #[test]
    fn invalid_signal_is_an_error() {
        let error = config(&[(ONSIG_REPORT, "often")]).unwrap_err();

        assert!(error.to_string().starts_with("invalid signal 'often'"), "{error}");
    }

    #[test]
    fn exit_report_needs_a_file_name() {
        let error = config(&[(ONEXIT_REPORT, "1")]).unwrap_err();
        assert!(matches!(error, Error::MissingReportPath { .. }));

        let config = config(&[(ONEXIT_REPORT, ""), (ONEXIT_REPORTFILENAME, "exit.out")]).unwrap();
        assert_eq!(config.exit_report, Some(PathBuf::from("exit.out")));
        assert!(!config.start_all_threads);
    }

    #[test]
    fn auto_report_starts_monitoring_and_reports_on_exit() {
        let config = config(&[(AUTO_REPORTFILENAME, "auto.out")]).unwrap();

        assert_eq!(config.exit_report, Some(PathBuf::from("auto.out")));
        assert!(config.start_all_threads);
    }

    #[test]
    fn explicit_exit_file_name_wins_over_auto() {
        let config = config(&[
            (AUTO_REPORTFILENAME, "auto.out"),
            (ONEXIT_REPORTFILENAME, "exit.out"),
        ])
        .unwrap();

        assert_eq!(config.exit_report, Some(PathBuf::from("exit.out")));
    }

    #[test]
    fn flags() {
        let config = config(&[
            (NOBANNER, ""),
            (ONSTART_STARTALLTHREAD, "yes"),
            (TRAP_ON_ANOMALY, "1"),
            (LOG, "leak_tracer=debug"),
        ])
        .unwrap();

        assert!(!config.banner);
        assert!(config.start_all_threads);
        assert!(config.trap_on_anomaly);
        assert_eq!(config.log_filter.as_deref(), Some("leak_tracer=debug"));
    }
}
