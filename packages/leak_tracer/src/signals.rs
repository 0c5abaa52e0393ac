//! Remote control of the process-wide tracer through OS signals.
//!
//! The handlers call straight into the tracer, which takes locks and allocates. That is
//! not async-signal-safe. It is good enough for a developer tool that is typically
//! poked once in a while from a shell, but a signal arriving while the interrupted
//! thread holds the registry lock deadlocks that thread.

use std::ffi::c_void;
use std::sync::atomic::{self, AtomicI32};
use std::{io, mem, ptr};

use tracing::{debug, warn};

use crate::bootstrap;
use crate::config::{Config, Signal};

static START_SIGNAL: AtomicI32 = AtomicI32::new(0);
static STOP_SIGNAL: AtomicI32 = AtomicI32::new(0);
static REPORT_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// What a configured signal does.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SignalAction {
    StartAllThreads,
    StopAllMonitoring,
    WriteReport,
}

/// Installs a handler for every signal named in `config`.
///
/// Failures are logged and otherwise ignored.
pub(crate) fn install(config: &Config) {
    let wanted = [
        (&START_SIGNAL, config.start_signal, SignalAction::StartAllThreads),
        (&STOP_SIGNAL, config.stop_signal, SignalAction::StopAllMonitoring),
        (&REPORT_SIGNAL, config.report_signal, SignalAction::WriteReport),
    ];

    for (slot, signal, action) in wanted {
        let Some(signal) = signal else {
            continue;
        };

        slot.store(signal.number(), atomic::Ordering::Relaxed);

        match register(signal) {
            Ok(()) => debug!(%signal, ?action, "signal handler installed"),
            Err(e) => warn!(%signal, ?action, error = %e, "could not install signal handler"),
        }
    }
}

fn register(signal: Signal) -> io::Result<()> {
    // SAFETY: An all-zero sigaction is a valid value to start from.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };

    let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void) = handle;
    action.sa_sigaction = handler as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO;

    // SAFETY: The mask is a valid sigset_t inside our local value.
    unsafe {
        libc::sigemptyset(&raw mut action.sa_mask);
    }

    // SAFETY: The action is fully initialized and the old action is not requested.
    let result = unsafe { libc::sigaction(signal.number(), &raw const action, ptr::null_mut()) };

    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn action_for(signal: i32) -> Option<SignalAction> {
    // A slot that was never configured holds zero, which is not a signal number.
    if signal == START_SIGNAL.load(atomic::Ordering::Relaxed) {
        Some(SignalAction::StartAllThreads)
    } else if signal == STOP_SIGNAL.load(atomic::Ordering::Relaxed) {
        Some(SignalAction::StopAllMonitoring)
    } else if signal == REPORT_SIGNAL.load(atomic::Ordering::Relaxed) {
        Some(SignalAction::WriteReport)
    } else {
        None
    }
}

#[cfg_attr(test, mutants::skip)] // Needs a fully started process-wide tracer.
extern "C" fn handle(signal: libc::c_int, _info: *mut libc::siginfo_t, _context: *mut c_void) {
    // Handlers are only installed during startup, but the signal may arrive before
    // startup completes.
    let Some(context) = bootstrap::context() else {
        return;
    };

    let tracer = context.tracer();

    match action_for(signal) {
        Some(SignalAction::StartAllThreads) => tracer.start_monitoring_all_threads(),
        Some(SignalAction::StopAllMonitoring) => tracer.stop_all_monitoring(),
        Some(SignalAction::WriteReport) => {
            // Failures are logged by the tracer.
            _ = tracer.write_leaks_to_file(&context.config().signal_report_path);
        }
        None => {}
    }
}
