//! Two-phase startup of the process-wide tracer.
//!
//! Allocation calls start arriving long before any code of ours gets a chance to run
//! on purpose, from the dynamic loader, from libc's own startup and from constructors
//! of other libraries. The first of them, on whatever thread, performs the startup.
//!
//! 1. The symbol phase resolves the raw allocation primitives. Nothing may be
//!    allocated from the interception layer at this point, because there is nowhere
//!    to forward it to yet. Allocations that the resolution itself makes on the
//!    resolving thread see [`Stage::Bootstrapping`] and are served by a static arena.
//! 2. The full phase builds the engine. It only runs on a call that arrives with the
//!    reentrancy guard lowered, so it is never entered from inside the symbol phase or
//!    from inside the tracer itself. While it runs, the process-wide disabler is
//!    raised and every allocation on every thread passes through untracked.
//!
//! Each phase runs exactly once. Concurrent first callers wait for it to finish.

use std::cell::Cell;
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::config::Config;
use crate::raw::Resolved;
use crate::record::CallStack;
use crate::tracer::Tracer;
use crate::{guard, signals};

thread_local! {
    static RESOLVING: Cell<bool> = const { Cell::new(false) };
}

/// How far startup has progressed, as seen by one call.
#[derive(Debug)]
#[non_exhaustive]
pub enum Stage<'a, S, E> {
    /// The calling thread is in the middle of the symbol phase. Nothing is available.
    Bootstrapping,

    /// The symbols are available but the engine is not, either because it is still
    /// being built or because the call arrived with the reentrancy guard raised.
    Resolved(&'a S),

    /// Everything is available.
    Ready(&'a S, &'a E),
}

/// One-time, two-phase initialization of a pair of values.
///
/// `S` is the result of the symbol phase, `E` the engine built from it.
#[derive(Debug)]
pub struct Bootstrap<S, E> {
    symbols: OnceLock<S>,
    engine: OnceLock<E>,
}

impl<S, E> Bootstrap<S, E> {
    /// Creates a bootstrap with neither phase executed.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            symbols: OnceLock::new(),
            engine: OnceLock::new(),
        }
    }

    /// Runs the symbol phase if it has not run yet, then the full phase if it has not
    /// run yet and the reentrancy guard allows it.
    ///
    /// Both phases run with the calling thread's guard raised.
    pub fn setup(
        &self,
        resolve: impl FnOnce() -> S,
        build: impl FnOnce(&S) -> E,
    ) -> Stage<'_, S, E> {
        let Some(symbols) = self.resolve(resolve) else {
            return Stage::Bootstrapping;
        };

        if let Some(engine) = self.engine.get() {
            return Stage::Ready(symbols, engine);
        }

        if guard::is_suppressed() {
            return Stage::Resolved(symbols);
        }

        let engine = self.engine.get_or_init(|| {
            let _suppressed = guard::suppress();
            build(symbols)
        });

        Stage::Ready(symbols, engine)
    }

    /// Runs only the symbol phase, if it has not run yet.
    ///
    /// Returns `None` when called from inside the symbol phase on the thread running it.
    pub fn resolve(&self, resolve: impl FnOnce() -> S) -> Option<&S> {
        if let Some(symbols) = self.symbols.get() {
            return Some(symbols);
        }

        if RESOLVING.get() {
            return None;
        }

        Some(self.symbols.get_or_init(|| {
            let _suppressed = guard::suppress();

            RESOLVING.set(true);
            let _resolving = scopeguard::guard((), |()| RESOLVING.set(false));

            resolve()
        }))
    }

    /// The engine, if the full phase has completed. Never runs either phase.
    #[must_use]
    pub fn engine(&self) -> Option<&E> {
        self.engine.get()
    }

    /// The symbols, if the symbol phase has completed. Never runs either phase.
    #[must_use]
    pub fn symbols(&self) -> Option<&S> {
        self.symbols.get()
    }
}

impl<S, E> Default for Bootstrap<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide engine: the tracer and the configuration it was started with.
#[derive(Debug)]
pub struct Context {
    tracer: Tracer<Resolved>,
    config: Config,
}

impl Context {
    /// The full phase: reads the configuration, builds the tracer and performs the
    /// configured startup actions.
    ///
    /// Invalid configuration is logged and replaced by the defaults.
    #[must_use]
    pub fn build(raw: &Resolved) -> Self {
        let _disabled = guard::disable_process();

        let config = Config::from_env().unwrap_or_else(|e| {
            warn!(error = %e, "invalid leak tracer configuration, using defaults");
            Config::default()
        });

        // The first stack walk on a thread may load unwind tables, which allocates.
        // Better to get that out of the way here than on some allocation later.
        _ = CallStack::capture(0);

        let tracer = Tracer::new(*raw);

        signals::install(&config);

        if config.exit_report.is_some() {
            // SAFETY: The handler is a plain function that stays valid for the life of
            // the process.
            let result = unsafe { libc::atexit(write_exit_report) };

            if result != 0 {
                warn!("could not register the exit report");
            }
        }

        if config.start_all_threads {
            tracer.start_monitoring_all_threads();
        }

        debug!(?config, "leak tracer ready");

        Self { tracer, config }
    }

    /// The process-wide tracer.
    #[must_use]
    pub fn tracer(&self) -> &Tracer<Resolved> {
        &self.tracer
    }

    /// The configuration the process was started with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

static PROCESS: Bootstrap<Resolved, Context> = Bootstrap::new();

/// Advances the process-wide startup as far as the calling context allows.
///
/// Every interception entry point calls this first.
#[inline]
pub fn setup() -> Stage<'static, Resolved, Context> {
    PROCESS.setup(Resolved::resolve, Context::build)
}

/// The raw allocation primitives, resolving them if needed.
///
/// Returns `None` when called from inside the symbol phase on the thread running it.
#[inline]
pub fn raw() -> Option<&'static Resolved> {
    PROCESS.resolve(Resolved::resolve)
}

/// The process-wide context, if startup has completed. Never advances startup.
#[inline]
#[must_use]
pub fn context() -> Option<&'static Context> {
    PROCESS.engine()
}

extern "C" fn write_exit_report() {
    let Some(context) = context() else {
        return;
    };

    let Some(path) = &context.config.exit_report else {
        return;
    };

    context.tracer.stop_all_monitoring();

    // Failures are logged by the tracer and there is nobody left to tell.
    _ = context.tracer.write_leaks_to_file(path);
}
