//! Finds heap blocks that a running process allocates and never releases.
//!
//! The tracer sits underneath every allocation and release the process makes. For each
//! live block it records the size, whether it was allocated in scalar or array form,
//! when it was allocated and the top of the call stack that allocated it. Whatever is
//! still recorded when a report is written is a leak candidate.
//!
//! This package is a development tool, not meant for production use.
//!
//! # Two ways in
//!
//! * For C and C++ programs, the `leak_tracer_preload` package builds
//!   `libleaktracer.so`, which is loaded with `LD_PRELOAD` and replaces `malloc`,
//!   `calloc`, `realloc`, `free` and the C++ allocation operators. Its behavior is
//!   controlled with `LEAKTRACER_*` environment variables (see [`config`]) and a small
//!   C API.
//! * For Rust programs, the [`Allocator`] wrapper is registered as the global
//!   allocator and monitoring is controlled with the functions in [`intercept`].
//!
//! ```
//! use leak_tracer::{Allocator, intercept};
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! fn main() {
//!     intercept::start_monitoring_this_thread();
//!     let kept = Box::leak(Box::new([0_u8; 100]));
//!     intercept::stop_all_monitoring();
//!
//!     let mut report = Vec::new();
//!     intercept::write_leaks(&mut report).unwrap();
//!
//!     let report = String::from_utf8(report).unwrap();
//!     assert!(report.contains("size=100"));
//!     # _ = kept;
//! }
//! ```
//!
//! # Monitoring
//!
//! Nothing is recorded until monitoring starts, either for all threads at once or for
//! individual threads that opt in. Stopping allocation monitoring keeps recording
//! releases, so blocks allocated while monitoring was on are still retired when they
//! are released. Stopping all monitoring freezes the record set for a report.
//!
//! # The engine on its own
//!
//! [`Tracer`] is the whole engine as an ordinary value, independent of the process-wide
//! one. It can be fed events directly, which is how most of the tests use it.
//!
//! # Reentrancy
//!
//! The tracer's own work allocates: stack walking, thread-local setup, logging. All of
//! it runs with the reentrancy guard in [`guard`] raised, so the nested allocation
//! calls pass through untracked instead of recursing.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod allocator;
pub mod bootstrap;
pub mod config;
mod diagnostics;
mod error;
pub mod guard;
pub mod intercept;
mod monitor;
mod pool;
pub mod raw;
mod record;
mod registry;
mod report;
mod signals;
mod tracer;

pub use allocator::*;
pub use bootstrap::{Bootstrap, Context, Stage};
pub use config::{Config, Signal};
pub use diagnostics::*;
pub use error::*;
pub use monitor::*;
pub use pool::*;
pub use raw::{Libc, RawAllocator, Resolved};
pub use record::*;
pub use registry::{DEFAULT_BUCKET_BITS, Iter as RegistryIter, Registry};
pub use report::*;
pub use tracer::*;
