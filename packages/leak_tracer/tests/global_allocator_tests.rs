//! Tests for the process-wide tracer, fed by the tracking global allocator.
//!
//! The process-wide tracer is shared by every test in this binary, so each test starts
//! and stops monitoring around its own work and uses block sizes no other test uses.

#![cfg(not(miri))] // Miri replaces the global allocator, so cannot be used here.

use std::hint::black_box;
use std::thread;

use leak_tracer::{Allocator, Error, MonitoringState, intercept};
use serial_test::serial;

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

fn report() -> String {
    let mut report = Vec::new();
    intercept::write_leaks(&mut report).unwrap();
    String::from_utf8(report).unwrap()
}

#[test]
#[serial]
fn leaked_box_is_reported_and_dropped_vec_is_not() {
    intercept::start_monitoring_this_thread();

    let kept = Box::leak(Box::new([b'A'; 333]));
    let released = black_box(vec![b'B'; 777]);
    drop(released);

    // Block contents are only shown while releases are still captured.
    intercept::stop_monitoring_allocations();

    let report = report();
    let expected_data = "A".repeat(50);

    intercept::stop_all_monitoring();

    assert!(report.starts_with("# LeakTracer report diff_utc_mono="), "{report}");
    assert!(
        report.contains(&format!("size=333, data={expected_data}")),
        "{report}"
    );
    assert!(!report.contains("size=777"), "{report}");

    black_box(kept);
}

#[test]
#[serial]
fn other_threads_are_not_recorded_without_opting_in() {
    intercept::start_monitoring_this_thread();

    thread::spawn(|| {
        Box::leak(black_box(Box::new([0_u8; 444])));
    })
    .join()
    .unwrap();

    intercept::stop_all_monitoring();

    assert!(!report().contains("size=444"));
}

#[test]
#[serial]
fn all_threads_monitoring_records_other_threads() {
    intercept::start_monitoring_all_threads();

    let tracer = intercept::tracer().unwrap();
    assert_eq!(tracer.state(), MonitoringState::AllThreads);

    thread::spawn(|| {
        Box::leak(black_box(Box::new([0_u8; 555])));
    })
    .join()
    .unwrap();

    intercept::stop_all_monitoring();
    assert_eq!(tracer.state(), MonitoringState::Idle);

    assert!(report().contains("size=555"));
}

#[test]
#[serial]
fn exited_threads_leave_the_thread_list() {
    let tracer = intercept::tracer().unwrap();
    let before = tracer.monitor().enrolled_threads();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(|| {
                intercept::start_monitoring_this_thread();
                intercept::stop_monitoring_allocations();
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    intercept::stop_all_monitoring();

    assert_eq!(tracer.monitor().enrolled_threads(), before);
}

#[test]
#[serial]
fn report_is_written_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leaks.out");

    intercept::start_monitoring_this_thread();
    let kept = Box::leak(Box::new([b'x'; 666]));
    intercept::stop_all_monitoring();

    intercept::write_leaks_to_file(&path).unwrap();

    let report = std::fs::read_to_string(&path).unwrap();
    assert!(report.contains("size=666"), "{report}");

    black_box(kept);
}

#[test]
#[serial]
fn report_to_missing_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("leaks.out");

    let error = intercept::write_leaks_to_file(&path).unwrap_err();

    assert!(matches!(error, Error::ReportFile { .. }), "{error}");
}
