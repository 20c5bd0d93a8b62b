use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use scx_cpufreq::*;

mod common;
use common::*;

fn start_deferred(gov: &Governor, spec: DomainSpec, gated: bool) -> Arc<GatedActuator> {
    let id = spec.id;
    let act = Arc::new(GatedActuator::new(gated));
    gov.domain_init(spec, Actuator::deferred(act.clone())).unwrap();
    tune(gov, id.0, 0, 0, 0);
    gov.domain_start(id).unwrap();
    act
}

fn idle(gov: &Governor, id: usize) -> bool {
    !gov.domain_stats(DomainId(id)).unwrap().work_in_progress
}

#[test]
fn test_worker_applies_request() {
    let gov = governor();
    let act = start_deferred(&gov, spec(0, "4", 25), false);

    gov.report(4, 100, 1024, UpdateFlags::NONE, T0);
    assert!(wait_until(|| idle(&gov, 0)));

    assert_eq!(act.calls(), vec![step_freq(1)]);
    let stats = gov.domain_stats(DomainId(0)).unwrap();
    assert!(!stats.inline);
    assert_eq!(stats.cur_freq, step_freq(1));
    assert_eq!(stats.next_freq, Some(step_freq(1)));
    assert_eq!(stats.changes, 1);
}

/// A request arriving while another is in flight is dropped.
#[test]
fn test_at_most_one_in_flight() {
    let gov = governor();
    let act = start_deferred(&gov, spec(0, "4", 25), true);

    gov.report(4, 100, 1024, UpdateFlags::NONE, T0);
    assert_eq!(act.wait_entered(), step_freq(1));

    gov.report(4, 900, 1024, UpdateFlags::NONE, T0 + MS);
    gov.report(4, 950, 1024, UpdateFlags::NONE, T0 + 2 * MS);
    let stats = gov.domain_stats(DomainId(0)).unwrap();
    assert!(stats.work_in_progress);
    assert_eq!(stats.busy, 2);
    assert_eq!(stats.next_freq, Some(step_freq(1)));

    act.release();
    assert!(wait_until(|| idle(&gov, 0)));
    assert_eq!(act.calls(), vec![step_freq(1)]);

    // The next evaluation after completion sees the current demand.
    gov.report(4, 900, 1024, UpdateFlags::NONE, T0 + 3 * MS);
    assert_eq!(act.wait_entered(), step_freq(22));
    act.release();
    assert!(wait_until(|| idle(&gov, 0)));
    assert_eq!(act.calls(), vec![step_freq(1), step_freq(22)]);
}

/// Stopping waits for the outstanding request and nothing runs afterwards.
#[test]
fn test_stop_waits_for_in_flight() {
    let gov = Arc::new(governor());
    let act = start_deferred(&gov, spec(0, "2-3", 25), true);

    gov.report(2, 100, 1024, UpdateFlags::NONE, T0);
    act.wait_entered();

    let stopped = Arc::new(AtomicBool::new(false));
    let stopper = {
        let gov = gov.clone();
        let stopped = stopped.clone();
        std::thread::spawn(move || {
            gov.domain_stop(DomainId(0)).unwrap();
            stopped.store(true, Ordering::SeqCst);
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    assert!(!stopped.load(Ordering::SeqCst));

    act.release();
    stopper.join().unwrap();
    assert!(stopped.load(Ordering::SeqCst));
    act.stopped.store(true, Ordering::SeqCst);

    gov.report(2, 900, 1024, UpdateFlags::NONE, T0 + 10 * MS);
    gov.report(3, 900, 1024, UpdateFlags::DEADLINE, T0 + 11 * MS);
    gov.domain_exit(DomainId(0)).unwrap();

    assert_eq!(act.violations.load(Ordering::SeqCst), 0);
    assert_eq!(act.calls(), vec![step_freq(1)]);
}

/// A failed blocking call leaves the previous request in place.
#[test]
fn test_failure_rolls_back() {
    let gov = governor();
    let act = start_deferred(&gov, spec(0, "4", 25), false);

    gov.report(4, 100, 1024, UpdateFlags::NONE, T0);
    assert!(wait_until(|| idle(&gov, 0)));

    act.fail.store(true, Ordering::SeqCst);
    gov.report(4, 900, 1024, UpdateFlags::NONE, T0 + MS);
    assert!(wait_until(|| idle(&gov, 0)));
    let stats = gov.domain_stats(DomainId(0)).unwrap();
    assert_eq!(stats.next_freq, Some(step_freq(1)));
    assert_eq!(stats.cur_freq, step_freq(1));
    assert_eq!(stats.failures, 1);

    // Retried on the next evaluation.
    act.fail.store(false, Ordering::SeqCst);
    gov.report(4, 900, 1024, UpdateFlags::NONE, T0 + 2 * MS);
    assert!(wait_until(|| idle(&gov, 0)));
    assert_eq!(
        act.calls(),
        vec![step_freq(1), step_freq(22), step_freq(22)]
    );
    assert_eq!(
        gov.domain_stats(DomainId(0)).unwrap().cur_freq,
        step_freq(22)
    );
}

/// Deferred domains pull the hardware into new limits right away.
#[test]
fn test_limits_clamp_hardware() {
    let gov = governor();
    let act = start_deferred(&gov, spec(0, "4", 25), false);
    assert_eq!(gov.domain_stats(DomainId(0)).unwrap().cur_freq, step_freq(0));

    let limits = FreqLimits {
        min: 1_000_000,
        max: 2_000_000,
    };
    gov.domain_limits_changed(DomainId(0), limits).unwrap();
    assert_eq!(act.calls(), vec![1_000_000]);
    assert_eq!(gov.domain_stats(DomainId(0)).unwrap().cur_freq, 1_000_000);

    // Already inside the window, nothing to do.
    gov.domain_limits_changed(DomainId(0), limits).unwrap();
    assert_eq!(act.calls(), vec![1_000_000]);
}

/// A stopped domain only records new limits and leaves the hardware alone.
#[test]
fn test_limits_while_stopped() {
    let gov = governor();
    let act = start_deferred(&gov, spec(0, "4", 25), false);
    gov.domain_stop(DomainId(0)).unwrap();
    act.stopped.store(true, Ordering::SeqCst);

    let limits = FreqLimits {
        min: 1_000_000,
        max: 2_000_000,
    };
    gov.domain_limits_changed(DomainId(0), limits).unwrap();
    assert_eq!(act.violations.load(Ordering::SeqCst), 0);
    assert!(act.calls().is_empty());
    assert_eq!(gov.domain_stats(DomainId(0)).unwrap().limits, limits);

    // The stored window applies once the domain runs again.
    act.stopped.store(false, Ordering::SeqCst);
    gov.domain_start(DomainId(0)).unwrap();
    gov.report(4, 100, 1024, UpdateFlags::NONE, T0);
    assert!(wait_until(|| idle(&gov, 0)));
    assert_eq!(act.calls(), vec![1_000_000]);
}

#[test]
fn test_exit_joins_worker() {
    let gov = governor();
    let act = start_deferred(&gov, spec(0, "4", 25), false);
    gov.domain_stop(DomainId(0)).unwrap();
    gov.domain_exit(DomainId(0)).unwrap();

    // Only the test's handle is left once the worker is gone.
    assert!(wait_until(|| Arc::strong_count(&act) == 1));
}
