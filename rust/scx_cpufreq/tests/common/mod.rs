#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crossbeam::channel::bounded;
use crossbeam::channel::unbounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;

use scx_cpufreq::*;

pub const T0: TimeNs = 1_000_000_000;
pub const MS: TimeNs = 1_000_000;

/// `n` ascending frequencies starting at 300MHz in 100MHz steps.
pub fn freq_table(n: usize) -> Vec<Option<Freq>> {
    (0..n).map(|i| Some(300_000 + 100_000 * i as Freq)).collect()
}

/// Frequency paired with capacity step `idx` by [`freq_table`].
pub fn step_freq(idx: usize) -> Freq {
    300_000 + 100_000 * idx as Freq
}

pub fn spec(id: usize, cpulist: &str, nr_steps: usize) -> DomainSpec {
    let cpus = Cpumask::from_cpulist(8, cpulist).unwrap();
    DomainSpec::new(DomainId(id), cpus, freq_table(nr_steps))
}

pub fn governor() -> Governor {
    Governor::new(GovernorConfig::new(8))
}

/// Set both rate limits and the boost of a domain's tunables.
pub fn tune(gov: &Governor, id: usize, up_us: u32, down_us: u32, boost: u32) {
    gov.tunables(DomainId(id))
        .unwrap()
        .update(TunableValues {
            up_rate_limit_us: up_us,
            down_rate_limit_us: down_us,
            boost_percent: boost,
        })
        .unwrap();
}

/// Poll `cond` until it holds or a few seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

fn resolve(supported: &[Freq], freq: Freq) -> Freq {
    supported
        .iter()
        .copied()
        .find(|&f| f >= freq)
        .or_else(|| supported.last().copied())
        .unwrap_or(freq)
}

/// Inline actuator that records every switch.
#[derive(Default)]
pub struct MockActuator {
    pub calls: Mutex<Vec<Freq>>,
    pub supported: Vec<Freq>,
    pub fail: AtomicBool,
}

impl MockActuator {
    pub fn with_supported(supported: Vec<Freq>) -> MockActuator {
        MockActuator {
            supported,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Freq> {
        self.calls.lock().unwrap().clone()
    }

    pub fn nr_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl FreqResolver for MockActuator {
    fn resolve_freq(&self, _dom: DomainId, freq: Freq) -> Freq {
        resolve(&self.supported, freq)
    }
}

impl NonBlockingActuator for MockActuator {
    fn fast_switch(&self, _dom: DomainId, freq: Freq) -> Option<Freq> {
        if self.fail.load(Ordering::SeqCst) {
            return None;
        }
        self.calls.lock().unwrap().push(freq);
        Some(freq)
    }
}

/// Blocking actuator whose calls can be held until the test releases them.
pub struct GatedActuator {
    pub gated: AtomicBool,
    pub fail: AtomicBool,
    /// Set by the test once the domain is stopped. Calls after that are
    /// counted as violations.
    pub stopped: AtomicBool,
    pub violations: AtomicUsize,
    pub calls: Mutex<Vec<Freq>>,
    entered_tx: Sender<Freq>,
    entered_rx: Receiver<Freq>,
    release_tx: Sender<()>,
    release_rx: Receiver<()>,
}

impl GatedActuator {
    pub fn new(gated: bool) -> GatedActuator {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = bounded(16);
        GatedActuator {
            gated: AtomicBool::new(gated),
            fail: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            violations: AtomicUsize::new(0),
            calls: Mutex::new(vec![]),
            entered_tx,
            entered_rx,
            release_tx,
            release_rx,
        }
    }

    /// Wait for the worker to enter `set_target` and return the frequency.
    pub fn wait_entered(&self) -> Freq {
        self.entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker never called the actuator")
    }

    pub fn release(&self) {
        self.release_tx.send(()).unwrap();
    }

    pub fn calls(&self) -> Vec<Freq> {
        self.calls.lock().unwrap().clone()
    }
}

impl FreqResolver for GatedActuator {
    fn resolve_freq(&self, _dom: DomainId, freq: Freq) -> Freq {
        freq
    }
}

impl BlockingActuator for GatedActuator {
    fn set_target(&self, _dom: DomainId, freq: Freq) -> Option<Freq> {
        if self.stopped.load(Ordering::SeqCst) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.calls.lock().unwrap().push(freq);
        if self.gated.load(Ordering::SeqCst) {
            let _ = self.entered_tx.send(freq);
            let _ = self.release_rx.recv();
        }
        if self.fail.load(Ordering::SeqCst) {
            None
        } else {
            Some(freq)
        }
    }
}
