// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-domain controller.
//!
//! A [`DomainCore`] owns the samples of its CPUs and the decision state of
//! the domain. Every report stores its sample under the slot lock, then
//! takes the domain lock to evaluate, decide and dispatch. The domain lock
//! is always taken before any slot lock during aggregation, and writers drop
//! their slot lock before taking the domain lock.
//!
//! Deferred domains own a worker thread that performs the blocking actuator
//! calls. At most one request is outstanding at a time, tracked by
//! `work_in_progress`.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use crossbeam::channel::unbounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use log::debug;
use log::trace;
use log::warn;

use crate::actuator::Actuator;
use crate::actuator::BlockingActuator;
use crate::actuator::FreqResolver;
use crate::actuator::NonBlockingActuator;
use crate::capacity::CapacityTable;
use crate::ratelimit::RateLimiter;
use crate::ratelimit::RateMode;
use crate::sample::CpuSample;
use crate::tunables::Tunables;
use crate::types::DomainId;
use crate::types::FreqLimits;
use crate::types::Freq;
use crate::types::TimeNs;
use crate::types::UpdateFlags;

/// Real-time priority of deferred workers.
const WORKER_RT_PRIORITY: libc::c_int = 50;

/// Messages for the deferred worker.
pub(crate) enum Work {
    /// Apply the current `next_freq`.
    Target,
    /// Pull the hardware frequency into new limits, then ack.
    Limits(FreqLimits, Sender<()>),
    /// Ack once everything queued before has been handled.
    Flush(Sender<()>),
    Exit,
}

enum Dispatch {
    Inline(Arc<dyn NonBlockingActuator>),
    Deferred {
        resolver: Arc<dyn FreqResolver>,
        tx: Sender<Work>,
    },
}

/// State restored when a deferred request fails.
#[derive(Debug, Clone, Copy)]
struct Rollback {
    next_freq: Option<Freq>,
    last_update: TimeNs,
}

#[derive(Debug)]
struct Controller {
    limiter: RateLimiter,
    tunables_gen: u64,
    boost_percent: u32,
    /// Last requested frequency, `None` until the first decision.
    next_freq: Option<Freq>,
    cur_freq: Freq,
    last_update: TimeNs,
    need_freq_update: bool,
    limits: FreqLimits,
    shared: bool,
    online_slots: Vec<usize>,
    stopped: bool,
    rollback: Option<Rollback>,
}

#[derive(Debug, Default)]
struct Counters {
    changes: AtomicU64,
    rate_limited: AtomicU64,
    busy: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time view of a domain for reporting.
#[derive(Debug, Clone)]
pub struct DomainStats {
    pub id: DomainId,
    pub cpus: String,
    pub started: bool,
    pub shared: bool,
    pub inline: bool,
    pub cur_freq: Freq,
    pub next_freq: Option<Freq>,
    pub limits: FreqLimits,
    pub up_delay_ns: u64,
    pub down_delay_ns: u64,
    pub boost_percent: u32,
    pub display_suspended: bool,
    pub work_in_progress: bool,
    pub changes: u64,
    pub rate_limited: u64,
    pub busy: u64,
    pub failures: u64,
}

pub(crate) struct DomainInit {
    pub id: DomainId,
    pub cpus: Vec<usize>,
    pub table: CapacityTable,
    pub cpuinfo_max: Freq,
    pub cur_freq: Freq,
    pub limits: FreqLimits,
    pub tick_ns: TimeNs,
    pub freq_invariant: bool,
    pub iowait_boost_max: u64,
    pub tunables: Tunables,
}

pub(crate) struct DomainCore {
    id: DomainId,
    cpus: Vec<usize>,
    table: CapacityTable,
    cpuinfo_max: Freq,
    tick_ns: TimeNs,
    freq_invariant: bool,
    tunables: Tunables,
    samples: Box<[spin::Mutex<CpuSample>]>,
    ctl: spin::Mutex<Controller>,
    work_in_progress: AtomicBool,
    work_lock: Mutex<()>,
    dispatch: Dispatch,
    counters: Counters,
}

impl DomainCore {
    /// Build the domain and, for deferred actuation, its worker thread.
    pub(crate) fn new(
        init: DomainInit,
        actuator: Actuator,
    ) -> std::io::Result<(Arc<DomainCore>, Option<JoinHandle<()>>)> {
        let values = init.tunables.values();
        let ctl = Controller {
            limiter: RateLimiter::new(values.up_rate_limit_us, values.down_rate_limit_us),
            tunables_gen: init.tunables.generation(),
            boost_percent: values.boost_percent,
            next_freq: None,
            cur_freq: init.cur_freq,
            last_update: 0,
            need_freq_update: true,
            limits: init.limits,
            shared: false,
            online_slots: vec![],
            stopped: true,
            rollback: None,
        };
        let samples = (0..init.cpus.len())
            .map(|_| spin::Mutex::new(CpuSample::new(init.iowait_boost_max)))
            .collect();

        let (dispatch, worker) = match actuator {
            Actuator::Inline(act) => (Dispatch::Inline(act), None),
            Actuator::Deferred { resolver, blocking } => {
                let (tx, rx) = unbounded();
                (Dispatch::Deferred { resolver, tx }, Some((rx, blocking)))
            }
        };

        let core = Arc::new(DomainCore {
            id: init.id,
            cpus: init.cpus,
            table: init.table,
            cpuinfo_max: init.cpuinfo_max,
            tick_ns: init.tick_ns,
            freq_invariant: init.freq_invariant,
            tunables: init.tunables,
            samples,
            ctl: spin::Mutex::new(ctl),
            work_in_progress: AtomicBool::new(false),
            work_lock: Mutex::new(()),
            dispatch,
            counters: Counters::default(),
        });

        let handle = match worker {
            Some((rx, blocking)) => {
                let worker_core = core.clone();
                let handle = thread::Builder::new()
                    .name(format!("freqgov:{}", core.first_cpu()))
                    .spawn(move || worker_core.worker_loop(rx, blocking))?;
                Some(handle)
            }
            None => None,
        };

        Ok((core, handle))
    }

    pub(crate) fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    pub(crate) fn first_cpu(&self) -> usize {
        self.cpus[0]
    }

    pub(crate) fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub(crate) fn slot_of(&self, cpu: usize) -> Option<usize> {
        self.cpus.binary_search(&cpu).ok()
    }

    /// Reset decision state and samples and start accepting reports from
    /// the CPUs in `online_slots`.
    pub(crate) fn start(&self, online_slots: Vec<usize>, display_active: bool) {
        for slot in self.samples.iter() {
            slot.lock().reset(UpdateFlags::NONE);
        }

        let (values, gen) = self.tunables.snapshot();
        let mut ctl = self.ctl.lock();
        ctl.limiter = RateLimiter::new(values.up_rate_limit_us, values.down_rate_limit_us);
        ctl.limiter.set_display(display_active);
        ctl.tunables_gen = gen;
        ctl.boost_percent = values.boost_percent;
        ctl.next_freq = None;
        ctl.last_update = 0;
        ctl.need_freq_update = true;
        ctl.shared = online_slots.len() > 1;
        ctl.online_slots = online_slots;
        ctl.rollback = None;
        ctl.stopped = false;
        self.work_in_progress.store(false, Ordering::Release);
    }

    /// Stop dispatching and wait until the worker has finished whatever was
    /// queued before.
    pub(crate) fn stop(&self) {
        self.ctl.lock().stopped = true;
        if let Dispatch::Deferred { tx, .. } = &self.dispatch {
            let (ack_tx, ack_rx) = unbounded();
            if tx.send(Work::Flush(ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
        }
    }

    /// Ask the worker to exit. The caller joins the thread.
    pub(crate) fn shutdown_worker(&self) {
        if let Dispatch::Deferred { tx, .. } = &self.dispatch {
            let _ = tx.send(Work::Exit);
        }
    }

    pub(crate) fn set_display(&self, active: bool) {
        self.ctl.lock().limiter.set_display(active);
    }

    /// Store new policy limits and force the next evaluation through. Running
    /// deferred domains also pull the hardware frequency into the new window.
    pub(crate) fn limits_changed(&self, limits: FreqLimits) {
        let stopped = {
            let mut ctl = self.ctl.lock();
            ctl.limits = limits;
            ctl.need_freq_update = true;
            ctl.stopped
        };
        if stopped {
            return;
        }

        if let Dispatch::Deferred { tx, .. } = &self.dispatch {
            let (ack_tx, ack_rx) = unbounded();
            if tx.send(Work::Limits(limits, ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
        }
    }

    /// Report path. Never blocks.
    pub(crate) fn update(&self, slot: usize, util: u64, max: u64, flags: UpdateFlags, now: TimeNs) {
        let (util, max) = {
            let mut sample = self.samples[slot].lock();
            sample.record(now, util, max, flags, self.tick_ns);
            (sample.util, sample.max)
        };

        let mut ctl = self.ctl.lock();
        if ctl.stopped {
            return;
        }
        self.sync_tunables(&mut ctl);

        if !self.should_update(&mut ctl, now) {
            return;
        }

        let next = if flags.contains(UpdateFlags::DEADLINE) {
            Some(self.cpuinfo_max)
        } else if ctl.shared {
            self.next_freq_shared(&ctl)
        } else {
            let (util, max) = self.samples[slot].lock().apply_boost(util, max);
            self.next_freq(&ctl, util, max)
        };

        if let Some(next) = next {
            self.commit(&mut ctl, now, next);
        }
    }

    fn sync_tunables(&self, ctl: &mut Controller) {
        if self.tunables.generation() == ctl.tunables_gen {
            return;
        }
        let (values, gen) = self.tunables.snapshot();
        ctl.limiter
            .reconfigure(values.up_rate_limit_us, values.down_rate_limit_us);
        ctl.boost_percent = values.boost_percent;
        ctl.tunables_gen = gen;
    }

    /// Coarse gate.
    fn should_update(&self, ctl: &mut Controller, now: TimeNs) -> bool {
        if self.work_in_progress.load(Ordering::Acquire) {
            self.counters.busy.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if ctl.need_freq_update {
            ctl.need_freq_update = false;
            ctl.next_freq = None;
            return true;
        }

        if ctl.limiter.coarse_allows(now, ctl.last_update) {
            true
        } else {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Pick the busiest CPU among those that reported within a tick of the
    /// last accepted change. Ties go to the lowest CPU id.
    fn next_freq_shared(&self, ctl: &Controller) -> Option<Freq> {
        let mut best: Option<(u64, u64)> = None;

        for &slot in ctl.online_slots.iter() {
            let mut sample = self.samples[slot].lock();
            if sample.is_stale(ctl.last_update, self.tick_ns) {
                sample.iowait_boost = 0;
                continue;
            }
            if sample.flags.contains(UpdateFlags::DEADLINE) {
                return Some(self.cpuinfo_max);
            }

            let (util, max) = (sample.util, sample.max);
            let (util, max) = sample.apply_boost(util, max);
            best = match best {
                Some((best_util, best_max))
                    if (util as u128) * (best_max as u128) <= (best_util as u128) * (max as u128) =>
                {
                    Some((best_util, best_max))
                }
                _ => Some((util, max)),
            };
        }

        let (util, max) = best?;
        self.next_freq(ctl, util, max)
    }

    /// Boost, then look up the capacity table. Without a table hit and
    /// without a previous request, scale the base frequency by utilization.
    fn next_freq(&self, ctl: &Controller, util: u64, max: u64) -> Option<Freq> {
        let boosted = (util as u128) * (100 + ctl.boost_percent as u128) / 100;
        let boosted = boosted.min(u64::MAX as u128) as u64;
        if let Some(freq) = self.table.select(boosted).filter(|&f| f != 0) {
            return Some(freq);
        }
        if ctl.next_freq.is_some() {
            return None;
        }

        let base = u64::from(if self.freq_invariant {
            self.cpuinfo_max
        } else {
            ctl.cur_freq
        });
        let raw = if max == 0 {
            base as u128
        } else {
            (base as u128) * (util.min(max) as u128) / (max as u128)
        };
        let freq = self.resolve_freq(raw.min(Freq::MAX as u128) as Freq);
        (freq != 0).then_some(freq)
    }

    fn resolve_freq(&self, freq: Freq) -> Freq {
        match &self.dispatch {
            Dispatch::Inline(act) => act.resolve_freq(self.id, freq),
            Dispatch::Deferred { resolver, .. } => resolver.resolve_freq(self.id, freq),
        }
    }

    fn commit(&self, ctl: &mut Controller, now: TimeNs, next: Freq) {
        let next = ctl.limits.clamp(next);
        if !ctl
            .limiter
            .direction_allows(now, ctl.last_update, ctl.next_freq, next)
        {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if ctl.next_freq == Some(next) {
            return;
        }

        match &self.dispatch {
            Dispatch::Inline(act) => match act.fast_switch(self.id, next) {
                Some(applied) => {
                    trace!("dom {} switched {} -> {}", self.id, ctl.cur_freq, applied);
                    ctl.next_freq = Some(next);
                    if applied != ctl.cur_freq {
                        ctl.last_update = now;
                        ctl.cur_freq = applied;
                    }
                    self.counters.changes.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    warn!("dom {} failed to switch to {}kHz", self.id, next);
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                }
            },
            Dispatch::Deferred { tx, .. } => {
                let rollback = Rollback {
                    next_freq: ctl.next_freq,
                    last_update: ctl.last_update,
                };
                ctl.next_freq = Some(next);
                ctl.last_update = now;
                ctl.rollback = Some(rollback);
                self.work_in_progress.store(true, Ordering::Release);
                if tx.send(Work::Target).is_err() {
                    warn!("dom {} worker is gone, dropping {}kHz", self.id, next);
                    ctl.next_freq = rollback.next_freq;
                    ctl.last_update = rollback.last_update;
                    ctl.rollback = None;
                    self.work_in_progress.store(false, Ordering::Release);
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                trace!("dom {} queued {}kHz", self.id, next);
                self.counters.changes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn lock_work(&self) -> std::sync::MutexGuard<'_, ()> {
        self.work_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn worker_loop(self: Arc<Self>, rx: Receiver<Work>, act: Arc<dyn BlockingActuator>) {
        set_worker_sched(self.id, &self.cpus);
        debug!("dom {} worker started", self.id);
        while let Ok(work) = rx.recv() {
            match work {
                Work::Target => {
                    let _guard = self.lock_work();
                    self.apply_target(act.as_ref());
                    self.work_in_progress.store(false, Ordering::Release);
                }
                Work::Limits(limits, ack) => {
                    let _guard = self.lock_work();
                    self.apply_limits(act.as_ref(), limits);
                    let _ = ack.send(());
                }
                Work::Flush(ack) => {
                    let _ = ack.send(());
                }
                Work::Exit => break,
            }
        }
        debug!("dom {} worker exiting", self.id);
    }

    fn apply_target(&self, act: &dyn BlockingActuator) {
        let Some(target) = self.ctl.lock().next_freq else {
            return;
        };

        let res = act.set_target(self.id, target);

        let mut ctl = self.ctl.lock();
        let rollback = ctl.rollback.take();
        match res {
            Some(applied) => {
                trace!("dom {} set {} -> {}", self.id, ctl.cur_freq, applied);
                ctl.cur_freq = applied;
            }
            None => {
                warn!("dom {} failed to set {}kHz", self.id, target);
                if let Some(rb) = rollback {
                    ctl.next_freq = rb.next_freq;
                    ctl.last_update = rb.last_update;
                }
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn apply_limits(&self, act: &dyn BlockingActuator, limits: FreqLimits) {
        let cur = {
            let ctl = self.ctl.lock();
            // Queued behind a stop.
            if ctl.stopped {
                return;
            }
            ctl.cur_freq
        };
        let clamped = limits.clamp(cur);
        if clamped == cur {
            return;
        }

        debug!("dom {} clamping {} into [{}, {}]", self.id, cur, limits.min, limits.max);
        match act.set_target(self.id, clamped) {
            Some(applied) => self.ctl.lock().cur_freq = applied,
            None => {
                warn!("dom {} failed to apply limits", self.id);
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn stats(&self, started: bool) -> DomainStats {
        let ctl = self.ctl.lock();
        DomainStats {
            id: self.id,
            cpus: format_cpus(&self.cpus),
            started,
            shared: ctl.shared,
            inline: matches!(self.dispatch, Dispatch::Inline(_)),
            cur_freq: ctl.cur_freq,
            next_freq: ctl.next_freq,
            limits: ctl.limits,
            up_delay_ns: ctl.limiter.up_delay_ns(),
            down_delay_ns: ctl.limiter.down_delay_ns(),
            boost_percent: ctl.boost_percent,
            display_suspended: matches!(ctl.limiter.mode(), RateMode::Suspended { .. }),
            work_in_progress: self.work_in_progress.load(Ordering::Acquire),
            changes: self.counters.changes.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            busy: self.counters.busy.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

/// Run the calling worker thread as `SCHED_FIFO` on the domain's CPUs so
/// blocking actuation is not starved by the load it reacts to. Failing to do
/// so, e.g. without `CAP_SYS_NICE`, only costs latency.
fn set_worker_sched(id: DomainId, cpus: &[usize]) {
    unsafe {
        let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
        for &cpu in cpus.iter().filter(|&&cpu| cpu < libc::CPU_SETSIZE as usize) {
            libc::CPU_SET(cpu, &mut cpu_set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of_val(&cpu_set), &cpu_set) != 0 {
            warn!(
                "dom {} failed to bind worker to CPUs {:?}: {}",
                id,
                cpus,
                std::io::Error::last_os_error()
            );
        }

        let param = libc::sched_param {
            sched_priority: WORKER_RT_PRIORITY,
        };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            warn!(
                "dom {} failed to set SCHED_FIFO for worker: {}",
                id,
                std::io::Error::last_os_error()
            );
        }
    }
}

fn format_cpus(cpus: &[usize]) -> String {
    cpus.iter()
        .map(|cpu| cpu.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
