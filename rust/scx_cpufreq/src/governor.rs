// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Governor
//!
//! Lifecycle manager for all domains plus the per-CPU hook table the load
//! source reports into.
//!
//! A domain moves through `domain_init` -> `domain_start` ->
//! `domain_stop` -> `domain_exit`. `domain_limits_changed` may arrive at any
//! point while the domain exists. Repeated `domain_stop` and `domain_exit`
//! calls are harmless.
//!
//!```rust
//!     use std::sync::Arc;
//!     use scx_cpufreq::*;
//!
//!     struct Hw;
//!     impl FreqResolver for Hw {
//!         fn resolve_freq(&self, _: DomainId, freq: Freq) -> Freq { freq }
//!     }
//!     impl NonBlockingActuator for Hw {
//!         fn fast_switch(&self, _: DomainId, freq: Freq) -> Option<Freq> { Some(freq) }
//!     }
//!
//!     let gov = Governor::new(GovernorConfig::new(4));
//!     let cpus = Cpumask::from_cpulist(4, "0-3").unwrap();
//!     let spec = DomainSpec::new(DomainId(0), cpus, vec![Some(500_000), Some(1_000_000)]);
//!     gov.domain_init(spec, Actuator::inline(Arc::new(Hw))).unwrap();
//!     gov.domain_start(DomainId(0)).unwrap();
//!     gov.report(2, 300, 1024, UpdateFlags::NONE, 1_000_000_000);
//!     gov.domain_stop(DomainId(0)).unwrap();
//!     gov.domain_exit(DomainId(0)).unwrap();
//!```

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread::JoinHandle;

use log::debug;
use log::info;
use log::warn;

use crate::actuator::Actuator;
use crate::actuator::NonBlockingReporter;
use crate::capacity::CapacityModel;
use crate::cpumask::Cpumask;
use crate::domain::DomainCore;
use crate::domain::DomainInit;
use crate::domain::DomainStats;
use crate::error::GovError;
use crate::error::GovResult;
use crate::tunables::TunableValues;
use crate::tunables::Tunables;
use crate::tunables::WeakTunables;
use crate::types::DomainId;
use crate::types::Freq;
use crate::types::FreqLimits;
use crate::types::TimeNs;
use crate::types::UpdateFlags;
use crate::types::DEFAULT_TICK_NS;
use crate::types::SCHED_CAPACITY_SCALE;

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Number of CPU ids the hook table covers.
    pub nr_cpus: usize,
    /// Samples older than this are treated as idle.
    pub tick_ns: TimeNs,
    pub iowait_boost_max: u64,
    /// Give every domain its own tunables instead of one shared instance.
    pub per_policy_tunables: bool,
    /// Utilization is frequency invariant, so the fallback scales the
    /// maximum frequency rather than the current one.
    pub freq_invariant: bool,
}

impl GovernorConfig {
    pub fn new(nr_cpus: usize) -> GovernorConfig {
        GovernorConfig {
            nr_cpus,
            tick_ns: DEFAULT_TICK_NS,
            iowait_boost_max: SCHED_CAPACITY_SCALE,
            per_policy_tunables: false,
            freq_invariant: true,
        }
    }
}

/// Everything the governor needs to know about a domain at init time.
#[derive(Debug, Clone)]
pub struct DomainSpec {
    pub id: DomainId,
    /// All CPUs sharing the frequency decision.
    pub cpus: Cpumask,
    /// CPUs currently reporting, a subset of `cpus`.
    pub online: Cpumask,
    /// Supported frequencies, lowest first. `None` marks an invalid entry.
    pub freq_table: Vec<Option<Freq>>,
    pub cpuinfo_min: Freq,
    pub cpuinfo_max: Freq,
    pub cur_freq: Freq,
    pub transition_latency_ns: u64,
    pub limits: FreqLimits,
}

impl DomainSpec {
    /// A domain with every CPU online whose bounds and limits come from the
    /// valid entries of `freq_table`.
    pub fn new(id: DomainId, cpus: Cpumask, freq_table: Vec<Option<Freq>>) -> DomainSpec {
        let valid = freq_table.iter().flatten().copied();
        let cpuinfo_min = valid.clone().min().unwrap_or(0);
        let cpuinfo_max = valid.max().unwrap_or(0);
        DomainSpec {
            id,
            online: cpus.clone(),
            cpus,
            freq_table,
            cpuinfo_min,
            cpuinfo_max,
            cur_freq: cpuinfo_min,
            transition_latency_ns: 0,
            limits: FreqLimits {
                min: cpuinfo_min,
                max: cpuinfo_max,
            },
        }
    }
}

#[derive(Clone)]
struct CpuHook {
    core: Arc<DomainCore>,
    slot: usize,
}

struct Domain {
    core: Arc<DomainCore>,
    online: Cpumask,
    started: bool,
    worker: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    domains: BTreeMap<DomainId, Domain>,
    global_tunables: WeakTunables,
    /// Tunables of exited domains keyed by their first CPU.
    cached_tunables: BTreeMap<usize, TunableValues>,
}

pub struct Governor {
    config: GovernorConfig,
    model: CapacityModel,
    hooks: Box<[spin::RwLock<Option<CpuHook>>]>,
    state: Mutex<State>,
    display_active: AtomicBool,
}

impl Governor {
    /// Governor with the built-in capacity tables and CPUs 0-1 as the little
    /// class.
    pub fn new(config: GovernorConfig) -> Governor {
        let model = CapacityModel::with_default_classes(config.nr_cpus);
        Self::with_model(config, model)
    }

    pub fn with_model(config: GovernorConfig, model: CapacityModel) -> Governor {
        let hooks = (0..config.nr_cpus)
            .map(|_| spin::RwLock::new(None))
            .collect();
        Governor {
            config,
            model,
            hooks,
            state: Mutex::new(State::default()),
            display_active: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn validate(&self, state: &State, spec: &DomainSpec) -> GovResult<()> {
        let invalid = |msg: String| Err(GovError::InvalidDomain(spec.id, msg));

        if spec.cpus.is_empty() {
            return invalid("no CPUs".into());
        }
        if let Some(cpu) = spec.cpus.iter().find(|&cpu| cpu >= self.config.nr_cpus) {
            return invalid(format!("CPU {} out of range", cpu));
        }
        if !spec.online.is_subset_of(&spec.cpus) {
            return invalid(format!("online CPUs {} not within {}", spec.online, spec.cpus));
        }
        if spec.cpuinfo_max == 0 || spec.cpuinfo_min > spec.cpuinfo_max {
            return invalid(format!(
                "bad frequency range [{}, {}]",
                spec.cpuinfo_min, spec.cpuinfo_max
            ));
        }
        for (id, dom) in state.domains.iter() {
            if let Some(cpu) = dom.core.cpus().iter().find(|&&cpu| spec.cpus.test_cpu(cpu)) {
                return invalid(format!("CPU {} already belongs to domain {}", cpu, id));
            }
        }
        Ok(())
    }

    fn attach_tunables(&self, state: &mut State, spec: &DomainSpec, first_cpu: usize) -> GovResult<Tunables> {
        if !self.config.per_policy_tunables {
            if let Some(tunables) = state.global_tunables.upgrade() {
                return Ok(tunables);
            }
        }

        let values = match state.cached_tunables.get(&first_cpu) {
            Some(values) => *values,
            None => TunableValues::for_latency_ns(spec.transition_latency_ns),
        };
        let tunables = Tunables::new(values)?;
        if !self.config.per_policy_tunables {
            state.global_tunables = tunables.downgrade();
        }
        Ok(tunables)
    }

    /// Attach tunables and prepare the actuation path of a new domain.
    pub fn domain_init(&self, spec: DomainSpec, actuator: Actuator) -> GovResult<()> {
        let mut state = self.state();
        if state.domains.contains_key(&spec.id) {
            return Err(GovError::AlreadyInitialized(spec.id));
        }
        self.validate(&state, &spec)?;

        let cpus: Vec<usize> = spec.cpus.iter().collect();
        let first_cpu = cpus[0];
        let tunables = self.attach_tunables(&mut state, &spec, first_cpu)?;
        let table = self.model.table_for(first_cpu, &spec.freq_table);
        let inline = actuator.is_inline();

        let init = DomainInit {
            id: spec.id,
            cpus,
            table,
            cpuinfo_max: spec.cpuinfo_max,
            cur_freq: spec.cur_freq,
            limits: spec.limits,
            tick_ns: self.config.tick_ns,
            freq_invariant: self.config.freq_invariant,
            iowait_boost_max: self.config.iowait_boost_max,
            tunables,
        };
        // On failure the tunables reference goes away with `init`.
        let (core, worker) =
            DomainCore::new(init, actuator).map_err(|e| GovError::WorkerSpawn(spec.id, e))?;

        debug!(
            "dom {} initialized: cpus={} inline={} tunables refs={}",
            spec.id,
            spec.cpus,
            inline,
            core.tunables().ref_count()
        );
        state.domains.insert(
            spec.id,
            Domain {
                core,
                online: spec.online,
                started: false,
                worker,
            },
        );
        Ok(())
    }

    /// Reset the domain and install hooks on its online CPUs.
    pub fn domain_start(&self, id: DomainId) -> GovResult<()> {
        let mut state = self.state();
        let dom = state
            .domains
            .get_mut(&id)
            .ok_or(GovError::NotInitialized(id))?;
        if dom.started {
            return Err(GovError::AlreadyStarted(id));
        }

        let slots: Vec<usize> = dom
            .online
            .iter()
            .filter_map(|cpu| dom.core.slot_of(cpu))
            .collect();
        dom.core
            .start(slots, self.display_active.load(Ordering::Acquire));

        for cpu in dom.online.iter() {
            if let Some(slot) = dom.core.slot_of(cpu) {
                *self.hooks[cpu].write() = Some(CpuHook {
                    core: dom.core.clone(),
                    slot,
                });
            }
        }
        dom.started = true;
        debug!("dom {} started on {}", id, dom.online);
        Ok(())
    }

    /// Remove the hooks and wait for any outstanding actuation. Once this
    /// returns the actuator is not called again for this domain.
    pub fn domain_stop(&self, id: DomainId) -> GovResult<()> {
        let mut state = self.state();
        let dom = state.domains.get_mut(&id).ok_or(GovError::NotStarted(id))?;
        if !dom.started {
            return Ok(());
        }

        // The write lock waits out reports already running on these CPUs.
        for &cpu in dom.core.cpus() {
            let mut hook = self.hooks[cpu].write();
            if hook.as_ref().is_some_and(|h| Arc::ptr_eq(&h.core, &dom.core)) {
                *hook = None;
            }
        }
        dom.core.stop();
        dom.started = false;
        debug!("dom {} stopped", id);
        Ok(())
    }

    /// Tear down the worker and release the tunables reference.
    pub fn domain_exit(&self, id: DomainId) -> GovResult<()> {
        let mut state = self.state();
        match state.domains.get(&id) {
            None => return Ok(()),
            Some(dom) if dom.started => return Err(GovError::AlreadyStarted(id)),
            Some(_) => {}
        }
        let Some(mut dom) = state.domains.remove(&id) else {
            return Ok(());
        };

        dom.core.shutdown_worker();
        if let Some(worker) = dom.worker.take() {
            if worker.join().is_err() {
                warn!("dom {} worker panicked", id);
            }
        }

        state
            .cached_tunables
            .insert(dom.core.first_cpu(), dom.core.tunables().values());
        debug!("dom {} exited", id);
        Ok(())
    }

    /// New policy limits. The next evaluation bypasses the rate limiter.
    pub fn domain_limits_changed(&self, id: DomainId, limits: FreqLimits) -> GovResult<()> {
        let core = {
            let state = self.state();
            let dom = state.domains.get(&id).ok_or(GovError::NotInitialized(id))?;
            dom.core.clone()
        };
        debug!("dom {} limits [{}, {}]", id, limits.min, limits.max);
        core.limits_changed(limits);
        Ok(())
    }

    /// Replace the online CPUs of a stopped domain, used at the next start.
    pub fn domain_set_online_cpus(&self, id: DomainId, online: Cpumask) -> GovResult<()> {
        let mut state = self.state();
        let dom = state
            .domains
            .get_mut(&id)
            .ok_or(GovError::NotInitialized(id))?;
        if dom.started {
            return Err(GovError::AlreadyStarted(id));
        }
        if online.iter().any(|cpu| dom.core.slot_of(cpu).is_none()) {
            return Err(GovError::InvalidDomain(
                id,
                format!("online CPUs {} not within the domain", online),
            ));
        }
        dom.online = online;
        Ok(())
    }

    /// Widen the rate limits of every domain while the display is off.
    pub fn on_display_state_changed(&self, active: bool) {
        if self.display_active.swap(active, Ordering::AcqRel) == active {
            return;
        }
        info!("display {}", if active { "on" } else { "off" });
        let state = self.state();
        for dom in state.domains.values() {
            dom.core.set_display(active);
        }
    }

    pub fn display_active(&self) -> bool {
        self.display_active.load(Ordering::Acquire)
    }

    /// Configuration surface of a domain.
    pub fn tunables(&self, id: DomainId) -> GovResult<Tunables> {
        let state = self.state();
        let dom = state.domains.get(&id).ok_or(GovError::NotInitialized(id))?;
        Ok(dom.core.tunables().clone())
    }

    pub fn domain_ids(&self) -> Vec<DomainId> {
        self.state().domains.keys().copied().collect()
    }

    pub fn domain_stats(&self, id: DomainId) -> Option<DomainStats> {
        let state = self.state();
        let dom = state.domains.get(&id)?;
        Some(dom.core.stats(dom.started))
    }
}

impl NonBlockingReporter for Governor {
    fn report(&self, cpu: usize, util: u64, max: u64, flags: UpdateFlags, now: TimeNs) {
        let Some(hook) = self.hooks.get(cpu) else {
            return;
        };
        let hook = hook.read();
        if let Some(hook) = hook.as_ref() {
            hook.core.update(hook.slot, util, max, flags, now);
        }
    }
}

impl Governor {
    /// Same as [`NonBlockingReporter::report`], without importing the trait.
    pub fn report(&self, cpu: usize, util: u64, max: u64, flags: UpdateFlags, now: TimeNs) {
        NonBlockingReporter::report(self, cpu, util, max, flags, now)
    }
}

impl Drop for Governor {
    fn drop(&mut self) {
        for id in self.domain_ids() {
            let _ = self.domain_stop(id);
            if let Err(e) = self.domain_exit(id) {
                warn!("dom {} exit failed: {}", id, e);
            }
        }
    }
}
