// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! cpufreq policies as exposed under `/sys/devices/system/cpu/cpufreq`.
//!
//! Each policy directory becomes one governor domain. Frequencies are set
//! through the `userspace` governor's `scaling_setspeed` file. The governor
//! that was active before is restored when the actuator is dropped.

use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::debug;
use log::info;
use log::warn;
use scx_cpufreq::read_cpulist;
use scx_cpufreq::BlockingActuator;
use scx_cpufreq::Cpumask;
use scx_cpufreq::DomainId;
use scx_cpufreq::DomainSpec;
use scx_cpufreq::Freq;
use scx_cpufreq::FreqLimits;
use scx_cpufreq::FreqResolver;
use scx_cpufreq::NonBlockingActuator;
use scx_cpufreq::SCHED_CAPACITY_SCALE;

const CPU_DIR: &str = "sys/devices/system/cpu";

pub fn read_from_file<T>(path: &Path) -> Result<T>
where
    T: std::str::FromStr,
{
    let val = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to open or read file {:?}", path))?;
    let val = val.trim_end_matches('\0').trim();

    match val.parse::<T>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => bail!("Failed to parse content '{}' from {:?}", val, path),
    }
}

/// Number of possible CPU ids.
pub fn nr_cpu_ids(root: &Path) -> Result<usize> {
    let path = root.join(CPU_DIR).join("possible");
    let cpulist = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    let cpus = read_cpulist(&cpulist)?;
    cpus.iter()
        .max()
        .map(|max| max + 1)
        .ok_or_else(|| anyhow!("No possible CPUs in {:?}", path))
}

/// Capacity of each CPU, full scale when the kernel does not report one.
pub fn cpu_capacities(root: &Path, nr_cpus: usize) -> Vec<u64> {
    (0..nr_cpus)
        .map(|cpu| {
            let path = root.join(CPU_DIR).join(format!("cpu{}/cpu_capacity", cpu));
            read_from_file(&path).unwrap_or(SCHED_CAPACITY_SCALE)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub id: usize,
    pub path: PathBuf,
    pub related: Cpumask,
    pub online: Cpumask,
    /// Supported frequencies in ascending order.
    pub freqs: Vec<Freq>,
    pub cpuinfo_min: Freq,
    pub cpuinfo_max: Freq,
    pub cur: Freq,
    pub transition_latency_ns: u64,
}

impl Policy {
    pub fn read(path: &Path, nr_cpus: usize) -> Result<Policy> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("Bad policy path {:?}", path))?;
        let id = name
            .strip_prefix("policy")
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| anyhow!("Bad policy name {}", name))?;

        let read_mask = |file: &str| -> Result<Cpumask> {
            let cpulist = std::fs::read_to_string(path.join(file))
                .with_context(|| format!("Failed to read {:?}", path.join(file)))?;
            Cpumask::from_cpulist(nr_cpus, &cpulist)
        };
        let related = read_mask("related_cpus")?;
        let online = read_mask("affected_cpus").unwrap_or_else(|_| related.clone());

        let cpuinfo_min: Freq = read_from_file(&path.join("cpuinfo_min_freq"))?;
        let cpuinfo_max: Freq = read_from_file(&path.join("cpuinfo_max_freq"))?;
        let cur: Freq = read_from_file(&path.join("scaling_cur_freq")).unwrap_or(cpuinfo_min);
        let transition_latency_ns: u64 =
            read_from_file(&path.join("cpuinfo_transition_latency")).unwrap_or(0);

        let mut freqs: Vec<Freq> =
            match std::fs::read_to_string(path.join("scaling_available_frequencies")) {
                Ok(list) => list
                    .split_whitespace()
                    .map(|f| f.parse::<Freq>())
                    .collect::<std::result::Result<_, _>>()
                    .with_context(|| format!("Bad frequency list in {:?}", path))?,
                Err(_) => vec![cpuinfo_min, cpuinfo_max],
            };
        freqs.sort_unstable();
        freqs.dedup();

        Ok(Policy {
            id,
            path: path.to_path_buf(),
            related,
            online,
            freqs,
            cpuinfo_min,
            cpuinfo_max,
            cur,
            transition_latency_ns,
        })
    }

    pub fn read_limits(&self) -> Result<FreqLimits> {
        Ok(FreqLimits {
            min: read_from_file(&self.path.join("scaling_min_freq"))?,
            max: read_from_file(&self.path.join("scaling_max_freq"))?,
        })
    }

    pub fn domain_spec(&self) -> Result<DomainSpec> {
        let mut spec = DomainSpec::new(
            DomainId(self.id),
            self.related.clone(),
            self.freqs.iter().map(|&f| Some(f)).collect(),
        );
        spec.online = self.online.clone();
        spec.cpuinfo_min = self.cpuinfo_min;
        spec.cpuinfo_max = self.cpuinfo_max;
        spec.cur_freq = self.cur;
        spec.transition_latency_ns = self.transition_latency_ns;
        spec.limits = self.read_limits()?;
        Ok(spec)
    }
}

/// All cpufreq policies under `root`, ordered by policy id.
pub fn discover_policies(root: &Path, nr_cpus: usize) -> Result<Vec<Policy>> {
    let pattern = root.join(CPU_DIR).join("cpufreq/policy*");
    let pattern = pattern
        .to_str()
        .ok_or_else(|| anyhow!("Bad sysfs root {:?}", root))?;

    let mut policies = vec![];
    for entry in glob(pattern)? {
        let path = entry?;
        let policy = Policy::read(&path, nr_cpus)?;
        debug!(
            "policy{}: cpus={} freqs={:?}",
            policy.id, policy.related, policy.freqs
        );
        policies.push(policy);
    }
    if policies.is_empty() {
        bail!("No cpufreq policies found under {}", pattern);
    }
    policies.sort_by_key(|p| p.id);
    Ok(policies)
}

/// Actuator writing `scaling_setspeed` of one policy.
#[derive(Debug)]
pub struct SysfsActuator {
    path: PathBuf,
    freqs: Vec<Freq>,
    prev_governor: Option<String>,
}

impl SysfsActuator {
    /// Switch the policy to the `userspace` governor.
    pub fn new(policy: &Policy) -> Result<SysfsActuator> {
        let gov_path = policy.path.join("scaling_governor");
        let prev: String = read_from_file(&gov_path)?;
        if prev != "userspace" {
            std::fs::write(&gov_path, "userspace")
                .with_context(|| format!("Failed to select userspace governor for {:?}", policy.path))?;
            info!("policy{}: {} -> userspace", policy.id, prev);
        }

        Ok(SysfsActuator {
            path: policy.path.clone(),
            freqs: policy.freqs.clone(),
            prev_governor: Some(prev),
        })
    }

    fn write_speed(&self, dom: DomainId, freq: Freq) -> Option<Freq> {
        match std::fs::write(self.path.join("scaling_setspeed"), freq.to_string()) {
            Ok(()) => Some(freq),
            Err(e) => {
                warn!("policy{}: failed to set {}kHz: {}", dom, freq, e);
                None
            }
        }
    }
}

impl FreqResolver for SysfsActuator {
    /// Lowest supported frequency at or above `freq`.
    fn resolve_freq(&self, _dom: DomainId, freq: Freq) -> Freq {
        self.freqs
            .iter()
            .copied()
            .find(|&f| f >= freq)
            .or_else(|| self.freqs.last().copied())
            .unwrap_or(freq)
    }
}

impl NonBlockingActuator for SysfsActuator {
    fn fast_switch(&self, dom: DomainId, freq: Freq) -> Option<Freq> {
        self.write_speed(dom, freq)
    }
}

impl BlockingActuator for SysfsActuator {
    fn set_target(&self, dom: DomainId, freq: Freq) -> Option<Freq> {
        self.write_speed(dom, freq)
    }
}

impl Drop for SysfsActuator {
    fn drop(&mut self) {
        if let Some(prev) = self.prev_governor.take().filter(|p| p != "userspace") {
            if let Err(e) = std::fs::write(self.path.join("scaling_governor"), &prev) {
                warn!("Failed to restore governor {} for {:?}: {}", prev, self.path, e);
            }
        }
    }
}
