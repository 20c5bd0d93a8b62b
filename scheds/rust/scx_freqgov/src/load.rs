// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;

use ::fb_procfs as procfs;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use scx_cpufreq::UpdateFlags;

fn sub_or_zero(curr: &u64, prev: &u64) -> u64 {
    curr.checked_sub(*prev).unwrap_or(0u64)
}

/// Per-CPU time split, in microseconds since boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub idle: u64,
    pub iowait: u64,
}

impl TryFrom<&procfs::CpuStat> for CpuTimes {
    type Error = anyhow::Error;

    fn try_from(stat: &procfs::CpuStat) -> Result<CpuTimes> {
        match stat {
            procfs::CpuStat {
                user_usec: Some(user),
                nice_usec: Some(nice),
                system_usec: Some(system),
                idle_usec: Some(idle),
                iowait_usec: Some(iowait),
                irq_usec: Some(irq),
                softirq_usec: Some(softirq),
                stolen_usec: Some(stolen),
                ..
            } => Ok(CpuTimes {
                busy: user + nice + system + irq + softirq + stolen,
                idle: *idle,
                iowait: *iowait,
            }),
            _ => bail!("Missing stats in cpustat"),
        }
    }
}

/// Turn two snapshots of a CPU's times into a utilization on the
/// `[0, capacity]` scale plus update flags.
///
/// The CPU is flagged as waiting on IO when the iowait share of the interval
/// reaches `iowait_thresh` (0.0 disables the flag). An interval with no time
/// accounted reads as fully busy.
pub fn calc_load(
    curr: &CpuTimes,
    prev: &CpuTimes,
    capacity: u64,
    iowait_thresh: f64,
) -> (u64, UpdateFlags) {
    let busy = sub_or_zero(&curr.busy, &prev.busy);
    let idle = sub_or_zero(&curr.idle, &prev.idle);
    let iowait = sub_or_zero(&curr.iowait, &prev.iowait);
    let total = busy + idle + iowait;
    if total == 0 {
        return (capacity, UpdateFlags::NONE);
    }

    let util = ((busy as f64 / total as f64).clamp(0.0, 1.0) * capacity as f64).round() as u64;
    let mut flags = UpdateFlags::NONE;
    if iowait_thresh > 0.0 && iowait as f64 / total as f64 >= iowait_thresh {
        flags |= UpdateFlags::IOWAIT;
    }
    (util.min(capacity), flags)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuLoad {
    pub cpu: usize,
    pub util: u64,
    pub max: u64,
    pub flags: UpdateFlags,
}

/// Samples `/proc/stat` and reports the load of each CPU since the
/// previous call.
pub struct LoadSampler {
    proc_reader: procfs::ProcReader,
    prev: BTreeMap<u32, CpuTimes>,
    capacities: Vec<u64>,
    iowait_thresh: f64,
}

impl LoadSampler {
    pub fn new(capacities: Vec<u64>, iowait_thresh: f64) -> Result<Self> {
        let mut sampler = Self {
            proc_reader: procfs::ProcReader::new(),
            prev: BTreeMap::new(),
            capacities,
            iowait_thresh,
        };
        sampler.prev = sampler.read_times()?;
        Ok(sampler)
    }

    fn read_times(&self) -> Result<BTreeMap<u32, CpuTimes>> {
        self.proc_reader
            .read_stat()?
            .cpus_map
            .ok_or_else(|| anyhow!("Expected cpus_map to exist"))?
            .iter()
            .map(|(cpu, stat)| Ok((*cpu, CpuTimes::try_from(stat)?)))
            .collect()
    }

    pub fn sample(&mut self) -> Result<Vec<CpuLoad>> {
        let curr = self.read_times()?;
        let mut loads = vec![];
        for (cpu, times) in curr.iter() {
            let cpu_idx = *cpu as usize;
            let capacity = match self.capacities.get(cpu_idx) {
                Some(cap) => *cap,
                None => continue,
            };
            // CPUs that just came online have no baseline yet.
            let prev = match self.prev.get(cpu) {
                Some(prev) => prev,
                None => continue,
            };
            let (util, flags) = calc_load(times, prev, capacity, self.iowait_thresh);
            loads.push(CpuLoad {
                cpu: cpu_idx,
                util,
                max: capacity,
                flags,
            });
        }
        self.prev = curr;
        Ok(loads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times(busy: u64, idle: u64, iowait: u64) -> CpuTimes {
        CpuTimes { busy, idle, iowait }
    }

    #[test]
    fn test_calc_load() {
        let prev = times(1000, 1000, 0);
        let (util, flags) = calc_load(&times(1750, 1250, 0), &prev, 1024, 0.0);
        assert_eq!(util, 768);
        assert!(flags.is_empty());

        let (util, _) = calc_load(&times(1500, 1500, 0), &prev, 512, 0.0);
        assert_eq!(util, 256);
    }

    #[test]
    fn test_calc_load_iowait() {
        let prev = times(0, 0, 0);
        let (util, flags) = calc_load(&times(100, 600, 300), &prev, 1024, 0.25);
        assert_eq!(util, 102);
        assert!(flags.contains(UpdateFlags::IOWAIT));

        let (_, flags) = calc_load(&times(100, 600, 300), &prev, 1024, 0.5);
        assert!(flags.is_empty());

        let (_, flags) = calc_load(&times(100, 600, 300), &prev, 1024, 0.0);
        assert!(flags.is_empty());
    }

    #[test]
    fn test_calc_load_degenerate() {
        // Counters going backwards count as no time.
        let prev = times(500, 500, 500);
        assert_eq!(
            calc_load(&times(400, 400, 400), &prev, 1024, 0.1),
            (1024, UpdateFlags::NONE)
        );

        let (util, _) = calc_load(&times(900, 500, 500), &prev, 1024, 0.0);
        assert_eq!(util, 1024);
    }

    #[test]
    fn test_cpu_times_from_stat() {
        let stat = procfs::CpuStat {
            user_usec: Some(10),
            nice_usec: Some(1),
            system_usec: Some(5),
            idle_usec: Some(100),
            iowait_usec: Some(7),
            irq_usec: Some(2),
            softirq_usec: Some(3),
            stolen_usec: Some(4),
            ..Default::default()
        };
        assert_eq!(CpuTimes::try_from(&stat).unwrap(), times(25, 100, 7));

        let partial = procfs::CpuStat {
            user_usec: Some(10),
            ..Default::default()
        };
        assert!(CpuTimes::try_from(&partial).is_err());
    }
}
