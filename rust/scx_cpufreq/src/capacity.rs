// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Capacity Model
//!
//! Static capacity tables for the two CPU size classes and the per-domain
//! lookup built from them.
//!
//! Each class carries an ascending list of capacities. When a domain is
//! initialized, the capacity at index `i` is paired with entry `i` of the
//! domain's frequency table, skipping invalid frequency entries, to form a
//! [`CapacityTable`]. A lookup then maps a (boosted) utilization to the
//! lowest frequency whose capacity covers it.

use crate::cpumask::Cpumask;
use crate::types::Freq;

/// Capacity steps of the little cluster, lowest first.
pub const LITTLE_CAPACITY: [u64; 18] = [
    0, 149, 188, 225, 257, 281, 315, 368, 406, 428, 469, 502, 538, 581, 611, 648, 684, 729,
];

/// Capacity steps of the big cluster, lowest first.
pub const BIG_CAPACITY: [u64; 25] = [
    0, 149, 188, 225, 257, 281, 315, 348, 374, 428, 469, 502, 538, 581, 611, 648, 684, 729, 763,
    795, 832, 868, 905, 952, 979,
];

/// CPUs below this id belong to the little class by default.
pub const DEFAULT_NR_LITTLE_CPUS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuClass {
    Little,
    Big,
}

/// Class capacity tables plus the static CPU-to-class map.
#[derive(Debug, Clone)]
pub struct CapacityModel {
    little: Vec<u64>,
    big: Vec<u64>,
    little_cpus: Cpumask,
}

impl CapacityModel {
    /// Model with the built-in tables where the CPUs in `little_cpus` are
    /// little and everything else is big.
    pub fn new(little_cpus: Cpumask) -> CapacityModel {
        Self::with_tables(LITTLE_CAPACITY.to_vec(), BIG_CAPACITY.to_vec(), little_cpus)
    }

    /// Model with the default little CPUs (0 and 1) on a machine with
    /// `nr_cpus` CPUs.
    pub fn with_default_classes(nr_cpus: usize) -> CapacityModel {
        let mut little_cpus = Cpumask::new(nr_cpus);
        for cpu in 0..DEFAULT_NR_LITTLE_CPUS.min(nr_cpus) {
            let _ = little_cpus.set_cpu(cpu);
        }
        Self::new(little_cpus)
    }

    pub fn with_tables(little: Vec<u64>, big: Vec<u64>, little_cpus: Cpumask) -> CapacityModel {
        CapacityModel {
            little,
            big,
            little_cpus,
        }
    }

    pub fn class_of(&self, cpu: usize) -> CpuClass {
        if self.little_cpus.test_cpu(cpu) {
            CpuClass::Little
        } else {
            CpuClass::Big
        }
    }

    pub fn capacities(&self, class: CpuClass) -> &[u64] {
        match class {
            CpuClass::Little => &self.little,
            CpuClass::Big => &self.big,
        }
    }

    /// Build the lookup table of a domain whose class is decided by its
    /// first CPU. `None` entries of `freq_table` are invalid and skipped.
    pub fn table_for(&self, first_cpu: usize, freq_table: &[Option<Freq>]) -> CapacityTable {
        CapacityTable::build(self.capacities(self.class_of(first_cpu)), freq_table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfStep {
    pub capacity: u64,
    pub frequency: Freq,
}

/// Ascending (capacity, frequency) steps of one domain.
#[derive(Debug, Clone, Default)]
pub struct CapacityTable {
    steps: Vec<PerfStep>,
}

impl CapacityTable {
    pub fn build(capacities: &[u64], freq_table: &[Option<Freq>]) -> CapacityTable {
        let steps = capacities
            .iter()
            .zip(freq_table.iter())
            .filter_map(|(&capacity, freq)| {
                freq.map(|frequency| PerfStep {
                    capacity,
                    frequency,
                })
            })
            .collect();
        CapacityTable { steps }
    }

    pub fn steps(&self) -> &[PerfStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Lowest frequency whose capacity is at least `util`. Utilization past
    /// the last step maps to the last step.
    pub fn select(&self, util: u64) -> Option<Freq> {
        let last = self.steps.last()?;
        let step = self
            .steps
            .iter()
            .find(|step| step.capacity >= util)
            .unwrap_or(last);
        Some(step.frequency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn freqs(n: usize) -> Vec<Option<Freq>> {
        (0..n).map(|i| Some(300_000 + 100_000 * i as Freq)).collect()
    }

    #[test]
    fn test_select_lowest_covering_step() {
        let table = CapacityTable::build(&LITTLE_CAPACITY, &freqs(18));
        // 225 is the first capacity covering 200.
        assert_eq!(table.select(200), Some(600_000));
        assert_eq!(table.select(225), Some(600_000));
        assert_eq!(table.select(226), Some(700_000));
        assert_eq!(table.select(0), Some(300_000));
    }

    #[test]
    fn test_select_clamps_to_last() {
        let table = CapacityTable::build(&LITTLE_CAPACITY, &freqs(18));
        assert_eq!(table.select(2000), Some(2_000_000));
        assert_eq!(CapacityTable::default().select(10), None);
    }

    #[test]
    fn test_build_skips_invalid_and_short_tables() {
        let mut table = freqs(5);
        table[3] = None;
        let table = CapacityTable::build(&BIG_CAPACITY, &table);
        let caps: Vec<u64> = table.steps().iter().map(|s| s.capacity).collect();
        assert_eq!(caps, vec![0, 149, 188, 257]);
        assert_eq!(table.select(200), Some(700_000));

        // Frequencies past the end of the capacity array are ignored.
        let table = CapacityTable::build(&LITTLE_CAPACITY, &freqs(30));
        assert_eq!(table.steps().len(), LITTLE_CAPACITY.len());
    }

    #[test]
    fn test_class_map() {
        let model = CapacityModel::with_default_classes(8);
        assert_eq!(model.class_of(0), CpuClass::Little);
        assert_eq!(model.class_of(1), CpuClass::Little);
        assert_eq!(model.class_of(2), CpuClass::Big);
        assert_eq!(model.table_for(4, &freqs(25)).steps().len(), 25);
        assert_eq!(model.table_for(0, &freqs(25)).steps().len(), 18);
    }
}
