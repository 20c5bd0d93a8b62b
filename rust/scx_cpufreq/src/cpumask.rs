// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! Fixed-width CPU sets used for domain spans, online sets and the
//! little/big class map.
//!
//! A Cpumask is a BitVec of u64's sized for a given number of CPUs. It can be
//! built from a hexadecimal mask or from a cpulist as found in sysfs:
//!
//!```rust
//!     use scx_cpufreq::Cpumask;
//!     let mask = Cpumask::from_cpulist(8, "0-1,4").unwrap();
//!     assert!(mask.test_cpu(4));
//!     assert!(!mask.test_cpu(2));
//!     assert_eq!(format!("{}", mask), "0-1,4");
//!```

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;

#[derive(Debug, Eq, Clone, Hash, PartialEq)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.mask.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask able to hold `nr_cpus` CPUs.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a Cpumask object from a hexadecimal string. "none" and "all" are
    /// accepted as the empty and full masks.
    pub fn from_str(nr_cpus: usize, cpumask: &str) -> Result<Cpumask> {
        match cpumask {
            "none" => return Ok(Self::new(nr_cpus)),
            "all" => {
                let mask = bitvec![u64, Lsb0; 1; nr_cpus];
                return Ok(Self { mask });
            }
            _ => {}
        }
        let hex_str = {
            let mut tmp_str = cpumask
                .strip_prefix("0x")
                .unwrap_or(cpumask)
                .replace([',', '_'], "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = Self::new(nr_cpus);
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                mask.set_cpu(cpu)
                    .with_context(|| format!("cpumask {cpumask} exceeds {nr_cpus} CPUs"))?;
            }
        }

        Ok(mask)
    }

    /// Build a Cpumask object from a cpulist such as "0-3,6".
    pub fn from_cpulist(nr_cpus: usize, cpulist: &str) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)
                .with_context(|| format!("cpulist {cpulist} exceeds {nr_cpus} CPUs"))?;
        }

        Ok(mask)
    }

    /// Accept either form: a hexadecimal mask ("0x..", "none", "all") or a
    /// cpulist.
    pub fn parse(nr_cpus: usize, input: &str) -> Result<Cpumask> {
        let input = input.trim();
        if input.starts_with("0x") || input == "none" || input == "all" {
            Self::from_str(nr_cpus, input)
        } else {
            Self::from_cpulist(nr_cpus, input)
        }
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Test whether the specified CPU bit is set. CPUs beyond the width of
    /// the mask are never set.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// True if every CPU in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &Cpumask) -> bool {
        self.iter().all(|cpu| other.test_cpu(cpu))
    }

    /// Iterate over the CPUs set in the mask in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        if min > max {
            bail!("Invalid cpulist range {}", group.trim());
        }
        cpu_ids.extend(min..=max);
    }

    Ok(cpu_ids)
}

/// Formats the mask as a cpulist, e.g. "0-3,6".
impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cpus = self.iter().peekable();
        while let Some(start) = cpus.next() {
            let mut end = start;
            while cpus.peek() == Some(&(end + 1)) {
                end += 1;
                cpus.next();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpus(mask: &Cpumask) -> Vec<usize> {
        mask.iter().collect()
    }

    #[test]
    fn test_cpulist_parse() {
        let mask = Cpumask::from_cpulist(16, "0-2,5,8-9\n").unwrap();
        assert_eq!(cpus(&mask), vec![0, 1, 2, 5, 8, 9]);
        assert_eq!(format!("{mask}"), "0-2,5,8-9");

        assert!(Cpumask::from_cpulist(4, "0-7").is_err());
        assert!(Cpumask::from_cpulist(4, "3-1").is_err());
        assert!(Cpumask::from_cpulist(4, "x").is_err());
        assert!(Cpumask::from_cpulist(4, "").unwrap().is_empty());
    }

    #[test]
    fn test_hex_parse() {
        let mask = Cpumask::from_str(8, "0x31").unwrap();
        assert_eq!(cpus(&mask), vec![0, 4, 5]);
        assert_eq!(cpus(&Cpumask::from_str(4, "all").unwrap()), vec![0, 1, 2, 3]);
        assert!(Cpumask::from_str(4, "none").unwrap().is_empty());
        assert!(Cpumask::from_str(4, "0x100").is_err());
    }

    #[test]
    fn test_parse_either_form() {
        assert_eq!(cpus(&Cpumask::parse(8, "0xf0").unwrap()), vec![4, 5, 6, 7]);
        assert_eq!(cpus(&Cpumask::parse(8, "4-7").unwrap()), vec![4, 5, 6, 7]);
        assert_eq!(cpus(&Cpumask::parse(8, " 0,2 ").unwrap()), vec![0, 2]);
        assert!(Cpumask::parse(8, "all").unwrap().test_cpu(7));
        assert!(Cpumask::parse(8, "0xzz").is_err());
    }

    #[test]
    fn test_subset() {
        let a = Cpumask::from_cpulist(8, "1-2").unwrap();
        let b = Cpumask::from_cpulist(8, "0-3").unwrap();
        assert!(a.is_subset_of(&b));
        assert!(!b.is_subset_of(&a));
        assert!(Cpumask::new(8).is_subset_of(&a));
    }
}
