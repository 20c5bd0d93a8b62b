// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Newtypes, flags and constants shared across the governor.
//!
//! Frequencies are plain `u32` values in kHz, matching cpufreq sysfs.
//! Utilization and capacity are plain `u64` values on the scheduler's
//! capacity scale.

use std::fmt;
use std::ops::BitOr;
use std::ops::BitOrAssign;

/// Policy domain identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub usize);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic time in nanoseconds.
pub type TimeNs = u64;

/// Frequency in kHz.
pub type Freq = u32;

/// Full capacity of the biggest CPU at its highest frequency.
pub const SCHED_CAPACITY_SCALE: u64 = 1024;

/// Scheduling tick at HZ=250.
pub const DEFAULT_TICK_NS: TimeNs = 4_000_000;

pub const NSEC_PER_USEC: u64 = 1_000;

/// Class of the scheduling event that produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UpdateFlags(u32);

impl UpdateFlags {
    pub const NONE: UpdateFlags = UpdateFlags(0);
    /// The task that just ran blocked on I/O.
    pub const IOWAIT: UpdateFlags = UpdateFlags(1 << 0);
    /// A deadline-class task needs the CPU.
    pub const DEADLINE: UpdateFlags = UpdateFlags(1 << 1);

    pub fn contains(self, other: UpdateFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for UpdateFlags {
    type Output = UpdateFlags;

    fn bitor(self, rhs: UpdateFlags) -> UpdateFlags {
        UpdateFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for UpdateFlags {
    fn bitor_assign(&mut self, rhs: UpdateFlags) {
        self.0 |= rhs.0;
    }
}

/// Current `scaling_min_freq` / `scaling_max_freq` window of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreqLimits {
    pub min: Freq,
    pub max: Freq,
}

impl FreqLimits {
    pub fn clamp(&self, freq: Freq) -> Freq {
        freq.max(self.min).min(self.max)
    }
}
