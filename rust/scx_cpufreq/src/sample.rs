// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::types::TimeNs;
use crate::types::UpdateFlags;

/// Latest load observation of one CPU plus its io-wait boost.
#[derive(Debug, Clone, Default)]
pub struct CpuSample {
    pub util: u64,
    pub max: u64,
    pub flags: UpdateFlags,
    pub last_update: TimeNs,
    pub iowait_boost: u64,
    pub iowait_boost_max: u64,
}

impl CpuSample {
    pub fn new(iowait_boost_max: u64) -> CpuSample {
        CpuSample {
            iowait_boost_max,
            ..Default::default()
        }
    }

    /// Forget everything observed so far.
    pub fn reset(&mut self, flags: UpdateFlags) {
        *self = CpuSample {
            flags,
            ..CpuSample::new(self.iowait_boost_max)
        };
    }

    /// Store a new observation. An io-wait event arms the boost at its
    /// maximum. Any other event clears a boost left over from before an idle
    /// period longer than `tick_ns`.
    pub fn record(&mut self, now: TimeNs, util: u64, max: u64, flags: UpdateFlags, tick_ns: TimeNs) {
        if flags.contains(UpdateFlags::IOWAIT) {
            self.iowait_boost = self.iowait_boost_max;
        } else if self.iowait_boost != 0 && now.saturating_sub(self.last_update) > tick_ns {
            self.iowait_boost = 0;
        }

        self.util = util.min(max);
        self.max = max;
        self.flags = flags;
        self.last_update = now;
    }

    /// Last reported more than one tick before `since`, or never reported at
    /// all. Samples newer than `since` are always fresh.
    pub fn is_stale(&self, since: TimeNs, tick_ns: TimeNs) -> bool {
        self.max == 0 || since.saturating_sub(self.last_update) > tick_ns
    }

    /// Let the boost stand in for `(util, max)` when it is relatively larger,
    /// then halve it.
    pub fn apply_boost(&mut self, util: u64, max: u64) -> (u64, u64) {
        let boost = self.iowait_boost;
        if boost == 0 {
            return (util, max);
        }
        self.iowait_boost >>= 1;

        if (util as u128) * (self.iowait_boost_max as u128) < (max as u128) * (boost as u128) {
            (boost, self.iowait_boost_max)
        } else {
            (util, max)
        }
    }
}
