// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Two-stage rate limiter.
//!
//! The coarse gate opens once the shorter of the two delays has passed since
//! the last accepted change. Once a candidate frequency is known, the
//! directional gate checks the delay that matches the direction of the move.
//!
//! While the display is off both delays are widened to at least
//! [`SUSPEND_RATE_LIMIT_NS`]. The configured values are kept in the
//! [`RateMode::Suspended`] state so turning the display back on restores
//! them exactly.

use crate::types::Freq;
use crate::types::TimeNs;
use crate::types::NSEC_PER_USEC;

/// Minimum delay applied in both directions while the display is off.
pub const SUSPEND_RATE_LIMIT_NS: TimeNs = 80_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateMode {
    Normal,
    Suspended { saved_up: TimeNs, saved_down: TimeNs },
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    up_delay_ns: TimeNs,
    down_delay_ns: TimeNs,
    mode: RateMode,
}

impl RateLimiter {
    pub fn new(up_rate_limit_us: u32, down_rate_limit_us: u32) -> RateLimiter {
        RateLimiter {
            up_delay_ns: up_rate_limit_us as u64 * NSEC_PER_USEC,
            down_delay_ns: down_rate_limit_us as u64 * NSEC_PER_USEC,
            mode: RateMode::Normal,
        }
    }

    pub fn up_delay_ns(&self) -> TimeNs {
        self.up_delay_ns
    }

    pub fn down_delay_ns(&self) -> TimeNs {
        self.down_delay_ns
    }

    pub fn mode(&self) -> RateMode {
        self.mode
    }

    /// Shorter of the two effective delays.
    pub fn min_delay_ns(&self) -> TimeNs {
        self.up_delay_ns.min(self.down_delay_ns)
    }

    /// Load newly configured delays. While suspended they only replace the
    /// saved values, and the effective ones stay widened.
    pub fn reconfigure(&mut self, up_rate_limit_us: u32, down_rate_limit_us: u32) {
        let up = up_rate_limit_us as u64 * NSEC_PER_USEC;
        let down = down_rate_limit_us as u64 * NSEC_PER_USEC;
        match self.mode {
            RateMode::Normal => {
                self.up_delay_ns = up;
                self.down_delay_ns = down;
            }
            RateMode::Suspended { .. } => {
                self.mode = RateMode::Suspended {
                    saved_up: up,
                    saved_down: down,
                };
                self.up_delay_ns = up.max(SUSPEND_RATE_LIMIT_NS);
                self.down_delay_ns = down.max(SUSPEND_RATE_LIMIT_NS);
            }
        }
    }

    /// Apply a display state change. Repeating the current state is a no-op.
    pub fn set_display(&mut self, active: bool) {
        match (self.mode, active) {
            (RateMode::Normal, false) => {
                self.mode = RateMode::Suspended {
                    saved_up: self.up_delay_ns,
                    saved_down: self.down_delay_ns,
                };
                self.up_delay_ns = self.up_delay_ns.max(SUSPEND_RATE_LIMIT_NS);
                self.down_delay_ns = self.down_delay_ns.max(SUSPEND_RATE_LIMIT_NS);
            }
            (
                RateMode::Suspended {
                    saved_up,
                    saved_down,
                },
                true,
            ) => {
                self.up_delay_ns = saved_up;
                self.down_delay_ns = saved_down;
                self.mode = RateMode::Normal;
            }
            _ => {}
        }
    }

    /// Coarse gate: has the shorter delay elapsed since `last_update`?
    pub fn coarse_allows(&self, now: TimeNs, last_update: TimeNs) -> bool {
        now.saturating_sub(last_update) >= self.min_delay_ns()
    }

    /// Directional gate for moving from `cur` to `next`. Without a previous
    /// request there is no direction to check.
    pub fn direction_allows(
        &self,
        now: TimeNs,
        last_update: TimeNs,
        cur: Option<Freq>,
        next: Freq,
    ) -> bool {
        let Some(cur) = cur else {
            return true;
        };
        let elapsed = now.saturating_sub(last_update);
        if next > cur {
            elapsed >= self.up_delay_ns
        } else if next < cur {
            elapsed >= self.down_delay_ns
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: TimeNs = 1_000_000;

    #[test]
    fn test_coarse_gate_uses_shorter_delay() {
        let rl = RateLimiter::new(10_000, 2_000);
        assert_eq!(rl.min_delay_ns(), 2 * MS);
        assert!(!rl.coarse_allows(100 * MS + 2 * MS - 1, 100 * MS));
        assert!(rl.coarse_allows(100 * MS + 2 * MS, 100 * MS));
    }

    #[test]
    fn test_directional_gate() {
        let rl = RateLimiter::new(10_000, 2_000);
        let t0 = 50 * MS;
        assert!(!rl.direction_allows(t0 + 10 * MS - 1, t0, Some(1000), 2000));
        assert!(rl.direction_allows(t0 + 10 * MS + 1, t0, Some(1000), 2000));
        assert!(rl.direction_allows(t0 + 2 * MS, t0, Some(2000), 1000));
        assert!(!rl.direction_allows(t0 + 2 * MS - 1, t0, Some(2000), 1000));
        assert!(rl.direction_allows(t0, t0, None, 1000));
    }

    #[test]
    fn test_display_round_trip_is_lossless() {
        let mut rl = RateLimiter::new(500, 100_000);
        rl.set_display(false);
        assert_eq!(rl.up_delay_ns(), SUSPEND_RATE_LIMIT_NS);
        assert_eq!(rl.down_delay_ns(), 100 * MS);
        assert!(matches!(rl.mode(), RateMode::Suspended { .. }));

        // Repeated signals do not overwrite the saved values.
        rl.set_display(false);
        rl.set_display(true);
        rl.set_display(true);
        assert_eq!(rl.up_delay_ns(), 500_000);
        assert_eq!(rl.down_delay_ns(), 100 * MS);
        assert_eq!(rl.mode(), RateMode::Normal);
    }

    #[test]
    fn test_reconfigure_while_suspended() {
        let mut rl = RateLimiter::new(1_000, 1_000);
        rl.set_display(false);
        rl.reconfigure(3_000, 200_000);
        assert_eq!(rl.up_delay_ns(), SUSPEND_RATE_LIMIT_NS);
        assert_eq!(rl.down_delay_ns(), 200 * MS);
        rl.set_display(true);
        assert_eq!(rl.up_delay_ns(), 3 * MS);
        assert_eq!(rl.down_delay_ns(), 200 * MS);
    }
}
